// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-CPU machine simulator: one host thread per environment program, one baton.
//!
//! Only the thread of the environment the kernel last resumed executes. Syscalls and faults go
//! through `Kernel::trap`; a resume of an environment without a program (idle, or a child no
//! program was attached to) is answered with a timer tick on its behalf.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use axon::hal::virt::{BufferConsole, RecordingMonitor, VirtCycles};
use axon::hal::DebugAction;
use axon::{boot, CpuId, Kernel, KernelConfig, Platform, TrapExit, TrapFrame};
use axon_abi::layout::{PAGE_SIZE, USTACKTOP, UTEXT};
use axon_abi::trap::{T_PGFLT, T_TIMER};
use axon_abi::{syscall as nr, EnvId, EnvInfo, EnvType, FaultRecord, PageFlags};
use axon_user::pgfault::{upcall_entry, UPCALL_ENTRY};
use axon_user::{FaultHandler, Machine};

const CPU: CpuId = CpuId::BOOT;
/// Consecutive ticks of programless environments before the run counts as finished.
const MAX_TICKS: usize = 10_000;

/// How a program's thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The program returned and the environment exited.
    Exited,
    /// The kernel destroyed the environment.
    Killed,
    /// Everything else stopped while this program was still waiting.
    Stuck,
}

/// Unwind payload ending a program thread.
enum Stop {
    Killed,
    Stuck,
}

type Program = Box<dyn FnOnce(&mut Env) + Send + 'static>;

struct Baton {
    running: Option<EnvId>,
    frame: TrapFrame,
    programs: HashSet<EnvId>,
    handlers: HashMap<EnvId, FaultHandler>,
    halted: bool,
    failure: Option<String>,
    faults: Vec<(EnvId, usize)>,
    outcomes: HashMap<EnvId, Outcome>,
}

struct Inner {
    kernel: Kernel,
    console: Arc<BufferConsole>,
    baton: Mutex<Baton>,
    turn: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drives the CPU from `exit` until `me` is resumed (guard returned) or the baton leaves.
    fn advance<'a>(&'a self, mut b: MutexGuard<'a, Baton>, mut exit: TrapExit, me: Option<EnvId>) -> Option<MutexGuard<'a, Baton>> {
        for _ in 0..MAX_TICKS {
            match exit {
                TrapExit::Resume(id) if Some(id) == me => {
                    b.running = Some(id);
                    return Some(b);
                }
                TrapExit::Resume(id) if b.programs.contains(&id) => {
                    b.running = Some(id);
                    self.turn.notify_all();
                    return None;
                }
                TrapExit::Resume(_) => {
                    b.frame.trapno = T_TIMER;
                    exit = self.kernel.trap(CPU, &mut b.frame);
                }
                TrapExit::Monitor => break,
            }
        }
        // Parked, or only programless environments are left spinning.
        b.running = None;
        b.halted = true;
        self.turn.notify_all();
        None
    }

    fn wait_turn<'a>(&'a self, b: MutexGuard<'a, Baton>, me: EnvId) -> MutexGuard<'a, Baton> {
        let b = self
            .turn
            .wait_while(b, |b| b.running != Some(me) && !b.halted)
            .unwrap_or_else(|e| e.into_inner());
        if b.running != Some(me) {
            drop(b);
            panic::resume_unwind(Box::new(Stop::Stuck));
        }
        b
    }

    /// Traps with the frame prepared by `prepare`; returns once `me` runs again.
    fn enter<'a>(&'a self, me: EnvId, prepare: impl FnOnce(&mut TrapFrame)) -> MutexGuard<'a, Baton> {
        let mut b = self.wait_turn(self.lock(), me);
        prepare(&mut b.frame);
        let exit = self.kernel.trap(CPU, &mut b.frame);
        // Checked while holding the baton: nobody else may touch the kernel yet.
        let alive = self.kernel.env_info(CPU, me).is_some();
        match self.advance(b, exit, Some(me)) {
            Some(b) => b,
            None if !alive => panic::resume_unwind(Box::new(Stop::Killed)),
            None => self.wait_turn(self.lock(), me),
        }
    }
}

/// The machine handed to one environment's program.
pub struct Env {
    id: EnvId,
    inner: Arc<Inner>,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Gives `child` a program; it inherits this environment's fault handler slot as the copied
    /// data segment would.
    pub fn attach(&mut self, child: EnvId, program: impl FnOnce(&mut Env) + Send + 'static) {
        let mut b = self.inner.lock();
        if let Some(handler) = b.handlers.get(&self.id).copied() {
            b.handlers.insert(child, handler);
        }
        b.programs.insert(child);
        drop(b);
        spawn_thread(&self.inner, child, Box::new(program));
    }

    pub fn read_word(&mut self, va: usize) -> usize {
        let mut bytes = [0u8; 8];
        self.read(va, &mut bytes);
        usize::from_le_bytes(bytes)
    }

    pub fn write_word(&mut self, va: usize, value: usize) {
        self.write(va, &value.to_le_bytes());
    }

    fn fault(&mut self, va: usize, err: usize) {
        let mut b = self.inner.enter(self.id, |frame| {
            frame.trapno = T_PGFLT;
            frame.tval = va;
            frame.err = err;
        });
        b.faults.push((self.id, va & !(PAGE_SIZE - 1)));
        let at_upcall = b.frame.ip == UPCALL_ENTRY;
        drop(b);
        assert!(at_upcall, "fault resumed outside the upcall");
        upcall_entry(self);
    }
}

impl Machine for Env {
    fn syscall(&mut self, number: usize, args: [usize; 5]) -> isize {
        let b = self.inner.enter(self.id, |frame| frame.set_syscall(number, args));
        b.frame.ret()
    }

    fn read(&mut self, va: usize, buf: &mut [u8]) {
        loop {
            match self.inner.kernel.user_read(CPU, self.id, va, buf) {
                Ok(()) => return,
                Err(fault) => self.fault(fault.va, fault.code.bits()),
            }
        }
    }

    fn write(&mut self, va: usize, data: &[u8]) {
        loop {
            match self.inner.kernel.user_write(CPU, self.id, va, data) {
                Ok(()) => return,
                Err(fault) => self.fault(fault.va, fault.code.bits()),
            }
        }
    }

    fn page_entry(&self, va: usize) -> Option<PageFlags> {
        self.inner.kernel.page_entry(CPU, self.id, va)
    }

    fn span_present(&self, va: usize) -> bool {
        self.inner.kernel.span_present(CPU, self.id, va)
    }

    fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.inner.kernel.env_info(CPU, id)
    }

    fn fault_handler(&self) -> Option<FaultHandler> {
        self.inner.lock().handlers.get(&self.id).copied()
    }

    fn set_fault_handler(&mut self, handler: FaultHandler) {
        self.inner.lock().handlers.insert(self.id, handler);
    }

    fn stack_pointer(&self) -> usize {
        self.inner.lock().frame.sp
    }

    fn resume(&mut self, record: &FaultRecord) {
        let mut b = self.inner.lock();
        b.frame.regs = record.regs;
        b.frame.ip = record.ip;
        b.frame.sp = record.sp;
        b.frame.flags = record.flags;
    }
}

fn classify(payload: Box<dyn std::any::Any + Send>) -> Result<Outcome, String> {
    match payload.downcast_ref::<Stop>() {
        Some(Stop::Killed) => Ok(Outcome::Killed),
        Some(Stop::Stuck) => Ok(Outcome::Stuck),
        None => Err(payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "program panicked".to_string())),
    }
}

fn spawn_thread(inner: &Arc<Inner>, id: EnvId, program: Program) {
    let inner2 = inner.clone();
    let handle = thread::spawn(move || {
        let mut env = Env { id, inner: inner2.clone() };
        let ran = panic::catch_unwind(AssertUnwindSafe(|| {
            drop(inner2.wait_turn(inner2.lock(), id));
            program(&mut env);
        }));
        let outcome = match ran {
            Ok(()) => {
                // Returning from the program exits the environment; the destroy never returns.
                let _ = panic::catch_unwind(AssertUnwindSafe(|| env.syscall(nr::ENV_DESTROY, [0; 5])));
                Ok(Outcome::Exited)
            }
            Err(payload) => classify(payload),
        };
        let mut b = inner2.lock();
        match outcome {
            Ok(outcome) => {
                b.outcomes.insert(id, outcome);
            }
            Err(msg) => {
                b.outcomes.insert(id, Outcome::Stuck);
                b.failure.get_or_insert(format!("{}: {}", id, msg));
                b.halted = true;
                inner2.turn.notify_all();
            }
        }
    });
    inner.threads.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
}

/// What a finished run left behind.
pub struct Report {
    pub outcomes: HashMap<EnvId, Outcome>,
    pub faults: Vec<(EnvId, usize)>,
    pub console: Vec<u8>,
}

impl Report {
    /// Faults `env` took on the page containing `va`.
    pub fn faults_at(&self, env: EnvId, va: usize) -> usize {
        let page = va & !(PAGE_SIZE - 1);
        self.faults.iter().filter(|(e, p)| *e == env && *p == page).count()
    }
}

pub struct Sim {
    inner: Arc<Inner>,
    pending: Vec<(EnvId, Program)>,
}

impl Sim {
    pub fn new(capacity: usize) -> Self {
        let console = Arc::new(BufferConsole::new());
        let platform = Platform {
            console: console.clone(),
            cycles: Arc::new(VirtCycles::new(11)),
            monitor: Arc::new(RecordingMonitor::new(DebugAction::Continue)),
        };
        let config = KernelConfig::new().with_env_capacity(capacity).with_phys_frames(1024);
        let kernel = match boot(config, platform) {
            Ok(kernel) => kernel,
            Err(err) => panic!("boot failed: {}", err),
        };
        let baton = Baton {
            running: None,
            frame: TrapFrame::default(),
            programs: HashSet::new(),
            handlers: HashMap::new(),
            halted: false,
            failure: None,
            faults: Vec::new(),
            outcomes: HashMap::new(),
        };
        let inner = Arc::new(Inner {
            kernel,
            console,
            baton: Mutex::new(baton),
            turn: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });
        Self { inner, pending: Vec::new() }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    /// Loads a program into a fresh environment with one stack page.
    pub fn spawn(&mut self, program: impl FnOnce(&mut Env) + Send + 'static) -> EnvId {
        let kernel = &self.inner.kernel;
        let id = kernel.create_env(CPU, EnvType::User).expect("create env");
        let stack = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
        kernel.map_page(CPU, id, USTACKTOP - PAGE_SIZE, stack).expect("map stack");
        kernel.set_entry(CPU, id, UTEXT, USTACKTOP).expect("entry");
        self.inner.lock().programs.insert(id);
        self.pending.push((id, Box::new(program)));
        id
    }

    /// Runs until no environment has work, then reports.
    pub fn run(mut self) -> Report {
        for (id, program) in self.pending.drain(..) {
            spawn_thread(&self.inner, id, program);
        }
        {
            let mut b = self.inner.lock();
            let exit = self.inner.kernel.start_cpu(CPU, &mut b.frame);
            if let Some(b) = self.inner.advance(b, exit, None) {
                drop(b);
            }
            let b = self.inner.lock();
            let _b = self.inner.turn.wait_while(b, |b| !b.halted).unwrap_or_else(|e| e.into_inner());
        }
        loop {
            let next = self.inner.threads.lock().unwrap_or_else(|e| e.into_inner()).pop();
            match next {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
        let mut b = self.inner.lock();
        if let Some(failure) = b.failure.take() {
            panic!("{}", failure);
        }
        Report {
            outcomes: std::mem::take(&mut b.outcomes),
            faults: std::mem::take(&mut b.faults),
            console: self.inner.console.take_output(),
        }
    }
}
