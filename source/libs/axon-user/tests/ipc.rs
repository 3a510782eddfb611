// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TEST_SCOPE: IPC helpers for the polling and queued designs through the kernel trap path
//! TEST_SCENARIOS: value 42 to a blocked receiver; page transfer; queued fan-in;
//!                 sender woken when its target dies; console output

mod common;

use std::sync::{Arc, Mutex};

use axon_abi::layout::USTACKTOP;
use axon_abi::{EnvId, ErrorCode, PageFlags};
use axon_user::ipc::{ipc_recv, ipc_recv_queued, ipc_send, ipc_send_queued, Message};
use axon_user::syscall::{sys_cputs, sys_getenvid, sys_page_alloc, sys_yield};
use axon_user::Machine;
use common::{Outcome, Sim};

const DATA: usize = 0x0100_0000;
const INBOX: usize = 0x0200_0000;
const PUW: PageFlags = PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::WRITABLE);

type Slot<T> = Arc<Mutex<Option<T>>>;

fn slot<T>() -> (Slot<T>, Slot<T>) {
    let a = Arc::new(Mutex::new(None));
    (a.clone(), a)
}

#[test]
fn value_42_reaches_a_blocked_receiver() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<Message>();
    let receiver = sim.spawn(move |m| {
        *out.lock().unwrap() = Some(ipc_recv(m, None).unwrap());
    });
    let sender = sim.spawn(move |m| {
        ipc_send(m, receiver, 42, None, PageFlags::empty()).unwrap();
    });

    let report = sim.run();
    let msg = got.lock().unwrap().expect("delivered");
    assert_eq!(msg, Message { value: 42, from: sender, perm: PageFlags::empty() });
    assert_eq!(report.outcomes[&receiver], Outcome::Exited);
    assert_eq!(report.outcomes[&sender], Outcome::Exited);
}

#[test]
fn polling_send_retries_until_the_receiver_arrives() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<Message>();
    let (rid, rid_out) = slot::<EnvId>();
    // The sender runs first and has to yield until the receiver blocks.
    let sender = sim.spawn(move |m| {
        let to = loop {
            if let Some(id) = *rid.lock().unwrap() {
                break id;
            }
            sys_yield(m);
        };
        ipc_send(m, to, 7, None, PageFlags::empty()).unwrap();
    });
    sim.spawn(move |m| {
        *rid_out.lock().unwrap() = Some(sys_getenvid(m));
        for _ in 0..3 {
            sys_yield(m);
        }
        *out.lock().unwrap() = Some(ipc_recv(m, None).unwrap());
    });

    sim.run();
    assert_eq!(got.lock().unwrap().map(|msg| (msg.value, msg.from)), Some((7, sender)));
}

#[test]
fn page_travels_with_the_value() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<(Message, usize, Option<PageFlags>)>();
    let receiver = sim.spawn(move |m| {
        let msg = ipc_recv(m, Some(INBOX)).unwrap();
        let word = m.read_word(INBOX);
        *out.lock().unwrap() = Some((msg, word, m.page_entry(INBOX)));
    });
    sim.spawn(move |m| {
        sys_page_alloc(m, EnvId::SELF, DATA, PUW).unwrap();
        m.write_word(DATA, 0xfeed);
        let ro = PageFlags::PRESENT | PageFlags::USER;
        ipc_send(m, receiver, 1, Some(DATA), ro).unwrap();
    });

    sim.run();
    let (msg, word, pte) = got.lock().unwrap().expect("delivered");
    assert_eq!(msg.perm, PageFlags::PRESENT | PageFlags::USER);
    assert_eq!(word, 0xfeed);
    assert_eq!(pte, Some(PageFlags::PRESENT | PageFlags::USER));
}

#[test]
fn unaligned_source_is_rejected() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<Result<(), ErrorCode>>();
    let receiver = sim.spawn(|m| {
        let _ = ipc_recv(m, Some(INBOX));
    });
    sim.spawn(move |m| {
        sys_page_alloc(m, EnvId::SELF, DATA, PUW).unwrap();
        *out.lock().unwrap() = Some(ipc_send(m, receiver, 1, Some(DATA + 1), PUW));
    });
    let report = sim.run();
    assert_eq!(*got.lock().unwrap(), Some(Err(ErrorCode::InvalidArgument)));
    // Nobody ever delivered, so the receiver is still blocked when the CPU parks.
    assert_eq!(report.outcomes[&receiver], Outcome::Stuck);
}

#[test]
fn queued_receiver_drains_every_sender() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<Vec<usize>>();
    let target = sim.spawn(move |m| {
        let mut values = Vec::new();
        for _ in 0..3 {
            values.push(ipc_recv_queued(m, None).unwrap().value);
        }
        values.sort_unstable();
        *out.lock().unwrap() = Some(values);
    });
    let mut senders = Vec::new();
    for value in 1..=3 {
        senders.push(sim.spawn(move |m| {
            ipc_send_queued(m, target, value, None, PageFlags::empty()).unwrap();
        }));
    }

    let report = sim.run();
    assert_eq!(*got.lock().unwrap(), Some(vec![1, 2, 3]));
    for sender in senders {
        assert_eq!(report.outcomes[&sender], Outcome::Exited);
    }
}

#[test]
fn queued_sender_learns_its_target_died() {
    let mut sim = Sim::new(8);
    let (got, out) = slot::<Result<(), ErrorCode>>();
    let target = sim.spawn(|m| {
        for _ in 0..4 {
            sys_yield(m);
        }
    });
    sim.spawn(move |m| {
        *out.lock().unwrap() = Some(ipc_send_queued(m, target, 9, None, PageFlags::empty()));
    });
    sim.run();
    assert_eq!(*got.lock().unwrap(), Some(Err(ErrorCode::BadEnvironment)));
}

#[test]
fn console_output_and_bad_buffers() {
    let mut sim = Sim::new(8);
    let buf = USTACKTOP - 64;
    sim.spawn(move |m| {
        m.write(buf, b"hello, axon\n");
        sys_cputs(m, buf, 12).unwrap();
    });
    let victim = sim.spawn(|m| {
        let _ = sys_cputs(m, DATA, 16);
        panic!("cputs of an unmapped buffer returned");
    });
    let report = sim.run();
    assert_eq!(report.console, b"hello, axon\n");
    assert_eq!(report.outcomes[&victim], Outcome::Killed);
}
