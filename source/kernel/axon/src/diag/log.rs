// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! PUBLIC API: log_* macros, emit(level,target,args), set_max_level(), drain_into(), recent()
//! DEPENDS_ON: spin::Mutex, alloc
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; bounded ring (oldest dropped)

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Arguments, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn enabled(self) -> bool {
        let built = match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        };
        built && self as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
    }
}

const RING_LINES: usize = 256;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static RING: Mutex<LogRing> = Mutex::new(LogRing::new());

struct LogRing {
    lines: VecDeque<String>,
    dropped: u64,
}

impl LogRing {
    const fn new() -> Self {
        Self { lines: VecDeque::new(), dropped: 0 }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == RING_LINES {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }
}

/// Sets the most verbose level that is recorded.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Formats one log line (without trailing newline) into `w`.
pub fn write_line<W: Write>(
    w: &mut W,
    level: Level,
    target: &str,
    args: Arguments<'_>,
) -> fmt::Result {
    write!(w, "[{} {}] ", level.tag(), target)?;
    w.write_fmt(args)
}

/// Emits a structured log line if the level is enabled.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    let mut line = String::new();
    let _ = write_line(&mut line, level, target, args);
    RING.lock().push(line);
}

/// Moves every buffered line into `w`, one per line.
pub fn drain_into<W: Write>(w: &mut W) -> fmt::Result {
    let mut ring = RING.lock();
    if ring.dropped != 0 {
        writeln!(w, "[WARN log] {} lines dropped", ring.dropped)?;
        ring.dropped = 0;
    }
    while let Some(line) = ring.lines.pop_front() {
        writeln!(w, "{}", line)?;
    }
    Ok(())
}

/// Returns up to `n` of the most recent lines, oldest first.
pub fn recent(n: usize) -> Vec<String> {
    let ring = RING.lock();
    let skip = ring.lines.len().saturating_sub(n);
    ring.lines.iter().skip(skip).cloned().collect()
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let mut out = String::new();
        write_line(&mut out, Level::Warn, "sched", format_args!("cpu {} idle", 2)).unwrap();
        assert_eq!(out, "[WARN sched] cpu 2 idle");
    }

    #[test]
    fn ring_drops_oldest() {
        let mut ring = LogRing::new();
        for i in 0..RING_LINES + 3 {
            ring.push(alloc::format!("{}", i));
        }
        assert_eq!(ring.lines.len(), RING_LINES);
        assert_eq!(ring.dropped, 3);
        assert_eq!(ring.lines.front().map(String::as_str), Some("3"));
    }

    #[test]
    fn levels_order_by_verbosity() {
        assert!(Level::Error < Level::Trace);
        assert!(Level::Error.enabled());
    }
}
