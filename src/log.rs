//! Ring-buffered kernel log.
//!
//! Keeps a bounded `VecDeque<u8>` behind a `Writer` handle but drops
//! hardware-specific display/arch-writer sinks; a `cfg(test)` sink
//! additionally mirrors to stderr so test runs are legible.

use alloc::collections::VecDeque;
use core::fmt;
use spin::{Mutex, MutexGuard};

pub static LOG: Mutex<Option<Log>> = Mutex::new(None);

pub fn init(capacity: usize) {
    *LOG.lock() = Some(Log::new(capacity));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A circular buffer for storing log messages.
pub struct Log {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Log {
    pub fn new(capacity: usize) -> Log {
        Log {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn read(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }

    pub fn write(&mut self, buf: &[u8]) {
        for &b in buf {
            while self.data.len() + 1 >= self.capacity {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }
}

pub struct Writer<'a> {
    log: MutexGuard<'a, Option<Log>>,
}

impl<'a> Writer<'a> {
    pub fn new() -> Writer<'a> {
        Writer { log: LOG.lock() }
    }

    pub fn write(&mut self, level: Level, buf: &[u8]) {
        if let Some(ref mut log) = *self.log {
            log.write(buf);
        }
        #[cfg(test)]
        {
            if level >= Level::Debug {
                std::eprint!("{}", core::str::from_utf8(buf).unwrap_or("<non-utf8>"));
            }
        }
        #[cfg(not(test))]
        {
            let _ = level;
        }
    }
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(Level::Info, s.as_bytes());
        Ok(())
    }
}

macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        use core::fmt::Write;
        let mut w = $crate::log::Writer::new();
        w.write($level, alloc::format!($($arg)*).as_bytes());
        w.write($level, b"\n");
    }};
}

macro_rules! trace {
    ($($arg:tt)*) => { $crate::log::klog!($crate::log::Level::Trace, $($arg)*) };
}

macro_rules! debugln {
    ($($arg:tt)*) => { $crate::log::klog!($crate::log::Level::Debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { $crate::log::klog!($crate::log::Level::Info, $($arg)*) };
}

macro_rules! warnln {
    ($($arg:tt)*) => { $crate::log::klog!($crate::log::Level::Warn, $($arg)*) };
}

pub(crate) use debugln;
pub(crate) use info;
pub(crate) use klog;
pub(crate) use trace;
pub(crate) use warnln;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_once_full() {
        let mut log = Log::new(4);
        log.write(b"abcd");
        let (front, back) = log.read();
        assert_eq!(front.len() + back.len(), 3);
    }

    #[test]
    fn read_reflects_writes_in_order() {
        let mut log = Log::new(64);
        log.write(b"hello");
        let (front, back) = log.read();
        let mut all = alloc::vec::Vec::new();
        all.extend_from_slice(front);
        all.extend_from_slice(back);
        assert_eq!(all.as_slice(), b"hello");
    }

    #[test]
    fn macros_write_through_to_the_global_log() {
        init(256);
        info!("probe {}", 42);
        let guard = LOG.lock();
        let log = guard.as_ref().unwrap();
        let (front, back) = log.read();
        let mut all = alloc::vec::Vec::new();
        all.extend_from_slice(front);
        all.extend_from_slice(back);
        let text = core::str::from_utf8(&all).unwrap();
        assert!(text.contains("probe 42"));
    }
}
