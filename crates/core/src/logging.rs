//! Category/level logging for the CPU core.
//!
//! Every message goes through [`log`], which takes a closure so that
//! formatting only happens when the category is enabled at the requested
//! level. Output goes to stderr, or to a file written by a background
//! thread once [`LogConfig::set_log_file`] has been called.
//!
//! # Levels
//!
//! Each category has its own level. A category left at `Off` inherits the
//! global level, so `set_global_level(Warn)` plus `set_level(FPU, Trace)`
//! traces the FPU while keeping everything else quiet.
//!
//! # Rate limiting
//!
//! Each category is limited to a fixed number of messages per second
//! (60 by default). Dropped messages are summarized once the window opens
//! again.
//!
//! ```rust
//! use pcx86_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Control, LogLevel::Debug, || {
//!     format!("IRET to {:04X}:{:04X}", 0xF000, 0x1234)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Subsystems of the core that log independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Opcode dispatch and general CPU state
    CPU,
    /// Far returns and interrupt returns
    Control,
    /// x87 register stack and arithmetic
    FPU,
    /// Memory bus accesses and aborts
    Bus,
    /// Cycle accounting and prefetch queue
    Timing,
    /// Faults surfaced to the dispatch loop
    Faults,
}

impl LogCategory {
    /// All categories, in index order
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::CPU,
        LogCategory::Control,
        LogCategory::FPU,
        LogCategory::Bus,
        LogCategory::Timing,
        LogCategory::Faults,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Parse a category name (case-insensitive)
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(LogCategory::CPU),
            "control" | "ctl" => Some(LogCategory::Control),
            "fpu" | "x87" => Some(LogCategory::FPU),
            "bus" | "mem" => Some(LogCategory::Bus),
            "timing" => Some(LogCategory::Timing),
            "faults" | "fault" => Some(LogCategory::Faults),
            _ => None,
        }
    }
}

const CATEGORY_COUNT: usize = 6;

#[derive(Default)]
struct CategoryWindow {
    stamps: VecDeque<Instant>,
    dropped: usize,
    last_report: Option<Instant>,
}

/// Sliding one-second window per category.
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    windows: Mutex<[CategoryWindow; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            windows: Mutex::new(Default::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [CategoryWindow; CATEGORY_COUNT]> {
        // A panic while holding the lock only loses rate-limit bookkeeping.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether the message may be written, and how many earlier
    /// messages should be reported as dropped.
    fn admit(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let max = self.max_per_second.load(Ordering::Relaxed);
        let mut windows = self.lock();
        let w = &mut windows[category.index()];

        while let Some(&front) = w.stamps.front() {
            if now.duration_since(front) > self.window {
                w.stamps.pop_front();
            } else {
                break;
            }
        }

        if w.stamps.len() < max {
            w.stamps.push_back(now);
            if w.dropped > 0 {
                let dropped = std::mem::take(&mut w.dropped);
                w.last_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        w.dropped += 1;
        let due = w
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.window);
        if due {
            w.last_report = Some(now);
            (false, Some(std::mem::take(&mut w.dropped)))
        } else {
            (false, None)
        }
    }
}

/// Process-wide logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    levels: [AtomicU8; CATEGORY_COUNT],
    file_sender: Mutex<Option<Sender<String>>>,
    file_enabled: AtomicBool,
    limiter: RateLimiter,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            file_sender: Mutex::new(None),
            file_enabled: AtomicBool::new(false),
            limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category with its own level uses it; otherwise the global level applies.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        match self.get_level(category) {
            LogLevel::Off => level <= self.get_global_level(),
            own => level <= own,
        }
    }

    /// Apply a filter string such as `"warn,fpu=trace,control=debug"`.
    ///
    /// A bare level sets the global level; `name=level` pairs set a category.
    /// Unknown entries are returned so the caller can report them.
    pub fn apply_filter(&self, filter: &str) -> Vec<String> {
        let mut rejected = Vec::new();
        for entry in filter.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((name, level)) => {
                    match (LogCategory::from_name(name), LogLevel::from_str(level)) {
                        (Some(cat), Some(lvl)) => self.set_level(cat, lvl),
                        _ => rejected.push(entry.to_string()),
                    }
                }
                None => match LogLevel::from_str(entry) {
                    Some(lvl) => self.set_global_level(lvl),
                    None => rejected.push(entry.to_string()),
                },
            }
        }
        rejected
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for cat in LogCategory::ALL {
            self.set_level(cat, LogLevel::Off);
        }
    }

    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.limiter
            .max_per_second
            .store(max_logs_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.limiter.max_per_second.load(Ordering::Relaxed)
    }

    /// Route output to `path` through a background writer thread.
    ///
    /// Replaces any previous log file; the old writer exits once its channel
    /// is dropped.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("cpu-log-writer".to_string())
            .spawn(move || {
                while let Ok(line) = receiver.recv() {
                    let _ = writeln!(file, "{}", line);
                    let _ = file.flush();
                }
            })?;

        *self.sender_slot() = Some(sender);
        self.file_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop writing to the log file and go back to stderr
    pub fn clear_log_file(&self) {
        *self.sender_slot() = None;
        self.file_enabled.store(false, Ordering::Relaxed);
    }

    fn sender_slot(&self) -> MutexGuard<'_, Option<Sender<String>>> {
        self.file_sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_message(&self, message: String) {
        if self.file_enabled.load(Ordering::Relaxed) {
            if let Some(sender) = self.sender_slot().as_ref() {
                if let Err(failed) = sender.send(message) {
                    eprintln!("{}", failed.0);
                }
                return;
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message for `category` at `level`.
///
/// `message_fn` is only called when the message will actually be written.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped) = config.limiter.admit(category);
    if let Some(count) = dropped.filter(|&n| n > 0) {
        config.write_message(format!(
            "[{:?}] rate limit exceeded, {} message(s) dropped",
            category, count
        ));
    }
    if allowed {
        config.write_message(format!("[{:?}] {}", category, message_fn()));
    }
}
