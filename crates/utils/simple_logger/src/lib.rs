#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset};
use klocks::{Once, SpinMutex};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// 日志的输出端，比如串口
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

/// a simple logger
struct SimpleLogger {
    clog: LevelFilter,
    console: &'static dyn Console,
    // 多个核同时打日志时，保证每行不会交错
    line_lock: SpinMutex<()>,
}

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.clog
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => AnsiColor::Red,         // Red
            Level::Warn => AnsiColor::BrightYellow, // BrightYellow
            Level::Info => AnsiColor::Blue,         // Blue
            Level::Debug => AnsiColor::Green,       // Green
            Level::Trace => AnsiColor::BrightBlack, // BrightBlack
        };
        let _line = self.line_lock.lock();
        let mut writer = ConsoleWriter(self.console);
        // Console 本身不会失败，忽略 fmt::Error 即可
        let _ = writeln!(
            writer,
            "{}[{:>5}]{} {}",
            color.render_fg(),
            record.level(),
            Reset.render(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: Once<SimpleLogger> = Once::new();

fn level_from_env() -> LevelFilter {
    match option_env!("KERNEL_CLOG") {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// 初始化日志，级别由编译时的环境变量 `KERNEL_CLOG` 决定
pub fn init(console: &'static dyn Console) {
    init_with_level(console, level_from_env());
}

/// 重复调用时只有第一次生效
pub fn init_with_level(console: &'static dyn Console, clog: LevelFilter) {
    let mut first = false;
    let logger = LOGGER.call_once(|| {
        first = true;
        SimpleLogger {
            clog,
            console,
            line_lock: SpinMutex::new(()),
        }
    });
    if first && log::set_logger(logger).is_ok() {
        log::set_max_level(logger.clog);
    }
}
