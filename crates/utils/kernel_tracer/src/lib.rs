#![cfg_attr(not(test), no_std)]

#[cfg(feature = "testing")]
extern crate alloc;

#[macro_use]
mod macros;
#[cfg(feature = "testing")]
pub mod capture;
mod level;
mod record;

pub use level::{Level, LevelFilter, CLOG};
pub use record::Record;

use core::fmt::{self, Arguments, Write};

use anstyle::{AnsiColor, Reset};
use spin::Once;

/// 日志的输出端，由内核在启动时注册（通常是串口）
pub trait Log: Sync {
    fn log(&self, record: &Record<'_>);
}

static LOGGER: Once<&'static dyn Log> = Once::new();

/// 注册日志输出端。只有第一次注册生效，返回是否注册成功
pub fn set_logger(logger: &'static dyn Log) -> bool {
    let mut installed = false;
    LOGGER.call_once(|| {
        installed = true;
        logger
    });
    installed
}

/// 当前注册的输出端是否就是 `logger`
pub fn logger_is(logger: &'static dyn Log) -> bool {
    LOGGER
        .get()
        .is_some_and(|installed| core::ptr::addr_eq(*installed, logger))
}

/// 以 `[ INFO] message` 的格式输出一条日志，日志级别带颜色
pub fn write_log(writer: &mut impl Write, record: &Record<'_>) -> fmt::Result {
    let color = match record.level() {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::BrightYellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug => AnsiColor::Green,
        Level::Trace => AnsiColor::BrightBlack,
    };
    writeln!(
        writer,
        "{}[{:>5}]{} {}",
        color.render_fg(),
        record.level(),
        Reset.render(),
        record.args()
    )
}

/// 交给已注册的输出端。级别过滤已经在宏中做过了
#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, args: Arguments<'_>) {
    if let Some(logger) = LOGGER.get() {
        logger.log(&Record::new(level, args));
    }
}
