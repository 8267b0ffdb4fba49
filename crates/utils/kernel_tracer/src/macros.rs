/// 该级别的日志能否通过编译期过滤
///
/// 用来跳过只为输出日志而做的计算。
#[macro_export]
macro_rules! log_enabled {
    ($level:expr) => {
        $level <= $crate::CLOG
    };
}

#[macro_export]
macro_rules! log {
    // log!(Level::Info, "queue {} ready", 0);
    ($level:expr, $($arg:tt)+) => {{
        let level: $crate::Level = $level;
        if $crate::log_enabled!(level) {
            $crate::log_impl(level, ::core::format_args!($($arg)+));
        }
    }};
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Error, $($arg)+))
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Warn, $($arg)+))
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Info, $($arg)+))
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Debug, $($arg)+))
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => ($crate::log!($crate::Level::Trace, $($arg)+))
}
