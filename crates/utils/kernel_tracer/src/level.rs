use core::{cmp::Ordering, fmt};

const NAMES: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Level {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        NAMES[self as usize]
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// 日志过滤等级，`Off` 关闭所有日志
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    pub const fn as_str(self) -> &'static str {
        NAMES[self as usize]
    }

    /// 按名字（大写）解析过滤等级，无法识别的名字视为 `Off`
    pub const fn from_name(name: &str) -> Self {
        const FILTERS: [LevelFilter; 6] = [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        let mut i = 0;
        while i < NAMES.len() {
            if bytes_eq(NAMES[i].as_bytes(), name.as_bytes()) {
                return FILTERS[i];
            }
            i += 1;
        }
        LevelFilter::Off
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl PartialEq<LevelFilter> for Level {
    fn eq(&self, other: &LevelFilter) -> bool {
        *self as u8 == *other as u8
    }
}

impl PartialOrd<LevelFilter> for Level {
    fn partial_cmp(&self, other: &LevelFilter) -> Option<Ordering> {
        (*self as u8).partial_cmp(&(*other as u8))
    }
}

/// 控制台日志等级，编译期由环境变量 `KERNEL_CLOG` 决定
///
/// 未设置时关闭日志，打开 `testing` 特性时全部输出。
pub const CLOG: LevelFilter = match option_env!("KERNEL_CLOG") {
    Some(name) => LevelFilter::from_name(name),
    None if cfg!(feature = "testing") => LevelFilter::Trace,
    None => LevelFilter::Off,
};

const fn bytes_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut i = 0;
    while i < lhs.len() {
        if lhs[i] != rhs[i] {
            return false;
        }
        i += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{Level, LevelFilter};

    #[test]
    fn parse_filter_names() {
        assert_eq!(LevelFilter::from_name("DEBUG"), LevelFilter::Debug);
        assert_eq!(LevelFilter::from_name("ERROR"), LevelFilter::Error);
        assert_eq!(LevelFilter::from_name("debug"), LevelFilter::Off);
        assert_eq!(LevelFilter::from_name(""), LevelFilter::Off);
    }

    #[test]
    fn level_against_filter() {
        assert!(Level::Warn <= LevelFilter::Info);
        assert!(Level::Trace > LevelFilter::Debug);
        assert!(Level::Error > LevelFilter::Off);
        assert_eq!(format!("{:>5}", Level::Info), " INFO");
    }
}
