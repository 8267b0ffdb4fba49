//! 把日志收集到内存里的输出端，供测试断言诊断信息

use alloc::{string::String, vec::Vec};

use spin::Mutex;

use crate::{write_log, Log, Record};

static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct Capture;

impl Log for Capture {
    fn log(&self, record: &Record<'_>) {
        let mut line = String::new();
        if write_log(&mut line, record).is_ok() {
            LINES.lock().push(line);
        }
    }
}

static CAPTURE: Capture = Capture;

/// 注册捕获输出端，返回捕获是否生效。可重复调用
pub fn install() -> bool {
    crate::set_logger(&CAPTURE) || crate::logger_is(&CAPTURE)
}

/// 已捕获的日志中是否有一行包含 `needle`
pub fn contains(needle: &str) -> bool {
    LINES.lock().iter().any(|line| line.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::{contains, install};
    use crate::{Level, CLOG};

    #[test]
    fn captured_lines_are_searchable() {
        let active = install();
        warn!("virtio slot {} is empty", 7);
        if active && Level::Warn <= CLOG {
            assert!(contains("virtio slot 7 is empty"));
        }
    }
}
