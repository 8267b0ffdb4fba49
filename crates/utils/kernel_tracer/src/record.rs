use core::fmt::Arguments;

use crate::Level;

/// 一条日志，只在调用 `Log::log` 期间存活
#[derive(Clone, Debug)]
pub struct Record<'a> {
    level: Level,
    args: Arguments<'a>,
}

impl<'a> Record<'a> {
    pub fn new(level: Level, args: Arguments<'a>) -> Self {
        Self { level, args }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn args(&self) -> &Arguments<'a> {
        &self.args
    }
}
