//! Runtime configuration of the coordinator and the race harness.

use std::time::Duration;

use crate::model::Isolation;

/// Tunables that real engines keep in server variables.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound on any blocking lock wait.
    pub lock_wait_timeout: Duration,
    /// Pause between an assignment's read and its write.
    pub think_time: Duration,
    /// Isolation used when a unit of work is started without an explicit level.
    pub default_isolation: Isolation,
    /// Hide rows inserted after the snapshot from repeatable-read scans.
    ///
    /// Not guaranteed by the SQL standard; some engines do it, some don't.
    pub repeatable_read_phantom_protection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
            think_time: Duration::from_millis(10),
            default_isolation: Isolation::RepeatableRead,
            repeatable_read_phantom_protection: true,
        }
    }
}

impl Config {
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_default_isolation(mut self, isolation: Isolation) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn with_repeatable_read_phantom_protection(mut self, enabled: bool) -> Self {
        self.repeatable_read_phantom_protection = enabled;
        self
    }
}
