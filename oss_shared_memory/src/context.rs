//! Per-process simulation context
//!
//! Holds what would otherwise be process-wide mutable globals: the role, the
//! shutdown flag, the live child count and the log level. Components receive
//! the pieces they need from here instead of reaching for ambient state.

use crate::error::ShmResult;
use crate::signals::{self, ShutdownFlag};
use oss_common::config::{LogConfig, LogLevel};
use oss_common::role::ProcessRole;

/// Count of children the coordinator launched and has not yet reaped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChildCounter {
    live: usize,
}

impl ChildCounter {
    /// Record a newly launched child.
    pub fn spawned(&mut self) {
        self.live += 1;
    }

    /// Record `count` children reaped outside the SIGCHLD handler.
    pub fn reaped(&mut self, count: usize) {
        self.live = self.live.saturating_sub(count);
    }

    /// Fold in what the SIGCHLD handler collected; returns that count.
    pub fn sync_reaped(&mut self) -> usize {
        let reaped = signals::take_reaped();
        self.reaped(reaped);
        reaped
    }

    /// Children still running
    pub fn current(&self) -> usize {
        self.live
    }
}

/// Everything a simulation process carries around
#[derive(Debug, Clone)]
pub struct SimContext {
    /// What this process is
    pub role: ProcessRole,
    /// Cooperative cancellation
    pub shutdown: ShutdownFlag,
    /// Children launched by this process
    pub children: ChildCounter,
    /// Minimum level this process logs at
    pub log_level: LogLevel,
}

impl SimContext {
    /// Context with a detached shutdown flag (no signal handlers).
    pub fn detached(role: ProcessRole, log_level: LogLevel) -> Self {
        Self {
            role,
            shutdown: ShutdownFlag::new(),
            children: ChildCounter::default(),
            log_level,
        }
    }

    /// Context wired to this process's signal handlers.
    pub fn with_signal_handlers(role: ProcessRole, log_level: LogLevel) -> ShmResult<Self> {
        let shutdown = signals::install(role)?;
        Ok(Self {
            role,
            shutdown,
            children: ChildCounter::default(),
            log_level,
        })
    }

    /// Whether the process should wind down
    pub fn should_stop(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Logger settings for this process: `base` filtered at our level.
    pub fn log_config(&self, base: &LogConfig) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: base.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_counter_never_underflows() {
        let mut children = ChildCounter::default();
        children.spawned();
        children.spawned();
        children.reaped(1);
        assert_eq!(children.current(), 1);
        children.reaped(5);
        assert_eq!(children.current(), 0);
    }

    #[test]
    fn detached_contexts_do_not_share_shutdown() {
        let a = SimContext::detached(ProcessRole::Coordinator, LogLevel::Info);
        let b = SimContext::detached(ProcessRole::Timekeeper, LogLevel::Debug);
        a.shutdown.request();
        assert!(a.should_stop());
        assert!(!b.should_stop());
    }

    #[test]
    fn log_config_takes_level_from_context() {
        let base = LogConfig {
            level: LogLevel::Error,
            file: Some("oss.log".into()),
        };
        let ctx = SimContext::detached(ProcessRole::Worker, LogLevel::Annoy);
        let log = ctx.log_config(&base);
        assert_eq!(log.level, LogLevel::Annoy);
        assert_eq!(log.file, base.file);
    }
}
