// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::RestartMode;
use crate::process::ExitInfo;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_RESTART_MAX_ATTEMPTS: u32 = 5;

/// When and how often a workload is relaunched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::default(),
            initial_delay: DEFAULT_RESTART_DELAY,
            max_delay: DEFAULT_RESTART_MAX_DELAY,
            max_attempts: DEFAULT_RESTART_MAX_ATTEMPTS,
        }
    }
}

impl RestartPolicy {
    /// Whether a process that exited on its own should be relaunched.
    pub fn restarts_after_exit(&self, exit: &ExitInfo) -> bool {
        match self.mode {
            RestartMode::Never => false,
            RestartMode::Always => true,
            RestartMode::OnFailure => !exit.success(),
        }
    }

    /// Whether a failed launch or a DOWN health verdict should be retried.
    pub fn restarts_after_failure(&self) -> bool {
        self.mode != RestartMode::Never
    }
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartMode::Never => write!(f, "never"),
            RestartMode::Always => write!(f, "always"),
            RestartMode::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Exponential restart backoff: `initial * 2^n`, capped at `max`, for at most
/// `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &RestartPolicy) -> Self {
        Self {
            initial: policy.initial_delay,
            max: policy.max_delay.max(policy.initial_delay),
            max_attempts: policy.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self
            .initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max));
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
