use crate::error::{RevlogError, RevlogResult};

/// Runtime configuration for a change orchestrator.
///
/// The two timeout fields model the execution budget of the hosting
/// platform: `change_timeout_ms` is the hard deadline after which any other
/// process may treat an in-flight change as abandoned, and
/// `critical_timeout_ms` is the tighter margin at which the owning process
/// voluntarily gives up instead of racing that deadline. The gap between
/// them is the headroom a recovering process needs to observe the record,
/// claim it and finish or fail it without ambiguity.
#[derive(Debug, Clone)]
pub struct RevlogConfig {
    /// Hard staleness deadline for an in-flight change, measured from its
    /// last activity stamp.
    pub change_timeout_ms: u64,
    /// Voluntary give-up margin; must be strictly below `change_timeout_ms`.
    pub critical_timeout_ms: u64,
    /// First sleep when polling a conflicting predecessor.
    pub wait_initial_delay_ms: u64,
    /// Backoff ceiling for predecessor polling.
    pub wait_max_delay_ms: u64,
    /// Full protocol attempts per command before a voluntary timeout is
    /// surfaced to the caller.
    pub max_command_attempts: u32,
    /// Upper bound on consecutive occupied revisions the allocation loop
    /// will probe past before treating the log as corrupt.
    pub max_allocate_probes: u64,
    /// Largest batch window for the forward scan in `current_revision`.
    pub max_scan_window: u64,
    /// Age at which the process-shared counter entry is re-pulled from the
    /// distributed cache.
    pub shared_refresh_interval_ms: u64,
    /// Capacity of the process-wide terminal-record cache.
    pub record_cache_capacity: usize,
    /// Publish counters and terminal records to the distributed cache.
    pub cache_write_through: bool,
}

impl Default for RevlogConfig {
    fn default() -> Self {
        Self {
            change_timeout_ms: 30_000,
            critical_timeout_ms: 24_000,
            wait_initial_delay_ms: 10,
            wait_max_delay_ms: 1_000,
            max_command_attempts: 4,
            max_allocate_probes: 10_000,
            max_scan_window: 1_024,
            shared_refresh_interval_ms: 1_000,
            record_cache_capacity: 4_096,
            cache_write_through: true,
        }
    }
}

impl RevlogConfig {
    /// Profile for heavily contended trees: tighter poll ceiling so waiters
    /// notice predecessor commits sooner, and more attempts before giving up.
    pub fn contended() -> Self {
        Self {
            wait_initial_delay_ms: 5,
            wait_max_delay_ms: 250,
            max_command_attempts: 8,
            ..Self::default()
        }
    }

    /// Profile with short deadlines so recovery paths run in test time.
    pub fn testing() -> Self {
        Self {
            change_timeout_ms: 200,
            critical_timeout_ms: 150,
            wait_initial_delay_ms: 1,
            wait_max_delay_ms: 20,
            shared_refresh_interval_ms: 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RevlogResult<()> {
        if self.change_timeout_ms == 0 {
            return Err(RevlogError::InvalidConfig {
                message: "change_timeout_ms must be positive".into(),
            });
        }
        if self.critical_timeout_ms >= self.change_timeout_ms {
            return Err(RevlogError::InvalidConfig {
                message: format!(
                    "critical_timeout_ms ({}) must be below change_timeout_ms ({})",
                    self.critical_timeout_ms, self.change_timeout_ms
                ),
            });
        }
        if self.wait_initial_delay_ms == 0 || self.wait_max_delay_ms < self.wait_initial_delay_ms {
            return Err(RevlogError::InvalidConfig {
                message: "predecessor backoff bounds are inverted or zero".into(),
            });
        }
        if self.max_command_attempts == 0 {
            return Err(RevlogError::InvalidConfig {
                message: "max_command_attempts must be at least 1".into(),
            });
        }
        if self.max_allocate_probes == 0 {
            return Err(RevlogError::InvalidConfig {
                message: "max_allocate_probes must be positive".into(),
            });
        }
        if self.max_scan_window == 0 {
            return Err(RevlogError::InvalidConfig {
                message: "max_scan_window must be positive".into(),
            });
        }
        if self.record_cache_capacity == 0 {
            return Err(RevlogError::InvalidConfig {
                message: "record_cache_capacity must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RevlogConfig;

    #[test]
    fn default_config_is_valid() {
        RevlogConfig::default().validate().expect("default valid");
        RevlogConfig::contended()
            .validate()
            .expect("contended valid");
        RevlogConfig::testing().validate().expect("testing valid");
    }

    #[test]
    fn critical_margin_must_leave_recovery_headroom() {
        let cfg = RevlogConfig {
            critical_timeout_ms: 30_000,
            ..RevlogConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_bounds_checked() {
        let cfg = RevlogConfig {
            wait_initial_delay_ms: 100,
            wait_max_delay_ms: 10,
            ..RevlogConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
