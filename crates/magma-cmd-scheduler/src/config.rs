//! # Scheduler Configuration
//!
//! Tunables for preemption polling, the fault queue, time-slice bounds and
//! the set of runlist domains created at initialization.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::time::Duration;

use magma_core::{DomainId, EngineId, EngineType, Error, Result};

use crate::policy::{
    PriorityThenWait, RoundRobin, SchedulingPolicy, StrictPriority, WeightedFair,
};

// =============================================================================
// BACKOFF
// =============================================================================

/// Delay schedule between completion polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same interval for every poll
    Fixed,
    /// Interval doubles after every poll, capped
    Exponential {
        /// Upper bound for one interval
        max_interval_us: u64,
    },
}

impl Backoff {
    /// Interval to wait after `retry` failed polls
    pub fn interval_us(self, base_us: u64, retry: u32) -> u64 {
        match self {
            Self::Fixed => base_us,
            Self::Exponential { max_interval_us } => {
                let shift = retry.min(32);
                base_us
                    .checked_shl(shift)
                    .unwrap_or(u64::MAX)
                    .min(max_interval_us)
            },
        }
    }
}

// =============================================================================
// PREEMPT CONFIG
// =============================================================================

/// Preempt controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptConfig {
    /// Completion polls before a waited request times out
    pub max_retries: u32,
    /// Base interval between polls
    pub poll_interval_us: u64,
    /// Interval schedule
    pub backoff: Backoff,
    /// Deadline for fire-and-forget requests
    pub async_timeout_us: u64,
}

impl Default for PreemptConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,
            poll_interval_us: 10,
            backoff: Backoff::Fixed,
            async_timeout_us: 100_000,
        }
    }
}

// =============================================================================
// POLICY KIND
// =============================================================================

/// Built-in scheduling policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    /// Priority class, then earliest runnable first
    #[default]
    PriorityThenWait,
    /// Priority class, then group id
    StrictPriority,
    /// Rotating order with a uniform quantum
    RoundRobin,
    /// Virtual-time fairness weighted by priority
    WeightedFair,
}

impl PolicyKind {
    /// Instantiate the policy
    pub fn build(self, default_timeslice: Duration) -> Box<dyn SchedulingPolicy> {
        match self {
            Self::PriorityThenWait => Box::new(PriorityThenWait::new()),
            Self::StrictPriority => Box::new(StrictPriority::new()),
            Self::RoundRobin => Box::new(RoundRobin::new(default_timeslice)),
            Self::WeightedFair => Box::new(WeightedFair::new()),
        }
    }
}

// =============================================================================
// DOMAIN CONFIG
// =============================================================================

/// One runlist domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainConfig {
    /// Domain id
    pub id: DomainId,
    /// Engine whose runlist the domain feeds
    pub engine: EngineId,
    /// Engine type
    pub engine_type: EngineType,
    /// Initial policy
    pub policy: PolicyKind,
}

impl DomainConfig {
    /// Domain with the default policy
    pub fn new(id: DomainId, engine: EngineId, engine_type: EngineType) -> Self {
        Self {
            id,
            engine,
            engine_type,
            policy: PolicyKind::default(),
        }
    }

    /// Select the policy
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }
}

// =============================================================================
// SCHEDULER CONFIG
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Preempt polling
    pub preempt: PreemptConfig,
    /// Capacity of the fault queue
    pub fault_queue_depth: usize,
    /// Idle interval of the fault worker
    pub fault_poll_interval_us: u64,
    /// Smallest accepted group time slice
    pub timeslice_min_us: u64,
    /// Largest accepted group time slice
    pub timeslice_max_us: u64,
    /// Time slice of new groups and base quantum for policies
    pub default_timeslice_us: u64,
    /// Domains to create
    pub domains: Vec<DomainConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preempt: PreemptConfig::default(),
            fault_queue_depth: 64,
            fault_poll_interval_us: 100,
            timeslice_min_us: 1_000,
            timeslice_max_us: 50_000,
            default_timeslice_us: 5_000,
            domains: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Add a domain
    pub fn with_domain(mut self, domain: DomainConfig) -> Self {
        self.domains.push(domain);
        self
    }

    /// Default group time slice
    pub fn default_timeslice(&self) -> Duration {
        Duration::from_micros(self.default_timeslice_us)
    }

    /// Check that a time slice lies within the configured bounds
    pub fn check_timeslice(&self, slice: Duration) -> Result<()> {
        let us = slice.as_micros();
        if us < u128::from(self.timeslice_min_us) || us > u128::from(self.timeslice_max_us) {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.preempt.max_retries == 0 || self.preempt.poll_interval_us == 0 {
            return Err(Error::InvalidParameter);
        }
        if let Backoff::Exponential { max_interval_us } = self.preempt.backoff {
            if max_interval_us < self.preempt.poll_interval_us {
                return Err(Error::InvalidParameter);
            }
        }
        if self.fault_queue_depth == 0 || self.fault_poll_interval_us == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.timeslice_min_us == 0 || self.timeslice_min_us > self.timeslice_max_us {
            return Err(Error::InvalidParameter);
        }
        self.check_timeslice(self.default_timeslice())?;

        for (i, domain) in self.domains.iter().enumerate() {
            if domain.id.is_null() {
                return Err(Error::InvalidParameter);
            }
            // Duplicate ids
            if self.domains[..i].iter().any(|d| d.id == domain.id) {
                return Err(Error::InvalidParameter);
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(id: u64) -> DomainConfig {
        DomainConfig::new(DomainId::new(id), EngineId(0), EngineType::Compute)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default().with_domain(domain(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.default_timeslice(), Duration::from_millis(5));
    }

    #[test]
    fn test_duplicate_domains_rejected() {
        let config = SchedulerConfig::default()
            .with_domain(domain(1))
            .with_domain(domain(1));
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_timeslice_bounds() {
        let config = SchedulerConfig::default();
        assert!(config.check_timeslice(Duration::from_millis(1)).is_ok());
        assert!(config.check_timeslice(Duration::from_micros(999)).is_err());
        assert!(config.check_timeslice(Duration::from_millis(51)).is_err());
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            max_interval_us: 100,
        };
        assert_eq!(backoff.interval_us(10, 0), 10);
        assert_eq!(backoff.interval_us(10, 2), 40);
        assert_eq!(backoff.interval_us(10, 10), 100);
        assert_eq!(backoff.interval_us(10, 200), 100);
        assert_eq!(Backoff::Fixed.interval_us(10, 50), 10);
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = SchedulerConfig {
            fault_queue_depth: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
    }
}
