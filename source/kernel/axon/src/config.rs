// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel configuration
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (new/with_*/validate), ConfigError
//! DEPENDS_ON: diag::log::Level, kernel::smp::MAX_CPUS
//! INVARIANTS: Every CPU gets an idle slot and at least one slot is left for user environments;
//!             capacity never exceeds the id index space

use core::fmt;

use axon_abi::NENV;

use crate::diag::log::Level;
use crate::kernel::smp::MAX_CPUS;

/// Default number of CPUs brought up.
pub const DEFAULT_NCPU: usize = 1;
/// Default environment table capacity.
pub const DEFAULT_ENV_CAPACITY: usize = NENV;
/// Default physical frame count (16 MiB of 4 KiB pages).
pub const DEFAULT_PHYS_FRAMES: usize = 4096;

/// Rejected configuration.
#[must_use = "configuration errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one CPU is required.
    NoCpus,
    /// More CPUs than the online mask can track.
    TooManyCpus { ncpu: usize, max: usize },
    /// Capacity must leave a slot beyond the idle environments and stay within `NENV`.
    Capacity { capacity: usize, ncpu: usize },
    /// Not enough frames for one root table per idle environment.
    TooFewFrames { frames: usize, needed: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Tunables read once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub ncpu: usize,
    pub env_capacity: usize,
    pub phys_frames: usize,
    pub log_level: Level,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            ncpu: DEFAULT_NCPU,
            env_capacity: DEFAULT_ENV_CAPACITY,
            phys_frames: DEFAULT_PHYS_FRAMES,
            log_level: Level::Info,
        }
    }

    pub const fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub const fn with_env_capacity(mut self, capacity: usize) -> Self {
        self.env_capacity = capacity;
        self
    }

    pub const fn with_phys_frames(mut self, frames: usize) -> Self {
        self.phys_frames = frames;
        self
    }

    pub const fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpu == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.ncpu > MAX_CPUS {
            return Err(ConfigError::TooManyCpus { ncpu: self.ncpu, max: MAX_CPUS });
        }
        if self.env_capacity <= self.ncpu || self.env_capacity > NENV {
            return Err(ConfigError::Capacity { capacity: self.env_capacity, ncpu: self.ncpu });
        }
        if self.phys_frames < self.ncpu {
            return Err(ConfigError::TooFewFrames { frames: self.phys_frames, needed: self.ncpu });
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn builders_and_bounds() {
        let cfg = KernelConfig::new().with_ncpu(4).with_env_capacity(4);
        assert_eq!(cfg.validate(), Err(ConfigError::Capacity { capacity: 4, ncpu: 4 }));
        assert_eq!(cfg.with_env_capacity(NENV + 1).validate(), Err(ConfigError::Capacity { capacity: NENV + 1, ncpu: 4 }));
        assert_eq!(cfg.with_env_capacity(5).validate(), Ok(()));
        assert_eq!(KernelConfig::new().with_ncpu(0).validate(), Err(ConfigError::NoCpus));
        assert_eq!(
            KernelConfig::new().with_ncpu(MAX_CPUS + 1).validate(),
            Err(ConfigError::TooManyCpus { ncpu: MAX_CPUS + 1, max: MAX_CPUS })
        );
        assert_eq!(
            KernelConfig::new().with_ncpu(2).with_phys_frames(1).validate(),
            Err(ConfigError::TooFewFrames { frames: 1, needed: 2 })
        );
    }
}
