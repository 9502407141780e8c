//! Admission control for pool growth
//!
//! New workers are only started while load averages and memory usage stay
//! below their limits. The open-files limit caps the worker count and the
//! number of ballooned jobs.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use thiserror::Error;

use crate::config::WorkerConfig;

/// Descriptors used by the process before any worker starts
pub const OPEN_FILES_BASE: u64 = 50;

/// Descriptors used per worker
pub const OPEN_FILES_PER_WORKER: u64 = 5;

/// Safety margin applied to the descriptor estimate
pub const OPEN_FILES_MARGIN: f64 = 1.2;

/// 1, 5 and 15 minute load averages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Memory totals in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
}

/// Source of host resource readings
pub trait ResourceProbe: Send + Sync {
    fn load_average(&self) -> LoadAverage;

    fn memory(&self) -> MemoryUsage;
}

/// Readings from the running host
pub struct SystemProbe {
    sys: Mutex<System>,
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").finish()
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn load_average(&self) -> LoadAverage {
        let load = System::load_average();
        LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        }
    }

    fn memory(&self) -> MemoryUsage {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        MemoryUsage {
            total: sys.total_memory(),
            available: sys.available_memory(),
        }
    }
}

/// Settable readings for tests and dry runs
#[derive(Debug, Default)]
pub struct FixedProbe {
    load: Mutex<LoadAverage>,
    memory: Mutex<MemoryUsage>,
}

impl FixedProbe {
    pub fn new(load: LoadAverage, memory: MemoryUsage) -> Self {
        Self {
            load: Mutex::new(load),
            memory: Mutex::new(memory),
        }
    }

    /// Idle host with plenty of memory
    pub fn idle() -> Self {
        Self::new(
            LoadAverage::default(),
            MemoryUsage {
                total: 16 << 30,
                available: 12 << 30,
            },
        )
    }

    pub fn set_load(&self, load: LoadAverage) {
        *self.load.lock() = load;
    }

    pub fn set_memory(&self, memory: MemoryUsage) {
        *self.memory.lock() = memory;
    }
}

impl ResourceProbe for FixedProbe {
    fn load_average(&self) -> LoadAverage {
        *self.load.lock()
    }

    fn memory(&self) -> MemoryUsage {
        *self.memory.lock()
    }
}

/// Why the pool may not grow
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Denied {
    #[error("cannot start any more worker, {name} is too high: {current:.6} > {limit:.6}")]
    Load {
        name: &'static str,
        current: f64,
        limit: f64,
    },

    #[error("cannot start any more worker, memory usage is too high: {used}% > {limit}% (free: {free_mb} MB)")]
    Memory { used: u64, limit: u8, free_mb: u64 },
}

/// Load and memory gate
#[derive(Clone)]
pub struct Admission {
    probe: Arc<dyn ResourceProbe>,
    load_limits: [f64; 3],
    mem_limit: u8,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("load_limits", &self.load_limits)
            .field("mem_limit", &self.mem_limit)
            .finish()
    }
}

impl Admission {
    pub fn new(config: &WorkerConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            load_limits: [config.load_limit1, config.load_limit5, config.load_limit15],
            mem_limit: config.mem_limit,
        }
    }

    /// Both load and memory allow another worker
    pub fn check(&self) -> Result<(), Denied> {
        self.check_loads()?;
        self.check_memory()
    }

    /// Compare load averages against their limits; a limit of 0 disables it
    pub fn check_loads(&self) -> Result<(), Denied> {
        if self.load_limits.iter().all(|limit| *limit <= 0.0) {
            return Ok(());
        }
        let load = self.probe.load_average();
        let readings = [
            ("load1", load.one),
            ("load5", load.five),
            ("load15", load.fifteen),
        ];
        for ((name, current), limit) in readings.into_iter().zip(self.load_limits) {
            if limit > 0.0 && current > 0.0 && limit < current {
                return Err(Denied::Load {
                    name,
                    current,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Compare used memory percentage against the limit
    pub fn check_memory(&self) -> Result<(), Denied> {
        if self.mem_limit == 0 {
            return Ok(());
        }
        let memory = self.probe.memory();
        if memory.total == 0 {
            return Ok(());
        }
        let free_percent = memory.available.min(memory.total) * 100 / memory.total;
        let used = 100 - free_percent;
        if used >= u64::from(self.mem_limit) {
            return Err(Denied::Memory {
                used,
                limit: self.mem_limit,
                free_mb: memory.available >> 20,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Open file limits
// ============================================================================

/// Descriptors needed to run `max_worker` workers
pub fn expected_open_files(max_worker: usize) -> u64 {
    ((max_worker as u64 * OPEN_FILES_PER_WORKER + OPEN_FILES_BASE) as f64 * OPEN_FILES_MARGIN) as u64
}

/// Workers that fit into `nofile` descriptors
pub fn max_possible_workers(nofile: u64) -> usize {
    let usable = (nofile as f64 / OPEN_FILES_MARGIN) as u64;
    (usable.saturating_sub(OPEN_FILES_BASE) / OPEN_FILES_PER_WORKER) as usize
}

/// Soft limit for open files, if it can be read
pub fn open_files_limit() -> Option<u64> {
    use nix::sys::resource::{getrlimit, Resource};

    getrlimit(Resource::RLIMIT_NOFILE).ok().map(|(soft, _)| soft)
}

/// Result of fitting `max_worker` into the open-files limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdBudget {
    /// Soft open-files limit
    pub nofile: u64,
    /// Workers the limit can sustain
    pub max_possible: usize,
    /// Set when `max_worker` had to be lowered
    pub clamped: Option<usize>,
}

impl FdBudget {
    /// Fit `max_worker` into `nofile` descriptors
    pub fn fit(max_worker: usize, nofile: u64) -> Self {
        let max_possible = max_possible_workers(nofile);
        let clamped = (expected_open_files(max_worker) > nofile).then_some(max_possible);
        Self {
            nofile,
            max_possible,
            clamped,
        }
    }

    /// Budget for the current process
    pub fn current(max_worker: usize) -> Self {
        match open_files_limit() {
            Some(nofile) => Self::fit(max_worker, nofile),
            None => Self {
                nofile: 0,
                max_possible: max_worker,
                clamped: None,
            },
        }
    }

    /// Extra in-flight jobs allowed next to `max_worker` workers
    pub fn ballooning_capacity(&self, max_worker: usize) -> usize {
        self.max_possible.saturating_sub(max_worker)
    }
}
