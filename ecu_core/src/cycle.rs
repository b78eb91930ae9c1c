//! Deterministic super-loop pacing: tick → sleep → tick.
//!
//! The loop body is [`crate::app::EcuApp::run_tick`]; this module owns
//! the timing. Production builds (`rt` feature) lock memory, pin the
//! loop to a core, raise SCHED_FIFO and pace with
//! `clock_nanosleep(TIMER_ABSTIME)` for drift-free cycles; simulation
//! builds use `std::thread::sleep`. Overruns are counted, never fatal —
//! the control loop always keeps running.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::app::EcuApp;

// ─── Cycle statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Last cycle duration [ns].
    pub last_cycle_ns: i64,
    /// Minimum cycle duration [ns].
    pub min_cycle_ns: i64,
    /// Maximum cycle duration [ns].
    pub max_cycle_ns: i64,
    /// Running sum for average computation.
    pub sum_cycle_ns: i64,
    /// Number of overruns detected.
    pub overruns: u64,
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: i64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            overruns: 0,
        }
    }

    /// Record a cycle duration. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: i64) {
        self.cycle_count += 1;
        self.last_cycle_ns = duration_ns;
        if duration_ns < self.min_cycle_ns {
            self.min_cycle_ns = duration_ns;
        }
        if duration_ns > self.max_cycle_ns {
            self.max_cycle_ns = duration_ns;
        }
        self.sum_cycle_ns += duration_ns;
    }

    /// Average cycle time [ns] (0 before the first cycle).
    #[inline]
    pub fn avg_cycle_ns(&self) -> i64 {
        if self.cycle_count == 0 {
            0
        } else {
            self.sum_cycle_ns / self.cycle_count as i64
        }
    }
}

// ─── RT setup ───────────────────────────────────────────────────────

/// Errors during RT setup.
#[derive(Debug)]
pub struct RtSetupError(pub String);

impl std::fmt::Display for RtSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RT setup error: {}", self.0)
    }
}

impl std::error::Error for RtSetupError {}

/// Lock all current and future memory pages.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), RtSetupError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| RtSetupError(format!("mlockall failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), RtSetupError> {
    Ok(()) // No-op in simulation mode
}

/// Prefault stack pages to prevent page faults during RT execution.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the current thread to a specific CPU core.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), RtSetupError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| RtSetupError(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| RtSetupError(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), RtSetupError> {
    Ok(())
}

/// Set SCHED_FIFO with the given RT priority.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), RtSetupError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RtSetupError(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), RtSetupError> {
    Ok(())
}

/// Perform the full RT setup sequence. All calls are no-ops without the
/// `rt` feature.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), RtSetupError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

// ─── Cycle runner ───────────────────────────────────────────────────

/// Paces [`EcuApp::run_tick`] at the configured cycle time.
pub struct CycleRunner {
    pub app: EcuApp,
    cycle_time_ns: i64,
    pub stats: CycleStats,
}

impl CycleRunner {
    pub fn new(app: EcuApp) -> Self {
        let cycle_time_ns = app.cycle_time_us() as i64 * 1000;
        Self {
            app,
            cycle_time_ns,
            stats: CycleStats::new(),
        }
    }

    /// Run the loop; `duration` bounds the run (None = forever).
    pub fn run(&mut self, duration: Option<Duration>) -> Result<(), RtSetupError> {
        let (cpu, priority) = self.app.rt_parameters();
        rt_setup(cpu, priority)?;
        info!(cycle_time_ns = self.cycle_time_ns, "entering control loop");

        #[cfg(feature = "rt")]
        {
            self.run_rt_loop(duration)
        }

        #[cfg(not(feature = "rt"))]
        {
            self.run_sim_loop(duration)
        }
    }

    fn record_cycle(&mut self, duration_ns: i64) {
        self.stats.record(duration_ns);
        if duration_ns > self.cycle_time_ns {
            self.stats.overruns += 1;
            if self.stats.overruns.is_power_of_two() {
                warn!(
                    actual_ns = duration_ns,
                    budget_ns = self.cycle_time_ns,
                    overruns = self.stats.overruns,
                    "cycle overrun"
                );
            }
        }
    }

    /// RT loop: absolute-time sleep on CLOCK_MONOTONIC for drift-free
    /// pacing.
    #[cfg(feature = "rt")]
    fn run_rt_loop(&mut self, duration: Option<Duration>) -> Result<(), RtSetupError> {
        use nix::time::{ClockId, clock_gettime, clock_nanosleep, ClockNanosleepFlags};

        let clock = ClockId::CLOCK_MONOTONIC;
        let mut next_wake = clock_gettime(clock)
            .map_err(|e| RtSetupError(format!("clock_gettime: {e}")))?;
        let start = Instant::now();

        loop {
            next_wake = timespec_add_ns(next_wake, self.cycle_time_ns);

            let cycle_start = Instant::now();
            self.app.run_tick(start.elapsed().as_micros() as u64);
            self.record_cycle(cycle_start.elapsed().as_nanos() as i64);

            if let Some(limit) = duration
                && start.elapsed() >= limit
            {
                info!(cycles = self.stats.cycle_count, "bounded run complete");
                return Ok(());
            }

            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
    }

    /// Simulation loop: relative sleep, approximate timing.
    #[cfg(not(feature = "rt"))]
    fn run_sim_loop(&mut self, duration: Option<Duration>) -> Result<(), RtSetupError> {
        let cycle_duration = Duration::from_nanos(self.cycle_time_ns as u64);
        let start = Instant::now();

        loop {
            let cycle_start = Instant::now();
            self.app.run_tick(start.elapsed().as_micros() as u64);
            let elapsed = cycle_start.elapsed();
            self.record_cycle(elapsed.as_nanos() as i64);

            if let Some(limit) = duration
                && start.elapsed() >= limit
            {
                info!(cycles = self.stats.cycle_count, "bounded run complete");
                return Ok(());
            }

            if let Some(remaining) = cycle_duration.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
    }

    /// Run exactly `n` ticks without sleeping (test support).
    pub fn run_ticks(&mut self, n: u64) {
        for i in 0..n {
            let now_us = (i + 1) * self.app.cycle_time_us() as u64;
            let cycle_start = Instant::now();
            self.app.run_tick(now_us);
            self.stats.record(cycle_start.elapsed().as_nanos() as i64);
        }
    }
}

// ─── Time helpers (rt) ──────────────────────────────────────────────

/// Add nanoseconds to a TimeSpec.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

// ─── Tests ──────────────────────────────────────────────────────────
