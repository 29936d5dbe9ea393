//! Process-level hardening applied before any secret is fetched.
//!
//! Every step is best-effort: a failure is logged and reported, never fatal.
//!
//! 1. **`PR_SET_DUMPABLE 0`** (Linux): no core dumps, and `/proc/<pid>/mem`
//!    becomes unreadable to other non-root processes.
//! 2. **`mlockall(MCL_CURRENT | MCL_FUTURE)`**: keeps key material out of
//!    swap.  Usually needs `CAP_IPC_LOCK` or a generous `RLIMIT_MEMLOCK`.

use bwagent_core::config::HardeningConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardeningReport {
    pub not_dumpable: StepOutcome,
    pub memory_locked: StepOutcome,
}

impl HardeningReport {
    pub fn any_failed(&self) -> bool {
        self.not_dumpable == StepOutcome::Failed || self.memory_locked == StepOutcome::Failed
    }
}

pub fn apply(config: &HardeningConfig) -> HardeningReport {
    HardeningReport {
        not_dumpable: if config.disable_core_dumps {
            set_not_dumpable()
        } else {
            StepOutcome::Skipped
        },
        memory_locked: if config.lock_memory {
            lock_memory()
        } else {
            StepOutcome::Skipped
        },
    }
}

#[cfg(target_os = "linux")]
fn set_not_dumpable() -> StepOutcome {
    // SAFETY: PR_SET_DUMPABLE takes a plain integer argument.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong, 0, 0, 0) };
    if ret == 0 {
        tracing::info!("PR_SET_DUMPABLE=0: core dumps and /proc/pid/mem access disabled");
        StepOutcome::Applied
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (continuing): {err}");
        StepOutcome::Failed
    }
}

#[cfg(not(target_os = "linux"))]
fn set_not_dumpable() -> StepOutcome {
    tracing::debug!("PR_SET_DUMPABLE unavailable on this platform");
    StepOutcome::Skipped
}

fn lock_memory() -> StepOutcome {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::info!("mlockall(MCL_CURRENT|MCL_FUTURE): memory locked in RAM");
        StepOutcome::Applied
    } else {
        // ENOMEM or EPERM without CAP_IPC_LOCK.
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (continuing without memory locking): {err}");
        StepOutcome::Failed
    }
}
