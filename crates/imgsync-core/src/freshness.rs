//! Freshness tracking: which side of an image holds the authoritative copy.
//!
//! The state is an explicit enum backed by a timestamp triple. The enum drives
//! synchronization; the timestamps detect the dual-dirty contract violation
//! and let a generic `update` decide which way data must flow.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::transfer::SyncDirection;
use crate::{Result, SyncError};

/// Process-wide modification clock. Starts at 1 so that 0 means "never".
static CLOCK: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing modification time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// A timestamp older than every modification.
    pub const NEVER: TimeStamp = TimeStamp(0);

    /// Draw a fresh timestamp, strictly greater than every earlier one.
    pub fn now() -> Self {
        TimeStamp(CLOCK.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// One side of the CPU/device pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Cpu,
    Gpu,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Cpu => write!(f, "CPU"),
            Side::Gpu => write!(f, "GPU"),
        }
    }
}

/// Which copy, if any, is out of date.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// Both copies agree, or nothing has been materialized yet.
    #[default]
    BothCurrent,
    /// The host copy is out of date; the device holds the latest writes.
    CpuStale,
    /// The device copy is out of date; the host holds the latest writes.
    GpuStale,
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::BothCurrent => write!(f, "both current"),
            Freshness::CpuStale => write!(f, "CPU stale"),
            Freshness::GpuStale => write!(f, "GPU stale"),
        }
    }
}

/// Per-manager freshness state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreshnessState {
    state: Freshness,
    cpu_modified: TimeStamp,
    gpu_modified: TimeStamp,
    synced: TimeStamp,
}

impl FreshnessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Freshness {
        self.state
    }

    pub fn cpu_modified(&self) -> TimeStamp {
        self.cpu_modified
    }

    pub fn gpu_modified(&self) -> TimeStamp {
        self.gpu_modified
    }

    pub fn last_sync(&self) -> TimeStamp {
        self.synced
    }

    /// Whether `side` carries writes newer than the last completed sync.
    pub fn has_unsynced_writes(&self, side: Side) -> bool {
        match side {
            Side::Cpu => self.cpu_modified > self.synced,
            Side::Gpu => self.gpu_modified > self.synced,
        }
    }

    pub fn is_cpu_stale(&self) -> bool {
        self.state == Freshness::CpuStale
    }

    pub fn is_gpu_stale(&self) -> bool {
        self.state == Freshness::GpuStale
    }

    /// Record a host-side write. The device copy becomes stale.
    ///
    /// Fails if the device holds writes that were never copied back.
    pub fn mark_cpu_modified(&mut self) -> Result<()> {
        if self.has_unsynced_writes(Side::Gpu) {
            return Err(SyncError::DualDirty {
                unsynced: Side::Gpu,
            });
        }
        self.cpu_modified = TimeStamp::now();
        self.state = Freshness::GpuStale;
        Ok(())
    }

    /// Record a device-side write. The host copy becomes stale.
    ///
    /// Fails if the host holds writes that were never uploaded.
    pub fn mark_gpu_modified(&mut self) -> Result<()> {
        if self.has_unsynced_writes(Side::Cpu) {
            return Err(SyncError::DualDirty {
                unsynced: Side::Cpu,
            });
        }
        self.gpu_modified = TimeStamp::now();
        self.state = Freshness::CpuStale;
        Ok(())
    }

    /// Direction a generic sync must flow, resolved from the timestamps.
    pub fn pending_direction(&self) -> Option<SyncDirection> {
        match (
            self.has_unsynced_writes(Side::Cpu),
            self.has_unsynced_writes(Side::Gpu),
        ) {
            (true, false) => Some(SyncDirection::HostToDevice),
            (false, true) => Some(SyncDirection::DeviceToHost),
            _ => None,
        }
    }

    /// Timestamps and the explicit state agree.
    pub fn is_consistent(&self) -> bool {
        let expected = match self.pending_direction() {
            Some(SyncDirection::HostToDevice) => Freshness::GpuStale,
            Some(SyncDirection::DeviceToHost) => Freshness::CpuStale,
            None => Freshness::BothCurrent,
        };
        !(self.has_unsynced_writes(Side::Cpu) && self.has_unsynced_writes(Side::Gpu))
            && expected == self.state
    }

    /// Record a completed copy; both sides agree afterwards.
    pub fn complete_sync(&mut self) {
        self.synced = TimeStamp::now();
        self.state = Freshness::BothCurrent;
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
