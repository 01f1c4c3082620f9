//! Lazy CPU/device buffer coherence for N-dimensional images.
//!
//! `imgsync-core` keeps a host-resident pixel buffer and a device-resident
//! buffer consistent for one logical image. Copies happen only when a consumer
//! asks for the side that is stale, and every copy is bounded by the overlap of
//! the CPU and GPU regions.
//!
//! # Layout
//!
//! - [`RegionDescriptor`]: N-dimensional index + size box
//! - [`FreshnessState`]: which side holds the authoritative copy
//! - [`DeviceAllocator`] / [`DeviceBuffer`]: the device collaborator and the
//!   shared handle that frees device memory on last drop
//! - [`ImageSyncManager`]: the coherence manager itself
//! - [`KernelAccess`]: capability handed to kernel executors
//! - [`SyncedImage`]: reference owner implementing the image-side contract

pub mod config;
pub mod device;
pub mod freshness;
pub mod image;
pub mod kernel;
pub mod manager;
pub mod region;
pub mod transfer;

pub use config::SyncOptions;
pub use device::{DeviceAllocator, DeviceBuffer, DevicePtr};
pub use freshness::{Freshness, FreshnessState, Side, TimeStamp};
pub use image::{HostImage, SyncedImage};
pub use kernel::KernelAccess;
pub use manager::ImageSyncManager;
pub use region::RegionDescriptor;
pub use transfer::{CopySpan, SyncDirection, TransferPlan};

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller contract or geometry problem; retrying without changes fails again.
    Configuration,
    /// Device memory exhausted or unavailable.
    Allocation,
    /// A copy primitive failed mid-operation.
    Transfer,
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid dimension count {0}")]
    InvalidDimension(usize),

    #[error("{unsynced} side holds unsynchronized writes; sync before marking the other side modified")]
    DualDirty { unsynced: Side },

    #[error("invalid graft: {0}")]
    InvalidGraft(String),

    #[error("no device buffer allocated")]
    NoDeviceBuffer,

    #[error("no image bound to the manager")]
    NoImage,

    #[error("host buffer holds {got} elements, region requires {expected}")]
    HostBufferMismatch { expected: usize, got: usize },

    #[error("region {0} is empty")]
    EmptyRegion(RegionDescriptor),

    #[error("device region {gpu} does not intersect image region {cpu}")]
    RegionOutsideImage {
        cpu: RegionDescriptor,
        gpu: RegionDescriptor,
    },

    #[error("device buffer holds unsynchronized writes that would be discarded")]
    UnsyncedDeviceWrites,

    #[error("host buffer holds writes never uploaded that would be discarded")]
    UnsyncedHostWrites,

    #[error("device allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("{direction} transfer failed: {reason}")]
    Transfer {
        direction: SyncDirection,
        reason: String,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Allocation { .. } => ErrorKind::Allocation,
            SyncError::Transfer { .. } => ErrorKind::Transfer,
            _ => ErrorKind::Configuration,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}
