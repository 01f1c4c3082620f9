//! Manager options and their environment overrides.

/// Disables transfer coalescing when set to `0`, `false` or `off`.
pub const COALESCE_ENV: &str = "IMGSYNC_COALESCE";

/// Caps the bytes a single manager may allocate on the device.
pub const MAX_DEVICE_BYTES_ENV: &str = "IMGSYNC_MAX_DEVICE_BYTES";

/// Tunables for an [`crate::ImageSyncManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Merge rows that are contiguous in both buffers into one span.
    pub coalesce_transfers: bool,
    /// Refuse device allocations larger than this many bytes.
    pub max_device_bytes: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            coalesce_transfers: true,
            max_device_bytes: None,
        }
    }
}

impl SyncOptions {
    /// Defaults, overridden by `IMGSYNC_COALESCE` and `IMGSYNC_MAX_DEVICE_BYTES`.
    ///
    /// Unrecognized values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();

        if let Some(val) = lookup(COALESCE_ENV) {
            match val.trim().to_lowercase().as_str() {
                "0" | "false" | "off" => opts.coalesce_transfers = false,
                "1" | "true" | "on" => opts.coalesce_transfers = true,
                _ => {}
            }
        }

        if let Some(val) = lookup(MAX_DEVICE_BYTES_ENV)
            && let Ok(bytes) = val.trim().parse::<usize>()
        {
            opts.max_device_bytes = Some(bytes);
        }

        opts
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_transfers = enabled;
        self
    }

    pub fn with_max_device_bytes(mut self, bytes: usize) -> Self {
        self.max_device_bytes = Some(bytes);
        self
    }
}
