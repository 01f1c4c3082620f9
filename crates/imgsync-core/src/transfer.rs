//! Transfer planning: contiguous byte spans bounded by the region overlap.

use crate::region::RegionDescriptor;

/// Direction of a copy between host and device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    HostToDevice,
    DeviceToHost,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::HostToDevice => write!(f, "host-to-device"),
            SyncDirection::DeviceToHost => write!(f, "device-to-host"),
        }
    }
}

/// One contiguous run of bytes, present in both buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CopySpan {
    pub host_offset: usize,
    pub device_offset: usize,
    pub len: usize,
}

/// Byte spans that move exactly the overlap of two regions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferPlan {
    spans: Vec<CopySpan>,
    elem_size: usize,
}

impl TransferPlan {
    /// Plan the copy of `overlap` between a host buffer laid out over
    /// `host_region` and a device buffer laid out over `device_region`.
    ///
    /// Each row along dimension 0 becomes one span. With `coalesce`, rows that
    /// are adjacent in both buffers merge into one span. Returns an empty plan
    /// when the overlap is empty or is not contained in both regions.
    pub fn new(
        host_region: &RegionDescriptor,
        device_region: &RegionDescriptor,
        overlap: &RegionDescriptor,
        elem_size: usize,
        coalesce: bool,
    ) -> Self {
        let mut plan = Self {
            spans: Vec::new(),
            elem_size,
        };
        if overlap.is_empty()
            || elem_size == 0
            || !host_region.contains(overlap)
            || !device_region.contains(overlap)
        {
            return plan;
        }

        let ndim = overlap.ndim();
        let row_bytes = overlap.size()[0] * elem_size;
        let rows: usize = overlap.size()[1..].iter().product();
        let mut point: Vec<i64> = overlap.index().to_vec();

        for _ in 0..rows {
            // Both offsets exist: the overlap is contained in both regions.
            let host = host_region.linear_offset(&point).unwrap_or_default() * elem_size;
            let device = device_region.linear_offset(&point).unwrap_or_default() * elem_size;
            plan.push(
                CopySpan {
                    host_offset: host,
                    device_offset: device,
                    len: row_bytes,
                },
                coalesce,
            );

            // Odometer over dimensions 1..N.
            for d in 1..ndim {
                point[d] += 1;
                if point[d] < overlap.upper(d) {
                    break;
                }
                point[d] = overlap.index()[d];
            }
        }
        plan
    }

    fn push(&mut self, span: CopySpan, coalesce: bool) {
        if coalesce
            && let Some(last) = self.spans.last_mut()
            && last.host_offset + last.len == span.host_offset
            && last.device_offset + last.len == span.device_offset
        {
            last.len += span.len;
            return;
        }
        self.spans.push(span);
    }

    pub fn spans(&self) -> &[CopySpan] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Total bytes moved by the plan.
    pub fn total_bytes(&self) -> usize {
        self.spans.iter().map(|s| s.len).sum()
    }

    /// Total elements moved by the plan.
    pub fn total_elements(&self) -> usize {
        if self.elem_size == 0 {
            0
        } else {
            self.total_bytes() / self.elem_size
        }
    }

    /// Highest host byte touched, exclusive.
    pub fn host_extent(&self) -> usize {
        self.spans
            .iter()
            .map(|s| s.host_offset + s.len)
            .max()
            .unwrap_or(0)
    }

    /// Highest device byte touched, exclusive.
    pub fn device_extent(&self) -> usize {
        self.spans
            .iter()
            .map(|s| s.device_offset + s.len)
            .max()
            .unwrap_or(0)
    }
}
