//! N-dimensional index + size boxes describing materialized buffer extents.

use smallvec::SmallVec;

/// Inline capacity for per-dimension arrays; images are rarely above 4-D.
pub(crate) type DimVec<T> = SmallVec<[T; 4]>;

/// Box bounding which part of an image a buffer materializes.
///
/// Elements are laid out dimension-0-fastest: the linear offset of a point
/// `p` inside the region is `sum((p[d] - index[d]) * stride[d])` with
/// `stride[0] = 1` and `stride[d] = stride[d - 1] * size[d - 1]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionDescriptor {
    index: DimVec<i64>,
    size: DimVec<usize>,
}

impl RegionDescriptor {
    /// Build a region from per-dimension start indices and extents.
    ///
    /// Returns `None` when the two arrays disagree on dimensionality or are
    /// empty, or when the box does not fit the `i64` index space or its
    /// element count overflows `usize`.
    pub fn new(index: &[i64], size: &[usize]) -> Option<Self> {
        if index.len() != size.len() || index.is_empty() {
            return None;
        }
        for (&start, &extent) in index.iter().zip(size) {
            start.checked_add(i64::try_from(extent).ok()?)?;
        }
        size.iter().try_fold(1usize, |acc, &extent| acc.checked_mul(extent))?;
        Some(Self {
            index: DimVec::from_slice(index),
            size: DimVec::from_slice(size),
        })
    }

    /// Region starting at the origin with the given extents.
    pub fn from_size(size: &[usize]) -> Option<Self> {
        let index: DimVec<i64> = size.iter().map(|_| 0).collect();
        Self::new(&index, size)
    }

    pub fn ndim(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub fn size(&self) -> &[usize] {
        &self.size
    }

    /// Number of elements the region spans.
    pub fn num_elements(&self) -> usize {
        self.size.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.size.contains(&0)
    }

    /// One past the last index along `dim`. In range: `new` validated it.
    pub(crate) fn upper(&self, dim: usize) -> i64 {
        self.index[dim] + self.size[dim] as i64
    }

    /// Intersecting box of two regions.
    ///
    /// Returns `None` when dimensionalities differ. Disjoint regions yield an
    /// empty region anchored at the larger start index.
    pub fn overlap(&self, other: &RegionDescriptor) -> Option<RegionDescriptor> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let mut index = DimVec::with_capacity(self.ndim());
        let mut size = DimVec::with_capacity(self.ndim());
        for d in 0..self.ndim() {
            let lo = self.index[d].max(other.index[d]);
            let hi = self.upper(d).min(other.upper(d));
            index.push(lo);
            size.push(hi.saturating_sub(lo).max(0) as usize);
        }
        Some(RegionDescriptor { index, size })
    }

    /// Whether `other` lies entirely inside this region.
    ///
    /// Empty regions are contained in every region of equal dimensionality.
    pub fn contains(&self, other: &RegionDescriptor) -> bool {
        if self.ndim() != other.ndim() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        (0..self.ndim())
            .all(|d| other.index[d] >= self.index[d] && other.upper(d) <= self.upper(d))
    }

    /// Whether the point `point` lies inside this region.
    pub fn contains_point(&self, point: &[i64]) -> bool {
        point.len() == self.ndim()
            && (0..self.ndim()).all(|d| point[d] >= self.index[d] && point[d] < self.upper(d))
    }

    /// Element strides for the dimension-0-fastest layout.
    pub fn strides(&self) -> DimVec<usize> {
        let mut strides = DimVec::with_capacity(self.ndim());
        let mut acc = 1usize;
        for &extent in &self.size {
            strides.push(acc);
            acc *= extent;
        }
        strides
    }

    /// Linear element offset of `point` within this region's buffer.
    ///
    /// Returns `None` if the point lies outside the region.
    pub fn linear_offset(&self, point: &[i64]) -> Option<usize> {
        if !self.contains_point(point) {
            return None;
        }
        let strides = self.strides();
        Some(
            (0..self.ndim())
                .map(|d| (point[d] - self.index[d]) as usize * strides[d])
                .sum(),
        )
    }
}

impl std::fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[index: (")?;
        for (i, v) in self.index.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "), size: (")?;
        for (i, v) in self.size.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")]")
    }
}
