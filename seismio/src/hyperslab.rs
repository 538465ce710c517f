//! Hyperslab selections.
//!
//! A [`Hyperslab`] selects a rectangular region of an N-dimensional array by
//! offset, stride, count, and block, matching the selection model of the
//! storage boundary. The benchmark only ever selects regular regions
//! (`count == 1` on every axis), but strided selections round-trip through
//! the same type.

use itertools::Itertools;
use thiserror::Error;

/// An invalid hyperslab.
#[derive(Clone, Debug, Error)]
pub enum HyperslabError {
    /// Mismatched field dimensionality.
    #[error("hyperslab fields must share one dimensionality, got {0:?}")]
    IncompatibleDimensionality(Vec<usize>),
    /// A zero count or block extent.
    #[error("hyperslab count and block extents must be nonzero on axis {0}")]
    EmptyAxis(usize),
    /// Repeated blocks that would overlap.
    #[error("hyperslab stride {stride} is smaller than block {block} on axis {axis}")]
    OverlappingBlocks {
        /// The axis with overlapping blocks.
        axis: usize,
        /// The stride on that axis.
        stride: u64,
        /// The block extent on that axis.
        block: u64,
    },
}

/// A hyperslab selection: `count` blocks of `block` elements per axis,
/// spaced `stride` apart, starting at `start`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hyperslab {
    start: Vec<u64>,
    stride: Vec<u64>,
    count: Vec<u64>,
    block: Vec<u64>,
}

impl Hyperslab {
    /// Create a hyperslab selection.
    ///
    /// # Errors
    /// Returns a [`HyperslabError`] if the fields differ in dimensionality,
    /// any `count`/`block` extent is zero, or blocks would overlap
    /// (`stride < block` with `count > 1`).
    pub fn new(
        start: Vec<u64>,
        stride: Vec<u64>,
        count: Vec<u64>,
        block: Vec<u64>,
    ) -> Result<Self, HyperslabError> {
        if start.len() != stride.len() || start.len() != count.len() || start.len() != block.len()
        {
            return Err(HyperslabError::IncompatibleDimensionality(vec![
                start.len(),
                stride.len(),
                count.len(),
                block.len(),
            ]));
        }
        for axis in 0..start.len() {
            if count[axis] == 0 || block[axis] == 0 {
                return Err(HyperslabError::EmptyAxis(axis));
            }
            if count[axis] > 1 && stride[axis] < block[axis] {
                return Err(HyperslabError::OverlappingBlocks {
                    axis,
                    stride: stride[axis],
                    block: block[axis],
                });
            }
        }
        Ok(Self {
            start,
            stride,
            count,
            block,
        })
    }

    /// Create a regular selection: one block per axis.
    ///
    /// # Errors
    /// Returns a [`HyperslabError`] if the fields differ in dimensionality or
    /// any block extent is zero.
    pub fn regular(start: Vec<u64>, block: Vec<u64>) -> Result<Self, HyperslabError> {
        let stride = block.clone();
        let count = vec![1; start.len()];
        Self::new(start, stride, count, block)
    }

    /// The selection start.
    #[must_use]
    pub fn start(&self) -> &[u64] {
        &self.start
    }

    /// The block extent per axis.
    #[must_use]
    pub fn block(&self) -> &[u64] {
        &self.block
    }

    /// The number of axes.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.start.len()
    }

    /// The number of selected elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        std::iter::zip(&self.count, &self.block)
            .map(|(count, block)| count * block)
            .product()
    }

    /// True if the selection is one dense block (`count == 1` on every axis).
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.count.iter().all(|&count| count == 1)
    }

    /// The exclusive upper bound of the selection per axis.
    #[must_use]
    pub fn end_exc(&self) -> Vec<u64> {
        (0..self.dimensionality())
            .map(|axis| self.start[axis] + (self.count[axis] - 1) * self.stride[axis] + self.block[axis])
            .collect()
    }

    /// Iterate the selection as contiguous rows.
    ///
    /// Yields `(index, length)` pairs in row-major order of the selection,
    /// where `index` is the array index of the row's first element and
    /// `length` is the run length along the last axis. An in-memory buffer
    /// laid out densely in selection order is consumed row by row in exactly
    /// this order.
    pub fn rows(&self) -> impl Iterator<Item = (Vec<u64>, u64)> + '_ {
        let leading: Vec<Vec<u64>> = self.start[..self.dimensionality() - 1]
            .iter()
            .enumerate()
            .map(|(axis, &start)| {
                (0..self.count[axis])
                    .flat_map(move |c| {
                        (0..self.block[axis]).map(move |b| start + c * self.stride[axis] + b)
                    })
                    .collect()
            })
            .collect();
        let last = self.dimensionality() - 1;
        let runs: Vec<(u64, u64)> = (0..self.count[last])
            .map(|c| (self.start[last] + c * self.stride[last], self.block[last]))
            .collect();
        leading
            .into_iter()
            .multi_cartesian_product()
            .cartesian_product(runs)
            .map(|(mut index, (run_start, run_length))| {
                index.push(run_start);
                (index, run_length)
            })
    }
}

/// The row-major linear index of `index` within an array of `shape`.
#[must_use]
pub fn linear_index(shape: &[u64], index: &[u64]) -> u64 {
    debug_assert_eq!(shape.len(), index.len());
    std::iter::zip(shape, index).fold(0, |acc, (&extent, &index)| acc * extent + index)
}
