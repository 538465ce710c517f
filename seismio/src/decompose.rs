//! Domain decomposition.
//!
//! Pure, deterministic mapping from a worker id to its coordinate in the 3D
//! process grid and to the offset and extent of the block it owns within the
//! global 4D array (time axis first). The write path and the read path must
//! use the same decoding or blocks are misaligned; both conventions that
//! exist in the wild are preserved here as explicit variants (see
//! [`OffsetConvention`]).

use thiserror::Error;

/// A worker's coordinate in the 3D process grid.
pub type GridCoordinate = [u64; 3];

/// A worker id outside the process grid.
#[derive(Clone, Debug, Error)]
#[error("worker id {worker_id} is out of range for process grid {process_grid:?}")]
pub struct WorkerIdOutOfRangeError {
    /// The offending worker id.
    pub worker_id: u64,
    /// The process grid.
    pub process_grid: [u64; 3],
}

/// The offset arithmetic used to place a worker's block in the global array.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OffsetConvention {
    /// Offsets in elements: the grid coordinate scaled by the domain block
    /// extent, with the time axis set to the time index. This is the write
    /// path's arithmetic and the one the verifier trusts.
    ElementOffsets,
    /// The historical reader's arithmetic: spatial offsets are scaled by the
    /// block extent exactly as on the write path, but the time axis is
    /// pinned to zero regardless of the time index, so every step re-reads
    /// the first one. Kept as a distinct, test-covered path until the
    /// discrepancy is resolved against a real use case.
    LegacyGridCells,
}

/// Decode a worker id into its grid coordinate.
///
/// Axis 2 varies fastest: `k = id % grid[2]`, `j = (id / grid[2]) % grid[1]`,
/// `i = id / (grid[2] * grid[1])`. Bijective over
/// `0..grid[0]*grid[1]*grid[2]`.
///
/// # Errors
/// Returns [`WorkerIdOutOfRangeError`] if `worker_id` is not within the grid.
pub fn grid_coordinate(
    worker_id: u64,
    process_grid: &[u64; 3],
) -> Result<GridCoordinate, WorkerIdOutOfRangeError> {
    let cells = process_grid.iter().product::<u64>();
    if worker_id >= cells {
        return Err(WorkerIdOutOfRangeError {
            worker_id,
            process_grid: *process_grid,
        });
    }
    let k = worker_id % process_grid[2];
    let j = (worker_id / process_grid[2]) % process_grid[1];
    let i = worker_id / (process_grid[2] * process_grid[1]);
    Ok([i, j, k])
}

/// Encode a grid coordinate back into a worker id. Inverse of
/// [`grid_coordinate`].
#[must_use]
pub fn worker_id(coordinate: &GridCoordinate, process_grid: &[u64; 3]) -> u64 {
    (coordinate[0] * process_grid[1] + coordinate[1]) * process_grid[2] + coordinate[2]
}

/// The global-array offset of the block owned by the worker at `coordinate`
/// for time step `time_index`.
#[must_use]
pub fn block_start(
    coordinate: &GridCoordinate,
    domain_block: &[u64; 3],
    time_index: u64,
    convention: OffsetConvention,
) -> [u64; 4] {
    match convention {
        OffsetConvention::ElementOffsets => [
            time_index,
            coordinate[0] * domain_block[0],
            coordinate[1] * domain_block[1],
            coordinate[2] * domain_block[2],
        ],
        OffsetConvention::LegacyGridCells => [
            0,
            coordinate[0] * domain_block[0],
            coordinate[1] * domain_block[1],
            coordinate[2] * domain_block[2],
        ],
    }
}

/// The extent of one worker's block: a single time step by the domain block.
#[must_use]
pub fn block_shape(domain_block: &[u64; 3]) -> [u64; 4] {
    [1, domain_block[0], domain_block[1], domain_block[2]]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn decompose_is_a_bijection() {
        for process_grid in [[2, 2, 2], [1, 1, 8], [4, 2, 1], [3, 5, 7]] {
            let cells = process_grid.iter().product::<u64>();
            let coordinates: HashSet<GridCoordinate> = (0..cells)
                .map(|id| grid_coordinate(id, &process_grid).unwrap())
                .collect();
            assert_eq!(coordinates.len() as u64, cells);
            for coordinate in &coordinates {
                for (axis, &extent) in process_grid.iter().enumerate() {
                    assert!(coordinate[axis] < extent);
                }
            }
            for id in 0..cells {
                let coordinate = grid_coordinate(id, &process_grid).unwrap();
                assert_eq!(worker_id(&coordinate, &process_grid), id);
            }
        }
    }

    #[test]
    fn axis_two_varies_fastest() {
        let process_grid = [2, 3, 4];
        assert_eq!(grid_coordinate(0, &process_grid).unwrap(), [0, 0, 0]);
        assert_eq!(grid_coordinate(1, &process_grid).unwrap(), [0, 0, 1]);
        assert_eq!(grid_coordinate(4, &process_grid).unwrap(), [0, 1, 0]);
        assert_eq!(grid_coordinate(12, &process_grid).unwrap(), [1, 0, 0]);
        assert_eq!(grid_coordinate(23, &process_grid).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn out_of_range_worker_id() {
        assert!(grid_coordinate(8, &[2, 2, 2]).is_err());
        assert!(grid_coordinate(0, &[2, 2, 2]).is_ok());
    }

    #[test]
    fn element_offsets_scale_by_domain_block() {
        let coordinate = [1, 2, 3];
        let domain_block = [10, 20, 30];
        assert_eq!(
            block_start(&coordinate, &domain_block, 5, OffsetConvention::ElementOffsets),
            [5, 10, 40, 90]
        );
        assert_eq!(block_shape(&domain_block), [1, 10, 20, 30]);
    }

    #[test]
    fn legacy_offsets_are_scaled_but_time_pinned() {
        let coordinate = [1, 2, 3];
        let domain_block = [10, 20, 30];
        assert_eq!(
            block_start(&coordinate, &domain_block, 5, OffsetConvention::LegacyGridCells),
            [0, 10, 40, 90]
        );
    }

    #[test]
    fn conventions_agree_only_at_the_first_time_step() {
        let coordinate = [1, 1, 1];
        let domain_block = [4, 4, 4];
        assert_eq!(
            block_start(&coordinate, &domain_block, 0, OffsetConvention::ElementOffsets),
            block_start(&coordinate, &domain_block, 0, OffsetConvention::LegacyGridCells),
        );
        assert_ne!(
            block_start(&coordinate, &domain_block, 1, OffsetConvention::ElementOffsets),
            block_start(&coordinate, &domain_block, 1, OffsetConvention::LegacyGridCells),
        );
    }
}
