//! Verification and the read benchmark.
//!
//! [`verify_container`] is a serial postmortem: it reconstructs the
//! decomposition from the container's recorded attributes and checks every
//! owned block against the default fill (each element equal to its owner's
//! worker id), reporting per-block and aggregate mismatch counts.
//! [`run_read`] is the parallel counterpart of the write orchestrator; it
//! times each worker reading back its own blocks under either offset
//! convention.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use seismio_storage::SharedStore;
use seismio_transport::Communicator;

use crate::bench::BenchError;
use crate::container::{Container, ContainerError};
use crate::dataset::{DatasetError, ELEMENT_SIZE};
use crate::decompose::{
    block_shape, block_start, grid_coordinate, GridCoordinate, OffsetConvention,
    WorkerIdOutOfRangeError,
};
use crate::hyperslab::{Hyperslab, HyperslabError};
use crate::metadata::{
    OwnedRegion, SimulationAttributes, OWNED_REGION_PREFIX, SIMULATION_ATTRIBUTES,
};
use crate::DATASET_NAME;

/// A verification error.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A container failure.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// A dataset failure.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// An invalid selection.
    #[error(transparent)]
    Hyperslab(#[from] HyperslabError),
    /// A recorded worker outside the recorded grid.
    #[error(transparent)]
    WorkerId(#[from] WorkerIdOutOfRangeError),
    /// An ownership record that is not a worker id.
    #[error("invalid ownership record: {0}")]
    InvalidOwnershipRecord(String),
}

/// The verdict for one worker's blocks, all time steps combined.
#[derive(Clone, Debug, Serialize)]
pub struct BlockReport {
    /// The owning worker.
    pub worker_id: u64,
    /// The worker's grid coordinate.
    pub coordinate: GridCoordinate,
    /// Elements matching the expected value.
    pub correct: u64,
    /// Elements differing from the expected value.
    pub incorrect: u64,
}

/// The verdict for a whole container.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Per-worker verdicts.
    pub blocks: Vec<BlockReport>,
    /// Total matching elements.
    pub correct: u64,
    /// Total mismatching elements.
    pub incorrect: u64,
}

impl VerifyReport {
    /// True if no element mismatched.
    #[must_use]
    pub fn is_correct(&self) -> bool {
        self.incorrect == 0
    }
}

/// Verify a completed container against the default fill.
///
/// The worker set comes from the container itself: the ownership records
/// written by a subfiled run, or the full process grid otherwise. Expected
/// values are exact; any filtering must have been lossless.
///
/// # Errors
/// Returns a [`VerifyError`] if the attributes are missing or malformed or
/// the data cannot be read.
pub fn verify_container(store: SharedStore) -> Result<VerifyReport, VerifyError> {
    let container = Container::open(store);
    let attributes: SimulationAttributes = container.read_attribute(SIMULATION_ATTRIBUTES)?;
    let dataset = container.open_dataset(DATASET_NAME)?;

    let workers: Vec<u64> = if attributes.subfile > 0 {
        let mut workers = Vec::new();
        for name in container.attribute_names(OWNED_REGION_PREFIX)? {
            let region: OwnedRegion = container
                .read_attribute(&name)
                .map_err(|_| VerifyError::InvalidOwnershipRecord(name))?;
            workers.push(region.worker_id);
        }
        workers.sort_unstable();
        workers
    } else {
        (0..attributes.processor_dims.iter().product()).collect()
    };

    let shape = block_shape(&attributes.domain_dims);
    let mut blocks = Vec::with_capacity(workers.len());
    let mut total_correct = 0;
    let mut total_incorrect = 0;
    for worker_id in workers {
        let coordinate = grid_coordinate(worker_id, &attributes.processor_dims)?;
        let expected = worker_id as f32;
        let mut correct = 0;
        let mut incorrect = 0;
        for time_index in 0..attributes.simulation_time {
            let start = block_start(
                &coordinate,
                &attributes.domain_dims,
                time_index,
                OffsetConvention::ElementOffsets,
            );
            let selection = Hyperslab::regular(start.to_vec(), shape.to_vec())?;
            for value in dataset.read_hyperslab(&selection)? {
                if value == expected {
                    correct += 1;
                } else {
                    incorrect += 1;
                }
            }
        }
        total_correct += correct;
        total_incorrect += incorrect;
        blocks.push(BlockReport {
            worker_id,
            coordinate,
            correct,
            incorrect,
        });
    }
    Ok(VerifyReport {
        blocks,
        correct: total_correct,
        incorrect: total_incorrect,
    })
}

/// One worker's account of a completed read run.
#[derive(Clone, Debug, Serialize)]
pub struct ReadReport {
    /// Seconds spent in the read loop, barriers included.
    pub read_seconds: f64,
    /// Raw bytes this worker read.
    pub bytes_read: u64,
}

impl ReadReport {
    /// This worker's read throughput in MiB/s.
    #[must_use]
    pub fn read_rate_mib_s(&self) -> f64 {
        const MIB: f64 = (1 << 20) as f64;
        self.bytes_read as f64 / MIB / self.read_seconds.max(f64::EPSILON)
    }
}

/// Run the read benchmark against a completed container. Entered
/// collectively by every worker.
///
/// Each worker reads the block its own rank owns, once per recorded time
/// step, placing it under the given offset convention.
/// [`OffsetConvention::LegacyGridCells`] reproduces the historical reader,
/// which pins the time axis to zero and so re-reads its block's first time
/// step; it times the same volume of transfers but never touches the later
/// steps.
///
/// # Errors
/// Returns a [`BenchError`] if the worker count does not match the recorded
/// grid or the data cannot be read.
pub fn run_read(
    communicator: &Arc<dyn Communicator>,
    store: SharedStore,
    convention: OffsetConvention,
) -> Result<ReadReport, BenchError> {
    let container = Container::open(store);
    let attributes: SimulationAttributes = container.read_attribute(SIMULATION_ATTRIBUTES)?;
    let dataset = container.open_dataset(DATASET_NAME)?;
    let rank = communicator.rank() as u64;
    let coordinate = grid_coordinate(rank, &attributes.processor_dims)?;
    let shape = block_shape(&attributes.domain_dims);
    let elements = shape.iter().product::<u64>();

    communicator.barrier();
    let read_start = communicator.wall_clock();
    let mut bytes_read = 0;
    for time_index in 0..attributes.simulation_time {
        let start = block_start(&coordinate, &attributes.domain_dims, time_index, convention);
        let selection = Hyperslab::regular(start.to_vec(), shape.to_vec())?;
        let block = dataset.read_hyperslab(&selection)?;
        bytes_read += block.len() as u64 * ELEMENT_SIZE;
        debug_assert_eq!(block.len() as u64, elements);
        communicator.barrier();
    }
    let read_seconds = communicator.wall_clock() - read_start;
    Ok(ReadReport {
        read_seconds,
        bytes_read,
    })
}

#[cfg(test)]
mod tests {
    use seismio_transport::LocalWorld;

    use super::*;
    use crate::bench::run_write;
    use crate::config::RunConfig;
    use crate::dataset::Dataset;
    use crate::fill::FillRegistry;
    use crate::provider::{MemoryStoreProvider, StoreProvider};
    use crate::CONTAINER_NAME;

    fn write(config: &RunConfig) -> Arc<MemoryStoreProvider> {
        let provider = Arc::new(MemoryStoreProvider::new());
        let handles: Vec<_> = LocalWorld::new(config.worker_count() as usize)
            .into_iter()
            .map(|communicator| {
                let config = config.clone();
                let provider = provider.clone();
                std::thread::spawn(move || {
                    let registry = FillRegistry::with_builtins();
                    run_write(&config, &communicator, provider.as_ref(), &registry).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        provider
    }

    fn config() -> RunConfig {
        RunConfig {
            process_grid: [2, 2, 2],
            domain_block: [4, 4, 4],
            time_steps: 1,
            ..RunConfig::default()
        }
    }

    #[test]
    fn a_clean_run_verifies() {
        let provider = write(&config());
        let report = verify_container(provider.store(CONTAINER_NAME).unwrap()).unwrap();
        assert!(report.is_correct());
        assert_eq!(report.correct, 512);
        assert_eq!(report.incorrect, 0);
        assert_eq!(report.blocks.len(), 8);
        assert!(report.blocks.iter().all(|block| block.correct == 64));
    }

    #[test]
    fn corruption_is_localized_to_its_block() {
        let provider = write(&config());
        let store = provider.store(CONTAINER_NAME).unwrap();

        // Scribble over part of worker 5's block.
        let dataset = Dataset::open(store.clone(), DATASET_NAME).unwrap();
        let coordinate = grid_coordinate(5, &[2, 2, 2]).unwrap();
        let start = block_start(&coordinate, &[4, 4, 4], 0, OffsetConvention::ElementOffsets);
        let selection = Hyperslab::regular(start.to_vec(), vec![1, 1, 1, 4]).unwrap();
        dataset.write_hyperslab(&selection, &[99.0; 4]).unwrap();

        let report = verify_container(store).unwrap();
        assert!(!report.is_correct());
        assert_eq!(report.incorrect, 4);
        for block in &report.blocks {
            let expected = if block.worker_id == 5 { 4 } else { 0 };
            assert_eq!(block.incorrect, expected, "worker {}", block.worker_id);
        }
    }

    #[test]
    fn read_benchmark_covers_the_written_volume() {
        let config = config();
        let provider = write(&config);
        let handles: Vec<_> = LocalWorld::new(8)
            .into_iter()
            .map(|communicator| {
                let store = provider.store(CONTAINER_NAME).unwrap();
                std::thread::spawn(move || {
                    run_read(&communicator, store, OffsetConvention::ElementOffsets).unwrap()
                })
            })
            .collect();
        for handle in handles {
            let report = handle.join().unwrap();
            assert_eq!(report.bytes_read, 64 * ELEMENT_SIZE);
        }
    }

    #[test]
    fn legacy_read_re_reads_the_first_time_step() {
        let config = RunConfig {
            time_steps: 2,
            ..config()
        };
        let provider = write(&config);
        let handles: Vec<_> = LocalWorld::new(8)
            .into_iter()
            .map(|communicator| {
                let store = provider.store(CONTAINER_NAME).unwrap();
                std::thread::spawn(move || {
                    run_read(&communicator, store, OffsetConvention::LegacyGridCells).unwrap()
                })
            })
            .collect();
        for handle in handles {
            let report = handle.join().unwrap();
            assert_eq!(report.bytes_read, 2 * 64 * ELEMENT_SIZE);
        }
    }
}
