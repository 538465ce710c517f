//! The write orchestrator.
//!
//! [`run_write`] is entered by every worker with the same configuration and
//! drives one benchmark run end to end: container creation under the
//! configured policy, the timed write loop with a global rendezvous after
//! every time step, and the closing metadata phase where one worker per
//! container records the run's [`SimulationAttributes`]. All workers return
//! the same phase timings modulo clock skew; the caller usually reports
//! worker zero's.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use seismio_storage::StorageError;
use seismio_transport::{Communicator, TransportError};

use crate::config::{PreCreateMode, RunConfig, RunConfigError, TransferMode};
use crate::container::{Container, ContainerError};
use crate::dataset::{Dataset, DatasetError, ELEMENT_SIZE};
use crate::decompose::{
    block_shape, block_start, grid_coordinate, OffsetConvention, WorkerIdOutOfRangeError,
};
use crate::fill::{FillContext, FillError, FillRegistry};
use crate::hyperslab::{Hyperslab, HyperslabError};
use crate::layout::{global_shape, plan_dataset};
use crate::metadata::{
    OwnedRegion, SimulationAttributes, OWNED_REGION_PREFIX, SIMULATION_ATTRIBUTES,
};
use crate::provider::StoreProvider;
use crate::{subfile_container_name, CONTAINER_NAME, DATASET_NAME};

/// A benchmark run error. All are fatal to the run.
#[derive(Debug, Error)]
pub enum BenchError {
    /// An invalid configuration.
    #[error(transparent)]
    Config(#[from] RunConfigError),
    /// A transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A container failure.
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// A dataset failure.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// A fill-function failure.
    #[error(transparent)]
    Fill(#[from] FillError),
    /// An invalid selection.
    #[error(transparent)]
    Hyperslab(#[from] HyperslabError),
    /// A worker outside the process grid.
    #[error(transparent)]
    WorkerId(#[from] WorkerIdOutOfRangeError),
}

/// One worker's account of a completed write run.
#[derive(Clone, Debug, Serialize)]
pub struct WriteReport {
    /// The container this worker wrote to.
    pub container: String,
    /// Seconds spent creating (or reopening) the container and dataset.
    pub create_seconds: f64,
    /// Seconds spent in the write loop, barriers included.
    pub write_seconds: f64,
    /// Seconds spent in the closing metadata phase.
    pub close_seconds: f64,
    /// Raw bytes this worker wrote.
    pub bytes_written: u64,
    /// Bytes the dataset occupies on storage, after any filters.
    pub storage_bytes: u64,
    /// Whether metadata operations were issued collectively.
    pub metadata_ops_collective: bool,
}

impl WriteReport {
    /// This worker's write throughput in MiB/s.
    #[must_use]
    pub fn write_rate_mib_s(&self) -> f64 {
        const MIB: f64 = (1 << 20) as f64;
        self.bytes_written as f64 / MIB / self.write_seconds.max(f64::EPSILON)
    }
}

/// The subfile group a worker lands in.
///
/// With more nodes than groups, striding by the node count first keeps each
/// group's membership spread evenly across nodes; otherwise plain modulo
/// assignment is used.
#[must_use]
pub fn subfile_color(rank: u64, subfile: u64, n_nodes: u64) -> u64 {
    if n_nodes > subfile {
        (rank % n_nodes) % subfile
    } else {
        rank % subfile
    }
}

/// Run the write benchmark. Entered collectively by every worker.
///
/// # Errors
/// Returns a [`BenchError`] on any configuration, transport, storage, or
/// fill failure. Errors are fatal: no teardown of partial output is
/// attempted.
pub fn run_write(
    config: &RunConfig,
    communicator: &Arc<dyn Communicator>,
    provider: &dyn StoreProvider,
    registry: &FillRegistry,
) -> Result<WriteReport, BenchError> {
    config.validate(communicator.size() as u64)?;
    let plan = plan_dataset(config)?;
    let rank = communicator.rank() as u64;
    let coordinate = grid_coordinate(rank, &config.process_grid)?;
    let fill = registry.resolve(config)?;

    let (group, container_name) = if config.subfile > 0 {
        let color = subfile_color(rank, config.subfile, config.n_nodes);
        (communicator.split(color)?, subfile_container_name(color))
    } else {
        (communicator.clone(), CONTAINER_NAME.to_string())
    };

    // Creation phase.
    communicator.barrier();
    let create_start = communicator.wall_clock();
    let (container, dataset) = match config.precreate {
        PreCreateMode::Off => {
            // Created on first touch: no truncation, no rendezvous. Every
            // worker persists the same planned document, so the concurrent
            // creates are idempotent. Early allocation needs a creation
            // rendezvous to not race completed writes, so it stays
            // incremental here.
            let container = Container::open(provider.store(&container_name)?);
            let dataset = container.create_dataset(DATASET_NAME, plan.clone())?;
            (container, dataset)
        }
        PreCreateMode::LeaderThenReopen => {
            if group.rank() == 0 {
                let container = Container::create(provider.store(&container_name)?)?;
                let dataset = container.create_dataset(DATASET_NAME, plan.clone())?;
                if config.early_allocation {
                    dataset.allocate_early()?;
                }
                // The leader's handles drop here, before anyone reopens.
            }
            group.barrier();
            let container = Container::open(provider.store(&container_name)?);
            let dataset = container.open_dataset(DATASET_NAME)?;
            (container, dataset)
        }
        PreCreateMode::CollectiveCreate => {
            let store = provider.store(&container_name)?;
            if group.rank() == 0 {
                Container::create(store.clone())?;
            }
            group.barrier();
            let container = Container::open(store);
            // Planning is pure, so every worker persists the same document.
            let dataset = container.create_dataset(DATASET_NAME, plan.clone())?;
            if config.early_allocation && group.rank() == 0 {
                dataset.allocate_early()?;
            }
            (container, dataset)
        }
    };
    group.barrier();
    let create_seconds = communicator.wall_clock() - create_start;

    // Write phase.
    let write_start = communicator.wall_clock();
    let bytes_written =
        write_loop(config, communicator, &group, &dataset, rank, &coordinate, fill.as_ref())?;
    let write_seconds = communicator.wall_clock() - write_start;

    let storage_bytes = dataset.storage_size()?;

    // Metadata phase: per-worker ownership records, then one attribute
    // document per container, written by that container's leader.
    let close_start = communicator.wall_clock();
    if config.subfile > 0 {
        let region = OwnedRegion {
            worker_id: rank,
            // Full time extent over this worker's spatial block.
            start: block_start(
                &coordinate,
                &config.domain_block,
                0,
                OffsetConvention::ElementOffsets,
            ),
            shape: [
                config.time_steps,
                config.domain_block[0],
                config.domain_block[1],
                config.domain_block[2],
            ],
        };
        container.write_attribute(&format!("{OWNED_REGION_PREFIX}/{rank}"), &region)?;
    }
    group.barrier();
    if group.rank() == 0 {
        container.write_attribute(
            SIMULATION_ATTRIBUTES,
            &SimulationAttributes::from_config(config),
        )?;
    }
    communicator.barrier();
    let close_seconds = communicator.wall_clock() - close_start;

    Ok(WriteReport {
        container: container_name,
        create_seconds,
        write_seconds,
        close_seconds,
        bytes_written,
        storage_bytes,
        metadata_ops_collective: config.set_collective_metadata,
    })
}

fn write_loop(
    config: &RunConfig,
    communicator: &Arc<dyn Communicator>,
    group: &Arc<dyn Communicator>,
    dataset: &Dataset,
    rank: u64,
    coordinate: &[u64; 3],
    fill: &dyn crate::fill::FillFunction,
) -> Result<u64, BenchError> {
    let shape = block_shape(&config.domain_block);
    let elements = shape.iter().product::<u64>();
    let mut block = vec![0.0f32; usize::try_from(elements).unwrap()];
    let mut bytes_written = 0;
    for time_index in 0..config.time_steps {
        let start = block_start(
            coordinate,
            &config.domain_block,
            time_index,
            OffsetConvention::ElementOffsets,
        );
        fill.fill(
            &FillContext {
                worker_id: rank,
                block_start: start,
                block_shape: shape,
                global_shape: global_shape(config),
            },
            &mut block,
        )?;
        let selection = Hyperslab::regular(start.to_vec(), shape.to_vec())?;
        if config.transfer == TransferMode::Collective {
            // Rendezvous so every worker's transfer is in flight at once.
            group.barrier();
        }
        dataset.write_hyperslab(&selection, &block)?;
        bytes_written += elements * ELEMENT_SIZE;
        // Every worker finishes each time step before any starts the next.
        communicator.barrier();
    }
    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use seismio_transport::LocalWorld;

    use super::*;
    use crate::provider::MemoryStoreProvider;

    fn run(config: RunConfig, provider: Arc<MemoryStoreProvider>) -> Vec<WriteReport> {
        let workers = config.worker_count() as usize;
        let handles: Vec<_> = LocalWorld::new(workers)
            .into_iter()
            .map(|communicator| {
                let config = config.clone();
                let provider = provider.clone();
                std::thread::spawn(move || {
                    let registry = FillRegistry::with_builtins();
                    run_write(&config, &communicator, provider.as_ref(), &registry).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn read_all(provider: &MemoryStoreProvider, container: &str, config: &RunConfig) -> Vec<f32> {
        let container = Container::open(provider.store(container).unwrap());
        let dataset = container.open_dataset(DATASET_NAME).unwrap();
        let shape = global_shape(config);
        let all = Hyperslab::regular(vec![0; 4], shape.to_vec()).unwrap();
        dataset.read_hyperslab(&all).unwrap()
    }

    #[test]
    fn every_block_lands_where_its_worker_owns() {
        let config = RunConfig {
            process_grid: [2, 2, 1],
            domain_block: [2, 2, 4],
            time_steps: 2,
            ..RunConfig::default()
        };
        let provider = Arc::new(MemoryStoreProvider::new());
        let reports = run(config.clone(), provider.clone());
        assert_eq!(reports.len(), 4);
        for report in &reports {
            assert_eq!(report.bytes_written, 2 * 16 * 4);
            assert_eq!(report.container, CONTAINER_NAME);
        }

        let data = read_all(&provider, CONTAINER_NAME, &config);
        // 4 workers x 16 elements x 2 time steps, each element its owner's id.
        for id in 0..4 {
            let count = data.iter().filter(|&&v| v == id as f32).count();
            assert_eq!(count, 32, "worker {id}");
        }
        // Spot-check one placement: worker 3 owns the (1, 1) corner.
        let attributes: SimulationAttributes = Container::open(
            provider.store(CONTAINER_NAME).unwrap(),
        )
        .read_attribute(SIMULATION_ATTRIBUTES)
        .unwrap();
        assert_eq!(attributes.processor_dims, [2, 2, 1]);
    }

    #[test]
    fn collective_leader_reopen_chunked_deflate() {
        let config = RunConfig {
            process_grid: [1, 2, 2],
            domain_block: [4, 2, 2],
            chunk_shape: [4, 2, 2],
            time_steps: 1,
            transfer: TransferMode::Collective,
            precreate: PreCreateMode::LeaderThenReopen,
            early_allocation: true,
            deflate: Some(5),
            ..RunConfig::default()
        };
        let provider = Arc::new(MemoryStoreProvider::new());
        let reports = run(config.clone(), provider.clone());
        // Constant blocks compress well below their raw size.
        let raw = config.worker_count() * 16 * ELEMENT_SIZE;
        assert!(reports[0].storage_bytes < raw);

        let data = read_all(&provider, CONTAINER_NAME, &config);
        for id in 0..4 {
            assert_eq!(data.iter().filter(|&&v| v == id as f32).count(), 16);
        }
    }

    #[test]
    fn subfiling_partitions_workers_across_containers() {
        let config = RunConfig {
            process_grid: [1, 2, 2],
            domain_block: [1, 2, 2],
            time_steps: 1,
            subfile: 2,
            ..RunConfig::default()
        };
        let provider = Arc::new(MemoryStoreProvider::new());
        let reports = run(config.clone(), provider.clone());
        for color in 0..2u64 {
            let name = subfile_container_name(color);
            assert_eq!(
                reports.iter().filter(|r| r.container == name).count(),
                2,
                "group {color}"
            );
            let container = Container::open(provider.store(&name).unwrap());
            let owners = container.attribute_names("owned_region").unwrap();
            assert_eq!(owners.len(), 2);
            let attributes: SimulationAttributes =
                container.read_attribute(SIMULATION_ATTRIBUTES).unwrap();
            assert_eq!(attributes.subfile, 2);

            // Each group's container holds exactly its members' blocks.
            // Worker zero's id equals the fill value, so only the nonzero
            // workers are distinguishable by value; zero's membership is
            // pinned by the ownership records above.
            let data = read_all(&provider, &name, &config);
            for rank in 1..4u64 {
                let expected = if rank % 2 == color { 4 } else { 0 };
                assert_eq!(
                    data.iter().filter(|&&v| v == rank as f32).count(),
                    expected,
                    "rank {rank} in group {color}"
                );
            }
        }
    }

    #[test]
    fn off_mode_opens_without_truncating_existing_content() {
        let config = RunConfig {
            process_grid: [1, 2, 2],
            domain_block: [2, 2, 2],
            time_steps: 1,
            precreate: PreCreateMode::Off,
            ..RunConfig::default()
        };
        let provider = Arc::new(MemoryStoreProvider::new());
        // Content from an earlier run survives: first-touch creation never
        // truncates the container.
        Container::open(provider.store(CONTAINER_NAME).unwrap())
            .write_attribute("leftover", &"kept".to_string())
            .unwrap();

        run(config.clone(), provider.clone());

        let container = Container::open(provider.store(CONTAINER_NAME).unwrap());
        let leftover: String = container.read_attribute("leftover").unwrap();
        assert_eq!(leftover, "kept");
        let attributes: SimulationAttributes =
            container.read_attribute(SIMULATION_ATTRIBUTES).unwrap();
        assert!(!attributes.precreate);

        let data = read_all(&provider, CONTAINER_NAME, &config);
        for id in 0..4 {
            let count = data.iter().filter(|&&v| v == id as f32).count();
            assert_eq!(count, 8, "worker {id}");
        }
    }

    /// Reports the dataset's data size as seen at fill time, before the
    /// write that follows.
    #[derive(Debug)]
    struct DataSizeAtFill {
        store: seismio_storage::SharedStore,
        seen: Arc<AtomicU64>,
    }

    impl crate::fill::FillFunction for DataSizeAtFill {
        fn fill(&self, context: &FillContext, block: &mut [f32]) -> Result<(), FillError> {
            let key = seismio_storage::StoreKey::new(format!("{DATASET_NAME}/data")).unwrap();
            let size = self.store.size_key(&key).unwrap().unwrap_or(0);
            self.seen.fetch_min(size, Ordering::SeqCst);
            block.fill(context.worker_id as f32);
            Ok(())
        }
    }

    fn data_size_at_first_fill(precreate: PreCreateMode) -> u64 {
        let provider = Arc::new(MemoryStoreProvider::new());
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let mut registry = FillRegistry::with_builtins();
        let store = provider.store(CONTAINER_NAME).unwrap();
        let record = seen.clone();
        registry.register("data_size", move |_| {
            Ok(Arc::new(DataSizeAtFill {
                store: store.clone(),
                seen: record.clone(),
            }))
        });
        let config = RunConfig {
            process_grid: [1, 1, 1],
            domain_block: [2, 2, 2],
            time_steps: 2,
            precreate,
            early_allocation: true,
            fill_function: Some("data_size".to_string()),
            ..RunConfig::default()
        };
        let communicator = LocalWorld::new(1).pop().unwrap();
        run_write(&config, &communicator, provider.as_ref(), &registry).unwrap();
        seen.load(Ordering::SeqCst)
    }

    #[test]
    fn off_mode_ignores_early_allocation() {
        // Reserving the full extent needs a creation rendezvous, or it could
        // land on top of a peer's completed writes. First-touch creation has
        // none, so allocation stays incremental and nothing is on storage at
        // the first fill; a leader-created run has reserved everything by
        // then.
        assert_eq!(data_size_at_first_fill(PreCreateMode::Off), 0);
        assert_eq!(
            data_size_at_first_fill(PreCreateMode::LeaderThenReopen),
            2 * 8 * ELEMENT_SIZE
        );
    }

    #[test]
    fn node_aware_colors_spread_groups_over_nodes() {
        assert_eq!(subfile_color(5, 2, 0), 1);
        assert_eq!(subfile_color(5, 2, 4), 1);
        // 8 ranks, 4 nodes, 2 groups: node parity decides the group.
        let colors: Vec<u64> = (0..8).map(|rank| subfile_color(rank, 2, 4)).collect();
        assert_eq!(colors, vec![0, 1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn grid_mismatch_fails_before_any_container_exists() {
        let config = RunConfig {
            process_grid: [3, 1, 1],
            domain_block: [1, 1, 1],
            ..RunConfig::default()
        };
        let provider = Arc::new(MemoryStoreProvider::new());
        let handles: Vec<_> = LocalWorld::new(2)
            .into_iter()
            .map(|communicator| {
                let config = config.clone();
                let provider = provider.clone();
                std::thread::spawn(move || {
                    let registry = FillRegistry::with_builtins();
                    run_write(&config, &communicator, provider.as_ref(), &registry)
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(BenchError::Config(RunConfigError::GridMismatch { .. }))
            ));
        }
        let store = provider.store(CONTAINER_NAME).unwrap();
        assert_eq!(store.size_prefix("").unwrap(), 0);
    }
}
