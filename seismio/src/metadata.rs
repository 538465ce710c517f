//! The self-describing attribute record.
//!
//! A completed container carries one [`SimulationAttributes`] document under
//! the attribute name [`SIMULATION_ATTRIBUTES`]. It captures everything a
//! reader needs to reconstruct the decomposition without access to the
//! original script: the grid, block, and chunk extents, the time step count,
//! and the knobs that shaped the write. The record is written once, by one
//! worker, after the data is on storage.

use serde::{Deserialize, Serialize};

use crate::config::{PreCreateMode, RunConfig, TransferMode};

/// The attribute name the record is stored under.
pub const SIMULATION_ATTRIBUTES: &str = "simulation_attributes";

/// The attribute prefix ownership records are written under in subfiled
/// runs.
pub const OWNED_REGION_PREFIX: &str = "owned_region";

/// One worker's claim on a region of a subfile container: the full time
/// extent over its own spatial block. Written once per worker as the
/// attribute `owned_region/<worker_id>`, so any physical container lists
/// exactly which logical regions it holds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OwnedRegion {
    /// The claiming worker.
    pub worker_id: u64,
    /// The region offset in the global array (time axis first).
    pub start: [u64; 4],
    /// The region extent (time axis first).
    pub shape: [u64; 4],
}

/// The run parameters recorded alongside the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationAttributes {
    /// The run name.
    pub name: String,
    /// The process grid.
    pub processor_dims: [u64; 3],
    /// The chunk extent per spatial axis; zeros for a contiguous layout.
    pub chunk_dims: [u64; 3],
    /// The per-worker block extent.
    pub domain_dims: [u64; 3],
    /// The number of time steps.
    pub simulation_time: u64,
    /// The number of physical nodes, `0` when unknown.
    pub n_nodes: u64,
    /// The number of subfile groups, `0` for a single container.
    pub subfile: u64,
    /// Whether writes used the collective discipline.
    pub collective_write: bool,
    /// Whether the container was precreated by a leader and reopened.
    pub precreate: bool,
    /// Whether metadata operations were issued collectively.
    pub set_collective_metadata: bool,
    /// Whether the extent was reserved before the first write.
    pub early_allocation: bool,
    /// Whether fill-value materialization was suppressed.
    pub never_fill: bool,
    /// The lossless compression level, `0` for none.
    pub deflate: u64,
    /// The lossy mantissa bits kept, `0` for none.
    pub lossy: u64,
    /// The fill-function library, empty when unused.
    pub use_function_lib: String,
    /// The fill-function name, empty when unused.
    pub use_function_name: String,
    /// The fill-function argument count.
    pub use_function_argc: u64,
    /// The fill-function arguments.
    pub use_function_argv: Vec<String>,
}

impl SimulationAttributes {
    /// Capture the attributes of a run.
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            name: config.name.clone(),
            processor_dims: config.process_grid,
            chunk_dims: config.chunk_shape,
            domain_dims: config.domain_block,
            simulation_time: config.time_steps,
            n_nodes: config.n_nodes,
            subfile: config.subfile,
            collective_write: config.transfer == TransferMode::Collective,
            precreate: config.precreate == PreCreateMode::LeaderThenReopen,
            set_collective_metadata: config.set_collective_metadata,
            early_allocation: config.early_allocation,
            never_fill: config.never_fill,
            deflate: u64::from(config.deflate.unwrap_or(0)),
            lossy: u64::from(config.lossy_bits.unwrap_or(0)),
            use_function_lib: config.fill_library.clone().unwrap_or_default(),
            use_function_name: config.fill_function.clone().unwrap_or_default(),
            use_function_argc: config.fill_args.len() as u64,
            use_function_argv: config.fill_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use seismio_storage::MemoryStore;

    use super::*;
    use crate::container::Container;

    fn attributes() -> SimulationAttributes {
        SimulationAttributes::from_config(&RunConfig {
            name: "demo run".to_string(),
            process_grid: [2, 2, 1],
            domain_block: [16, 16, 32],
            chunk_shape: [1, 16, 16],
            time_steps: 10,
            transfer: TransferMode::Collective,
            deflate: Some(6),
            n_nodes: 2,
            fill_library: Some("./libgauss.so".to_string()),
            fill_function: Some("gaussian".to_string()),
            fill_args: vec!["1.0".to_string(), "0.3".to_string()],
            ..RunConfig::default()
        })
    }

    #[test]
    fn captures_the_configuration() {
        let attributes = attributes();
        assert_eq!(attributes.name, "demo run");
        assert_eq!(attributes.processor_dims, [2, 2, 1]);
        assert_eq!(attributes.chunk_dims, [1, 16, 16]);
        assert_eq!(attributes.domain_dims, [16, 16, 32]);
        assert_eq!(attributes.simulation_time, 10);
        assert!(attributes.collective_write);
        assert!(!attributes.precreate);
        assert_eq!(attributes.deflate, 6);
        assert_eq!(attributes.lossy, 0);
        assert_eq!(attributes.use_function_name, "gaussian");
        assert_eq!(attributes.use_function_argc, 2);
    }

    #[test]
    fn string_fields_roundtrip_exactly() {
        let container = Container::create(Arc::new(MemoryStore::new())).unwrap();
        let mut written = attributes();
        written.name = "white space  and \"quotes\" survive".to_string();
        container
            .write_attribute(SIMULATION_ATTRIBUTES, &written)
            .unwrap();
        let read: SimulationAttributes =
            container.read_attribute(SIMULATION_ATTRIBUTES).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.name, "white space  and \"quotes\" survive");
    }

    #[test]
    fn the_record_is_write_once() {
        let container = Container::create(Arc::new(MemoryStore::new())).unwrap();
        let record = attributes();
        container
            .write_attribute(SIMULATION_ATTRIBUTES, &record)
            .unwrap();
        assert!(container
            .write_attribute(SIMULATION_ATTRIBUTES, &record)
            .is_err());
    }
}
