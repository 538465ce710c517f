//! A parallel, block-distributed data-generation and I/O benchmarking engine.
//!
//! A fixed number of cooperating workers jointly populate one logical 4D
//! array (time × three spatial axes), each owning a disjoint rectangular
//! sub-block, and optionally read it back to verify correctness and measure
//! throughput. The crate covers the domain-decomposition and I/O-strategy
//! layer:
//!
//! - [`config`]: the validated, immutable description of a run, broadcast
//!   once to every worker.
//! - [`decompose`]: pure mapping from a worker id to its grid coordinate and
//!   its block's offset and extent within the global array.
//! - [`layout`]: derivation of the global array shape, chunk shape, and
//!   storage-creation options from the configuration.
//! - [`fill`]: pluggable synthetic-data generators resolved by name.
//! - [`container`] and [`dataset`]: a typed N-dimensional array with
//!   hyperslab-selection I/O and a per-chunk [`filter`] chain, layered over
//!   the byte stores of [`seismio_storage`].
//! - [`metadata`]: the self-describing attribute record that lets a reader
//!   reconstruct the decomposition without re-deriving it.
//! - [`bench`]: the write orchestrator (container-creation policies,
//!   transfer disciplines, subfile partitioning, phase timing).
//! - [`verify`]: the correctness verifier and the parallel read benchmark.
//!
//! Storage containers and the collective transport are external
//! collaborators reached through the `seismio_storage` and
//! `seismio_transport` traits. Any error they signal is fatal to the run;
//! there is no retry or degraded-mode path.

pub mod bench;
pub mod config;
pub mod container;
pub mod dataset;
pub mod decompose;
pub mod fill;
pub mod filter;
pub mod hyperslab;
pub mod layout;
pub mod metadata;
pub mod provider;
pub mod verify;

pub use seismio_storage as storage;
pub use seismio_transport as transport;

/// The name of the benchmark dataset within a container.
pub const DATASET_NAME: &str = "chunked";

/// The container name used for a single-container run.
pub const CONTAINER_NAME: &str = "seism-test";

/// The container name for subfile group `color`.
#[must_use]
pub fn subfile_container_name(color: u64) -> String {
    format!("subfile_{color}")
}
