//! The SPMD transport boundary for the `seismio` benchmark engine.
//!
//! One worker per logical grid cell, no intra-process threading on the worker
//! side: every cross-worker interaction goes through a [`Communicator`]. The
//! benchmark uses exactly two coordination primitives, a broadcast (once, to
//! distribute the run configuration) and a barrier (to delimit benchmark
//! phases), plus communicator splitting for subfile groups.
//!
//! Collective operations are rendezvous style: every worker in the
//! communicator must issue the matching call for any of them to complete. A
//! worker that skips a collective call stalls its peers. There is no timeout
//! and no cancellation; a fatal condition on any worker is expected to bring
//! down the whole run.
//!
//! [`LocalWorld`] provides a thread-backed communicator for tests and
//! single-node demo runs.

mod local;

use std::sync::Arc;

use thiserror::Error;

pub use local::LocalWorld;

/// A transport error.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// A broadcast root outside the communicator.
    #[error("broadcast root {root} is out of range for communicator of size {size}")]
    InvalidRoot {
        /// The requested root rank.
        root: usize,
        /// The communicator size.
        size: usize,
    },
    /// A peer worker exited while a collective operation was in progress.
    #[error("a peer worker exited during a collective operation")]
    PeerLost,
}

/// A communicator over a group of SPMD workers.
///
/// Implementations must give every worker in the group its own handle; rank
/// and size are properties of the handle, collective calls are properties of
/// the group.
pub trait Communicator: Send + Sync {
    /// The rank of this worker within the communicator, in `0..size`.
    fn rank(&self) -> usize;

    /// The number of workers in the communicator.
    fn size(&self) -> usize;

    /// Block until every worker in the communicator has entered the barrier.
    ///
    /// Collective.
    fn barrier(&self);

    /// Propagate `value` from the worker with rank `root` to every worker.
    ///
    /// On non-root workers the contents of `value` on entry are ignored and
    /// replaced. Collective.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidRoot`] if `root >= size`.
    fn broadcast(&self, root: usize, value: &mut Vec<u8>) -> Result<(), TransportError>;

    /// Split the communicator into disjoint sub-communicators by `color`.
    ///
    /// Workers passing the same color end up in the same sub-communicator,
    /// with sub-ranks ordered by parent rank. Collective.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the group state is corrupt.
    fn split(&self, color: u64) -> Result<Arc<dyn Communicator>, TransportError>;

    /// Seconds of wall-clock time since an epoch shared by the communicator.
    fn wall_clock(&self) -> f64;
}
