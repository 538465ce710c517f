//! A thread-backed communicator for local runs.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Instant;

use crate::{Communicator, TransportError};

/// Group state shared by every member of one communicator.
struct Group {
    size: usize,
    barrier: Barrier,
    epoch: Instant,
    /// Broadcast slot, valid between the flanking barriers of a broadcast.
    bcast: Mutex<Option<Vec<u8>>>,
    /// Per-rank colors gathered during a split.
    colors: Mutex<Vec<Option<u64>>>,
    /// Sub-groups built by rank 0 during a split, keyed by color.
    subgroups: Mutex<HashMap<u64, Arc<Group>>>,
}

impl Group {
    fn new(size: usize, epoch: Instant) -> Self {
        Self {
            size,
            barrier: Barrier::new(size),
            epoch,
            bcast: Mutex::new(None),
            colors: Mutex::new(vec![None; size]),
            subgroups: Mutex::new(HashMap::new()),
        }
    }
}

/// A set of communicators over worker threads within one process.
///
/// `LocalWorld::new(n)` yields `n` handles; hand one to each worker thread.
/// The collective semantics match the trait contract: barriers and broadcasts
/// block until every member arrives, so dropping a handle without finishing
/// the run deadlocks the rest, exactly like a died peer in a batch job.
pub struct LocalWorld;

impl LocalWorld {
    /// Create communicators for a world of `size` workers.
    #[must_use]
    pub fn new(size: usize) -> Vec<Arc<dyn Communicator>> {
        assert!(size > 0, "world size must be nonzero");
        let group = Arc::new(Group::new(size, Instant::now()));
        (0..size)
            .map(|rank| {
                Arc::new(LocalCommunicator {
                    rank,
                    group: group.clone(),
                }) as Arc<dyn Communicator>
            })
            .collect()
    }
}

/// One worker's handle onto a [`LocalWorld`] group.
struct LocalCommunicator {
    rank: usize,
    group: Arc<Group>,
}

impl LocalCommunicator {
    fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        // A poisoned lock means a peer worker panicked mid-collective; the
        // contract is to go down with it rather than continue on torn state.
        mutex.lock().unwrap_or_else(|_| {
            panic!("a peer worker panicked during a collective operation")
        })
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn broadcast(&self, root: usize, value: &mut Vec<u8>) -> Result<(), TransportError> {
        if root >= self.group.size {
            return Err(TransportError::InvalidRoot {
                root,
                size: self.group.size,
            });
        }
        if self.rank == root {
            *Self::lock(&self.group.bcast) = Some(value.clone());
        }
        self.group.barrier.wait();
        if self.rank != root {
            *value = Self::lock(&self.group.bcast)
                .clone()
                .ok_or(TransportError::PeerLost)?;
        }
        // The closing barrier keeps a subsequent broadcast from overwriting
        // the slot while a peer is still reading it.
        self.group.barrier.wait();
        Ok(())
    }

    fn split(&self, color: u64) -> Result<Arc<dyn Communicator>, TransportError> {
        Self::lock(&self.group.colors)[self.rank] = Some(color);
        self.group.barrier.wait();

        // Every rank sees the complete color vector; rank 0 materializes the
        // sub-groups so each group shares a single barrier.
        let colors: Vec<u64> = Self::lock(&self.group.colors)
            .iter()
            .map(|color| color.ok_or(TransportError::PeerLost))
            .collect::<Result<_, _>>()?;
        if self.rank == 0 {
            let mut subgroups = Self::lock(&self.group.subgroups);
            subgroups.clear();
            for &color in &colors {
                let members = colors.iter().filter(|&&c| c == color).count();
                subgroups
                    .entry(color)
                    .or_insert_with(|| Arc::new(Group::new(members, self.group.epoch)));
            }
        }
        self.group.barrier.wait();

        let subgroup = Self::lock(&self.group.subgroups)
            .get(&color)
            .cloned()
            .ok_or(TransportError::PeerLost)?;
        let subrank = colors[..self.rank].iter().filter(|&&c| c == color).count();
        // No cleanup: the next split rewrites every color slot and rebuilds
        // the sub-group map, and its opening barrier orders that rewrite
        // after every read above.
        self.group.barrier.wait();
        Ok(Arc::new(LocalCommunicator {
            rank: subrank,
            group: subgroup,
        }))
    }

    fn wall_clock(&self) -> f64 {
        self.group.epoch.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Run `f` on `size` worker threads, each with its own communicator.
    fn spmd<F>(size: usize, f: F)
    where
        F: Fn(Arc<dyn Communicator>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalWorld::new(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn ranks_and_size() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_ = seen.clone();
        spmd(4, move |comm| {
            assert_eq!(comm.size(), 4);
            seen_.fetch_add(1 << comm.rank(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0b1111);
    }

    #[test]
    fn broadcast_from_root() {
        spmd(4, |comm| {
            let mut value = if comm.rank() == 0 {
                vec![7, 7, 7]
            } else {
                Vec::new()
            };
            comm.broadcast(0, &mut value).unwrap();
            assert_eq!(value, vec![7, 7, 7]);

            // A second broadcast reuses the slot.
            let mut value = if comm.rank() == 1 { vec![9] } else { Vec::new() };
            comm.broadcast(1, &mut value).unwrap();
            assert_eq!(value, vec![9]);
        });
    }

    #[test]
    fn broadcast_invalid_root() {
        spmd(2, |comm| {
            // Erroring before the rendezvous keeps the peers consistent.
            assert!(matches!(
                comm.broadcast(5, &mut Vec::new()),
                Err(TransportError::InvalidRoot { root: 5, size: 2 })
            ));
        });
    }

    #[test]
    fn barrier_separates_phases() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_ = counter.clone();
        spmd(8, move |comm| {
            counter_.fetch_add(1, Ordering::SeqCst);
            comm.barrier();
            // All increments happen before any worker passes the barrier.
            assert_eq!(counter_.load(Ordering::SeqCst), 8);
        });
    }

    #[test]
    fn split_by_color() {
        spmd(8, |comm| {
            let color = (comm.rank() % 4) as u64;
            let sub = comm.split(color).unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), usize::from(comm.rank() >= 4));
            sub.barrier();

            // Sub-communicators support their own broadcasts.
            let mut value = if sub.rank() == 0 {
                vec![u8::try_from(color).unwrap()]
            } else {
                Vec::new()
            };
            sub.broadcast(0, &mut value).unwrap();
            assert_eq!(value, vec![u8::try_from(color).unwrap()]);
        });
    }

    #[test]
    fn split_all_same_color() {
        spmd(3, |comm| {
            let sub = comm.split(0).unwrap();
            assert_eq!(sub.size(), 3);
            assert_eq!(sub.rank(), comm.rank());
        });
    }

    #[test]
    fn wall_clock_is_monotonic() {
        spmd(2, |comm| {
            let t0 = comm.wall_clock();
            comm.barrier();
            assert!(comm.wall_clock() >= t0);
        });
    }
}
