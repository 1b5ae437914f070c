//! Consistent-hash sharding of cron jobs across the controller fleet.
//!
//! Each controller contributes [`VIRTUAL_NODES`] points to the ring. A job key
//! lands on the first point clockwise of its own hash; that point's
//! controller and the next `replication - 1` controllers in list order form
//! the job's window of responsible controllers.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use sha2::{Digest, Sha256};

use cronfleet_core::config::CONTROLLERS_PER_JOB;
use cronfleet_core::{Controller, ControllerKey, CronJobKey};

/// Points per controller on the ring.
pub const VIRTUAL_NODES: usize = 64;

fn ring_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Immutable ring over a list of node names.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// `(position, node index)`, sorted by position.
    points: Vec<(u64, usize)>,
}

impl HashRing {
    pub fn new<S: AsRef<str>>(nodes: &[S]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * VIRTUAL_NODES);
        for (idx, node) in nodes.iter().enumerate() {
            for replica in 0..VIRTUAL_NODES {
                let label = format!("{}#{}", node.as_ref(), replica);
                points.push((ring_hash(label.as_bytes()), idx));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// Index of the node that owns `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let h = ring_hash(key.as_bytes());
        let pos = self.points.partition_point(|(p, _)| *p < h);
        let (_, idx) = self.points[pos % self.points.len()];
        Some(idx)
    }
}

/// Snapshot of fleet membership as seen by one controller.
#[derive(Debug, Clone)]
pub struct HashRingState {
    ring: HashRing,
    controllers: Vec<Controller>,
    /// This controller's position in `controllers`.
    idx: Option<usize>,
}

impl HashRingState {
    pub fn new(controllers: Vec<Controller>, self_key: &ControllerKey) -> Self {
        let keys: Vec<&str> = controllers.iter().map(|c| c.key.as_str()).collect();
        let ring = HashRing::new(&keys);
        let idx = controllers.iter().position(|c| &c.key == self_key);
        Self {
            ring,
            controllers,
            idx,
        }
    }

    /// A state with no controllers: responsible for nothing.
    pub fn empty() -> Self {
        Self {
            ring: HashRing::new::<&str>(&[]),
            controllers: Vec::new(),
            idx: None,
        }
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn idx(&self) -> Option<usize> {
        self.idx
    }

    /// Whether the list is element-wise identical to this snapshot's.
    pub fn has_controllers(&self, controllers: &[Controller]) -> bool {
        self.controllers == controllers
    }

    /// True iff `self_idx` is in the window of `replication` controllers
    /// starting at the ring-chosen node for `job_key`, wrapping at the end
    /// of the controller list.
    pub fn responsible_for(&self, job_key: &CronJobKey, self_idx: usize, replication: usize) -> bool {
        let n = self.controllers.len();
        let Some(initial) = self.ring.get(job_key.as_str()) else {
            return false;
        };
        (0..replication.min(n)).any(|i| (initial + i) % n == self_idx)
    }

    /// Responsibility of this controller with the fleet-wide replication factor.
    pub fn is_responsible(&self, job_key: &CronJobKey) -> bool {
        match self.idx {
            Some(idx) => self.responsible_for(job_key, idx, CONTROLLERS_PER_JOB),
            None => false,
        }
    }
}

/// Holder for the current [`HashRingState`].
///
/// Readers take an `Arc` snapshot without locking and never observe a
/// partially built ring; writers replace the whole value.
#[derive(Debug)]
pub struct SharedHashRing {
    current: ArcSwap<HashRingState>,
}

impl SharedHashRing {
    pub fn new(state: HashRingState) -> Self {
        Self {
            current: ArcSwap::from_pointee(state),
        }
    }

    pub fn load(&self) -> Arc<HashRingState> {
        self.current.load_full()
    }

    pub fn store(&self, state: HashRingState) {
        self.current.store(Arc::new(state));
    }

    /// Install a ring for `controllers` unless the current one already has
    /// exactly that list. Returns the installed ring.
    ///
    /// Concurrent callers with the same list see at most one `Some`.
    pub fn replace_if_changed(
        &self,
        controllers: &[Controller],
        self_key: &ControllerKey,
    ) -> Option<Arc<HashRingState>> {
        let mut current = self.current.load_full();
        loop {
            if current.has_controllers(controllers) {
                return None;
            }
            let next = Arc::new(HashRingState::new(controllers.to_vec(), self_key));
            let previous = self.current.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &current) {
                return Some(next);
            }
            current = Guard::into_inner(previous);
        }
    }
}

impl Default for SharedHashRing {
    fn default() -> Self {
        Self::new(HashRingState::empty())
    }
}
