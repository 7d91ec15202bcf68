//! Fiber registry
//!
//! Every live fiber is registered from creation until termination, so
//! diagnostics and memory-management scans can find suspended stacks.
//!
//! # Design
//!
//! The registry is a fixed power-of-two array of shards. A fiber's shard is
//! picked from its address with the alignment bits shifted out:
//!
//! ```text
//!   shard = (fiber_addr >> log2(align_of::<Fiber>())) & (shards - 1)
//! ```
//!
//! Each shard owns a circular doubly-linked list whose links live in a
//! shard-local arena (`next`/`prev` are indices into it), plus a count that
//! always equals the list length. Each shard has its own mutex and no
//! operation ever holds two of them.
//!
//! # Parallel scans
//!
//! A scan round is identified by a nonzero parity value (shards start out
//! tagged 0, so round 0 would find every shard already claimed). Every
//! scanner thread of the
//! round calls [`FiberRegistry::par_for_each`]; a shard is processed by the
//! one scanner that wins the CAS of its parity tag to the round's value.
//! A losing CAS must observe exactly the round's value; anything else means
//! two rounds overlap, which is a fatal bug.

use crate::fiber::{Fiber, FiberId, UNLINKED};
use crate::frames::FrameSource;
use fiber_core::{fatal, guarantee};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::trace;

/// Low address bits that are always zero for a `Fiber`
const ID_SHIFT: u32 = std::mem::align_of::<Fiber>().trailing_zeros();

struct Link {
    fiber: Arc<Fiber>,
    next: usize,
    prev: usize,
}

/// Circular list of one shard
#[derive(Default)]
struct ShardList {
    links: Vec<Option<Link>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    count: usize,
}

impl ShardList {
    fn link(&self, idx: usize) -> &Link {
        match self.links.get(idx) {
            Some(Some(link)) => link,
            _ => fatal!("registry link {} is vacant", idx),
        }
    }

    fn link_mut(&mut self, idx: usize) -> &mut Link {
        match self.links.get_mut(idx) {
            Some(Some(link)) => link,
            _ => fatal!("registry link {} is vacant", idx),
        }
    }

    /// Link `fiber` in as the new head; returns its link index.
    fn push(&mut self, fiber: Arc<Fiber>) -> usize {
        let idx = match self.vacant.pop() {
            Some(idx) => idx,
            None => {
                self.links.push(None);
                self.links.len() - 1
            }
        };
        let (next, prev) = match self.head {
            None => (idx, idx),
            Some(head) => (head, self.link(head).prev),
        };
        self.links[idx] = Some(Link { fiber, next, prev });
        if next != idx {
            self.link_mut(prev).next = idx;
            self.link_mut(next).prev = idx;
        }
        self.head = Some(idx);
        self.count += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) -> Arc<Fiber> {
        let Some(link) = self.links.get_mut(idx).and_then(Option::take) else {
            fatal!("registry link {} is vacant", idx);
        };
        if link.next == idx {
            self.head = None;
        } else {
            self.link_mut(link.prev).next = link.next;
            self.link_mut(link.next).prev = link.prev;
            if self.head == Some(idx) {
                self.head = Some(link.next);
            }
        }
        self.vacant.push(idx);
        self.count -= 1;
        link.fiber
    }

    /// Link indices in list order, starting at the head
    fn indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count);
        if let Some(head) = self.head {
            let mut idx = head;
            loop {
                out.push(idx);
                idx = self.link(idx).next;
                if idx == head || out.len() > self.links.len() {
                    break;
                }
            }
        }
        out
    }

    fn for_each(&self, mut f: impl FnMut(&Arc<Fiber>)) {
        if let Some(head) = self.head {
            let mut idx = head;
            loop {
                let link = self.link(idx);
                f(&link.fiber);
                idx = link.next;
                if idx == head {
                    break;
                }
            }
        }
    }

    fn find(&self, id: FiberId) -> Option<Arc<Fiber>> {
        let mut found = None;
        self.for_each(|fiber| {
            if found.is_none() && fiber.id() == id {
                found = Some(Arc::clone(fiber));
            }
        });
        found
    }
}

/// One independently locked partition of the registry
pub struct RegistryShard {
    list: Mutex<ShardList>,
    parity: AtomicU32,
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            list: Mutex::new(ShardList::default()),
            parity: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShardList> {
        self.list
            .lock()
            .unwrap_or_else(|_| fatal!("registry shard lock poisoned"))
    }

    /// Claim this shard for the scan round `parity`.
    ///
    /// Returns true for exactly one caller per round. Rounds are nonzero.
    pub fn claim(&self, parity: u32) -> bool {
        guarantee!(parity != 0, "scan round parity must be nonzero");
        let observed = self.parity.load(Ordering::Acquire);
        if observed == parity {
            return false;
        }
        match self
            .parity
            .compare_exchange(observed, parity, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                guarantee!(
                    actual == parity,
                    "shard parity moved from {} to {} while claiming round {}",
                    observed,
                    actual,
                    parity
                );
                false
            }
        }
    }

    pub fn parity(&self) -> u32 {
        self.parity.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }
}

/// Sharded set of all live fibers
pub struct FiberRegistry {
    shards: Box<[RegistryShard]>,
    mask: usize,
}

impl FiberRegistry {
    /// `shards` must be a nonzero power of two.
    pub fn new(shards: usize) -> Self {
        guarantee!(
            shards.is_power_of_two(),
            "registry shard count {} is not a power of two",
            shards
        );
        Self {
            shards: (0..shards).map(|_| RegistryShard::new()).collect(),
            mask: shards - 1,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, id: FiberId) -> usize {
        (id.as_usize() >> ID_SHIFT) & self.mask
    }

    pub fn shard(&self, index: usize) -> &RegistryShard {
        self.shards.get(index).unwrap_or_else(|| {
            fatal!(
                "registry shard index {} out of range ({} shards)",
                index,
                self.shards.len()
            )
        })
    }

    pub fn insert(&self, fiber: &Arc<Fiber>) {
        let shard = self.shard_index(fiber.id());
        let mut list = self.shards[shard].lock();
        guarantee!(
            fiber.registry_slot.load(Ordering::Acquire) == UNLINKED,
            "fiber {} is already registered",
            fiber.id()
        );
        let slot = list.push(Arc::clone(fiber));
        fiber.registry_slot.store(slot, Ordering::Release);
        trace!(fiber = %fiber.id(), shard, "fiber registered");
    }

    pub fn remove(&self, fiber: &Fiber) {
        let shard = self.shard_index(fiber.id());
        let mut list = self.shards[shard].lock();
        let slot = fiber.registry_slot.load(Ordering::Acquire);
        guarantee!(slot != UNLINKED, "fiber {} is not registered", fiber.id());
        guarantee!(
            list.link(slot).fiber.id() == fiber.id(),
            "registry slot {} of fiber {} holds another fiber",
            slot,
            fiber.id()
        );
        list.unlink(slot);
        fiber.registry_slot.store(UNLINKED, Ordering::Release);
        trace!(fiber = %fiber.id(), shard, "fiber unregistered");
    }

    /// Look a fiber up by identity.
    ///
    /// With `may_block == false` a busy shard is not waited for and the
    /// lookup answers `None`; callers needing certainty must search elsewhere.
    pub fn find(&self, id: FiberId, may_block: bool) -> Option<Arc<Fiber>> {
        let shard = &self.shards[self.shard_index(id)];
        if may_block {
            return shard.lock().find(id);
        }
        match shard.list.try_lock() {
            Ok(list) => list.find(id),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => fatal!("registry shard lock poisoned"),
        }
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.find(id, true).is_some()
    }

    /// Visit every fiber, one shard lock at a time, shards in index order.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Fiber>)) {
        for shard in self.shards.iter() {
            shard.lock().for_each(&mut f);
        }
    }

    /// Visit shard `index` if this caller wins it for round `parity`.
    pub fn scan_shard(&self, index: usize, parity: u32, f: impl FnMut(&Arc<Fiber>)) -> bool {
        let shard = self.shard(index);
        if !shard.claim(parity) {
            return false;
        }
        shard.lock().for_each(f);
        true
    }

    /// One scanner's share of a parallel round; returns the shards it claimed.
    ///
    /// Every scanner thread of the round calls this with the same parity;
    /// together they visit each fiber exactly once.
    pub fn par_for_each(&self, parity: u32, mut f: impl FnMut(&Arc<Fiber>)) -> usize {
        (0..self.shards.len())
            .filter(|&index| self.scan_shard(index, parity, &mut f))
            .count()
    }

    /// Total registered fibers
    pub fn len(&self) -> usize {
        self.shards.iter().map(RegistryShard::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_counts(&self) -> Vec<usize> {
        self.shards.iter().map(RegistryShard::count).collect()
    }

    /// Check every shard's count and membership; fatal on mismatch.
    pub fn verify(&self) {
        for (index, shard) in self.shards.iter().enumerate() {
            let list = shard.lock();
            let indices = list.indices();
            guarantee!(
                indices.len() == list.count,
                "shard {} count {} != list length {}",
                index,
                list.count,
                indices.len()
            );
            for idx in indices {
                let fiber = &list.link(idx).fiber;
                guarantee!(
                    self.shard_index(fiber.id()) == index,
                    "fiber {} hashes to shard {} but is linked in shard {}",
                    fiber.id(),
                    self.shard_index(fiber.id()),
                    index
                );
                guarantee!(
                    fiber.registry_slot.load(Ordering::Acquire) == idx,
                    "fiber {} records slot {} but is linked at {}",
                    fiber.id(),
                    fiber.registry_slot.load(Ordering::Acquire),
                    idx
                );
            }
        }
    }

    /// Dump every suspended fiber's stack
    pub fn print_stacks(
        &self,
        out: &mut dyn Write,
        source: &dyn FrameSource,
        max_depth: usize,
    ) -> io::Result<()> {
        let mut result = Ok(());
        self.for_each(|fiber| {
            if result.is_ok() {
                result = fiber.print_stack_on(out, source, max_depth);
            }
        });
        result
    }
}

/// Fibers currently running on some OS thread
pub trait ActiveUnits {
    fn active(&self) -> Box<dyn Iterator<Item = Arc<Fiber>> + '_>;
}

/// Find the fiber owning a lock.
///
/// `owner` is either a fiber identity (inflated locks) or the address of a
/// lock record on some fiber's stack. Registered identities are tried first;
/// unless locks are always inflated, running fibers are then searched for a
/// stack containing the record.
pub fn find_lock_owner(
    registry: &FiberRegistry,
    owner: usize,
    may_block: bool,
    heavy_monitors: bool,
    units: &dyn ActiveUnits,
) -> Option<Arc<Fiber>> {
    if owner == 0 {
        return None;
    }
    if let Some(fiber) = registry.find(FiberId::from_raw(owner), may_block) {
        return Some(fiber);
    }
    if heavy_monitors {
        return None;
    }
    units.active().find(|fiber| fiber.is_lock_owned(owner))
}
