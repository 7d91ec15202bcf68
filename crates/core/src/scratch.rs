//! Thread scratch resources
//!
//! Each OS thread running fibers owns one [`ThreadScratch`]: the resources
//! managed code borrows from the thread rather than from the fiber. A fiber
//! that yields while still holding any of them would hand them to whichever
//! fiber runs next on the thread, so switch verification snapshots them when
//! a fiber is entered and compares when it leaves.
//!
//! Design:
//! - Two bump arenas (handle area, resource area) backed by bumpalo
//! - Each arena tracks a high-water mark; `mark`/`release_to` pair like a stack
//! - A stack of handle blocks, each counting its live handles
//! - Plain counters for native-call depth, held locks, foreign frames and
//!   monitor chunks
//!
//! Nothing here is shared between threads.

use bumpalo::Bump;

/// Thread-local bump arena with a mark/release discipline
///
/// `hwm` counts bytes handed out since the last full release. Releasing to
/// mark zero resets the underlying `Bump` so its chunks are reused.
#[derive(Default)]
pub struct ScratchArena {
    bump: Bump,
    hwm: usize,
}

/// Position in a `ScratchArena` to release back to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaMark(usize);

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes.
    pub fn alloc_bytes(&mut self, len: usize) -> &mut [u8] {
        self.hwm += len;
        self.bump.alloc_slice_fill_copy(len, 0u8)
    }

    /// Current position
    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.hwm)
    }

    /// Release everything allocated since `mark`.
    ///
    /// Memory is only returned to the `Bump` when the arena drains completely.
    pub fn release_to(&mut self, mark: ArenaMark) {
        crate::guarantee!(
            mark.0 <= self.hwm,
            "scratch arena released to mark {} above high-water mark {}",
            mark.0,
            self.hwm
        );
        self.hwm = mark.0;
        if self.hwm == 0 {
            self.bump.reset();
        }
    }

    /// Bytes currently handed out
    pub fn hwm(&self) -> usize {
        self.hwm
    }

    /// Bytes the underlying arena has reserved from the allocator
    pub fn reserved_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

/// One block of local handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleBlock {
    pub id: u64,
    pub live: usize,
}

/// What switch verification records about a thread's scratch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchSnapshot {
    /// Id of the active handle block
    pub handle_block: u64,
    /// Live handles in the active block
    pub live_handles: usize,
    pub handle_area_hwm: usize,
    pub resource_area_hwm: usize,
}

/// All scratch resources of one OS thread
pub struct ThreadScratch {
    handle_blocks: Vec<HandleBlock>,
    next_block_id: u64,
    handle_area: ScratchArena,
    resource_area: ScratchArena,
    native_call_depth: usize,
    locks_held: usize,
    foreign_frames: usize,
    monitor_chunks: usize,
}

impl Default for ThreadScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadScratch {
    /// Fresh scratch state with one (base) handle block.
    pub fn new() -> Self {
        Self {
            handle_blocks: vec![HandleBlock { id: 0, live: 0 }],
            next_block_id: 1,
            handle_area: ScratchArena::new(),
            resource_area: ScratchArena::new(),
            native_call_depth: 0,
            locks_held: 0,
            foreign_frames: 0,
            monitor_chunks: 0,
        }
    }

    // Handle blocks

    /// Open a new handle block; returns its id.
    pub fn push_handle_block(&mut self) -> u64 {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.handle_blocks.push(HandleBlock { id, live: 0 });
        id
    }

    /// Close the active handle block, dropping its handles.
    pub fn pop_handle_block(&mut self) {
        crate::guarantee!(
            self.handle_blocks.len() > 1,
            "attempt to pop the base handle block"
        );
        self.handle_blocks.pop();
    }

    /// Create a handle in the active block.
    pub fn make_handle(&mut self) {
        if let Some(block) = self.handle_blocks.last_mut() {
            block.live += 1;
        }
    }

    /// Drop every handle in the active block.
    pub fn clear_handles(&mut self) {
        if let Some(block) = self.handle_blocks.last_mut() {
            block.live = 0;
        }
    }

    pub fn active_handle_block(&self) -> HandleBlock {
        self.handle_blocks
            .last()
            .copied()
            .unwrap_or(HandleBlock { id: 0, live: 0 })
    }

    // Arenas

    pub fn handle_area(&mut self) -> &mut ScratchArena {
        &mut self.handle_area
    }

    pub fn resource_area(&mut self) -> &mut ScratchArena {
        &mut self.resource_area
    }

    // Counters

    pub fn enter_native_call(&mut self) {
        self.native_call_depth += 1;
    }

    pub fn exit_native_call(&mut self) {
        crate::guarantee!(self.native_call_depth > 0, "native call depth underflow");
        self.native_call_depth -= 1;
    }

    pub fn native_call_depth(&self) -> usize {
        self.native_call_depth
    }

    pub fn lock_acquired(&mut self) {
        self.locks_held += 1;
    }

    pub fn lock_released(&mut self) {
        crate::guarantee!(self.locks_held > 0, "lock count underflow");
        self.locks_held -= 1;
    }

    pub fn locks_held(&self) -> usize {
        self.locks_held
    }

    pub fn enter_foreign_frame(&mut self) {
        self.foreign_frames += 1;
    }

    pub fn exit_foreign_frame(&mut self) {
        crate::guarantee!(self.foreign_frames > 0, "foreign frame count underflow");
        self.foreign_frames -= 1;
    }

    pub fn foreign_frames(&self) -> usize {
        self.foreign_frames
    }

    pub fn push_monitor_chunk(&mut self) {
        self.monitor_chunks += 1;
    }

    pub fn pop_monitor_chunk(&mut self) {
        crate::guarantee!(self.monitor_chunks > 0, "monitor chunk underflow");
        self.monitor_chunks -= 1;
    }

    pub fn monitor_chunks(&self) -> usize {
        self.monitor_chunks
    }

    /// Record the state switch verification compares against.
    pub fn snapshot(&self) -> ScratchSnapshot {
        let block = self.active_handle_block();
        ScratchSnapshot {
            handle_block: block.id,
            live_handles: block.live,
            handle_area_hwm: self.handle_area.hwm(),
            resource_area_hwm: self.resource_area.hwm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_mark_and_release() {
        let mut arena = ScratchArena::new();
        assert_eq!(arena.hwm(), 0);

        let bytes = arena.alloc_bytes(64);
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|b| *b == 0));

        let mark = arena.mark();
        arena.alloc_bytes(100);
        assert_eq!(arena.hwm(), 164);

        arena.release_to(mark);
        assert_eq!(arena.hwm(), 64);

        arena.release_to(ArenaMark(0));
        assert_eq!(arena.hwm(), 0);
    }

    #[test]
    #[should_panic(expected = "above high-water mark")]
    fn test_arena_release_above_hwm_is_fatal() {
        let mut arena = ScratchArena::new();
        let mut other = ScratchArena::new();
        other.alloc_bytes(10);
        let mark = other.mark();
        arena.release_to(mark);
    }

    #[test]
    fn test_handle_blocks() {
        let mut scratch = ThreadScratch::new();
        assert_eq!(scratch.active_handle_block().id, 0);

        let id = scratch.push_handle_block();
        assert_ne!(id, 0);
        scratch.make_handle();
        scratch.make_handle();
        assert_eq!(scratch.active_handle_block(), HandleBlock { id, live: 2 });

        scratch.pop_handle_block();
        assert_eq!(scratch.active_handle_block().id, 0);

        // Ids are never reused
        let next = scratch.push_handle_block();
        assert!(next > id);
    }

    #[test]
    #[should_panic(expected = "base handle block")]
    fn test_pop_base_block_is_fatal() {
        let mut scratch = ThreadScratch::new();
        scratch.pop_handle_block();
    }

    #[test]
    fn test_snapshot_tracks_all_fields() {
        let mut scratch = ThreadScratch::new();
        let before = scratch.snapshot();

        scratch.make_handle();
        assert_ne!(scratch.snapshot(), before);
        scratch.clear_handles();
        assert_eq!(scratch.snapshot(), before);

        let mark = scratch.resource_area().mark();
        scratch.resource_area().alloc_bytes(32);
        assert_eq!(scratch.snapshot().resource_area_hwm, 32);
        scratch.resource_area().release_to(mark);
        assert_eq!(scratch.snapshot(), before);

        scratch.handle_area().alloc_bytes(8);
        assert_eq!(scratch.snapshot().handle_area_hwm, 8);
    }

    #[test]
    fn test_counters() {
        let mut scratch = ThreadScratch::new();
        scratch.enter_native_call();
        scratch.lock_acquired();
        scratch.enter_foreign_frame();
        scratch.push_monitor_chunk();
        assert_eq!(scratch.native_call_depth(), 1);
        assert_eq!(scratch.locks_held(), 1);
        assert_eq!(scratch.foreign_frames(), 1);
        assert_eq!(scratch.monitor_chunks(), 1);

        scratch.exit_native_call();
        scratch.lock_released();
        scratch.exit_foreign_frame();
        scratch.pop_monitor_chunk();
        assert_eq!(scratch.native_call_depth(), 0);
        assert_eq!(scratch.locks_held(), 0);
        assert_eq!(scratch.foreign_frames(), 0);
        assert_eq!(scratch.monitor_chunks(), 0);
    }
}
