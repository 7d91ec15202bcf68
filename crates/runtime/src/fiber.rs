//! The fiber entity
//!
//! A fiber is an execution context with its own stack and a saved resume
//! point. Fibers are shared as `Arc<Fiber>`; the address of the `Fiber`
//! inside its `Arc` is the fiber's identity and registry hash key.
//!
//! ## States
//!
//! ```text
//!             switch_to(target)
//!   OnStack ─────────────────────► Current
//!      ▲                              │
//!      └──────────────────────────────┘
//!        switch_to(other) from here
//! ```
//!
//! `Current` means the fiber is attached to its OS thread (running, or
//! blocked in native code on its behalf). `OnStack` means suspended: the
//! resume point is valid and frames can be walked.
//!
//! ## Priming
//!
//! A fresh heap stack gets a fake initial frame so the first switch into it
//! "returns" into `fiber_start`:
//!
//! ```text
//!   base ─►  ┌─────────────────────┐
//!            │ 0  (x7 scratch)     │  profiler lookup slots
//!            │ 0  (aarch64 only)   │  keeps fp 16-byte aligned
//!            │ fiber_start         │  return address (sentinel)
//!   resume ─►│ 0                   │  saved frame pointer
//!            └─────────────────────┘
//! ```
//!
//! A walk that finds the sentinel as return address knows the fiber never
//! ran and stops.

use crate::frames::{CallFrame, FrameCursor, FrameSource, StackTraceElement, WalkMode};
use crate::linkage::fiber_start_address;
use crate::stack_pool::{GuardState, StackLease, StackRegion};
use fiber_core::scratch::ScratchSnapshot;
use fiber_core::{fatal, guarantee};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Machine word size
pub const WORD: usize = std::mem::size_of::<usize>();

/// Zeroed slots at the top of every stack for sampling profilers
const PROFILER_SCRATCH_SLOTS: usize = 7;

/// Words written by priming, including the return address and frame pointer
pub const PRIMED_WORDS: usize =
    PROFILER_SCRATCH_SLOTS + if cfg!(target_arch = "aarch64") { 1 } else { 0 } + 2;

/// Marks a fiber that is not linked into the registry
pub(crate) const UNLINKED: usize = usize::MAX;

/// Fiber identity: the stable address of the `Fiber`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(usize);

impl FiberId {
    /// Identity from a raw address, e.g. a lock owner field
    pub const fn from_raw(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({:#x})", self.0)
    }
}

/// Identifies the `FiberThread` that owns a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(u64);

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

impl ThreadToken {
    pub(crate) fn next() -> Self {
        Self(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    /// Wraps an OS thread's own stack
    Thread,
    /// Runs on a pooled stack
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    OnStack = 0,
    Current = 1,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::OnStack,
            1 => Self::Current,
            other => fatal!("invalid fiber state {}", other),
        }
    }
}

/// Saved stack pointer of a suspended fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint(usize);

impl ResumePoint {
    /// `None` for the null address
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// Kind tag of the managed continuation object behind a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationKind {
    Plain,
    VirtualThread,
}

/// Name and state of the virtual thread a continuation belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualThreadInfo {
    pub name: Option<String>,
    pub state: i32,
}

/// The managed object a heap fiber runs; held weakly by the fiber
pub trait Continuation: Send + Sync {
    fn kind(&self) -> ContinuationKind;

    fn virtual_thread(&self) -> Option<VirtualThreadInfo> {
        None
    }
}

/// Virtual-thread state code of a terminated thread
pub const VT_TERMINATED: i32 = 99;

const VT_STATE_NAMES: [&str; 7] = [
    "NEW", "STARTED", "RUNNABLE", "RUNNING", "PARKING", "PARKED", "PINNED",
];

/// Printable name of a virtual-thread state code
pub fn vt_state_name(state: i32) -> &'static str {
    match usize::try_from(state) {
        Ok(idx) if idx < VT_STATE_NAMES.len() => VT_STATE_NAMES[idx],
        _ if state == VT_TERMINATED => "TERMINATED",
        _ => "ERROR STATE",
    }
}

/// A cooperative execution context
pub struct Fiber {
    kind: FiberKind,
    owner: ThreadToken,
    owner_name: Arc<str>,
    region: StackRegion,
    lease: Option<StackLease>,
    state: AtomicU8,
    resume: AtomicUsize,
    entered: AtomicBool,
    /// `None` when verification was off at creation
    bookmark: Option<Mutex<Option<ScratchSnapshot>>>,
    continuation: Mutex<Option<Weak<dyn Continuation>>>,
    /// Link index in the owning registry shard
    pub(crate) registry_slot: AtomicUsize,
}

impl Fiber {
    pub(crate) fn new_thread(owner: ThreadToken, owner_name: Arc<str>, region: StackRegion) -> Self {
        Self {
            kind: FiberKind::Thread,
            owner,
            owner_name,
            region,
            lease: None,
            state: AtomicU8::new(FiberState::Current as u8),
            resume: AtomicUsize::new(0),
            entered: AtomicBool::new(true),
            bookmark: None,
            continuation: Mutex::new(None),
            registry_slot: AtomicUsize::new(UNLINKED),
        }
    }

    pub(crate) fn new_heap(
        owner: ThreadToken,
        owner_name: Arc<str>,
        lease: StackLease,
        verify: bool,
    ) -> Self {
        let region = lease.region();
        let resume = prime_stack(&region);
        Self {
            kind: FiberKind::Heap,
            owner,
            owner_name,
            region,
            lease: Some(lease),
            state: AtomicU8::new(FiberState::OnStack as u8),
            resume: AtomicUsize::new(resume.addr()),
            entered: AtomicBool::new(false),
            bookmark: verify.then(|| Mutex::new(None)),
            continuation: Mutex::new(None),
            registry_slot: AtomicUsize::new(UNLINKED),
        }
    }

    /// Make a parked fiber look freshly created.
    pub(crate) fn reset_for_reuse(&self) {
        guarantee!(
            self.kind == FiberKind::Heap,
            "thread fiber {} cannot be recycled",
            self.id()
        );
        self.entered.store(false, Ordering::Release);
        let resume = prime_stack(&self.region);
        self.resume.store(resume.addr(), Ordering::Release);
        self.set_state(FiberState::OnStack);
        if let Some(bookmark) = &self.bookmark {
            *lock_bookmark(bookmark) = None;
        }
    }

    pub fn id(&self) -> FiberId {
        FiberId(self as *const Fiber as usize)
    }

    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    pub fn is_thread_fiber(&self) -> bool {
        self.kind == FiberKind::Thread
    }

    pub fn owner(&self) -> ThreadToken {
        self.owner
    }

    /// Name of the OS thread that owns this fiber
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub fn region(&self) -> StackRegion {
        self.region
    }

    pub fn stack_base(&self) -> usize {
        self.region.base
    }

    /// Guard state of the pooled stack; thread stacks report `Disabled`
    pub fn guard_state(&self) -> GuardState {
        self.lease
            .as_ref()
            .map_or(GuardState::Disabled, StackLease::guard_state)
    }

    pub fn lease(&self) -> Option<&StackLease> {
        self.lease.as_ref()
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn resume_point(&self) -> Option<ResumePoint> {
        ResumePoint::new(self.resume.load(Ordering::Acquire))
    }

    /// Record where this fiber continues; called by the switch primitive.
    pub fn save_resume_point(&self, point: ResumePoint) {
        self.resume.store(point.addr(), Ordering::Release);
    }

    /// Whether the fiber has run managed code
    pub fn has_entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_entered(&self) {
        self.entered.store(true, Ordering::Release);
    }

    /// Whether this fiber carries a verification bookmark record
    pub fn has_bookmark_record(&self) -> bool {
        self.bookmark.is_some()
    }

    pub fn bookmark(&self) -> Option<ScratchSnapshot> {
        self.bookmark.as_ref().and_then(|b| *lock_bookmark(b))
    }

    pub(crate) fn set_bookmark(&self, snapshot: ScratchSnapshot) {
        match &self.bookmark {
            Some(bookmark) => *lock_bookmark(bookmark) = Some(snapshot),
            None => fatal!("fiber {} has no verification bookmark record", self.id()),
        }
    }

    fn lock_continuation(&self) -> MutexGuard<'_, Option<Weak<dyn Continuation>>> {
        self.continuation
            .lock()
            .unwrap_or_else(|_| fatal!("continuation lock of fiber {} poisoned", self.id()))
    }

    /// The continuation, if it is set and still alive
    pub fn continuation(&self) -> Option<Arc<dyn Continuation>> {
        self.lock_continuation().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_continuation(&self, continuation: Option<Weak<dyn Continuation>>) {
        *self.lock_continuation() = continuation;
    }

    pub(crate) fn clear_continuation(&self) {
        *self.lock_continuation() = None;
    }

    /// Whether `addr` (a lock record) lives on this fiber's stack
    pub fn is_lock_owned(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    fn virtual_thread(&self) -> Option<VirtualThreadInfo> {
        self.continuation()
            .filter(|c| c.kind() == ContinuationKind::VirtualThread)
            .and_then(|c| c.virtual_thread())
    }

    /// Thread name for dumps: the OS thread name for thread fibers, the
    /// virtual thread's name otherwise
    pub fn thread_name(&self) -> String {
        if self.is_thread_fiber() {
            return self.owner_name.to_string();
        }
        self.virtual_thread()
            .and_then(|vt| vt.name)
            .unwrap_or_else(|| "unknown_vt".to_string())
    }

    pub fn print_vt_info(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.is_thread_fiber() {
            return writeln!(out, "thread fiber: {}", self.owner_name);
        }
        match self.virtual_thread() {
            Some(vt) => write!(
                out,
                "\tVirtualThread => name: {}, state {}",
                vt.name.as_deref().unwrap_or("null"),
                vt_state_name(vt.state)
            ),
            None => Ok(()),
        }
    }

    fn read_word(&self, addr: usize) -> usize {
        guarantee!(
            self.region.contains(addr) && self.region.contains(addr + WORD - 1),
            "fiber {} reads {:#x} outside its stack",
            self.id(),
            addr
        );
        // SAFETY: addr is inside this fiber's stack, which is mapped for as
        // long as the fiber (and so its lease or its OS thread) is alive
        unsafe { std::ptr::read_volatile(addr as *const usize) }
    }

    /// Walk the frames of a suspended fiber.
    ///
    /// Returns how many frames were passed to `f`. Fibers that are `Current`,
    /// have no resume point, or never started yield nothing.
    pub fn walk_frames(
        &self,
        source: &dyn FrameSource,
        mode: WalkMode,
        mut f: impl FnMut(&CallFrame),
    ) -> usize {
        if self.state() != FiberState::OnStack {
            return 0;
        }
        let Some(resume) = self.resume_point() else {
            return 0;
        };

        let fp = self.read_word(resume.addr());
        let pc = self.read_word(resume.addr() + WORD);
        if pc == fiber_start_address() {
            guarantee!(
                !self.is_thread_fiber(),
                "thread fiber {} returns into the fiber start trampoline",
                self.id()
            );
            guarantee!(
                fp == 0,
                "unstarted fiber {} has frame pointer {:#x}",
                self.id(),
                fp
            );
            return 0;
        }

        let cursor = FrameCursor {
            sp: resume.addr() + 2 * WORD,
            fp,
            pc,
        };
        let frames = source.frames(cursor, self);
        let mut visited = 0;
        match mode {
            WalkMode::Scan => {
                for frame in frames {
                    f(&frame);
                    visited += 1;
                }
            }
            WalkMode::Dump { max_depth } => {
                let mut depth = 0;
                for frame in frames.skip_while(|frame| !frame.is_managed()) {
                    if frame.is_managed() {
                        f(&frame);
                        visited += 1;
                    }
                    depth += 1;
                    if depth >= max_depth {
                        break;
                    }
                }
            }
        }
        visited
    }

    /// Structured stack trace, empty unless the fiber is suspended in managed code
    pub fn stack_trace(&self, source: &dyn FrameSource, max_depth: usize) -> Vec<StackTraceElement> {
        let mut trace = Vec::new();
        if !self.has_entered() {
            return trace;
        }
        self.walk_frames(source, WalkMode::Dump { max_depth }, |frame| {
            trace.extend(frame.trace_element());
        });
        trace
    }

    /// Human-readable dump of a suspended fiber
    pub fn print_stack_on(
        &self,
        out: &mut dyn Write,
        source: &dyn FrameSource,
        max_depth: usize,
    ) -> io::Result<()> {
        if !self.has_entered() || self.state() != FiberState::OnStack {
            return Ok(());
        }
        writeln!(out)?;
        write!(out, "   Fiber: {}", self.id())?;
        if self.is_thread_fiber() {
            writeln!(out, "  [thread fiber]")?;
        } else {
            self.print_vt_info(out)?;
            writeln!(out)?;
        }
        for element in self.stack_trace(source, max_depth) {
            writeln!(out, "{}", element)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("owner", &self.owner)
            .field("base", &format_args!("{:#x}", self.region.base))
            .finish()
    }
}

fn lock_bookmark(
    bookmark: &Mutex<Option<ScratchSnapshot>>,
) -> MutexGuard<'_, Option<ScratchSnapshot>> {
    bookmark
        .lock()
        .unwrap_or_else(|_| fatal!("verification bookmark lock poisoned"))
}

/// Write the initial frame at the top of a heap stack; returns the resume point.
fn prime_stack(region: &StackRegion) -> ResumePoint {
    let mut sp = region.base as *mut usize;
    // SAFETY: the top PRIMED_WORDS words of a leased stack are mapped,
    // writable, far above the guard zone and owned by this fiber
    unsafe {
        for _ in 0..PROFILER_SCRATCH_SLOTS {
            sp = sp.sub(1);
            sp.write(0);
        }
        if cfg!(target_arch = "aarch64") {
            sp = sp.sub(1);
            sp.write(0);
        }
        sp = sp.sub(1);
        sp.write(fiber_start_address());
        sp = sp.sub(1);
        sp.write(0);
    }
    ResumePoint(sp as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::ManagedMethod;
    use crate::stack_pool::StackPool;
    use crate::stack_pool::tests::small_config;

    fn heap_fiber(verify: bool) -> Fiber {
        let pool = Arc::new(StackPool::new(&small_config()));
        let lease = pool.acquire().unwrap();
        Fiber::new_heap(ThreadToken::next(), Arc::from("worker"), lease, verify)
    }

    /// Frames read from a fixed list, ignoring the cursor
    struct ScriptedFrames {
        frames: Vec<CallFrame>,
        seen: Mutex<Option<FrameCursor>>,
    }

    impl ScriptedFrames {
        fn new(frames: Vec<CallFrame>) -> Self {
            Self {
                frames,
                seen: Mutex::new(None),
            }
        }
    }

    impl FrameSource for ScriptedFrames {
        fn frames<'a>(
            &'a self,
            cursor: FrameCursor,
            _owner: &'a Fiber,
        ) -> Box<dyn Iterator<Item = CallFrame> + 'a> {
            *self.seen.lock().unwrap() = Some(cursor);
            Box::new(self.frames.iter().cloned())
        }
    }

    fn managed(name: &str) -> CallFrame {
        CallFrame::managed(
            0,
            0,
            0,
            ManagedMethod {
                name: name.into(),
                file: Some("App.java".into()),
                line: Some(1),
            },
        )
    }

    /// Pretend the fiber ran: write a real-looking frame below the primed area.
    fn fake_started(fiber: &Fiber, fp: usize, pc: usize) -> usize {
        let slot = fiber.stack_base() - (PRIMED_WORDS + 4) * WORD;
        unsafe {
            (slot as *mut usize).write(fp);
            ((slot + WORD) as *mut usize).write(pc);
        }
        fiber.save_resume_point(ResumePoint::new(slot).unwrap());
        slot
    }

    struct Vt(Option<&'static str>, i32);

    impl Continuation for Vt {
        fn kind(&self) -> ContinuationKind {
            ContinuationKind::VirtualThread
        }

        fn virtual_thread(&self) -> Option<VirtualThreadInfo> {
            Some(VirtualThreadInfo {
                name: self.0.map(String::from),
                state: self.1,
            })
        }
    }

    struct Plain;

    impl Continuation for Plain {
        fn kind(&self) -> ContinuationKind {
            ContinuationKind::Plain
        }
    }

    #[test]
    fn test_priming_layout() {
        let fiber = heap_fiber(false);
        let resume = fiber.resume_point().unwrap();
        assert_eq!(resume.addr(), fiber.stack_base() - PRIMED_WORDS * WORD);

        let words: Vec<usize> = (0..PRIMED_WORDS)
            .map(|i| unsafe { ((resume.addr() + i * WORD) as *const usize).read() })
            .collect();
        assert_eq!(words[0], 0);
        assert_eq!(words[1], fiber_start_address());
        assert!(words[2..].iter().all(|w| *w == 0));
        assert_eq!(fiber.state(), FiberState::OnStack);
        assert!(!fiber.has_entered());
    }

    #[test]
    fn test_identity_is_arc_address() {
        let fiber = Arc::new(heap_fiber(false));
        assert_eq!(fiber.id().as_usize(), Arc::as_ptr(&fiber) as usize);
        assert_eq!(fiber.id(), FiberId::from_raw(Arc::as_ptr(&fiber) as usize));
    }

    #[test]
    fn test_unstarted_fiber_walk_is_noop() {
        let fiber = heap_fiber(false);
        let source = ScriptedFrames::new(vec![managed("a")]);
        let visited = fiber.walk_frames(&source, WalkMode::Scan, |_| {});
        assert_eq!(visited, 0);
        assert!(source.seen.lock().unwrap().is_none());
    }

    #[test]
    fn test_walk_rebuilds_cursor_from_resume_point() {
        let fiber = heap_fiber(false);
        let slot = fake_started(&fiber, 0x1234, 0x5678);
        let source = ScriptedFrames::new(vec![
            CallFrame::native(0, 0, 1),
            managed("a"),
            CallFrame::native(0, 0, 2),
            managed("b"),
        ]);

        let mut count = 0;
        assert_eq!(fiber.walk_frames(&source, WalkMode::Scan, |_| count += 1), 4);
        assert_eq!(count, 4);
        assert_eq!(
            *source.seen.lock().unwrap(),
            Some(FrameCursor {
                sp: slot + 2 * WORD,
                fp: 0x1234,
                pc: 0x5678,
            })
        );
    }

    #[test]
    fn test_dump_skips_leading_native_and_truncates() {
        let fiber = heap_fiber(false);
        fake_started(&fiber, 0, 0x5678);
        let source = ScriptedFrames::new(vec![
            CallFrame::native(0, 0, 1),
            CallFrame::native(0, 0, 2),
            managed("a"),
            CallFrame::native(0, 0, 3),
            managed("b"),
            managed("c"),
        ]);

        let mut names = Vec::new();
        fiber.walk_frames(&source, WalkMode::Dump { max_depth: 3 }, |frame| {
            names.push(frame.method.as_ref().unwrap().name.clone());
        });
        // Depth counts frames from the first managed one, native included
        assert_eq!(names, vec!["a", "b"]);

        let visited = fiber.walk_frames(&source, WalkMode::Dump { max_depth: 100 }, |_| {});
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_current_fiber_is_skipped() {
        let fiber = heap_fiber(false);
        fake_started(&fiber, 0, 0x5678);
        fiber.set_state(FiberState::Current);
        let source = ScriptedFrames::new(vec![managed("a")]);
        assert_eq!(fiber.walk_frames(&source, WalkMode::Scan, |_| {}), 0);
    }

    #[test]
    #[should_panic(expected = "has frame pointer")]
    fn test_unstarted_fiber_with_frame_pointer_is_fatal() {
        let fiber = heap_fiber(false);
        fake_started(&fiber, 0xdead, fiber_start_address());
        let source = ScriptedFrames::new(vec![]);
        fiber.walk_frames(&source, WalkMode::Scan, |_| {});
    }

    #[test]
    fn test_stack_trace_requires_entered() {
        let fiber = heap_fiber(false);
        fake_started(&fiber, 0, 0x5678);
        let source = ScriptedFrames::new(vec![managed("a"), managed("b")]);
        assert!(fiber.stack_trace(&source, 10).is_empty());

        fiber.mark_entered();
        let trace = fiber.stack_trace(&source, 10);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].method, "a");
    }

    #[test]
    fn test_vt_state_names() {
        assert_eq!(vt_state_name(0), "NEW");
        assert_eq!(vt_state_name(3), "RUNNING");
        assert_eq!(vt_state_name(6), "PINNED");
        assert_eq!(vt_state_name(99), "TERMINATED");
        assert_eq!(vt_state_name(7), "ERROR STATE");
        assert_eq!(vt_state_name(-1), "ERROR STATE");
    }

    #[test]
    fn test_thread_name_falls_back() {
        let fiber = heap_fiber(false);
        assert_eq!(fiber.thread_name(), "unknown_vt");

        let plain: Arc<dyn Continuation> = Arc::new(Plain);
        fiber.set_continuation(Some(Arc::downgrade(&plain)));
        assert_eq!(fiber.thread_name(), "unknown_vt");

        let vt: Arc<dyn Continuation> = Arc::new(Vt(Some("vt-7"), 5));
        fiber.set_continuation(Some(Arc::downgrade(&vt)));
        assert_eq!(fiber.thread_name(), "vt-7");

        // Weak: the fiber does not keep its continuation alive
        drop(vt);
        assert!(fiber.continuation().is_none());
        assert_eq!(fiber.thread_name(), "unknown_vt");
    }

    #[test]
    fn test_print_vt_info() {
        let fiber = heap_fiber(false);
        let vt: Arc<dyn Continuation> = Arc::new(Vt(None, 5));
        fiber.set_continuation(Some(Arc::downgrade(&vt)));

        let mut out = Vec::new();
        fiber.print_vt_info(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\tVirtualThread => name: null, state PARKED"
        );

        fiber.clear_continuation();
        let mut out = Vec::new();
        fiber.print_vt_info(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_print_stack_on() {
        let fiber = heap_fiber(false);
        let vt: Arc<dyn Continuation> = Arc::new(Vt(Some("worker-1"), 5));
        fiber.set_continuation(Some(Arc::downgrade(&vt)));
        fake_started(&fiber, 0, 0x5678);
        fiber.mark_entered();

        let source = ScriptedFrames::new(vec![managed("app.Main.run")]);
        let mut out = Vec::new();
        fiber.print_stack_on(&mut out, &source, 10).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("Fiber: {}", fiber.id())));
        assert!(text.contains("name: worker-1, state PARKED"));
        assert!(text.contains("\tat app.Main.run(App.java:1)"));
    }

    #[test]
    fn test_reset_for_reuse() {
        let fiber = heap_fiber(true);
        fake_started(&fiber, 0, 0x5678);
        fiber.mark_entered();
        fiber.set_state(FiberState::Current);
        fiber.set_bookmark(fiber_core::ThreadScratch::new().snapshot());

        fiber.reset_for_reuse();
        assert!(!fiber.has_entered());
        assert_eq!(fiber.state(), FiberState::OnStack);
        assert_eq!(
            fiber.resume_point().unwrap().addr(),
            fiber.stack_base() - PRIMED_WORDS * WORD
        );
        assert!(fiber.has_bookmark_record());
        assert!(fiber.bookmark().is_none());
    }

    #[test]
    fn test_lock_ownership_by_stack_range() {
        let fiber = heap_fiber(false);
        assert!(fiber.is_lock_owned(fiber.stack_base() - 64));
        assert!(!fiber.is_lock_owned(fiber.stack_base()));
        assert!(!fiber.is_lock_owned(0));
    }
}
