//! End-to-end fiber lifecycle through the public API
//!
//! A host-side `ContextSwitch` that only records resume points stands in
//! for the real register switch, so every step runs on the test thread.

use fiber_runtime::{
    CallFrame, ContextSwitch, Continuation, ContinuationKind, Fiber, FiberConfig, FiberRuntime,
    FiberState, FiberThread, FrameCursor, FrameSource, GuardState, ManagedMethod, ResumePoint,
    StackRequest, VirtualThreadInfo,
};
use std::sync::{Arc, Weak};

fn config() -> FiberConfig {
    FiberConfig {
        stack_size: 32 * 1024,
        stacks_per_slab: 8,
        physical_cache_max: 4,
        idle_cache_size: 2,
        registry_shards: 32,
        verify_on_yield: true,
        ..FiberConfig::default()
    }
}

struct ParkingSwitch;

impl ContextSwitch for ParkingSwitch {
    fn switch(&self, from: &Fiber, _to: &Fiber) {
        if let Some(point) = ResumePoint::new(from.region().base - 1024) {
            from.save_resume_point(point);
        }
    }

    fn resume(&self, _to: &Fiber) {}
}

/// Pretends every suspended fiber sits in two managed frames below a native one
struct FixedFrames;

impl FrameSource for FixedFrames {
    fn frames<'a>(
        &'a self,
        cursor: FrameCursor,
        _owner: &'a Fiber,
    ) -> Box<dyn Iterator<Item = CallFrame> + 'a> {
        let native = CallFrame::native(cursor.sp, cursor.fp, cursor.pc);
        let inner = CallFrame::managed(
            cursor.sp + 64,
            cursor.fp,
            cursor.pc,
            ManagedMethod {
                name: "Worker.run".into(),
                file: Some("Worker.java".into()),
                line: Some(12),
            },
        );
        let outer = CallFrame::managed(
            cursor.sp + 128,
            cursor.fp,
            cursor.pc,
            ManagedMethod {
                name: "Thread.start".into(),
                file: Some("Thread.java".into()),
                line: Some(40),
            },
        );
        Box::new(vec![native, inner, outer].into_iter())
    }
}

struct NamedVirtualThread;

impl Continuation for NamedVirtualThread {
    fn kind(&self) -> ContinuationKind {
        ContinuationKind::VirtualThread
    }

    fn virtual_thread(&self) -> Option<VirtualThreadInfo> {
        Some(VirtualThreadInfo {
            name: Some("worker-7".to_string()),
            state: 5,
        })
    }
}

#[test]
fn test_heap_fiber_lifecycle() {
    let rt = Arc::new(FiberRuntime::new(config()).unwrap());
    let thread = FiberThread::attach(Arc::clone(&rt)).unwrap();
    let main = Arc::clone(thread.thread_fiber());
    let switch = ParkingSwitch;

    let fiber = thread.create_fiber(StackRequest::Default, None).unwrap();
    assert_eq!(fiber.state(), FiberState::OnStack);
    assert_eq!(fiber.guard_state(), GuardState::Applied);
    assert!(rt.registry().contains(fiber.id()));
    assert!(fiber.stack_trace(&FixedFrames, 16).is_empty());

    thread.switch_to(&fiber, &switch);
    assert_eq!(thread.current().id(), fiber.id());

    thread.switch_to(&main, &switch);
    assert_eq!(thread.current().id(), main.id());

    // Suspended in managed code: the leading native frame is skipped
    let trace = fiber.stack_trace(&FixedFrames, 16);
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].method, "Worker.run");
    assert_eq!(trace[1].line, Some(40));

    // Back in and out again, terminating this time
    thread.switch_to(&fiber, &switch);
    thread.scratch_mut().enter_native_call();
    thread.switch_to_and_terminate(&main, &switch);
    thread.scratch_mut().exit_native_call();

    assert!(!rt.registry().contains(fiber.id()));
    assert_eq!(thread.idle_cached(), 1);
    assert_eq!(rt.registry().len(), 1);
}

#[test]
fn test_idle_cache_overflow_returns_stacks() {
    let rt = Arc::new(FiberRuntime::new(config()).unwrap());
    let thread = FiberThread::attach(Arc::clone(&rt)).unwrap();

    let fibers: Vec<_> = (0..5)
        .map(|_| thread.create_fiber(StackRequest::Default, None).unwrap())
        .collect();
    let bases: Vec<_> = fibers.iter().map(|f| f.stack_base()).collect();
    for fiber in fibers {
        thread.terminate(fiber);
    }

    // Two parked, three back in the pool
    assert_eq!(thread.idle_cached(), 2);
    assert_eq!(rt.pool().stats().free, 3);

    // Reuse drains the idle cache before touching the pool
    let a = thread.create_fiber(StackRequest::Default, None).unwrap();
    let b = thread.create_fiber(StackRequest::Default, None).unwrap();
    assert_eq!(thread.idle_cached(), 0);
    assert_eq!(rt.pool().stats().free, 3);
    assert!(bases.contains(&a.stack_base()));
    assert!(bases.contains(&b.stack_base()));

    // Then the pool hands out the most recently freed stack
    let c = thread.create_fiber(StackRequest::Default, None).unwrap();
    assert_eq!(c.stack_base(), bases[4]);
    assert_eq!(rt.pool().stats().free, 2);
}

#[test]
fn test_virtual_thread_dump() {
    let rt = Arc::new(FiberRuntime::new(config()).unwrap());
    let thread = FiberThread::attach(Arc::clone(&rt)).unwrap();
    let main = Arc::clone(thread.thread_fiber());
    let switch = ParkingSwitch;

    let vt: Arc<dyn Continuation> = Arc::new(NamedVirtualThread);
    let fiber = thread
        .create_fiber(StackRequest::Default, Some(Arc::downgrade(&vt)))
        .unwrap();
    assert_eq!(fiber.thread_name(), "worker-7");

    thread.switch_to(&fiber, &switch);
    thread.switch_to(&main, &switch);

    let mut out = Vec::new();
    fiber.print_stack_on(&mut out, &FixedFrames, 16).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("VirtualThread => name: worker-7, state PARKED"));
    assert!(text.contains("\tat Worker.run(Worker.java:12)"));

    // The fiber only holds its continuation weakly
    drop(vt);
    assert!(fiber.continuation().is_none());
    assert_eq!(fiber.thread_name(), "unknown_vt");
}

#[test]
fn test_continuation_cleared_on_terminate() {
    let rt = Arc::new(FiberRuntime::new(config()).unwrap());
    let thread = FiberThread::attach(Arc::clone(&rt)).unwrap();

    let vt: Arc<dyn Continuation> = Arc::new(NamedVirtualThread);
    let weak: Weak<dyn Continuation> = Arc::downgrade(&vt);
    let fiber = thread.create_fiber(StackRequest::Default, Some(weak)).unwrap();
    let id = fiber.id();
    thread.terminate(fiber);

    let reused = thread.create_fiber(StackRequest::Default, None).unwrap();
    assert_eq!(reused.id(), id);
    assert!(reused.continuation().is_none());
}
