use crate::error::JvmError;
use crate::heap::HeapRef;
use crate::keys::{MonitorId, ThreadId};
use crate::sync::MonitorTable;
use crate::throw_exception;
use crate::vm::stack::FrameStack;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New = 0,
    Runnable = 1,
    /// Inside a blocking region: the thread promises not to touch the heap
    /// or its Java stack, and everything it still references is pinned.
    Blocked = 2,
    Waiting = 3,
    TimedWaiting = 4,
    /// Parked at a safepoint poll.
    Suspended = 5,
    Terminated = 6,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::New,
            1 => ThreadState::Runnable,
            2 => ThreadState::Blocked,
            3 => ThreadState::Waiting,
            4 => ThreadState::TimedWaiting,
            5 => ThreadState::Suspended,
            6 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

/// The shared face of a thread: everything another thread (or the
/// collector) may poke while the owner runs.
pub struct VmThreadHandle {
    pub id: ThreadId,
    pub name: Mutex<String>,
    pub daemon: bool,
    state: AtomicU8,
    suspend: AtomicBool,
    pub interrupted: AtomicBool,
    /// Monitor currently waited on, for interrupt delivery.
    wait_monitor: Mutex<Option<MonitorId>>,
    /// Sleep/join parking.
    park_lock: Mutex<bool>,
    park_cond: Condvar,
    /// Valid while the owner is Suspended/Blocked/Waiting; the collector
    /// scans and rewrites the frames behind it.
    stack_ptr: AtomicPtr<FrameStack>,
    /// Explicitly registered heap references held by native code across
    /// possible collections. Traced as roots and pinned by the compactor.
    local_refs: Mutex<Vec<HeapRef>>,
    /// The java/lang/Thread object, once attached.
    thread_obj: AtomicUsize,
    /// In-flight throwable between throw and handler, a GC root.
    pending_exception: AtomicUsize,
    /// Termination latch for joiners.
    terminated: Mutex<bool>,
    term_cond: Condvar,
}

impl VmThreadHandle {
    fn new(id: ThreadId, name: String, daemon: bool) -> Self {
        Self {
            id,
            name: Mutex::new(name),
            daemon,
            state: AtomicU8::new(ThreadState::New as u8),
            suspend: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            wait_monitor: Mutex::new(None),
            park_lock: Mutex::new(false),
            park_cond: Condvar::new(),
            stack_ptr: AtomicPtr::new(std::ptr::null_mut()),
            local_refs: Mutex::new(Vec::new()),
            thread_obj: AtomicUsize::new(0),
            pending_exception: AtomicUsize::new(0),
            terminated: Mutex::new(false),
            term_cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), ThreadState::New | ThreadState::Terminated)
    }

    pub fn thread_obj(&self) -> Option<HeapRef> {
        match self.thread_obj.load(Ordering::Acquire) {
            0 => None,
            obj => Some(obj),
        }
    }

    pub fn set_thread_obj(&self, obj: HeapRef) {
        self.thread_obj.store(obj, Ordering::Release);
    }

    pub fn pending_exception(&self) -> Option<HeapRef> {
        match self.pending_exception.load(Ordering::Acquire) {
            0 => None,
            obj => Some(obj),
        }
    }

    pub fn set_pending_exception(&self, obj: HeapRef) {
        self.pending_exception.store(obj, Ordering::Release);
    }

    pub fn clear_pending_exception(&self) {
        self.pending_exception.store(0, Ordering::Release);
    }

    pub fn push_local_ref(&self, heap_ref: HeapRef) {
        self.local_refs.lock().unwrap().push(heap_ref);
    }

    pub fn pop_local_ref(&self) -> Option<HeapRef> {
        self.local_refs.lock().unwrap().pop()
    }

    /// Removes one matching entry; used when another thread releases a
    /// reference it pinned on our behalf.
    pub fn remove_local_ref(&self, heap_ref: HeapRef) {
        let mut refs = self.local_refs.lock().unwrap();
        if let Some(pos) = refs.iter().rposition(|r| *r == heap_ref) {
            refs.remove(pos);
        }
    }

    pub fn set_wait_monitor(&self, monitor: Option<MonitorId>) {
        *self.wait_monitor.lock().unwrap() = monitor;
    }

    /// Interruptible sleep on the private parking condition.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut poked = self.park_lock.lock().unwrap();
        loop {
            if *poked {
                *poked = false;
                return true;
            }
            if self.interrupted.load(Ordering::Acquire) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    poked = self.park_cond.wait_timeout(poked, deadline - now).unwrap().0;
                }
                None => poked = self.park_cond.wait(poked).unwrap(),
            }
        }
    }

    pub fn unpark(&self) {
        let mut poked = self.park_lock.lock().unwrap();
        *poked = true;
        self.park_cond.notify_all();
    }

    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut terminated = self.terminated.lock().unwrap();
        while !*terminated {
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    terminated = self
                        .term_cond
                        .wait_timeout(terminated, deadline - now)
                        .unwrap()
                        .0;
                }
                None => terminated = self.term_cond.wait(terminated).unwrap(),
            }
        }
        true
    }
}

/// Per-thread execution state owned by the running thread itself. The
/// frame stack is boxed so its address stays valid for the collector while
/// the thread is parked.
pub struct JavaThreadState {
    pub id: ThreadId,
    pub handle: Arc<VmThreadHandle>,
    pub stack: Box<FrameStack>,
}

impl JavaThreadState {
    pub fn new(handle: Arc<VmThreadHandle>, frame_stack_depth: usize) -> Self {
        let mut stack = Box::new(FrameStack::new(frame_stack_depth));
        handle
            .stack_ptr
            .store(&mut *stack as *mut FrameStack, Ordering::Release);
        Self {
            id: handle.id,
            handle,
            stack,
        }
    }
}

struct RegistryInner {
    threads: HashMap<ThreadId, Arc<VmThreadHandle>>,
    /// One bit per thread id; bit 0 of word 0 is id 1.
    id_bitmap: Vec<u64>,
    non_daemon: usize,
    stw_active: bool,
}

/// The global thread list, id bitmap and the stop-the-world machinery.
///
/// Suspension is cooperative: `request_suspend_all` raises per-thread
/// flags, and every thread parks at its next safepoint poll (the top of
/// the dispatch loop) or, if it is inside a blocking region, counts as
/// already safe.
pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
    cond: Condvar,
    suspend_pending: AtomicBool,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                threads: HashMap::new(),
                id_bitmap: Vec::new(),
                non_daemon: 0,
                stw_active: false,
            }),
            cond: Condvar::new(),
            suspend_pending: AtomicBool::new(false),
        }
    }

    fn allocate_id(inner: &mut RegistryInner) -> ThreadId {
        for (word_index, word) in inner.id_bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return ThreadId::from_usize(word_index * 64 + bit + 1);
            }
        }
        inner.id_bitmap.push(1);
        ThreadId::from_usize((inner.id_bitmap.len() - 1) * 64 + 1)
    }

    fn release_id(inner: &mut RegistryInner, id: ThreadId) {
        let index = id.to_index();
        inner.id_bitmap[index / 64] &= !(1 << (index % 64));
    }

    /// Allocates an id and adds the thread to the global list. A thread
    /// arriving while the world is stopped waits here before joining.
    pub fn register(&self, name: String, daemon: bool) -> Arc<VmThreadHandle> {
        let mut inner = self.inner.lock().unwrap();
        while inner.stw_active {
            inner = self.cond.wait(inner).unwrap();
        }
        let id = Self::allocate_id(&mut inner);
        let handle = Arc::new(VmThreadHandle::new(id, name, daemon));
        handle.set_state(ThreadState::Runnable);
        inner.threads.insert(id, handle.clone());
        if !daemon {
            inner.non_daemon += 1;
        }
        handle
    }

    /// Removal reverses registration: the thread leaves the list before its
    /// id returns to the bitmap, and joiners plus the exit waiter are woken.
    pub fn detach(&self, handle: &VmThreadHandle) {
        handle.set_state(ThreadState::Terminated);
        // A suspend flag raised by an in-flight stop-the-world must not
        // outlive the registration; nobody will clear it for us later.
        handle.suspend.store(false, Ordering::Release);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.threads.remove(&handle.id);
            Self::release_id(&mut inner, handle.id);
            if !handle.daemon {
                inner.non_daemon -= 1;
            }
        }
        {
            let mut terminated = handle.terminated.lock().unwrap();
            *terminated = true;
        }
        handle.term_cond.notify_all();
        self.cond.notify_all();
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<VmThreadHandle>> {
        self.inner.lock().unwrap().threads.get(&id).cloned()
    }

    pub fn live_threads(&self) -> Vec<Arc<VmThreadHandle>> {
        self.inner.lock().unwrap().threads.values().cloned().collect()
    }

    /// Blocks until every non-daemon thread other than the caller's has
    /// detached.
    pub fn await_non_daemon_exit(&self, self_is_non_daemon: bool) {
        let floor = usize::from(self_is_non_daemon);
        let mut inner = self.inner.lock().unwrap();
        while inner.non_daemon > floor {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    // ---- stop the world ----

    /// Fast check compiled into the dispatch loop.
    #[inline]
    pub fn suspend_pending(&self) -> bool {
        self.suspend_pending.load(Ordering::Acquire)
    }

    /// Parks the calling thread if a suspension is pending for it. Called
    /// at every safepoint poll.
    pub fn safepoint_poll(&self, handle: &VmThreadHandle) {
        if !self.suspend_pending() || !handle.suspend.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        while handle.suspend.load(Ordering::Acquire) {
            handle.set_state(ThreadState::Suspended);
            self.cond.notify_all();
            inner = self.cond.wait(inner).unwrap();
        }
        drop(inner);
        handle.set_state(ThreadState::Runnable);
    }

    /// Brings every other registered thread to a safepoint and returns with
    /// the world stopped. Threads already inside blocking regions count as
    /// stopped. Must be paired with [`resume_all_threads`].
    ///
    /// [`resume_all_threads`]: ThreadRegistry::resume_all_threads
    pub fn suspend_all_threads(&self, self_id: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        while inner.stw_active {
            // Another collector got there first; wait our turn, and park if
            // it wants us too.
            drop(inner);
            if let Some(own) = self.get(self_id) {
                self.safepoint_poll(&own);
            }
            inner = self.inner.lock().unwrap();
            if !inner.stw_active {
                break;
            }
            inner = self.cond.wait(inner).unwrap();
        }
        inner.stw_active = true;
        self.suspend_pending.store(true, Ordering::Release);
        for (id, handle) in &inner.threads {
            if *id != self_id {
                handle.suspend.store(true, Ordering::Release);
            }
        }
        loop {
            let all_safe = inner.threads.iter().all(|(id, handle)| {
                *id == self_id
                    || !matches!(handle.state(), ThreadState::Runnable | ThreadState::New)
            });
            if all_safe {
                break;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn resume_all_threads(&self, self_id: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        self.suspend_pending.store(false, Ordering::Release);
        for (id, handle) in &inner.threads {
            if *id != self_id {
                handle.suspend.store(false, Ordering::Release);
            }
        }
        inner.stw_active = false;
        drop(inner);
        self.cond.notify_all();
    }

    /// Stacks of every thread that is currently safe to scan, i.e. the
    /// whole world minus the collector while it is stopped.
    ///
    /// # Safety
    /// Only while the world is stopped; the pointers die on resume.
    pub unsafe fn parked_stacks(&self, self_id: ThreadId) -> Vec<*mut FrameStack> {
        let inner = self.inner.lock().unwrap();
        inner
            .threads
            .iter()
            .filter(|(id, _)| **id != self_id)
            .map(|(_, handle)| handle.stack_ptr.load(Ordering::Acquire))
            .filter(|ptr| !ptr.is_null())
            .collect()
    }

    /// Every registered local-handle reference plus pending exceptions and
    /// attached thread objects; these are collector roots and, for the
    /// compactor, pin targets.
    pub fn for_each_root(&self, f: &mut dyn FnMut(HeapRef)) {
        let inner = self.inner.lock().unwrap();
        for handle in inner.threads.values() {
            for r in handle.local_refs.lock().unwrap().iter() {
                f(*r);
            }
            if let Some(obj) = handle.thread_obj() {
                f(obj);
            }
            if let Some(obj) = handle.pending_exception() {
                f(obj);
            }
        }
    }

    pub fn pinned_refs(&self) -> Vec<HeapRef> {
        let inner = self.inner.lock().unwrap();
        let mut pinned = Vec::new();
        for handle in inner.threads.values() {
            pinned.extend(handle.local_refs.lock().unwrap().iter().copied());
        }
        pinned
    }

    pub fn forward_heap_refs(&self, forward: &dyn Fn(HeapRef) -> HeapRef) {
        let inner = self.inner.lock().unwrap();
        for handle in inner.threads.values() {
            for r in handle.local_refs.lock().unwrap().iter_mut() {
                *r = forward(*r);
            }
            if let Some(obj) = handle.thread_obj() {
                handle.set_thread_obj(forward(obj));
            }
            if let Some(obj) = handle.pending_exception() {
                handle.set_pending_exception(forward(obj));
            }
        }
    }
}

/// RAII blocking region: `disableSuspend`/`enableSuspend`. While the guard
/// lives the thread counts as safe for stop-the-world; on drop it
/// self-suspends if a suspension arrived meanwhile.
pub struct BlockedRegion<'a> {
    registry: &'a ThreadRegistry,
    handle: &'a VmThreadHandle,
    previous: ThreadState,
}

impl<'a> BlockedRegion<'a> {
    pub fn enter(registry: &'a ThreadRegistry, handle: &'a VmThreadHandle) -> Self {
        Self::enter_as(registry, handle, ThreadState::Blocked)
    }

    pub fn enter_as(
        registry: &'a ThreadRegistry,
        handle: &'a VmThreadHandle,
        state: ThreadState,
    ) -> Self {
        let previous = handle.state();
        handle.set_state(state);
        // A collector may already be counting us.
        registry.cond.notify_all();
        Self {
            registry,
            handle,
            previous,
        }
    }
}

impl Drop for BlockedRegion<'_> {
    fn drop(&mut self) {
        self.handle.set_state(self.previous);
        self.registry.safepoint_poll(self.handle);
    }
}

/// Sleep with interrupt support; used by Thread.sleep.
pub fn sleep_interruptibly(
    registry: &ThreadRegistry,
    handle: &VmThreadHandle,
    duration: Duration,
) -> Result<(), JvmError> {
    let _region = BlockedRegion::enter_as(registry, handle, ThreadState::TimedWaiting);
    handle.park(Some(duration));
    if handle.interrupted.swap(false, Ordering::AcqRel) {
        return throw_exception!(InterruptedException, "sleep interrupted");
    }
    Ok(())
}

/// Sets the interrupt flag and kicks whatever the thread is blocked on.
pub fn interrupt_thread(
    monitors: &MonitorTable,
    handle: &VmThreadHandle,
) {
    handle.interrupted.store(true, Ordering::Release);
    if let Some(monitor_id) = *handle.wait_monitor.lock().unwrap() {
        crate::sync::ObjectLocks::kick_waiters(monitors, monitor_id);
    }
    handle.unpark();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_bitmap_allocates_lowest_free_bit() {
        let registry = ThreadRegistry::new();
        let a = registry.register("a".into(), false);
        let b = registry.register("b".into(), false);
        let c = registry.register("c".into(), false);
        assert_eq!(a.id.into_raw(), 1);
        assert_eq!(b.id.into_raw(), 2);
        assert_eq!(c.id.into_raw(), 3);
        registry.detach(&b);
        let d = registry.register("d".into(), false);
        // Freed id is reused.
        assert_eq!(d.id.into_raw(), 2);
    }

    #[test]
    fn suspend_all_waits_for_pollers() {
        let registry = Arc::new(ThreadRegistry::new());
        let collector = registry.register("collector".into(), false);
        let worker = registry.register("worker".into(), false);

        let stopped = Arc::new(AtomicBool::new(false));
        let worker_thread = {
            let registry = registry.clone();
            let worker = worker.clone();
            let stopped = stopped.clone();
            std::thread::spawn(move || {
                // Simulated dispatch loop.
                while !stopped.load(Ordering::Acquire) {
                    registry.safepoint_poll(&worker);
                    std::thread::sleep(Duration::from_micros(50));
                }
                registry.detach(&worker);
            })
        };

        for _ in 0..10 {
            registry.suspend_all_threads(collector.id);
            assert_eq!(worker.state(), ThreadState::Suspended);
            registry.resume_all_threads(collector.id);
        }
        stopped.store(true, Ordering::Release);
        worker_thread.join().unwrap();
        registry.detach(&collector);
    }

    #[test]
    fn blocked_regions_count_as_safe() {
        let registry = Arc::new(ThreadRegistry::new());
        let collector = registry.register("collector".into(), false);
        let worker = registry.register("worker".into(), true);

        let release = Arc::new(AtomicBool::new(false));
        let worker_thread = {
            let registry = registry.clone();
            let worker = worker.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                let _region = BlockedRegion::enter(&registry, &worker);
                while !release.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        // Returns even though the worker never polls: it is blocked.
        registry.suspend_all_threads(collector.id);
        registry.resume_all_threads(collector.id);
        release.store(true, Ordering::Release);
        worker_thread.join().unwrap();
    }

    #[test]
    fn exit_wait_sees_non_daemon_detach() {
        let registry = Arc::new(ThreadRegistry::new());
        let main = registry.register("main".into(), false);
        let other = registry.register("other".into(), false);
        let _daemon = registry.register("daemon".into(), true);

        let waiter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.await_non_daemon_exit(true))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        registry.detach(&other);
        waiter.join().unwrap();
        let _ = main;
    }

    #[test]
    fn interrupted_sleep_raises_and_clears() {
        let registry = Arc::new(ThreadRegistry::new());
        let monitors = MonitorTable::new();
        let handle = registry.register("sleeper".into(), false);

        let sleeper = {
            let registry = registry.clone();
            let handle = handle.clone();
            std::thread::spawn(move || {
                sleep_interruptibly(&registry, &handle, Duration::from_secs(30))
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        interrupt_thread(&monitors, &handle);
        let result = sleeper.join().unwrap();
        assert!(result.is_err());
        assert!(!handle.interrupted.load(Ordering::Acquire));
    }
}
