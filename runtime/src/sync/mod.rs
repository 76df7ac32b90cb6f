use crate::error::JvmError;
use crate::heap::HeapRef;
use crate::keys::{MonitorId, ThreadId};
use crate::throw_exception;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Lockword layout, a tagged union on the low bit:
///
/// ```text
///   thin:  | tid (22 bits) | count (8 bits) | FLC | 0 |
///   fat:   | monitor id (31 bits)                 | 1 |
/// ```
///
/// Zero means unlocked. The FLC bit is set by a spinning contender to force
/// the owner into the slow unlock path.
pub const SHAPE_BIT: u32 = 0x1;
pub const FLC_BIT: u32 = 0x2;
pub const COUNT_SHIFT: u32 = 2;
pub const COUNT_SIZE: u32 = 8;
pub const COUNT_MASK: u32 = ((1 << COUNT_SIZE) - 1) << COUNT_SHIFT;
pub const TID_SHIFT: u32 = COUNT_SHIFT + COUNT_SIZE;
pub const TID_MASK: u32 = !((1 << TID_SHIFT) - 1);
const COUNT_MAX: u32 = (1 << COUNT_SIZE) - 1;

/// `entering` sentinel: nobody references the monitor, the compactor may
/// recycle it.
pub const UN_USED: u32 = u32::MAX;

fn thin_word(tid: ThreadId) -> u32 {
    tid.into_raw() << TID_SHIFT
}

fn fat_word(monitor_id: MonitorId) -> u32 {
    (monitor_id.into_raw() << 1) | SHAPE_BIT
}

fn fat_monitor_id(lockword: u32) -> Option<MonitorId> {
    if lockword & SHAPE_BIT == 0 {
        return None;
    }
    MonitorId::from_raw(lockword >> 1)
}

/// The monitor behind a fat lockword, if the lock is inflated right now.
pub fn fat_monitor_of(lockword: &AtomicU32) -> Option<MonitorId> {
    fat_monitor_id(lockword.load(Ordering::Acquire))
}

struct Waiter {
    thread: ThreadId,
    wait_id: u64,
    cell: Arc<WaitCell>,
}

/// Per-wait flag: `notified` is set by the notifier after unlinking the
/// waiter. An interrupted or timed-out waiter that finds it set arrived too
/// late and must pass the signal on, or a wakeup would be lost.
pub struct WaitCell {
    notified: AtomicBool,
}

struct MonitorCore {
    owner: Option<ThreadId>,
    recursion: u32,
    wait_set: VecDeque<Waiter>,
    next_wait_id: u64,
}

pub struct Monitor {
    core: Mutex<MonitorCore>,
    /// Entry and thin-to-fat handoff.
    cond: Condvar,
    /// Wait-set sleeps.
    wait_cond: Condvar,
    /// Count of threads between "decided to inflate" and "entered";
    /// `UN_USED` marks a recyclable monitor.
    entering: AtomicU32,
    in_wait: AtomicU32,
    bound_object: AtomicUsize,
}

impl Monitor {
    fn new() -> Self {
        Self {
            core: Mutex::new(MonitorCore {
                owner: None,
                recursion: 0,
                wait_set: VecDeque::new(),
                next_wait_id: 0,
            }),
            cond: Condvar::new(),
            wait_cond: Condvar::new(),
            entering: AtomicU32::new(0),
            in_wait: AtomicU32::new(0),
            bound_object: AtomicUsize::new(0),
        }
    }

    pub fn bound_object(&self) -> HeapRef {
        self.bound_object.load(Ordering::Acquire)
    }

    pub fn is_unused(&self) -> bool {
        self.entering.load(Ordering::Acquire) == UN_USED
    }

    fn lock_core(&self) -> MutexGuard<'_, MonitorCore> {
        self.core.lock().unwrap()
    }

    /// Blocking monitor entry; recursion-aware.
    fn enter(&self, tid: ThreadId) {
        let mut core = self.lock_core();
        if core.owner == Some(tid) {
            core.recursion += 1;
            return;
        }
        while core.owner.is_some() {
            core = self.cond.wait(core).unwrap();
        }
        core.owner = Some(tid);
        core.recursion = 0;
    }

    /// Installs ownership during inflation; the caller already holds the
    /// object's thin lock so nobody else can own the monitor.
    fn claim(&self, tid: ThreadId, recursion: u32) {
        let mut core = self.lock_core();
        debug_assert!(core.owner.is_none());
        core.owner = Some(tid);
        core.recursion = recursion;
    }

    fn exit(&self, tid: ThreadId) -> Result<bool, JvmError> {
        let mut core = self.lock_core();
        if core.owner != Some(tid) {
            return throw_exception!(IllegalMonitorStateException, "not the monitor owner");
        }
        if core.recursion > 0 {
            core.recursion -= 1;
            return Ok(false);
        }
        core.owner = None;
        let waiters = !core.wait_set.is_empty();
        drop(core);
        self.cond.notify_all();
        Ok(waiters)
    }

    /// Whether the monitor can fall back to a thin-zero lockword.
    fn deflatable(&self, core: &MonitorCore) -> bool {
        core.recursion == 0
            && core.wait_set.is_empty()
            && self.entering.load(Ordering::Acquire) == 0
            && self.in_wait.load(Ordering::Acquire) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
    Interrupted,
}

/// Monitors live outside the heap in a recycled pool, keyed by object
/// identity. Fat lockwords carry the pool index so compaction can move the
/// object without touching the word.
pub struct MonitorTable {
    monitors: RwLock<Vec<Arc<Monitor>>>,
    cache: DashMap<HeapRef, MonitorId>,
    free: Mutex<Vec<MonitorId>>,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorTable {
    pub fn new() -> Self {
        Self {
            monitors: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, monitor_id: MonitorId) -> Arc<Monitor> {
        self.monitors.read().unwrap()[monitor_id.to_index()].clone()
    }

    pub fn lookup(&self, obj: HeapRef) -> Option<MonitorId> {
        self.cache.get(&obj).map(|entry| *entry)
    }

    /// Looks up or allocates the monitor for an object, reviving a monitor
    /// parked at `UN_USED` by a previous deflation.
    pub fn bind(&self, obj: HeapRef) -> MonitorId {
        let monitor_id = *self.cache.entry(obj).or_insert_with(|| {
            let reused = self.free.lock().unwrap().pop();
            match reused {
                Some(id) => id,
                None => {
                    let mut monitors = self.monitors.write().unwrap();
                    monitors.push(Arc::new(Monitor::new()));
                    MonitorId::from_usize(monitors.len())
                }
            }
        });
        let monitor = self.get(monitor_id);
        monitor.bound_object.store(obj, Ordering::Release);
        let _ = monitor
            .entering
            .compare_exchange(UN_USED, 0, Ordering::AcqRel, Ordering::Acquire);
        monitor_id
    }

    /// Drops one object's cache entry, recycling its monitor. Used by the
    /// collector for dead objects whose lock already deflated.
    pub fn reclaim_for(&self, obj: HeapRef) {
        if let Some((_, monitor_id)) = self.cache.remove(&obj) {
            self.free.lock().unwrap().push(monitor_id);
        }
    }

    /// Compaction-time sweep: drops cache entries whose monitor carries the
    /// `UN_USED` sentinel and recycles them through the free list.
    pub fn reclaim_unused(&self) {
        let mut freed = Vec::new();
        self.cache.retain(|_, monitor_id| {
            let monitor = self.get(*monitor_id);
            if monitor.is_unused() {
                freed.push(*monitor_id);
                false
            } else {
                true
            }
        });
        self.free.lock().unwrap().extend(freed);
    }

    /// Rewrites object keys after compaction moved their objects.
    pub fn forward_heap_refs(&self, forward: &dyn Fn(HeapRef) -> HeapRef) {
        let entries: Vec<(HeapRef, MonitorId)> = self
            .cache
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        self.cache.clear();
        for (obj, monitor_id) in entries {
            let moved = forward(obj);
            self.get(monitor_id)
                .bound_object
                .store(moved, Ordering::Release);
            self.cache.insert(moved, monitor_id);
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.read().unwrap().len()
    }
}

/// The lockword state machine. The lockword atomic lives in the object
/// header; callers pass it in so none of this touches the heap lock.
pub struct ObjectLocks;

impl ObjectLocks {
    pub fn lock(table: &MonitorTable, lockword: &AtomicU32, obj: HeapRef, tid: ThreadId) {
        let thin = thin_word(tid);
        loop {
            let cur = lockword.load(Ordering::Relaxed);

            if cur == 0 {
                // Acquire fence follows the successful CAS.
                if lockword
                    .compare_exchange(0, thin, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            if cur & SHAPE_BIT == 0 {
                if cur & TID_MASK == thin {
                    // Recursive thin lock; preserve a contender's FLC bit.
                    let count = (cur & COUNT_MASK) >> COUNT_SHIFT;
                    if count < COUNT_MAX {
                        if lockword
                            .compare_exchange(
                                cur,
                                cur + (1 << COUNT_SHIFT),
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            return;
                        }
                        continue;
                    }
                    // Count exhausted: inflate, carrying the recursion over.
                    let monitor_id = table.bind(obj);
                    table.get(monitor_id).claim(tid, count + 1);
                    lockword.store(fat_word(monitor_id), Ordering::Release);
                    return;
                }
                // Thin lock held by someone else.
                Self::lock_contended(table, lockword, obj, tid);
                return;
            }

            // Fat lock.
            let monitor_id = fat_monitor_id(cur).expect("fat lockword without monitor");
            let monitor = table.get(monitor_id);
            monitor.entering.fetch_add(1, Ordering::AcqRel);
            monitor.enter(tid);
            monitor.entering.fetch_sub(1, Ordering::AcqRel);
            // The monitor may have deflated while we blocked; retry then.
            if lockword.load(Ordering::Acquire) == fat_word(monitor_id) {
                return;
            }
            let _ = monitor.exit(tid);
        }
    }

    fn lock_contended(table: &MonitorTable, lockword: &AtomicU32, obj: HeapRef, tid: ThreadId) {
        let thin = thin_word(tid);
        let monitor_id = table.bind(obj);
        let monitor = table.get(monitor_id);
        monitor.entering.fetch_add(1, Ordering::AcqRel);

        loop {
            let cur = lockword.load(Ordering::Acquire);

            if cur & SHAPE_BIT != 0 {
                // Someone else completed the inflation.
                monitor.enter(tid);
                monitor.entering.fetch_sub(1, Ordering::AcqRel);
                if lockword.load(Ordering::Acquire) == cur {
                    return;
                }
                let _ = monitor.exit(tid);
                monitor.entering.fetch_add(1, Ordering::AcqRel);
                continue;
            }

            if cur == 0 {
                if lockword
                    .compare_exchange(0, thin, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // We own the thin lock; finish the inflation ourselves.
                    monitor.claim(tid, 0);
                    lockword.store(fat_word(monitor_id), Ordering::Release);
                    monitor.entering.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                continue;
            }

            // Still thin-locked by the owner: raise FLC so its unlock goes
            // through the slow path, then sleep until poked.
            if cur & FLC_BIT == 0 {
                let _ = lockword.compare_exchange(
                    cur,
                    cur | FLC_BIT,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }
            let core = monitor.lock_core();
            // Timeout backstop: the owner may have released between our
            // lockword read and this wait.
            let _ = monitor
                .cond
                .wait_timeout(core, Duration::from_millis(1))
                .unwrap();
        }
    }

    pub fn unlock(
        table: &MonitorTable,
        lockword: &AtomicU32,
        obj: HeapRef,
        tid: ThreadId,
    ) -> Result<(), JvmError> {
        let thin = thin_word(tid);
        loop {
            let cur = lockword.load(Ordering::Relaxed);

            if cur & SHAPE_BIT == 0 {
                if cur & TID_MASK != thin || cur == 0 {
                    return throw_exception!(
                        IllegalMonitorStateException,
                        "thread does not own the object lock"
                    );
                }
                let count = (cur & COUNT_MASK) >> COUNT_SHIFT;
                if count > 0 {
                    if lockword
                        .compare_exchange(
                            cur,
                            cur - (1 << COUNT_SHIFT),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return Ok(());
                    }
                    continue;
                }
                // Release fence precedes the zeroing write.
                if lockword
                    .compare_exchange(cur, 0, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                if cur & FLC_BIT != 0 {
                    // A contender is spinning; poke it through the monitor.
                    if let Some(monitor_id) = table.lookup(obj) {
                        let monitor = table.get(monitor_id);
                        let _guard = monitor.lock_core();
                        monitor.cond.notify_all();
                    }
                }
                return Ok(());
            }

            let monitor_id = fat_monitor_id(cur).expect("fat lockword without monitor");
            let monitor = table.get(monitor_id);
            {
                let mut core = monitor.lock_core();
                if core.owner != Some(tid) {
                    return throw_exception!(
                        IllegalMonitorStateException,
                        "thread does not own the monitor"
                    );
                }
                if core.recursion > 0 {
                    core.recursion -= 1;
                    return Ok(());
                }
                // Deflate when nothing depends on the fat shape any more.
                if monitor.deflatable(&core) {
                    core.owner = None;
                    lockword.store(0, Ordering::Release);
                    let _ = monitor.entering.compare_exchange(
                        0,
                        UN_USED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    drop(core);
                    monitor.cond.notify_all();
                    return Ok(());
                }
                core.owner = None;
            }
            monitor.cond.notify_all();
            return Ok(());
        }
    }

    /// Caller must own the lock. Inflates a thin lock first: the wait set
    /// lives on the monitor.
    pub fn ensure_fat(
        table: &MonitorTable,
        lockword: &AtomicU32,
        obj: HeapRef,
        tid: ThreadId,
    ) -> Result<MonitorId, JvmError> {
        let cur = lockword.load(Ordering::Acquire);
        if let Some(monitor_id) = fat_monitor_id(cur) {
            return Ok(monitor_id);
        }
        if cur & TID_MASK != thin_word(tid) || cur & SHAPE_BIT != 0 || cur == 0 {
            return throw_exception!(
                IllegalMonitorStateException,
                "thread does not own the object lock"
            );
        }
        let recursion = (cur & COUNT_MASK) >> COUNT_SHIFT;
        let monitor_id = table.bind(obj);
        table.get(monitor_id).claim(tid, recursion);
        lockword.store(fat_word(monitor_id), Ordering::Release);
        Ok(monitor_id)
    }

    /// Object.wait. Returns how the wait ended; on `Interrupted` the caller
    /// clears the thread's interrupt flag and raises InterruptedException.
    pub fn wait(
        table: &MonitorTable,
        monitor_id: MonitorId,
        tid: ThreadId,
        timeout: Option<Duration>,
        interrupted: &AtomicBool,
    ) -> Result<WaitOutcome, JvmError> {
        let monitor = table.get(monitor_id);
        let cell = Arc::new(WaitCell {
            notified: AtomicBool::new(false),
        });

        let saved_recursion;
        {
            let mut core = monitor.lock_core();
            if core.owner != Some(tid) {
                return throw_exception!(
                    IllegalMonitorStateException,
                    "wait without owning the monitor"
                );
            }
            if interrupted.swap(false, Ordering::AcqRel) {
                return throw_exception!(InterruptedException, "interrupt pending before wait");
            }
            saved_recursion = core.recursion;
            let wait_id = core.next_wait_id;
            core.next_wait_id += 1;
            core.wait_set.push_back(Waiter {
                thread: tid,
                wait_id,
                cell: cell.clone(),
            });
            monitor.in_wait.fetch_add(1, Ordering::AcqRel);

            // Release the monitor for the duration of the wait.
            core.owner = None;
            core.recursion = 0;
        }
        monitor.cond.notify_all();

        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut outcome = WaitOutcome::Notified;
        let mut core = monitor.lock_core();
        loop {
            if cell.notified.load(Ordering::Acquire) {
                break;
            }
            if interrupted.load(Ordering::Acquire) {
                if Self::unlink_waiter(&mut core, tid) {
                    outcome = WaitOutcome::Interrupted;
                } else {
                    // Already unlinked by a notifier: the notification must
                    // not be lost, hand it to the next waiter.
                    Self::forward_notify(&monitor, &mut core);
                    outcome = WaitOutcome::Interrupted;
                }
                break;
            }
            match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        if Self::unlink_waiter(&mut core, tid) {
                            outcome = WaitOutcome::TimedOut;
                        } else {
                            Self::forward_notify(&monitor, &mut core);
                            outcome = WaitOutcome::TimedOut;
                        }
                        break;
                    }
                    let (guard, _) = monitor
                        .wait_cond
                        .wait_timeout(core, deadline - now)
                        .unwrap();
                    core = guard;
                }
                None => {
                    core = monitor.wait_cond.wait(core).unwrap();
                }
            }
        }
        monitor.in_wait.fetch_sub(1, Ordering::AcqRel);

        // Reacquire with the saved recursion count.
        while core.owner.is_some() {
            core = monitor.cond.wait(core).unwrap();
        }
        core.owner = Some(tid);
        core.recursion = saved_recursion;
        drop(core);

        if outcome == WaitOutcome::Interrupted {
            interrupted.store(false, Ordering::Release);
        }
        Ok(outcome)
    }

    fn unlink_waiter(core: &mut MonitorCore, tid: ThreadId) -> bool {
        let before = core.wait_set.len();
        core.wait_set.retain(|w| w.thread != tid);
        core.wait_set.len() != before
    }

    /// A waiter consumed a notify it cannot honor; wake the longest
    /// waiting thread instead.
    fn forward_notify(monitor: &Monitor, core: &mut MonitorCore) {
        if let Some(next) = core.wait_set.pop_front() {
            next.cell.notified.store(true, Ordering::Release);
        }
        monitor.wait_cond.notify_all();
    }

    pub fn notify(
        table: &MonitorTable,
        monitor_id: MonitorId,
        tid: ThreadId,
    ) -> Result<(), JvmError> {
        let monitor = table.get(monitor_id);
        let mut core = monitor.lock_core();
        if core.owner != Some(tid) {
            return throw_exception!(
                IllegalMonitorStateException,
                "notify without owning the monitor"
            );
        }
        // Longest-waiting thread first.
        if let Some(waiter) = core.wait_set.pop_front() {
            waiter.cell.notified.store(true, Ordering::Release);
            drop(core);
            monitor.wait_cond.notify_all();
        }
        Ok(())
    }

    pub fn notify_all(
        table: &MonitorTable,
        monitor_id: MonitorId,
        tid: ThreadId,
    ) -> Result<(), JvmError> {
        let monitor = table.get(monitor_id);
        let mut core = monitor.lock_core();
        if core.owner != Some(tid) {
            return throw_exception!(
                IllegalMonitorStateException,
                "notifyAll without owning the monitor"
            );
        }
        while let Some(waiter) = core.wait_set.pop_front() {
            waiter.cell.notified.store(true, Ordering::Release);
        }
        drop(core);
        monitor.wait_cond.notify_all();
        Ok(())
    }

    /// Wakes a waiter so it can observe its interrupt flag.
    pub fn kick_waiters(table: &MonitorTable, monitor_id: MonitorId) {
        let monitor = table.get(monitor_id);
        let _core = monitor.lock_core();
        monitor.wait_cond.notify_all();
    }

    pub fn holds_lock(table: &MonitorTable, lockword: &AtomicU32, tid: ThreadId) -> bool {
        let cur = lockword.load(Ordering::Acquire);
        match fat_monitor_id(cur) {
            Some(monitor_id) => table.get(monitor_id).lock_core().owner == Some(tid),
            None => cur != 0 && cur & TID_MASK == thin_word(tid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::from_raw(n).unwrap()
    }

    #[test]
    fn thin_lock_recursion_restores_zero() {
        let table = MonitorTable::new();
        let lockword = AtomicU32::new(0);
        let t = tid(1);
        for _ in 0..5 {
            ObjectLocks::lock(&table, &lockword, 64, t);
        }
        assert_eq!(
            (lockword.load(Ordering::Relaxed) & COUNT_MASK) >> COUNT_SHIFT,
            4
        );
        for _ in 0..5 {
            ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
        }
        assert_eq!(lockword.load(Ordering::Relaxed), 0);
        // No monitor was ever needed.
        assert_eq!(table.monitor_count(), 0);
    }

    #[test]
    fn count_overflow_inflates() {
        let table = MonitorTable::new();
        let lockword = AtomicU32::new(0);
        let t = tid(1);
        for _ in 0..(COUNT_MAX as usize + 2) {
            ObjectLocks::lock(&table, &lockword, 64, t);
        }
        assert_ne!(lockword.load(Ordering::Relaxed) & SHAPE_BIT, 0);
        for _ in 0..(COUNT_MAX as usize + 2) {
            ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
        }
        // Fully released and deflated back to a thin-zero word.
        assert_eq!(lockword.load(Ordering::Relaxed), 0);
        let monitor = table.get(table.lookup(64).unwrap());
        assert!(monitor.is_unused());
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let table = MonitorTable::new();
        let lockword = AtomicU32::new(0);
        ObjectLocks::lock(&table, &lockword, 64, tid(1));
        assert!(ObjectLocks::unlock(&table, &lockword, 64, tid(2)).is_err());
        ObjectLocks::unlock(&table, &lockword, 64, tid(1)).unwrap();
    }

    #[test]
    fn reclaim_drops_unused_monitors() {
        let table = MonitorTable::new();
        let lockword = AtomicU32::new(0);
        let t = tid(1);
        ObjectLocks::lock(&table, &lockword, 64, t);
        ObjectLocks::ensure_fat(&table, &lockword, 64, t).unwrap();
        ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
        assert!(table.lookup(64).is_some());
        table.reclaim_unused();
        assert!(table.lookup(64).is_none());
        // The monitor is recycled for the next inflation.
        let count_before = table.monitor_count();
        ObjectLocks::lock(&table, &lockword, 64, t);
        ObjectLocks::ensure_fat(&table, &lockword, 64, t).unwrap();
        assert_eq!(table.monitor_count(), count_before);
        ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
    }

    #[test]
    fn contended_increment_stays_consistent() {
        let table = Arc::new(MonitorTable::new());
        let lockword = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for i in 0..4 {
            let table = table.clone();
            let lockword = lockword.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                let t = tid(i + 1);
                for _ in 0..10_000 {
                    ObjectLocks::lock(&table, &lockword, 64, t);
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
        assert_eq!(lockword.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn wait_notify_delivers_to_one_waiter() {
        let table = Arc::new(MonitorTable::new());
        let lockword = Arc::new(AtomicU32::new(0));
        let woken = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..3 {
            let table = table.clone();
            let lockword = lockword.clone();
            let woken = woken.clone();
            handles.push(std::thread::spawn(move || {
                let t = tid(i + 2);
                let flag = AtomicBool::new(false);
                ObjectLocks::lock(&table, &lockword, 64, t);
                let monitor_id = ObjectLocks::ensure_fat(&table, &lockword, 64, t).unwrap();
                let outcome =
                    ObjectLocks::wait(&table, monitor_id, t, None, &flag).unwrap();
                assert_eq!(outcome, WaitOutcome::Notified);
                woken.fetch_add(1, Ordering::AcqRel);
                ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
            }));
        }

        // Give the waiters time to park.
        std::thread::sleep(Duration::from_millis(100));
        let t1 = tid(1);
        for expected in 1..=3u32 {
            ObjectLocks::lock(&table, &lockword, 64, t1);
            let monitor_id = ObjectLocks::ensure_fat(&table, &lockword, 64, t1).unwrap();
            ObjectLocks::notify(&table, monitor_id, t1).unwrap();
            ObjectLocks::unlock(&table, &lockword, 64, t1).unwrap();
            // Exactly one waiter wakes per notify.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while woken.load(Ordering::Acquire) < expected {
                assert!(std::time::Instant::now() < deadline, "waiter never woke");
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(woken.load(Ordering::Acquire), expected);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn interrupted_wait_clears_flag() {
        let table = Arc::new(MonitorTable::new());
        let lockword = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let table = table.clone();
            let lockword = lockword.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                let t = tid(1);
                ObjectLocks::lock(&table, &lockword, 64, t);
                let monitor_id = ObjectLocks::ensure_fat(&table, &lockword, 64, t).unwrap();
                let outcome = ObjectLocks::wait(&table, monitor_id, t, None, &flag).unwrap();
                ObjectLocks::unlock(&table, &lockword, 64, t).unwrap();
                outcome
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        flag.store(true, Ordering::Release);
        ObjectLocks::kick_waiters(&table, table.lookup(64).unwrap());
        assert_eq!(handle.join().unwrap(), WaitOutcome::Interrupted);
        // The interrupt flag was consumed by the wait.
        assert!(!flag.load(Ordering::Acquire));
    }
}
