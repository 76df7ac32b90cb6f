use crate::debug_log;
use crate::heap::method_area::MethodArea;
use crate::heap::{
    HAS_HASHCODE_BIT, HASHCODE_TAKEN_BIT, HEADER_SIZE, Heap, HeapRef, LOG_OBJECT_GRAIN,
    MIN_BLOCK_SIZE, OBJECT_GRAIN,
};
use crate::rt::{JvmClass, ReferenceKind};
use crate::sync::MonitorTable;
use crate::thread::ThreadRegistry;
use crate::vm::stack::FrameStack;
use bonsai_classfile::descriptor::AllocationType;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Two-bit mark grades, strongest last.
pub const UNMARKED: u8 = 0;
pub const PHANTOM_MARK: u8 = 1;
pub const FINALIZER_MARK: u8 = 2;
pub const HARD_MARK: u8 = 3;

const MARKS_PER_WORD: usize = 16;

/// One two-bit entry per heap grain.
pub struct MarkBits {
    bits: Vec<u32>,
}

impl MarkBits {
    pub fn new(heap_max: usize) -> Self {
        let grains = heap_max >> LOG_OBJECT_GRAIN;
        Self {
            bits: vec![0; grains.div_ceil(MARKS_PER_WORD)],
        }
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    fn slot(heap_ref: HeapRef) -> (usize, u32) {
        let grain = heap_ref >> LOG_OBJECT_GRAIN;
        (grain / MARKS_PER_WORD, ((grain % MARKS_PER_WORD) * 2) as u32)
    }

    pub fn get(&self, heap_ref: HeapRef) -> u8 {
        let (word, shift) = Self::slot(heap_ref);
        ((self.bits[word] >> shift) & 0b11) as u8
    }

    /// Raises the mark to `grade` if it is stronger than the current one.
    pub fn raise(&mut self, heap_ref: HeapRef, grade: u8) -> bool {
        let (word, shift) = Self::slot(heap_ref);
        let current = (self.bits[word] >> shift) & 0b11;
        if current >= grade as u32 {
            return false;
        }
        self.bits[word] = (self.bits[word] & !(0b11 << shift)) | ((grade as u32) << shift);
        true
    }
}

/// Work queues shared between the collector and the finalizer/reference
/// handler threads. The queued objects are collector roots until consumed.
pub struct CollectorQueues {
    finalize: Mutex<VecDeque<HeapRef>>,
    finalize_cond: Condvar,
    /// References whose referents were cleared, awaiting delivery to their
    /// ReferenceQueue by the handler thread.
    pending_refs: Mutex<VecDeque<HeapRef>>,
    pending_refs_cond: Condvar,
    /// Bumped by the finalizer thread after each drained batch, so the
    /// allocator's run-finalizers escalation can wait boundedly.
    finalizer_passes: Mutex<u64>,
    finalizer_pass_cond: Condvar,
}

impl Default for CollectorQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorQueues {
    pub fn new() -> Self {
        Self {
            finalize: Mutex::new(VecDeque::new()),
            finalize_cond: Condvar::new(),
            pending_refs: Mutex::new(VecDeque::new()),
            pending_refs_cond: Condvar::new(),
            finalizer_passes: Mutex::new(0),
            finalizer_pass_cond: Condvar::new(),
        }
    }

    pub fn push_finalizable(&self, obj: HeapRef) {
        self.finalize.lock().unwrap().push_back(obj);
        self.finalize_cond.notify_all();
    }

    pub fn finalize_queue_is_empty(&self) -> bool {
        self.finalize.lock().unwrap().is_empty()
    }

    pub fn pop_finalizable(&self, wait: bool) -> Option<HeapRef> {
        let mut queue = self.finalize.lock().unwrap();
        loop {
            if let Some(obj) = queue.pop_front() {
                return Some(obj);
            }
            if !wait {
                return None;
            }
            queue = self.finalize_cond.wait(queue).unwrap();
        }
    }

    pub fn note_finalizer_pass(&self) {
        *self.finalizer_passes.lock().unwrap() += 1;
        self.finalizer_pass_cond.notify_all();
    }

    /// Waits up to `timeout` for the finalizer thread to complete a pass.
    pub fn await_finalizer_pass(&self, timeout: Duration) {
        let passes = self.finalizer_passes.lock().unwrap();
        let seen = *passes;
        let _ = self
            .finalizer_pass_cond
            .wait_timeout_while(passes, timeout, |p| *p == seen)
            .unwrap();
    }

    pub fn push_pending_ref(&self, obj: HeapRef) {
        self.pending_refs.lock().unwrap().push_back(obj);
        self.pending_refs_cond.notify_all();
    }

    pub fn pop_pending_ref(&self, wait: bool) -> Option<HeapRef> {
        let mut queue = self.pending_refs.lock().unwrap();
        loop {
            if let Some(obj) = queue.pop_front() {
                return Some(obj);
            }
            if !wait {
                return None;
            }
            queue = self.pending_refs_cond.wait(queue).unwrap();
        }
    }

    pub fn wake_all(&self) {
        self.finalize_cond.notify_all();
        self.pending_refs_cond.notify_all();
    }

    fn for_each_root(&self, f: &mut dyn FnMut(HeapRef)) {
        for obj in self.finalize.lock().unwrap().iter() {
            f(*obj);
        }
        for obj in self.pending_refs.lock().unwrap().iter() {
            f(*obj);
        }
    }

    fn forward(&self, forward: &dyn Fn(HeapRef) -> HeapRef) {
        for obj in self.finalize.lock().unwrap().iter_mut() {
            *obj = forward(*obj);
        }
        for obj in self.pending_refs.lock().unwrap().iter_mut() {
            *obj = forward(*obj);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GcOptions {
    /// Treat soft references as strong (the normal case) or clear them
    /// (last-ditch collection before OOM).
    pub keep_soft: bool,
    pub compact: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GcOutcome {
    pub largest_free: usize,
    pub free_bytes: usize,
}

/// Everything the stopped world hands to a collection. The caller owns the
/// heap lock and has brought every other thread to a safepoint.
pub struct GcContext<'a> {
    pub heap: &'a mut Heap,
    pub method_area: &'a mut MethodArea,
    pub threads: &'a ThreadRegistry,
    pub monitors: &'a MonitorTable,
    pub queues: &'a CollectorQueues,
    /// JNI-style global references plus VM-owned objects such as the
    /// pre-allocated OutOfMemoryError. Roots, and pinned by the compactor.
    pub globals: &'a mut Vec<HeapRef>,
    /// The collecting thread's own Java stack; every other stack comes
    /// through the registry.
    pub self_stack: &'a mut FrameStack,
    pub self_id: crate::keys::ThreadId,
}

pub struct Collector {
    mark_bits: MarkBits,
}

impl Collector {
    pub fn new(heap_max: usize) -> Self {
        Self {
            mark_bits: MarkBits::new(heap_max),
        }
    }

    /// One stop-the-world collection: mark, reference processing,
    /// finalizer discovery, then sweep or compact.
    pub fn collect(&mut self, ctx: &mut GcContext, opts: GcOptions) -> GcOutcome {
        self.mark_bits.clear();

        self.mark_roots(ctx, opts);
        self.discover_finalizable(ctx);
        self.process_references(ctx, opts);

        let outcome = if opts.compact {
            self.compact(ctx)
        } else {
            self.sweep(ctx)
        };
        debug_log!(
            "collection done: {} bytes free, largest chunk {}",
            outcome.free_bytes,
            outcome.largest_free
        );
        outcome
    }

    fn mark_roots(&mut self, ctx: &mut GcContext, opts: GcOptions) {
        let mut pending: Vec<(HeapRef, u8)> = Vec::new();
        {
            let mut push_root = |r: HeapRef| pending.push((r, HARD_MARK));
            for heap_ref in ctx.heap.string_pool().values() {
                push_root(*heap_ref);
            }
            ctx.method_area.for_each_root(&mut push_root);
            ctx.threads.for_each_root(&mut push_root);
            ctx.queues.for_each_root(&mut push_root);
            for r in ctx.globals.iter() {
                push_root(*r);
            }
        }
        for frame in ctx.self_stack.java_frames() {
            for r in frame.iter_ref_slots() {
                pending.push((r, HARD_MARK));
            }
        }
        // Safety: the world is stopped; parked stacks stay put until resume.
        unsafe {
            for stack in ctx.threads.parked_stacks(ctx.self_id) {
                for frame in (*stack).java_frames() {
                    for r in frame.iter_ref_slots() {
                        pending.push((r, HARD_MARK));
                    }
                }
            }
        }

        self.mark_transitively(ctx, pending, opts);
    }

    /// Iterative tracing; recursion would be at the mercy of object-graph
    /// depth.
    fn mark_transitively(
        &mut self,
        ctx: &GcContext,
        mut pending: Vec<(HeapRef, u8)>,
        opts: GcOptions,
    ) {
        while let Some((obj, grade)) = pending.pop() {
            if obj == 0 || !ctx.heap.contains(obj) || !ctx.heap.is_allocated(obj) {
                continue;
            }
            if !self.mark_bits.raise(obj, grade) {
                continue;
            }
            self.push_children(ctx, obj, grade, &mut pending, opts);
        }
    }

    /// Children inherit the parent's grade; referents are marked at most
    /// one grade weaker than their container allows.
    fn push_children(
        &self,
        ctx: &GcContext,
        obj: HeapRef,
        parent_grade: u8,
        pending: &mut Vec<(HeapRef, u8)>,
        opts: GcOptions,
    ) {
        let Ok(class_id) = ctx.heap.get_class_id(obj) else {
            return;
        };
        if let Some(kind) = ctx.heap.array_kind(obj) {
            if kind == AllocationType::Reference {
                let Ok(length) = ctx.heap.get_array_length(obj) else {
                    return;
                };
                for index in 0..length {
                    if let Ok(value) = ctx.heap.read_array_element(obj, index) {
                        if let Ok(Some(r)) = value.as_nullable_obj_ref() {
                            pending.push((r, parent_grade));
                        }
                    }
                }
            }
            return;
        }

        let class = ctx.method_area.get_class(&class_id);
        let JvmClass::Instance(instance) = class else {
            return;
        };
        let reference_referent = class.reference_kind().and_then(|kind| {
            instance
                .lookup_instance_field(&ctx.method_area.br().reference_referent_fk)
                .map(|f| (kind, f.offset))
        });
        let Ok(ranges) = instance.get_ref_ranges() else {
            return;
        };
        for (start, end) in ranges {
            let mut offset = *start as usize;
            while offset < *end as usize {
                let grade = match reference_referent {
                    Some((kind, referent_offset)) if referent_offset == offset => {
                        let by_kind = match kind {
                            ReferenceKind::Soft if opts.keep_soft => HARD_MARK,
                            ReferenceKind::Soft | ReferenceKind::Weak => UNMARKED,
                            ReferenceKind::Phantom => PHANTOM_MARK,
                        };
                        by_kind.min(parent_grade)
                    }
                    _ => parent_grade,
                };
                if grade != UNMARKED {
                    if let Ok(value) = ctx.heap.read_field(obj, offset, AllocationType::Reference)
                    {
                        if let Ok(Some(r)) = value.as_nullable_obj_ref() {
                            pending.push((r, grade));
                        }
                    }
                }
                offset += AllocationType::Reference.byte_size();
            }
        }
    }

    /// Unreachable objects with finalizers move to the finalizer queue and
    /// get a stay of execution: they and everything they reach survive one
    /// more cycle.
    fn discover_finalizable(&mut self, ctx: &mut GcContext) {
        let registered = std::mem::take(ctx.heap.finalizable_mut());
        let mut kept = Vec::with_capacity(registered.len());
        let mut rescued: Vec<(HeapRef, u8)> = Vec::new();
        for obj in registered {
            if !ctx.heap.is_allocated(obj) {
                continue;
            }
            if self.mark_bits.get(obj) == UNMARKED {
                self.mark_bits.raise(obj, FINALIZER_MARK);
                let mut children = Vec::new();
                self.push_children(
                    ctx,
                    obj,
                    FINALIZER_MARK,
                    &mut children,
                    GcOptions {
                        keep_soft: true,
                        compact: false,
                    },
                );
                rescued.extend(children);
                ctx.queues.push_finalizable(obj);
            } else {
                kept.push(obj);
            }
        }
        *ctx.heap.finalizable_mut() = kept;
        self.mark_transitively(
            ctx,
            rescued,
            GcOptions {
                keep_soft: true,
                compact: false,
            },
        );
    }

    /// Clears referents that did not survive and queues references that
    /// declared a queue.
    fn process_references(&mut self, ctx: &mut GcContext, opts: GcOptions) {
        let referent_fk = ctx.method_area.br().reference_referent_fk;
        let queue_fk = ctx.method_area.br().reference_queue_fk;

        let mut to_clear: Vec<(HeapRef, usize, Option<usize>)> = Vec::new();
        for (obj, _, allocated) in ctx.heap.iter_blocks() {
            if !allocated || self.mark_bits.get(obj) == UNMARKED {
                continue;
            }
            let Ok(class_id) = ctx.heap.get_class_id(obj) else {
                continue;
            };
            let class = ctx.method_area.get_class(&class_id);
            let Some(kind) = class.reference_kind() else {
                continue;
            };
            let JvmClass::Instance(instance) = class else {
                continue;
            };
            let Some(referent_field) = instance.lookup_instance_field(&referent_fk) else {
                continue;
            };
            let referent = match ctx
                .heap
                .read_field(obj, referent_field.offset, AllocationType::Reference)
            {
                Ok(value) => match value.as_nullable_obj_ref() {
                    Ok(Some(r)) => r,
                    _ => continue,
                },
                Err(_) => continue,
            };
            let referent_mark = self.mark_bits.get(referent);
            let dead = match kind {
                ReferenceKind::Soft if opts.keep_soft => false,
                ReferenceKind::Soft | ReferenceKind::Weak => referent_mark < FINALIZER_MARK,
                ReferenceKind::Phantom => referent_mark <= PHANTOM_MARK,
            };
            if dead {
                let queue_offset = instance.lookup_instance_field(&queue_fk).map(|f| f.offset);
                to_clear.push((obj, referent_field.offset, queue_offset));
            }
        }

        for (reference, referent_offset, queue_offset) in to_clear {
            let _ = ctx.heap.write_field(
                reference,
                referent_offset,
                crate::vm::Value::Null,
                AllocationType::Reference,
            );
            let has_queue = queue_offset.is_some_and(|offset| {
                matches!(
                    ctx.heap.read_field(reference, offset, AllocationType::Reference),
                    Ok(crate::vm::Value::Ref(_))
                )
            });
            if has_queue {
                ctx.queues.push_pending_ref(reference);
            }
        }
    }

    /// Linear scan merging every run of dead and free space into single
    /// chunks; installs the result as the new free list.
    fn sweep(&mut self, ctx: &mut GcContext) -> GcOutcome {
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut run_start: Option<usize> = None;
        let mut run_len = 0;
        let mut dead_objects = Vec::new();

        let blocks: Vec<(HeapRef, usize, bool)> = ctx.heap.iter_blocks().collect();
        for (offset, size, allocated) in blocks {
            let live = allocated && self.mark_bits.get(offset) != UNMARKED;
            if live {
                if let Some(start) = run_start.take() {
                    chunks.push((start, run_len));
                    run_len = 0;
                }
            } else {
                if allocated {
                    dead_objects.push(offset);
                }
                run_start.get_or_insert(offset);
                run_len += size;
            }
        }
        if let Some(start) = run_start {
            chunks.push((start, run_len));
        }

        self.drop_dead_bookkeeping(ctx, &dead_objects);
        install_chunks(ctx.heap, &chunks);
        GcOutcome {
            largest_free: chunks.iter().map(|(_, len)| *len).max().unwrap_or(0),
            free_bytes: chunks.iter().map(|(_, len)| *len).sum(),
        }
    }

    /// Sliding compaction. Live objects move down over dead space; objects
    /// pinned by native handles stay put and free runs are emitted around
    /// them. The forwarding table then rewrites every reference slot the VM
    /// knows about, and finally the objects are copied.
    fn compact(&mut self, ctx: &mut GcContext) -> GcOutcome {
        let mut pinned: HashSet<HeapRef> = ctx.threads.pinned_refs().into_iter().collect();
        pinned.extend(ctx.globals.iter().copied());

        // Pass one: compute destinations.
        let blocks: Vec<(HeapRef, usize, bool)> = ctx.heap.iter_blocks().collect();
        let mut forwarding: HashMap<HeapRef, HeapRef> = HashMap::new();
        let mut plan: Vec<(HeapRef, usize, HeapRef, usize)> = Vec::new();
        let mut cursor = ctx.heap.start();
        let mut dead_objects = Vec::new();

        for (offset, size, allocated) in &blocks {
            let live = *allocated && self.mark_bits.get(*offset) != UNMARKED;
            if !live {
                if *allocated {
                    dead_objects.push(*offset);
                }
                continue;
            }
            if pinned.contains(offset) {
                // Non-movable: the gap before it becomes free space.
                cursor = (*offset + *size).max(cursor);
                continue;
            }
            let moving = cursor < *offset;
            let grows = moving
                && ctx.heap.has_flag(*offset, HASHCODE_TAKEN_BIT)
                && !ctx.heap.has_flag(*offset, HAS_HASHCODE_BIT);
            let new_size = size + if grows { OBJECT_GRAIN } else { 0 };
            if moving {
                forwarding.insert(*offset, cursor);
                plan.push((*offset, *size, cursor, new_size));
            }
            cursor += new_size;
        }

        self.drop_dead_bookkeeping(ctx, &dead_objects);

        // Pass two: rewrite every reference slot while the objects still
        // sit at their old addresses.
        let forward = |r: HeapRef| forwarding.get(&r).copied().unwrap_or(r);
        for (offset, _, allocated) in &blocks {
            let live = *allocated && self.mark_bits.get(*offset) != UNMARKED;
            if live {
                forward_object_fields(ctx, *offset, &forward);
            }
        }
        {
            let pool = ctx.heap.string_pool_mut();
            for value in pool.values_mut() {
                *value = forward(*value);
            }
        }
        for obj in ctx.heap.finalizable_mut().iter_mut() {
            *obj = forward(*obj);
        }
        ctx.method_area.forward_heap_refs(&forward);
        ctx.threads.forward_heap_refs(&forward);
        ctx.monitors.forward_heap_refs(&forward);
        ctx.queues.forward(&forward);
        for frame in ctx.self_stack.java_frames_mut() {
            frame.forward_ref_slots(&forward);
        }
        // Safety: world is stopped.
        unsafe {
            for stack in ctx.threads.parked_stacks(ctx.self_id) {
                for frame in (*stack).java_frames_mut() {
                    frame.forward_ref_slots(&forward);
                }
            }
        }

        // Pass three: slide the objects into place, appending the stored
        // hashcode word for objects whose identity hash was already taken.
        let base = ctx.heap.base_ptr();
        for (old, old_size, new, new_size) in &plan {
            let header = ctx.heap.header(*old);
            unsafe {
                std::ptr::copy(base.add(*old), base.add(*new), *old_size);
            }
            if new_size > old_size {
                ctx.heap
                    .set_header(*new, (header | HAS_HASHCODE_BIT) + OBJECT_GRAIN as u64);
                let hash_slot = *new + *new_size - OBJECT_GRAIN;
                unsafe {
                    (base.add(hash_slot) as *mut u64).write(*old as u64);
                }
            }
        }

        // Pass four: rebuild the free list from the gaps that remain.
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut scan = ctx.heap.start();
        let mut live_after: Vec<(HeapRef, usize)> = Vec::new();
        for (offset, size, allocated) in &blocks {
            let live = *allocated && self.mark_bits.get(*offset) != UNMARKED;
            if !live {
                continue;
            }
            if pinned.contains(offset) {
                live_after.push((*offset, *size));
            }
        }
        for (old, _, new, new_size) in &plan {
            let _ = old;
            live_after.push((*new, *new_size));
        }
        // Unmoved (but unpinned) survivors kept their addresses.
        for (offset, size, allocated) in &blocks {
            let live = *allocated && self.mark_bits.get(*offset) != UNMARKED;
            if live && !pinned.contains(offset) && !forwarding.contains_key(offset) {
                live_after.push((*offset, *size));
            }
        }
        live_after.sort_unstable();
        for (offset, size) in &live_after {
            if scan < *offset {
                chunks.push((scan, offset - scan));
            }
            scan = offset + size;
        }
        if scan < ctx.heap.limit() {
            chunks.push((scan, ctx.heap.limit() - scan));
        }
        install_chunks(ctx.heap, &chunks);

        // Monitors whose object went away or deflated are recycled here.
        ctx.monitors.reclaim_unused();

        GcOutcome {
            largest_free: chunks.iter().map(|(_, len)| *len).max().unwrap_or(0),
            free_bytes: chunks.iter().map(|(_, len)| *len).sum(),
        }
    }

    /// Dead objects may leave bookkeeping behind: monitor cache entries
    /// and interned-string table slots never do (both are roots), but the
    /// monitor cache can hold entries for deflated locks on dead objects.
    fn drop_dead_bookkeeping(&self, ctx: &GcContext, dead: &[HeapRef]) {
        for obj in dead {
            if let Some(monitor_id) = ctx.monitors.lookup(*obj) {
                if ctx.monitors.get(monitor_id).is_unused() {
                    ctx.monitors.reclaim_for(*obj);
                }
            }
        }
    }
}

fn forward_object_fields(ctx: &mut GcContext, obj: HeapRef, forward: &dyn Fn(HeapRef) -> HeapRef) {
    let Ok(class_id) = ctx.heap.get_class_id(obj) else {
        return;
    };
    if let Some(kind) = ctx.heap.array_kind(obj) {
        if kind == AllocationType::Reference {
            let Ok(length) = ctx.heap.get_array_length(obj) else {
                return;
            };
            for index in 0..length {
                if let Ok(value) = ctx.heap.read_array_element(obj, index) {
                    if let Ok(Some(r)) = value.as_nullable_obj_ref() {
                        let _ = ctx.heap.write_array_element(
                            obj,
                            index,
                            crate::vm::Value::Ref(forward(r)),
                        );
                    }
                }
            }
        }
        return;
    }
    let ranges: Vec<(u32, u32)> = {
        let class = ctx.method_area.get_class(&class_id);
        let JvmClass::Instance(instance) = class else {
            return;
        };
        match instance.get_ref_ranges() {
            Ok(ranges) => ranges.to_vec(),
            Err(_) => return,
        }
    };
    for (start, end) in ranges {
        let mut offset = start as usize;
        while offset < end as usize {
            if let Ok(crate::vm::Value::Ref(r)) =
                ctx.heap.read_field(obj, offset, AllocationType::Reference)
            {
                let _ = ctx.heap.write_field(
                    obj,
                    offset,
                    crate::vm::Value::Ref(forward(r)),
                    AllocationType::Reference,
                );
            }
            offset += AllocationType::Reference.byte_size();
        }
    }
}

/// Writes an address-ordered chunk list into the heap.
fn install_chunks(heap: &mut Heap, chunks: &[(usize, usize)]) {
    let mut total = 0;
    let mut head: u64 = u64::MAX;
    for (start, len) in chunks.iter().rev() {
        debug_assert!(*len >= MIN_BLOCK_SIZE);
        heap.set_header(*start, *len as u64);
        unsafe {
            (heap.base_ptr().add(start + HEADER_SIZE) as *mut u64).write(head);
        }
        head = *start as u64;
        total += len;
    }
    heap.install_free_list(head, total);
}

// Keep the arithmetic honest without a full VM around it.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_bits_hold_grades_per_grain() {
        let mut bits = MarkBits::new(4096);
        assert_eq!(bits.get(64), UNMARKED);
        assert!(bits.raise(64, PHANTOM_MARK));
        assert!(bits.raise(64, HARD_MARK));
        // Weaker grades never downgrade.
        assert!(!bits.raise(64, FINALIZER_MARK));
        assert_eq!(bits.get(64), HARD_MARK);
        // Neighboring grains are independent.
        assert_eq!(bits.get(72), UNMARKED);
        assert_eq!(bits.get(56), UNMARKED);
    }

    #[test]
    fn finalizer_pass_wait_times_out() {
        let queues = CollectorQueues::new();
        let begin = std::time::Instant::now();
        queues.await_finalizer_pass(Duration::from_millis(50));
        assert!(begin.elapsed() >= Duration::from_millis(40));
    }
}
