use crate::error::JvmError;
use crate::keys::{ClassId, Symbol};
use crate::vm::Value;
use crate::{debug_error_log, throw_exception};
use bonsai_classfile::descriptor::{ArrayType, AllocationType};
use lasso::ThreadedRodeo;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

pub mod gc;
pub mod method_area;

/// Offset of a block header within the heap region. Never zero: the first
/// grain of the region is reserved so `0` can stand for null in object
/// fields.
pub type HeapRef = usize;

/// Alignment unit for block placement and the mark bitmap.
pub const OBJECT_GRAIN: usize = 8;
pub const LOG_OBJECT_GRAIN: usize = 3;

/// One-word block header preceding every object. Low bits are free because
/// sizes are grain-aligned; the top two bits carry the hashcode protocol.
pub const ALLOC_BIT: u64 = 0x1;
/// Set while a monitor exists for the object.
pub const FLC_BIT: u64 = 0x2;
/// Class mirrors, reference objects, thread objects: the collector applies
/// extra cleanup to these.
pub const SPECIAL_BIT: u64 = 0x4;
pub const ARRAY_BIT: u64 = 1 << 61;
pub const HASHCODE_TAKEN_BIT: u64 = 1 << 62;
pub const HAS_HASHCODE_BIT: u64 = 1 << 63;
const FLAGS_MASK: u64 =
    ALLOC_BIT | FLC_BIT | SPECIAL_BIT | ARRAY_BIT | HASHCODE_TAKEN_BIT | HAS_HASHCODE_BIT;

pub const HEADER_SIZE: usize = 8;
/// class id + lockword, directly after the header.
pub const OBJECT_BASE_SIZE: usize = 8;
/// Smallest block: enough for a free chunk's `{size, next}` pair.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + OBJECT_BASE_SIZE;

const FREE_NIL: u64 = u64::MAX;

pub fn align_grain(n: usize) -> usize {
    (n + OBJECT_GRAIN - 1) & !(OBJECT_GRAIN - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub committed: usize,
    pub free: usize,
    pub largest_free: usize,
}

/// A single contiguous region: block headers encode size and flags, free
/// chunks reuse the header word for `{size, next}`, and the free list is
/// kept in address order with a next-fit cursor.
pub struct Heap {
    memory: *mut u8,
    /// Mapped size; the hard upper bound.
    max_size: usize,
    /// Current usable end, grows toward `max_size`.
    limit: usize,
    /// First usable block offset (one reserved grain after the base).
    start: usize,
    free_head: u64,
    /// Offset of the chunk *preceding* the next-fit scan position, or
    /// `None` when the scan resumes at the head.
    cursor: Option<usize>,
    free_bytes: usize,
    interner: Arc<ThreadedRodeo>,
    string_pool: HashMap<Symbol, HeapRef>,
    /// Objects whose class declares a finalizer, registered on creation.
    finalizable: Vec<HeapRef>,
}

// Safety: the heap owns its mapping exclusively; the VM serializes access
// through a lock.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub const ARRAY_LENGTH_OFFSET: usize = 0;
    pub const ARRAY_KIND_OFFSET: usize = 4;
    pub const ARRAY_ELEMENTS_OFFSET: usize = 8;
    pub const LATIN1: i32 = 0;
    pub const UTF16: i32 = 1;

    pub fn new(
        initial_size: usize,
        max_size: usize,
        interner: Arc<ThreadedRodeo>,
    ) -> Result<Self, JvmError> {
        let max_size = align_grain(max_size.max(MIN_BLOCK_SIZE * 4));
        let initial = align_grain(initial_size.clamp(MIN_BLOCK_SIZE * 4, max_size));

        let memory = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                max_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if memory == libc::MAP_FAILED {
            return Err(JvmError::IllegalInternalState(
                "mmap of heap region failed".to_string(),
            ));
        }

        let start = OBJECT_GRAIN * 2;
        let mut heap = Self {
            memory: memory as *mut u8,
            max_size,
            limit: initial,
            start,
            free_head: FREE_NIL,
            cursor: None,
            free_bytes: 0,
            interner,
            string_pool: HashMap::new(),
            finalizable: Vec::new(),
        };
        // The initial free list is one chunk spanning the whole usable region.
        heap.write_free_chunk(start, initial - start, FREE_NIL);
        heap.free_head = start as u64;
        heap.free_bytes = initial - start;
        Ok(heap)
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.memory
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn usable_size(&self) -> usize {
        self.limit - self.start
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    // ---- raw header access ----

    fn word_at(&self, offset: usize) -> u64 {
        unsafe { (self.memory.add(offset) as *const u64).read() }
    }

    fn set_word_at(&mut self, offset: usize, word: u64) {
        unsafe { (self.memory.add(offset) as *mut u64).write(word) }
    }

    pub fn header(&self, heap_ref: HeapRef) -> u64 {
        self.word_at(heap_ref)
    }

    pub fn set_header(&mut self, heap_ref: HeapRef, header: u64) {
        self.set_word_at(heap_ref, header);
    }

    pub fn block_size(&self, heap_ref: HeapRef) -> usize {
        (self.header(heap_ref) & !FLAGS_MASK) as usize
    }

    pub fn is_allocated(&self, heap_ref: HeapRef) -> bool {
        self.header(heap_ref) & ALLOC_BIT != 0
    }

    pub fn set_flag(&mut self, heap_ref: HeapRef, flag: u64) {
        let header = self.header(heap_ref);
        self.set_header(heap_ref, header | flag);
    }

    pub fn clear_flag(&mut self, heap_ref: HeapRef, flag: u64) {
        let header = self.header(heap_ref);
        self.set_header(heap_ref, header & !flag);
    }

    pub fn has_flag(&self, heap_ref: HeapRef, flag: u64) -> bool {
        self.header(heap_ref) & flag != 0
    }

    fn write_free_chunk(&mut self, offset: usize, size: usize, next: u64) {
        self.set_word_at(offset, size as u64);
        self.set_word_at(offset + HEADER_SIZE, next);
    }

    fn free_next(&self, offset: usize) -> u64 {
        self.word_at(offset + HEADER_SIZE)
    }

    fn set_free_next(&mut self, offset: usize, next: u64) {
        self.set_word_at(offset + HEADER_SIZE, next);
    }

    pub fn contains(&self, heap_ref: HeapRef) -> bool {
        heap_ref >= self.start && heap_ref < self.limit && heap_ref % OBJECT_GRAIN == 0
    }

    // ---- object access ----

    pub fn class_id_raw(&self, heap_ref: HeapRef) -> u32 {
        unsafe { (self.memory.add(heap_ref + HEADER_SIZE) as *const u32).read() }
    }

    fn set_class_id_raw(&mut self, heap_ref: HeapRef, class_id: u32) {
        unsafe { (self.memory.add(heap_ref + HEADER_SIZE) as *mut u32).write(class_id) }
    }

    pub fn get_class_id(&self, heap_ref: HeapRef) -> Result<ClassId, JvmError> {
        if !self.contains(heap_ref) || !self.is_allocated(heap_ref) {
            return Err(JvmError::WrongHeapAddress(heap_ref));
        }
        ClassId::from_raw(self.class_id_raw(heap_ref)).ok_or(JvmError::WrongHeapAddress(heap_ref))
    }

    /// The lockword lives next to the class id and is the one field mutated
    /// by other threads without the heap lock.
    pub fn lockword(&self, heap_ref: HeapRef) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.memory.add(heap_ref + HEADER_SIZE + 4) as *mut u32) }
    }

    pub(crate) unsafe fn data_ptr(&self, heap_ref: HeapRef) -> *mut u8 {
        unsafe { self.memory.add(heap_ref + HEADER_SIZE + OBJECT_BASE_SIZE) }
    }

    pub fn payload_size(&self, heap_ref: HeapRef) -> usize {
        let mut size = self.block_size(heap_ref) - HEADER_SIZE - OBJECT_BASE_SIZE;
        if self.has_flag(heap_ref, HAS_HASHCODE_BIT) {
            size -= OBJECT_GRAIN;
        }
        size
    }

    // ---- allocation ----

    /// First fit from the next-fit cursor. Fails with `HeapExhausted` and
    /// leaves escalation to the caller; nothing here triggers collection.
    fn alloc_block(&mut self, total_size: usize) -> Result<HeapRef, JvmError> {
        let n = align_grain(total_size.max(MIN_BLOCK_SIZE));

        let mut wrapped = false;
        let mut prev = self.cursor;
        loop {
            let cur = match prev {
                Some(p) => self.free_next(p),
                None => self.free_head,
            };
            if cur == FREE_NIL {
                if wrapped || self.cursor.is_none() {
                    return Err(JvmError::HeapExhausted(n));
                }
                // Wrap once to cover the part of the list before the cursor.
                wrapped = true;
                prev = None;
                continue;
            }
            let cur = cur as usize;
            let len = self.block_size(cur);

            if len >= n {
                let next = self.free_next(cur);
                let remainder = len - n;
                let link = if remainder >= MIN_BLOCK_SIZE {
                    // Split; the tail stays on the list in address order.
                    let rem = cur + n;
                    self.write_free_chunk(rem, remainder, next);
                    rem as u64
                } else {
                    next
                };
                match prev {
                    Some(p) => self.set_free_next(p, link),
                    None => self.free_head = link,
                }
                let taken = if remainder >= MIN_BLOCK_SIZE { n } else { len };
                self.set_header(cur, taken as u64 | ALLOC_BIT);
                self.free_bytes -= taken;
                self.cursor = prev;
                return Ok(cur);
            }
            prev = Some(cur);
        }
    }

    fn alloc_raw(&mut self, payload_size: usize) -> Result<HeapRef, JvmError> {
        let heap_ref = self.alloc_block(HEADER_SIZE + OBJECT_BASE_SIZE + payload_size)?;
        // Zero class id, lockword and payload before the reference escapes,
        // so a concurrent collector sees a consistent snapshot.
        unsafe {
            std::ptr::write_bytes(
                self.memory.add(heap_ref + HEADER_SIZE),
                0,
                self.block_size(heap_ref) - HEADER_SIZE,
            );
        }
        Ok(heap_ref)
    }

    pub fn alloc_instance(
        &mut self,
        instance_size: usize,
        class_id: ClassId,
    ) -> Result<HeapRef, JvmError> {
        let heap_ref = self.alloc_raw(instance_size)?;
        self.set_class_id_raw(heap_ref, class_id.into_raw());
        Ok(heap_ref)
    }

    pub fn register_finalizable(&mut self, heap_ref: HeapRef) {
        self.finalizable.push(heap_ref);
    }

    pub(crate) fn finalizable_mut(&mut self) -> &mut Vec<HeapRef> {
        &mut self.finalizable
    }

    fn alloc_array_internal(
        &mut self,
        class_id: ClassId,
        length: i32,
        kind: AllocationType,
    ) -> Result<HeapRef, JvmError> {
        if length < 0 {
            return throw_exception!(NegativeArraySizeException, "{}", length);
        }
        let data_size =
            Self::ARRAY_ELEMENTS_OFFSET + (length as usize * kind.byte_size());
        let heap_ref = self.alloc_raw(data_size)?;
        self.set_class_id_raw(heap_ref, class_id.into_raw());
        self.set_flag(heap_ref, ARRAY_BIT);
        unsafe {
            let data = self.data_ptr(heap_ref);
            (data as *mut i32).write(length);
            data.add(Self::ARRAY_KIND_OFFSET).write(kind as u8);
        }
        Ok(heap_ref)
    }

    pub fn alloc_primitive_array(
        &mut self,
        class_id: ClassId,
        array_type: ArrayType,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        self.alloc_array_internal(class_id, length, array_type.element_type().into())
    }

    pub fn alloc_object_array(
        &mut self,
        class_id: ClassId,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        self.alloc_array_internal(class_id, length, AllocationType::Reference)
    }

    pub fn alloc_array_for_kind(
        &mut self,
        class_id: ClassId,
        kind: AllocationType,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        self.alloc_array_internal(class_id, length, kind)
    }

    /// Grows the committed limit by at least `min_extra`, by heap/2 when
    /// that is larger, clamped to the mapped maximum. The new tail becomes
    /// one free chunk appended in address order.
    pub fn expand(&mut self, min_extra: usize) -> bool {
        if self.limit >= self.max_size {
            return false;
        }
        let grow = align_grain(min_extra.max(self.usable_size() / 2)).min(self.max_size - self.limit);
        let chunk_start = self.limit;
        self.limit += grow;
        self.release_chunk(chunk_start, grow);
        true
    }

    /// Returns a block to the free list, coalescing is left to the sweep.
    /// Used by expansion and the collector's free-run emission.
    pub(crate) fn release_chunk(&mut self, offset: usize, size: usize) {
        // Address-ordered insert.
        let mut prev: Option<usize> = None;
        let mut cur = self.free_head;
        while cur != FREE_NIL && (cur as usize) < offset {
            prev = Some(cur as usize);
            cur = self.free_next(cur as usize);
        }
        // Merge with successor / predecessor when adjacent.
        let mut start = offset;
        let mut len = size;
        if cur != FREE_NIL && offset + size == cur as usize {
            len += self.block_size(cur as usize);
            cur = self.free_next(cur as usize);
        }
        if let Some(p) = prev {
            if p + self.block_size(p) == start {
                start = p;
                len += self.block_size(p);
                prev = self.free_prev(p);
            }
        }
        self.write_free_chunk(start, len, cur);
        match prev {
            Some(p) => self.set_free_next(p, start as u64),
            None => self.free_head = start as u64,
        }
        self.free_bytes += size;
        self.cursor = None;
    }

    fn free_prev(&self, offset: usize) -> Option<usize> {
        let mut prev = None;
        let mut cur = self.free_head;
        while cur != FREE_NIL {
            if cur as usize == offset {
                return prev;
            }
            prev = Some(cur as usize);
            cur = self.free_next(cur as usize);
        }
        None
    }

    /// Installs a freshly built address-ordered free list; the sweep and
    /// compact phases end here. Resets the next-fit cursor.
    pub(crate) fn install_free_list(&mut self, head: u64, total_free: usize) {
        self.free_head = head;
        self.free_bytes = total_free;
        self.cursor = None;
    }

    pub fn largest_free_chunk(&self) -> usize {
        let mut largest = 0;
        let mut cur = self.free_head;
        while cur != FREE_NIL {
            largest = largest.max(self.block_size(cur as usize));
            cur = self.free_next(cur as usize);
        }
        largest
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            committed: self.usable_size(),
            free: self.free_bytes,
            largest_free: self.largest_free_chunk(),
        }
    }

    /// Walks every block in address order: `(offset, size, allocated)`.
    pub fn iter_blocks(&self) -> BlockIter<'_> {
        BlockIter {
            heap: self,
            offset: self.start,
        }
    }

    // ---- identity hashcode ----

    /// Address-derived until the object first moves; compaction appends a
    /// trailing word holding the old value when `HASHCODE_TAKEN` is set.
    pub fn identity_hashcode(&mut self, heap_ref: HeapRef) -> i32 {
        if self.has_flag(heap_ref, HAS_HASHCODE_BIT) {
            let size = self.block_size(heap_ref);
            return self.word_at(heap_ref + size - OBJECT_GRAIN) as i32;
        }
        self.set_flag(heap_ref, HASHCODE_TAKEN_BIT);
        heap_ref as i32
    }

    // ---- field and array element access ----

    pub fn write_field(
        &mut self,
        heap_ref: HeapRef,
        field_offset: usize,
        value: Value,
        field_type: AllocationType,
    ) -> Result<(), JvmError> {
        let target = unsafe { self.data_ptr(heap_ref).add(field_offset) };
        match (value, field_type) {
            (Value::Integer(i), AllocationType::Boolean) => unsafe {
                *target = (i != 0) as u8;
            },
            (Value::Integer(i), AllocationType::Byte) => unsafe {
                *(target as *mut i8) = i as i8;
            },
            (Value::Integer(i), AllocationType::Short) => unsafe {
                *(target as *mut i16) = i as i16;
            },
            (Value::Integer(i), AllocationType::Char) => unsafe {
                *(target as *mut u16) = i as u16;
            },
            (Value::Integer(i), AllocationType::Int) => unsafe {
                *(target as *mut i32) = i;
            },
            (Value::Long(l), AllocationType::Long) => unsafe {
                *(target as *mut i64) = l;
            },
            (Value::Float(f), AllocationType::Float) => unsafe {
                *(target as *mut f32) = f;
            },
            (Value::Double(d), AllocationType::Double) => unsafe {
                *(target as *mut f64) = d;
            },
            (Value::Ref(r), AllocationType::Reference) => unsafe {
                *(target as *mut usize) = r;
            },
            (Value::Null, AllocationType::Reference) => unsafe {
                *(target as *mut usize) = 0;
            },
            (value, field_type) => {
                return Err(JvmError::UnexpectedType(format!(
                    "cannot store {:?} into {:?} slot",
                    value, field_type
                )));
            }
        }
        Ok(())
    }

    pub fn read_field(
        &self,
        heap_ref: HeapRef,
        field_offset: usize,
        field_type: AllocationType,
    ) -> Result<Value, JvmError> {
        let source = unsafe { self.data_ptr(heap_ref).add(field_offset) };
        Ok(match field_type {
            AllocationType::Boolean => {
                Value::Integer(unsafe { *source } as i32)
            }
            AllocationType::Byte => Value::Integer(unsafe { *(source as *const i8) } as i32),
            AllocationType::Short => Value::Integer(unsafe { *(source as *const i16) } as i32),
            AllocationType::Char => Value::Integer(unsafe { *(source as *const u16) } as i32),
            AllocationType::Int => Value::Integer(unsafe { *(source as *const i32) }),
            AllocationType::Long => Value::Long(unsafe { *(source as *const i64) }),
            AllocationType::Float => Value::Float(unsafe { *(source as *const f32) }),
            AllocationType::Double => Value::Double(unsafe { *(source as *const f64) }),
            AllocationType::Reference => {
                let raw = unsafe { *(source as *const usize) };
                if raw == 0 { Value::Null } else { Value::Ref(raw) }
            }
        })
    }

    // ---- arrays ----

    pub fn is_array(&self, heap_ref: HeapRef) -> Result<bool, JvmError> {
        if !self.contains(heap_ref) || !self.is_allocated(heap_ref) {
            return Err(JvmError::WrongHeapAddress(heap_ref));
        }
        Ok(self.has_flag(heap_ref, ARRAY_BIT))
    }

    pub(crate) fn array_kind(&self, heap_ref: HeapRef) -> Option<AllocationType> {
        if !self.has_flag(heap_ref, ARRAY_BIT) {
            return None;
        }
        let tag = unsafe { self.data_ptr(heap_ref).add(Self::ARRAY_KIND_OFFSET).read() };
        AllocationType::try_from(tag).ok()
    }

    fn expect_array_kind(&self, heap_ref: HeapRef) -> Result<AllocationType, JvmError> {
        self.array_kind(heap_ref)
            .ok_or_else(|| JvmError::UnexpectedType("not an array".to_string()))
    }

    pub fn get_array_length(&self, heap_ref: HeapRef) -> Result<i32, JvmError> {
        self.expect_array_kind(heap_ref)?;
        Ok(unsafe { (self.data_ptr(heap_ref) as *const i32).read() })
    }

    pub fn write_array_element(
        &mut self,
        heap_ref: HeapRef,
        index: i32,
        value: Value,
    ) -> Result<(), JvmError> {
        let length = self.get_array_length(heap_ref)?;
        if index < 0 || index >= length {
            throw_exception!(
                ArrayIndexOutOfBoundsException,
                "Index {} out of bounds for length {}",
                index,
                length
            )?
        }
        let kind = self.expect_array_kind(heap_ref)?;
        let offset = Self::ARRAY_ELEMENTS_OFFSET + index as usize * kind.byte_size();
        self.write_field(heap_ref, offset, value, kind)
    }

    pub fn read_array_element(&self, heap_ref: HeapRef, index: i32) -> Result<Value, JvmError> {
        let length = self.get_array_length(heap_ref)?;
        if index < 0 || index >= length {
            throw_exception!(
                ArrayIndexOutOfBoundsException,
                "Index {} out of bounds for length {}",
                index,
                length
            )?
        }
        let kind = self.expect_array_kind(heap_ref)?;
        let offset = Self::ARRAY_ELEMENTS_OFFSET + index as usize * kind.byte_size();
        self.read_field(heap_ref, offset, kind)
    }

    pub fn copy_array_region(
        &mut self,
        src: HeapRef,
        src_pos: i32,
        dest: HeapRef,
        dest_pos: i32,
        length: i32,
    ) -> Result<(), JvmError> {
        let src_kind = self.expect_array_kind(src)?;
        let dest_kind = self.expect_array_kind(dest)?;
        if src_kind != dest_kind {
            return throw_exception!(ArrayStoreException, "array element kinds differ");
        }
        let src_len = self.get_array_length(src)?;
        let dest_len = self.get_array_length(dest)?;
        if src_pos < 0
            || dest_pos < 0
            || length < 0
            || src_pos.checked_add(length).is_none_or(|end| end > src_len)
            || dest_pos.checked_add(length).is_none_or(|end| end > dest_len)
        {
            throw_exception!(
                ArrayIndexOutOfBoundsException,
                "source or destination range out of bounds"
            )?
        }
        let elem = src_kind.byte_size();
        unsafe {
            let src_ptr = self
                .data_ptr(src)
                .add(Self::ARRAY_ELEMENTS_OFFSET + src_pos as usize * elem);
            let dest_ptr = self
                .data_ptr(dest)
                .add(Self::ARRAY_ELEMENTS_OFFSET + dest_pos as usize * elem);
            std::ptr::copy(src_ptr, dest_ptr, length as usize * elem);
        }
        Ok(())
    }

    pub fn get_array_bytes(&self, heap_ref: HeapRef) -> Result<&[u8], JvmError> {
        let kind = self.expect_array_kind(heap_ref)?;
        let length = self.get_array_length(heap_ref)? as usize;
        let ptr = unsafe { self.data_ptr(heap_ref).add(Self::ARRAY_ELEMENTS_OFFSET) };
        Ok(unsafe { std::slice::from_raw_parts(ptr, length * kind.byte_size()) })
    }

    pub fn get_byte_array_slice(&self, heap_ref: HeapRef) -> Result<&[i8], JvmError> {
        self.typed_slice(heap_ref, AllocationType::Byte)
    }

    pub fn get_byte_array_slice_mut(&mut self, heap_ref: HeapRef) -> Result<&mut [i8], JvmError> {
        let slice = self.typed_slice::<i8>(heap_ref, AllocationType::Byte)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(slice.as_ptr() as *mut i8, slice.len()) })
    }

    pub fn get_char_array_slice(&self, heap_ref: HeapRef) -> Result<&[u16], JvmError> {
        self.typed_slice(heap_ref, AllocationType::Char)
    }

    pub fn get_int_array_slice(&self, heap_ref: HeapRef) -> Result<&[i32], JvmError> {
        self.typed_slice(heap_ref, AllocationType::Int)
    }

    fn typed_slice<T>(
        &self,
        heap_ref: HeapRef,
        expected: AllocationType,
    ) -> Result<&[T], JvmError> {
        let kind = self.expect_array_kind(heap_ref)?;
        if kind != expected {
            return Err(JvmError::UnexpectedType(format!(
                "expected {:?} array, found {:?}",
                expected, kind
            )));
        }
        let length = self.get_array_length(heap_ref)? as usize;
        let ptr = unsafe { self.data_ptr(heap_ref).add(Self::ARRAY_ELEMENTS_OFFSET) };
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const T, length) })
    }

    /// Shallow copy with a fresh lockword and hashcode state.
    pub fn clone_object(&mut self, src: HeapRef) -> Result<HeapRef, JvmError> {
        let data_size = self.payload_size(src);
        let class_id = self.class_id_raw(src);
        let kept_flags = self.header(src) & (SPECIAL_BIT | ARRAY_BIT);
        let dest = self.alloc_raw(data_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(src), self.data_ptr(dest), data_size);
        }
        self.set_class_id_raw(dest, class_id);
        self.set_flag(dest, kept_flags);
        Ok(dest)
    }

    // ---- interned strings ----
    //
    // String construction is a two-step allocation (byte array, then the
    // instance); callers that may collect between the steps go through the
    // VM-level wrapper, which pins the intermediate array.

    pub fn string_pool(&self) -> &HashMap<Symbol, HeapRef> {
        &self.string_pool
    }

    pub(crate) fn string_pool_mut(&mut self) -> &mut HashMap<Symbol, HeapRef> {
        &mut self.string_pool
    }

    pub fn lookup_interned(&self, sym: Symbol) -> Option<HeapRef> {
        self.string_pool.get(&sym).copied()
    }

    pub fn intern_string(&mut self, sym: Symbol, heap_ref: HeapRef) {
        self.string_pool.insert(sym, heap_ref);
    }
}

pub struct BlockIter<'a> {
    heap: &'a Heap,
    offset: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = (HeapRef, usize, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.heap.limit {
            return None;
        }
        let offset = self.offset;
        let size = self.heap.block_size(offset);
        debug_assert!(size >= MIN_BLOCK_SIZE && size % OBJECT_GRAIN == 0);
        self.offset += size;
        Some((offset, size, self.heap.is_allocated(offset)))
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.memory as *mut libc::c_void, self.max_size) };
        if result != 0 {
            debug_error_log!("munmap failed during Heap drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JvmError;

    fn small_heap() -> Heap {
        Heap::new(64 * 1024, 64 * 1024, Arc::new(ThreadedRodeo::default())).unwrap()
    }

    fn class_id() -> ClassId {
        ClassId::from_usize(1)
    }

    /// Free chunks plus allocated blocks must tile the usable region.
    fn assert_conservation(heap: &Heap) {
        let mut total = 0;
        let mut free = 0;
        let mut prev_free_end: Option<usize> = None;
        for (offset, size, allocated) in heap.iter_blocks() {
            assert_eq!(offset % OBJECT_GRAIN, 0);
            total += size;
            if !allocated {
                free += size;
                if let Some(end) = prev_free_end {
                    assert_ne!(end, offset, "adjacent free chunks at {:#x}", offset);
                }
                prev_free_end = Some(offset + size);
            } else {
                prev_free_end = None;
            }
        }
        assert_eq!(total, heap.usable_size());
        assert_eq!(free, heap.free_bytes());
    }

    #[test]
    fn allocations_tile_the_heap() {
        let mut heap = small_heap();
        let mut refs = Vec::new();
        for i in 0..100 {
            refs.push(heap.alloc_instance(8 + (i % 7) * 8, class_id()).unwrap());
        }
        assert_conservation(&heap);
        for r in &refs {
            assert!(heap.is_allocated(*r));
            assert!(heap.contains(*r));
        }
    }

    #[test]
    fn refs_are_never_null() {
        let mut heap = small_heap();
        let r = heap.alloc_instance(0, class_id()).unwrap();
        assert_ne!(r, 0);
    }

    #[test]
    fn exhaustion_reports_aligned_request() {
        let mut heap = Heap::new(4096, 4096, Arc::new(ThreadedRodeo::default())).unwrap();
        let result = std::iter::repeat_with(|| heap.alloc_instance(256, class_id()))
            .take(64)
            .find(|r| r.is_err());
        match result {
            Some(Err(JvmError::HeapExhausted(n))) => assert_eq!(n % OBJECT_GRAIN, 0),
            other => panic!("expected exhaustion, got {:?}", other.map(|r| r.ok())),
        }
    }

    #[test]
    fn expansion_appends_free_space() {
        let mut heap = Heap::new(8 * 1024, 32 * 1024, Arc::new(ThreadedRodeo::default())).unwrap();
        let before = heap.usable_size();
        assert!(heap.expand(1024));
        assert!(heap.usable_size() > before);
        assert_conservation(&heap);
        // Cannot grow past the mapped maximum.
        while heap.expand(1024) {}
        assert_eq!(heap.limit(), heap.max_size());
    }

    #[test]
    fn release_chunk_coalesces_neighbors() {
        let mut heap = small_heap();
        let a = heap.alloc_instance(32, class_id()).unwrap();
        let b = heap.alloc_instance(32, class_id()).unwrap();
        let c = heap.alloc_instance(32, class_id()).unwrap();
        let _keep = heap.alloc_instance(32, class_id()).unwrap();
        let size_a = heap.block_size(a);
        let size_b = heap.block_size(b);
        let size_c = heap.block_size(c);
        heap.release_chunk(a, size_a);
        heap.release_chunk(c, size_c);
        heap.release_chunk(b, size_b);
        assert_conservation(&heap);
        // a..c collapsed into one chunk.
        assert_eq!(heap.block_size(a), size_a + size_b + size_c);
    }

    #[test]
    fn array_layout_round_trips() {
        let mut heap = small_heap();
        let arr = heap
            .alloc_primitive_array(class_id(), ArrayType::Int, 5)
            .unwrap();
        assert_eq!(heap.get_array_length(arr).unwrap(), 5);
        heap.write_array_element(arr, 3, Value::Integer(99)).unwrap();
        assert_eq!(
            heap.read_array_element(arr, 3).unwrap().as_int().unwrap(),
            99
        );
        assert!(heap.write_array_element(arr, 5, Value::Integer(0)).is_err());
        assert!(heap.read_array_element(arr, -1).is_err());
        assert_eq!(heap.get_int_array_slice(arr).unwrap()[3], 99);
    }

    #[test]
    fn instances_are_not_arrays() {
        let mut heap = small_heap();
        let obj = heap.alloc_instance(16, class_id()).unwrap();
        assert!(heap.array_kind(obj).is_none());
        assert!(heap.get_array_length(obj).is_err());
    }

    #[test]
    fn hashcode_is_stable_before_move() {
        let mut heap = small_heap();
        let obj = heap.alloc_instance(8, class_id()).unwrap();
        let h1 = heap.identity_hashcode(obj);
        let h2 = heap.identity_hashcode(obj);
        assert_eq!(h1, h2);
        assert!(heap.has_flag(obj, HASHCODE_TAKEN_BIT));
    }

    #[test]
    fn object_fields_round_trip() {
        let mut heap = small_heap();
        let obj = heap.alloc_instance(24, class_id()).unwrap();
        heap.write_field(obj, 0, Value::Ref(obj), AllocationType::Reference)
            .unwrap();
        heap.write_field(obj, 8, Value::Long(-1), AllocationType::Long)
            .unwrap();
        heap.write_field(obj, 16, Value::Integer(7), AllocationType::Int)
            .unwrap();
        assert_eq!(
            heap.read_field(obj, 0, AllocationType::Reference)
                .unwrap()
                .as_obj_ref()
                .unwrap(),
            obj
        );
        assert_eq!(
            heap.read_field(obj, 8, AllocationType::Long)
                .unwrap()
                .as_long()
                .unwrap(),
            -1
        );
        assert_eq!(
            heap.read_field(obj, 16, AllocationType::Int)
                .unwrap()
                .as_int()
                .unwrap(),
            7
        );
    }
}
