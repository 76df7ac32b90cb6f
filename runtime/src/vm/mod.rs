use crate::VmConfig;
use crate::class_loader::{BootstrapClassLoader, ClassBytesSource};
use crate::class_loader::system::DirectoryClassSource;
use crate::error::{JavaExceptionFromJvm, JavaExceptionKind, JvmError};
use crate::heap::gc::{Collector, CollectorQueues, GcContext, GcOptions, GcOutcome};
use crate::heap::method_area::MethodArea;
use crate::heap::{FLC_BIT, Heap, HeapRef, SPECIAL_BIT};
use crate::interpreter::Interpreter;
use crate::interpreter::prepare::PreparedCode;
use crate::keys::{ClassId, FullyQualifiedMethodKey, MethodId, Symbol};
use crate::native::NativeFn;
use crate::native::dll::{
    DllCache, NativeLibraryLoader, mangle_native_name, mangle_native_name_with_descriptor,
};
use crate::rt::JvmClass;
use crate::sync::{MonitorTable, ObjectLocks, WaitOutcome};
use crate::thread::{
    BlockedRegion, JavaThreadState, ThreadRegistry, ThreadState, VmThreadHandle,
};
use crate::{build_exception, debug_log, throw_exception};
use bonsai_classfile::descriptor::{AllocationType, ArrayType};
use lasso::ThreadedRodeo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tracing_log::log::warn;

pub mod bootstrap_registry;
pub mod stack;
pub mod throw;

use bootstrap_registry::BootstrapRegistry;

/// Stack operands, locals, arguments and static field slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(HeapRef),
    /// Pushed by `jsr`, consumed by `ret`.
    ReturnAddress(usize),
    Null,
}

impl Value {
    pub fn as_nullable_obj_ref(&self) -> Result<Option<HeapRef>, JvmError> {
        match self {
            Value::Ref(addr) => Ok(Some(*addr)),
            Value::Null => Ok(None),
            other => Err(JvmError::UnexpectedType(format!(
                "expected reference, found {:?}",
                other
            ))),
        }
    }

    pub fn as_obj_ref(&self) -> Result<HeapRef, JvmError> {
        match self {
            Value::Ref(addr) => Ok(*addr),
            Value::Null => throw_exception!(NullPointerException),
            other => Err(JvmError::UnexpectedType(format!(
                "expected reference, found {:?}",
                other
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i32, JvmError> {
        match self {
            Value::Integer(v) => Ok(*v),
            other => Err(JvmError::UnexpectedType(format!(
                "expected int, found {:?}",
                other
            ))),
        }
    }

    pub fn as_long(&self) -> Result<i64, JvmError> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(JvmError::UnexpectedType(format!(
                "expected long, found {:?}",
                other
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f32, JvmError> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(JvmError::UnexpectedType(format!(
                "expected float, found {:?}",
                other
            ))),
        }
    }

    pub fn as_double(&self) -> Result<f64, JvmError> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(JvmError::UnexpectedType(format!(
                "expected double, found {:?}",
                other
            ))),
        }
    }

    /// Category-2 in the JVMS sense: occupies two local slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }
}

impl From<&bonsai_classfile::descriptor::JavaType> for Value {
    fn from(jtype: &bonsai_classfile::descriptor::JavaType) -> Self {
        use bonsai_classfile::descriptor::{JavaType, PrimitiveType};
        match jtype {
            JavaType::Primitive(PrimitiveType::Double) => Value::Double(0.0),
            JavaType::Primitive(PrimitiveType::Float) => Value::Float(0.0),
            JavaType::Primitive(PrimitiveType::Long) => Value::Long(0),
            JavaType::Primitive(_) => Value::Integer(0),
            JavaType::Instance(_) | JavaType::Array(_) => Value::Null,
        }
    }
}

/// The allocator's escalation ladder, shared by every allocating thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocState {
    Gc,
    RunFinalizers,
    ThrowOom,
}

/// One process-wide VM instance owning every subsystem and their locks.
pub struct VirtualMachine {
    config: VmConfig,
    interner: Arc<ThreadedRodeo>,
    heap: RwLock<Heap>,
    method_area: RwLock<MethodArea>,
    pub br: Arc<BootstrapRegistry>,
    pub native_registry: crate::native::NativeRegistry,
    /// The §6 dynamic-loader collaborator, installed by the embedder;
    /// without one, unresolved natives stay UnsatisfiedLinkError.
    native_loader: Mutex<Option<Box<dyn NativeLibraryLoader>>>,
    dll_cache: DllCache,
    pub monitors: MonitorTable,
    threads: ThreadRegistry,
    queues: CollectorQueues,
    collector: Mutex<Collector>,
    alloc_state: Mutex<AllocState>,
    /// VM-held strong references: JNI-style globals plus the pre-allocated
    /// OutOfMemoryError.
    globals: Mutex<Vec<HeapRef>>,
    oom_object: Mutex<Option<HeapRef>>,
    class_init_lock: Mutex<()>,
    class_init_cond: Condvar,
    exit_hooks: Mutex<Vec<HeapRef>>,
    booted: AtomicBool,
    started_at: Instant,
    self_ref: Weak<VirtualMachine>,
}

impl VirtualMachine {
    /// Maps the heap, seeds the caches, loads the well-known classes.
    pub fn boot(
        config: VmConfig,
        sources: Vec<Box<dyn ClassBytesSource>>,
    ) -> Result<Arc<Self>, JvmError> {
        let interner = Arc::new(ThreadedRodeo::default());
        let heap = Heap::new(
            config.initial_heap_size,
            config.max_heap_size,
            interner.clone(),
        )?;
        let loader = BootstrapClassLoader::new(sources);
        let (method_area, br) = MethodArea::init(loader, interner.clone());
        let max_heap = config.max_heap_size;

        let vm = Arc::new_cyclic(|self_ref| Self {
            native_registry: crate::native::NativeRegistry::new(interner.clone()),
            native_loader: Mutex::new(None),
            dll_cache: DllCache::new(),
            config,
            interner,
            heap: RwLock::new(heap),
            method_area: RwLock::new(method_area),
            br,
            monitors: MonitorTable::new(),
            threads: ThreadRegistry::new(),
            queues: CollectorQueues::new(),
            collector: Mutex::new(Collector::new(max_heap)),
            alloc_state: Mutex::new(AllocState::Gc),
            globals: Mutex::new(Vec::new()),
            oom_object: Mutex::new(None),
            class_init_lock: Mutex::new(()),
            class_init_cond: Condvar::new(),
            exit_hooks: Mutex::new(Vec::new()),
            booted: AtomicBool::new(false),
            started_at: Instant::now(),
            self_ref: self_ref.clone(),
        });

        vm.method_area_write().preload_basic_classes()?;
        Ok(vm)
    }

    /// Boot, attach the main thread, run `main`, wait for non-daemon
    /// threads and report the exit status.
    pub fn start(config: VmConfig) -> Result<i32, JvmError> {
        let sources: Vec<Box<dyn ClassBytesSource>> = config
            .class_path
            .iter()
            .map(|root| Box::new(DirectoryClassSource::new(root)) as Box<dyn ClassBytesSource>)
            .collect();
        let vm = Self::boot(config, sources)?;
        let mut main_thread = vm.attach_main_thread()?;
        vm.preallocate_oom(&mut main_thread);
        vm.start_vm_threads();
        vm.booted.store(true, Ordering::Release);

        let status = vm.run_main(&mut main_thread);

        {
            let _region = BlockedRegion::enter_as(
                vm.threads(),
                &main_thread.handle,
                ThreadState::Waiting,
            );
            vm.threads().detach(&main_thread.handle);
            vm.threads().await_non_daemon_exit(false);
        }
        status
    }

    fn run_main(self: &Arc<Self>, thread: &mut JavaThreadState) -> Result<i32, JvmError> {
        let main_sym = self.interner.get_or_intern(&self.config.main_class);
        let class_id = self
            .method_area_write()
            .get_class_id_or_load(main_sym)
            .map_err(|_| JvmError::MainClassNotFound(self.config.main_class.clone()))?;
        let method_id = {
            let ma = self.method_area_read();
            match ma.get_class(&class_id) {
                JvmClass::Instance(instance) => instance.lookup_method(&self.br.main_mk),
                _ => None,
            }
        }
        .ok_or_else(|| JvmError::MainClassNotFound(self.config.main_class.clone()))?;

        let string_array_sym = self.interner.get_or_intern("[Ljava/lang/String;");
        let string_array_class = self
            .method_area_write()
            .get_class_id_or_load(string_array_sym)?;
        let args_array = self.alloc_object_array(thread, string_array_class, 0)?;

        match Interpreter::invoke_static_method(
            thread,
            method_id,
            self,
            vec![Value::Ref(args_array)],
        ) {
            Ok(_) => Ok(0),
            Err(e) => {
                eprintln!(
                    "Exception in thread \"main\" {}",
                    self.describe_throwable(e)
                );
                Ok(1)
            }
        }
    }

    pub fn attach_main_thread(self: &Arc<Self>) -> Result<JavaThreadState, JvmError> {
        let handle = self.threads.register("main".to_string(), false);
        let mut thread = JavaThreadState::new(handle, self.config.frame_stack_depth);
        // The Java-level Thread object for the initial thread.
        if let Ok(thread_class) = self.br.get_java_lang_thread_id() {
            let size = self
                .method_area_read()
                .get_instance_class(&thread_class)?
                .get_instance_size()?;
            let obj = self.alloc_instance_for_class(&mut thread, thread_class, size)?;
            thread.handle.set_thread_obj(obj);
        }
        Ok(thread)
    }

    fn preallocate_oom(self: &Arc<Self>, thread: &mut JavaThreadState) {
        let sym = self
            .interner
            .get_or_intern(JavaExceptionKind::OutOfMemoryError.class_name());
        let result = (|| -> Result<HeapRef, JvmError> {
            let class_id = self.method_area_write().get_class_id_or_load(sym)?;
            let size = self
                .method_area_read()
                .get_instance_class(&class_id)?
                .get_instance_size()?;
            self.alloc_instance_for_class(thread, class_id, size)
        })();
        match result {
            Ok(obj) => {
                self.globals.lock().unwrap().push(obj);
                *self.oom_object.lock().unwrap() = Some(obj);
            }
            Err(_) => warn!("could not pre-allocate OutOfMemoryError"),
        }
    }

    /// Finalizer and reference-handler service threads. Both sit in
    /// blocking regions while idle so they never hold up a collection.
    pub fn start_vm_threads(self: &Arc<Self>) {
        if !self.config.enable_finalizers {
            return;
        }
        let vm = self.clone();
        std::thread::spawn(move || vm.finalizer_loop());
        let vm = self.clone();
        std::thread::spawn(move || vm.reference_handler_loop());
    }

    fn finalizer_loop(self: Arc<Self>) {
        let handle = self.threads.register("Finalizer".to_string(), true);
        let mut thread = JavaThreadState::new(handle, self.config.frame_stack_depth);
        loop {
            let obj = {
                let _region = BlockedRegion::enter(self.threads(), &thread.handle);
                self.queues.pop_finalizable(true)
            };
            let Some(obj) = obj else { continue };
            let result = Interpreter::invoke_virtual_by_key(
                &mut thread,
                &self.br.finalize_mk,
                &self,
                vec![Value::Ref(obj)],
            );
            if let Err(e) = result {
                // Deliberately swallowed, surfaced only as a warning.
                warn!(
                    "exception discarded from finalizer: {}",
                    self.describe_throwable(e)
                );
            }
            if self.queues.finalize_queue_is_empty() {
                self.queues.note_finalizer_pass();
            }
        }
    }

    fn reference_handler_loop(self: Arc<Self>) {
        let handle = self.threads.register("Reference Handler".to_string(), true);
        let thread = JavaThreadState::new(handle, self.config.frame_stack_depth);
        loop {
            let reference = {
                let _region = BlockedRegion::enter(self.threads(), &thread.handle);
                self.queues.pop_pending_ref(true)
            };
            let Some(reference) = reference else { continue };
            if let Err(e) = self.enqueue_reference(reference) {
                warn!("reference enqueue failed: {}", e);
            }
        }
    }

    /// Appends a cleared reference to its queue object's intrusive list
    /// and detaches it from the queue so it can only be enqueued once.
    ///
    /// Lock order everywhere in the VM: method area before heap.
    fn enqueue_reference(&self, reference: HeapRef) -> Result<(), JvmError> {
        let class_id = self.heap_read().get_class_id(reference)?;
        let (queue_offset, next_offset) = {
            let ma = self.method_area_read();
            let instance = ma.get_instance_class(&class_id)?;
            let queue = instance
                .lookup_instance_field(&self.br.reference_queue_fk)
                .map(|f| f.offset);
            let next = instance
                .lookup_instance_field(&self.br.reference_next_fk)
                .map(|f| f.offset);
            match (queue, next) {
                (Some(q), Some(n)) => (q, n),
                _ => return Ok(()),
            }
        };
        let queue = match self
            .heap_read()
            .read_field(reference, queue_offset, AllocationType::Reference)?
        {
            Value::Ref(q) => q,
            _ => return Ok(()),
        };
        let queue_class = self.heap_read().get_class_id(queue)?;
        let head_offset = {
            let ma = self.method_area_read();
            match ma
                .get_instance_class(&queue_class)
                .ok()
                .and_then(|c| c.lookup_instance_field(&self.br.queue_head_fk))
            {
                Some(field) => field.offset,
                None => return Ok(()),
            }
        };
        let mut heap = self.heap_write();
        let head = heap.read_field(queue, head_offset, AllocationType::Reference)?;
        heap.write_field(reference, next_offset, head, AllocationType::Reference)?;
        heap.write_field(queue, head_offset, Value::Ref(reference), AllocationType::Reference)?;
        heap.write_field(reference, queue_offset, Value::Null, AllocationType::Reference)?;
        Ok(())
    }

    pub fn reference_queue_poll(&self, queue: HeapRef) -> Result<Value, JvmError> {
        let queue_class = self.heap_read().get_class_id(queue)?;
        let head_field_offset = {
            let ma = self.method_area_read();
            match ma
                .get_instance_class(&queue_class)
                .ok()
                .and_then(|c| c.lookup_instance_field(&self.br.queue_head_fk))
            {
                Some(field) => field.offset,
                None => return Ok(Value::Null),
            }
        };
        let reference = match self
            .heap_read()
            .read_field(queue, head_field_offset, AllocationType::Reference)?
        {
            Value::Ref(r) => r,
            _ => return Ok(Value::Null),
        };
        let ref_class = self.heap_read().get_class_id(reference)?;
        let next_offset = {
            let ma = self.method_area_read();
            ma.get_instance_class(&ref_class)
                .ok()
                .and_then(|c| c.lookup_instance_field(&self.br.reference_next_fk))
                .map(|f| f.offset)
        };
        let mut heap = self.heap_write();
        let next = match next_offset {
            Some(offset) => heap.read_field(reference, offset, AllocationType::Reference)?,
            None => Value::Null,
        };
        heap.write_field(queue, head_field_offset, next, AllocationType::Reference)?;
        if let Some(offset) = next_offset {
            heap.write_field(reference, offset, Value::Null, AllocationType::Reference)?;
        }
        Ok(Value::Ref(reference))
    }

    pub fn reference_referent_offset(&self, reference: HeapRef) -> Result<usize, JvmError> {
        let class_id = self.heap_read().get_class_id(reference)?;
        let ma = self.method_area_read();
        Ok(ma
            .get_instance_class(&class_id)?
            .get_instance_field(&self.br.reference_referent_fk)?
            .offset)
    }

    // ---- accessors ----

    pub fn heap_read(&self) -> RwLockReadGuard<'_, Heap> {
        self.heap.read().unwrap()
    }

    pub fn heap_write(&self) -> RwLockWriteGuard<'_, Heap> {
        self.heap.write().unwrap()
    }

    pub fn method_area_read(&self) -> RwLockReadGuard<'_, MethodArea> {
        self.method_area.read().unwrap()
    }

    pub fn method_area_write(&self) -> RwLockWriteGuard<'_, MethodArea> {
        self.method_area.write().unwrap()
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn queues(&self) -> &CollectorQueues {
        &self.queues
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn class_init_lock(&self) -> &Mutex<()> {
        &self.class_init_lock
    }

    pub fn class_init_cond(&self) -> &Condvar {
        &self.class_init_cond
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn arc(&self) -> Arc<VirtualMachine> {
        self.self_ref.upgrade().expect("VM dropped while in use")
    }

    pub fn prepared_code(&self, method_id: MethodId) -> Result<*const PreparedCode, JvmError> {
        let ma = self.method_area_read();
        let prepared = ma.get_method(&method_id).code_body()?.prepared_code()?;
        Ok(prepared as *const PreparedCode)
    }

    pub fn pretty_method_name(&self, method_id: &MethodId) -> String {
        let ma = self.method_area_read();
        let method = ma.get_method(method_id);
        let class = ma.get_class(&method.class_id());
        format!(
            "{}.{}{}",
            self.interner.resolve(&class.get_name()).replace('/', "."),
            self.interner.resolve(&method.name),
            self.interner.resolve(&method.desc)
        )
    }

    // ---- allocation with collection retry ----

    /// Every allocation that may trigger a collection funnels through
    /// here: try, reclaim, retry, escalating per the allocator ladder.
    fn allocate_with_gc(
        &self,
        thread: &mut JavaThreadState,
        request: &mut dyn FnMut(&mut Heap) -> Result<HeapRef, JvmError>,
    ) -> Result<HeapRef, JvmError> {
        loop {
            let needed = {
                let mut heap = self.heap_write();
                match request(&mut heap) {
                    Ok(obj) => return Ok(obj),
                    Err(JvmError::HeapExhausted(n)) => n,
                    Err(other) => return Err(other),
                }
            };
            self.reclaim_for_allocation(thread, needed)?;
        }
    }

    /// The escalation ladder. Its position is shared: a thread that fails
    /// while another already escalated skips the rungs that were tried.
    fn reclaim_for_allocation(
        &self,
        thread: &mut JavaThreadState,
        needed: usize,
    ) -> Result<(), JvmError> {
        let mut rung = *self.alloc_state.lock().unwrap();
        loop {
            match rung {
                AllocState::Gc => {
                    debug_log!("allocation of {} bytes failed, collecting", needed);
                    let outcome = self.collect(
                        thread,
                        GcOptions {
                            keep_soft: true,
                            compact: false,
                        },
                    );
                    if self.allocation_satisfied(needed, &outcome) {
                        *self.alloc_state.lock().unwrap() = AllocState::Gc;
                        return Ok(());
                    }
                    rung = AllocState::RunFinalizers;
                    *self.alloc_state.lock().unwrap() = rung;
                }
                AllocState::RunFinalizers => {
                    // Give outstanding finalizers a bounded chance to free
                    // something, then compact.
                    self.queues.await_finalizer_pass(Duration::from_millis(200));
                    let outcome = self.collect(
                        thread,
                        GcOptions {
                            keep_soft: true,
                            compact: true,
                        },
                    );
                    if self.allocation_satisfied(needed, &outcome) {
                        *self.alloc_state.lock().unwrap() = AllocState::Gc;
                        return Ok(());
                    }
                    {
                        let mut heap = self.heap_write();
                        if heap.limit() < heap.max_size() {
                            heap.expand(needed);
                            *self.alloc_state.lock().unwrap() = AllocState::Gc;
                            return Ok(());
                        }
                    }
                    // Last resort before OOM: clear soft references.
                    let outcome = self.collect(
                        thread,
                        GcOptions {
                            keep_soft: false,
                            compact: true,
                        },
                    );
                    if needed <= outcome.largest_free {
                        *self.alloc_state.lock().unwrap() = AllocState::Gc;
                        return Ok(());
                    }
                    rung = AllocState::ThrowOom;
                    *self.alloc_state.lock().unwrap() = rung;
                }
                AllocState::ThrowOom => {
                    *self.alloc_state.lock().unwrap() = AllocState::Gc;
                    return Err(self.out_of_memory_error());
                }
            }
        }
    }

    /// Retry only pays off when the request fits and at least a quarter of
    /// the heap came back; anything less and we escalate to avoid gc
    /// thrash.
    fn allocation_satisfied(&self, needed: usize, outcome: &GcOutcome) -> bool {
        needed <= outcome.largest_free
            && outcome.free_bytes * 4 >= self.heap_read().usable_size()
    }

    fn out_of_memory_error(&self) -> JvmError {
        match *self.oom_object.lock().unwrap() {
            Some(obj) => JvmError::JavaExceptionThrown(obj),
            None => build_exception!(OutOfMemoryError, "Java heap space"),
        }
    }

    pub fn preallocated_oom(&self) -> Option<HeapRef> {
        *self.oom_object.lock().unwrap()
    }

    /// Stop-the-world collection. The caller must not hold the heap or
    /// method-area locks.
    pub fn collect(&self, thread: &mut JavaThreadState, opts: GcOptions) -> GcOutcome {
        self.threads.suspend_all_threads(thread.id);
        let outcome = {
            let mut heap = self.heap_write();
            let mut ma = self.method_area_write();
            let mut collector = self.collector.lock().unwrap();
            let mut globals = self.globals.lock().unwrap();
            let mut ctx = GcContext {
                heap: &mut heap,
                method_area: &mut ma,
                threads: &self.threads,
                monitors: &self.monitors,
                queues: &self.queues,
                globals: &mut globals,
                self_stack: &mut thread.stack,
                self_id: thread.id,
            };
            collector.collect(&mut ctx, opts)
        };
        self.threads.resume_all_threads(thread.id);
        self.queues.wake_all();
        outcome
    }

    pub fn request_gc(&self, thread: &mut JavaThreadState) {
        self.collect(
            thread,
            GcOptions {
                keep_soft: true,
                compact: false,
            },
        );
    }

    // ---- typed allocation helpers ----

    pub fn alloc_instance_for_class(
        &self,
        thread: &mut JavaThreadState,
        class_id: ClassId,
        size: usize,
    ) -> Result<HeapRef, JvmError> {
        let obj =
            self.allocate_with_gc(thread, &mut |heap| heap.alloc_instance(size, class_id))?;
        let (special, finalizable) = {
            let ma = self.method_area_read();
            let class = ma.get_class(&class_id);
            let special = class.reference_kind().is_some()
                || self
                    .br
                    .get_java_lang_thread_id()
                    .is_ok_and(|t| ma.is_subclass_of(class_id, t))
                || self
                    .br
                    .get_java_lang_throwable_id()
                    .is_ok_and(|t| ma.is_subclass_of(class_id, t));
            (special, class.has_finalizer())
        };
        let mut heap = self.heap_write();
        if special {
            heap.set_flag(obj, SPECIAL_BIT);
        }
        if finalizable {
            // Finalizable objects register at creation.
            heap.register_finalizable(obj);
        }
        Ok(obj)
    }

    pub fn alloc_instance_auto(
        &self,
        thread: &mut JavaThreadState,
        class_id: ClassId,
    ) -> Result<HeapRef, JvmError> {
        let size = self
            .method_area_read()
            .get_instance_class(&class_id)?
            .get_instance_size()?;
        self.alloc_instance_for_class(thread, class_id, size)
    }

    pub fn alloc_primitive_array(
        &self,
        thread: &mut JavaThreadState,
        array_type: ArrayType,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        let name = self.interner.get_or_intern(array_type.descriptor());
        let class_id = self.method_area_write().load_array_class(name)?;
        self.allocate_with_gc(thread, &mut |heap| {
            heap.alloc_primitive_array(class_id, array_type, length)
        })
    }

    pub fn alloc_object_array(
        &self,
        thread: &mut JavaThreadState,
        class_id: ClassId,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        self.allocate_with_gc(thread, &mut |heap| heap.alloc_object_array(class_id, length))
    }

    /// Array allocation keyed by the array class itself.
    pub fn alloc_object_array_or_primitive(
        &self,
        thread: &mut JavaThreadState,
        class_id: ClassId,
        length: i32,
    ) -> Result<HeapRef, JvmError> {
        let element = {
            let ma = self.method_area_read();
            match ma.get_class(&class_id) {
                JvmClass::PrimitiveArray(array) => Some(array.element_type),
                _ => None,
            }
        };
        match element {
            Some(primitive) => self.allocate_with_gc(thread, &mut |heap| {
                heap.alloc_array_for_kind(class_id, primitive.into(), length)
            }),
            None => self.alloc_object_array(thread, class_id, length),
        }
    }

    pub fn clone_with_gc(
        &self,
        thread: &mut JavaThreadState,
        obj: HeapRef,
    ) -> Result<HeapRef, JvmError> {
        // Pin the source: a collection between the failure and the retry
        // must neither free nor move it.
        thread.handle.push_local_ref(obj);
        let result = self.allocate_with_gc(thread, &mut |heap| heap.clone_object(obj));
        thread.handle.pop_local_ref();
        result
    }

    // ---- strings ----

    pub fn alloc_string(
        &self,
        thread: &mut JavaThreadState,
        text: &str,
    ) -> Result<HeapRef, JvmError> {
        let string_class = self.br.get_java_lang_string_id()?;
        let byte_class = self.br.get_byte_array_class_id()?;
        let (value_offset, coder_offset, size) = {
            let ma = self.method_area_read();
            let class = ma.get_instance_class(&string_class)?;
            (
                class.get_instance_field(&self.br.string_value_fk)?.offset,
                class.get_instance_field(&self.br.string_coder_fk)?.offset,
                class.get_instance_size()?,
            )
        };

        // Latin-1 when every char fits a byte, UTF-16 otherwise.
        let latin1 = text.chars().all(|c| (c as u32) <= 0xFF);
        let bytes: Vec<u8> = if latin1 {
            text.chars().map(|c| c as u8).collect()
        } else {
            text.encode_utf16().flat_map(u16::to_le_bytes).collect()
        };
        let coder = if latin1 { Heap::LATIN1 } else { Heap::UTF16 };

        let array = self.allocate_with_gc(thread, &mut |heap| {
            heap.alloc_primitive_array(byte_class, ArrayType::Byte, bytes.len() as i32)
        })?;
        {
            let mut heap = self.heap_write();
            let slice = heap.get_byte_array_slice_mut(array)?;
            for (dst, src) in slice.iter_mut().zip(bytes.iter()) {
                *dst = *src as i8;
            }
        }

        // The value array must survive a collection triggered by the
        // instance allocation.
        thread.handle.push_local_ref(array);
        let instance = self
            .allocate_with_gc(thread, &mut |heap| heap.alloc_instance(size, string_class));
        let array = thread.handle.pop_local_ref().unwrap_or(array);
        let instance = instance?;

        let mut heap = self.heap_write();
        heap.write_field(instance, value_offset, Value::Ref(array), AllocationType::Reference)?;
        heap.write_field(instance, coder_offset, Value::Integer(coder), AllocationType::Byte)?;
        Ok(instance)
    }

    /// The interned-string table: one canonical instance per symbol. A
    /// racing insert wins and the loser's instance becomes garbage.
    pub fn intern_string(
        &self,
        thread: &mut JavaThreadState,
        sym: Symbol,
    ) -> Result<HeapRef, JvmError> {
        if let Some(existing) = self.heap_read().lookup_interned(sym) {
            return Ok(existing);
        }
        let text = self.interner.resolve(&sym).to_string();
        let instance = self.alloc_string(thread, &text)?;
        let mut heap = self.heap_write();
        if let Some(existing) = heap.lookup_interned(sym) {
            return Ok(existing);
        }
        heap.intern_string(sym, instance);
        Ok(instance)
    }

    pub fn read_java_string(&self, obj: HeapRef) -> Result<String, JvmError> {
        let string_class = self.br.get_java_lang_string_id()?;
        let (value_offset, coder_offset) = {
            let ma = self.method_area_read();
            let class = ma.get_instance_class(&string_class)?;
            (
                class.get_instance_field(&self.br.string_value_fk)?.offset,
                class.get_instance_field(&self.br.string_coder_fk)?.offset,
            )
        };
        let heap = self.heap_read();
        let array = heap
            .read_field(obj, value_offset, AllocationType::Reference)?
            .as_obj_ref()?;
        let coder = heap.read_field(obj, coder_offset, AllocationType::Byte)?.as_int()?;
        let bytes = heap.get_byte_array_slice(array)?;
        match coder {
            Heap::LATIN1 => Ok(bytes.iter().map(|b| *b as u8 as char).collect()),
            Heap::UTF16 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0] as u8, pair[1] as u8]))
                    .collect();
                Ok(String::from_utf16_lossy(&units))
            }
            other => Err(JvmError::IllegalInternalState(format!(
                "unknown string coder {}",
                other
            ))),
        }
    }

    // ---- mirrors ----

    pub fn mirror_for(
        &self,
        thread: &mut JavaThreadState,
        class_id: ClassId,
    ) -> Result<HeapRef, JvmError> {
        loop {
            let needed = {
                let mut ma = self.method_area_write();
                let mut heap = self.heap_write();
                match ma.get_mirror_ref_or_create(class_id, &mut heap) {
                    Ok(mirror) => return Ok(mirror),
                    Err(JvmError::HeapExhausted(n)) => n,
                    Err(other) => return Err(other),
                }
            };
            self.reclaim_for_allocation(thread, needed)?;
        }
    }

    // ---- object locking ----

    fn lockword_ptr(&self, obj: HeapRef) -> *const std::sync::atomic::AtomicU32 {
        self.heap_read().lockword(obj) as *const _
    }

    /// Object monitor entry. The object is pinned for the duration: the
    /// thread may block, a collection may run, and the lockword pointer
    /// must stay valid throughout.
    pub fn lock_object(&self, thread: &JavaThreadState, obj: HeapRef) {
        let lockword = self.lockword_ptr(obj);
        thread.handle.push_local_ref(obj);
        {
            let _region = BlockedRegion::enter(&self.threads, &thread.handle);
            ObjectLocks::lock(&self.monitors, unsafe { &*lockword }, obj, thread.id);
        }
        thread.handle.pop_local_ref();
        if unsafe { &*lockword }.load(Ordering::Acquire) & crate::sync::SHAPE_BIT != 0 {
            self.heap_write().set_flag(obj, FLC_BIT);
        }
    }

    pub fn unlock_object(&self, thread: &JavaThreadState, obj: HeapRef) -> Result<(), JvmError> {
        let lockword = self.lockword_ptr(obj);
        ObjectLocks::unlock(&self.monitors, unsafe { &*lockword }, obj, thread.id)
    }

    pub fn holds_lock(&self, thread: &JavaThreadState, obj: HeapRef) -> bool {
        let lockword = self.lockword_ptr(obj);
        ObjectLocks::holds_lock(&self.monitors, unsafe { &*lockword }, thread.id)
    }

    pub fn object_wait(
        &self,
        thread: &JavaThreadState,
        obj: HeapRef,
        timeout: Option<Duration>,
    ) -> Result<(), JvmError> {
        let lockword = self.lockword_ptr(obj);
        let monitor_id =
            ObjectLocks::ensure_fat(&self.monitors, unsafe { &*lockword }, obj, thread.id)?;
        self.heap_write().set_flag(obj, FLC_BIT);
        thread.handle.set_wait_monitor(Some(monitor_id));
        thread.handle.push_local_ref(obj);
        let outcome = {
            let state = if timeout.is_some() {
                ThreadState::TimedWaiting
            } else {
                ThreadState::Waiting
            };
            let _region = BlockedRegion::enter_as(&self.threads, &thread.handle, state);
            ObjectLocks::wait(
                &self.monitors,
                monitor_id,
                thread.id,
                timeout,
                &thread.handle.interrupted,
            )
        };
        thread.handle.pop_local_ref();
        thread.handle.set_wait_monitor(None);
        match outcome? {
            WaitOutcome::Interrupted => throw_exception!(InterruptedException, "wait interrupted"),
            _ => Ok(()),
        }
    }

    pub fn object_notify(
        &self,
        thread: &JavaThreadState,
        obj: HeapRef,
        all: bool,
    ) -> Result<(), JvmError> {
        let lockword_ptr = self.lockword_ptr(obj);
        let lockword = unsafe { &*lockword_ptr };
        match crate::sync::fat_monitor_of(lockword) {
            Some(monitor_id) => {
                if all {
                    ObjectLocks::notify_all(&self.monitors, monitor_id, thread.id)
                } else {
                    ObjectLocks::notify(&self.monitors, monitor_id, thread.id)
                }
            }
            None => {
                // Thin lock: ownership check only, the wait set is empty.
                if !ObjectLocks::holds_lock(&self.monitors, lockword, thread.id) {
                    return throw_exception!(
                        IllegalMonitorStateException,
                        "notify without owning the monitor"
                    );
                }
                Ok(())
            }
        }
    }

    // ---- dynamically loaded natives ----

    pub fn install_native_loader(&self, loader: Box<dyn NativeLibraryLoader>) {
        *self.native_loader.lock().unwrap() = Some(loader);
    }

    /// Opens (or reuses) a library handle through the collaborator; the
    /// cache key is `(library, defining class loader)`.
    pub fn load_native_library(&self, library: &str, class_loader: Option<HeapRef>) -> bool {
        let guard = self.native_loader.lock().unwrap();
        let Some(loader) = guard.as_ref() else {
            return false;
        };
        self.dll_cache.open(loader.as_ref(), library, class_loader).is_some()
    }

    /// Lazy symbol binding for a native method the built-in table does not
    /// know: JNI short-name first, the descriptor-carrying long name as
    /// the overload fallback. A hit is registered so later calls skip the
    /// search.
    pub fn resolve_dynamic_native(&self, key: &FullyQualifiedMethodKey) -> Option<NativeFn> {
        let guard = self.native_loader.lock().unwrap();
        let loader = guard.as_ref()?;
        let class = self.interner.resolve(&key.class?);
        let name = self.interner.resolve(&key.name);
        let desc = self.interner.resolve(&key.desc);

        let short = mangle_native_name(class, name);
        let entry = self
            .dll_cache
            .search_symbol(loader.as_ref(), &short)
            .or_else(|| {
                let long = mangle_native_name_with_descriptor(class, name, desc);
                self.dll_cache.search_symbol(loader.as_ref(), &long)
            })?;
        self.native_registry.register_dynamic(*key, entry);
        Some(entry)
    }

    // ---- java threads ----

    pub fn handle_for_thread_obj(&self, thread_obj: HeapRef) -> Option<Arc<VmThreadHandle>> {
        self.threads
            .live_threads()
            .into_iter()
            .find(|handle| handle.thread_obj() == Some(thread_obj))
    }

    /// Thread.start0: spawns the native carrier and runs `run()` on it.
    pub fn spawn_java_thread(
        &self,
        parent: &mut JavaThreadState,
        thread_obj: HeapRef,
    ) -> Result<(), JvmError> {
        if self.handle_for_thread_obj(thread_obj).is_some() {
            return throw_exception!(IllegalThreadStateException, "thread already started");
        }
        let class_id = self.heap_read().get_class_id(thread_obj)?;
        let (name, daemon) = {
            let ma = self.method_area_read();
            let instance = ma.get_instance_class(&class_id)?;
            let name = instance
                .lookup_instance_field(&self.br.thread_name_fk)
                .map(|f| f.offset)
                .and_then(|offset| {
                    self.heap_read()
                        .read_field(thread_obj, offset, AllocationType::Reference)
                        .ok()
                })
                .and_then(|v| match v {
                    Value::Ref(s) => self.read_java_string(s).ok(),
                    _ => None,
                })
                .unwrap_or_else(|| "Thread".to_string());
            let daemon = instance
                .lookup_instance_field(&self.br.thread_daemon_fk)
                .map(|f| f.offset)
                .and_then(|offset| {
                    self.heap_read()
                        .read_field(thread_obj, offset, AllocationType::Boolean)
                        .ok()
                })
                .is_some_and(|v| v.as_int().unwrap_or(0) != 0);
            (name, daemon)
        };

        // Keep the Thread object alive until the child publishes it.
        parent.handle.push_local_ref(thread_obj);
        let vm = self.arc();
        let depth = self.config.frame_stack_depth;
        let parent_handle = parent.handle.clone();
        std::thread::spawn(move || {
            // Registration blocks while the world is stopped; the object
            // stays pinned through the parent until we hold it.
            let handle = vm.threads.register(name, daemon);
            handle.set_thread_obj(thread_obj);
            parent_handle.remove_local_ref(thread_obj);
            let mut thread = JavaThreadState::new(handle, depth);

            let result = Interpreter::invoke_virtual_by_key(
                &mut thread,
                &vm.br.run_mk,
                &vm,
                vec![Value::Ref(thread_obj)],
            );
            if let Err(e) = result {
                warn!(
                    "uncaught exception in thread: {}",
                    vm.describe_throwable(e)
                );
            }
            vm.threads.detach(&thread.handle);
        });
        Ok(())
    }

    pub fn join_thread(
        &self,
        thread: &JavaThreadState,
        thread_obj: HeapRef,
        timeout: Option<Duration>,
    ) -> Result<(), JvmError> {
        let Some(target) = self.handle_for_thread_obj(thread_obj) else {
            return Ok(());
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if thread.handle.interrupted.swap(false, Ordering::AcqRel) {
                return throw_exception!(InterruptedException, "join interrupted");
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(Duration::from_millis(50))
                }
                None => Duration::from_millis(50),
            };
            let done = {
                let _region = BlockedRegion::enter_as(
                    &self.threads,
                    &thread.handle,
                    ThreadState::TimedWaiting,
                );
                target.await_termination(Some(slice))
            };
            if done {
                return Ok(());
            }
        }
    }

    // ---- exit ----

    pub fn register_exit_hook(&self, runnable: HeapRef) {
        self.globals.lock().unwrap().push(runnable);
        self.exit_hooks.lock().unwrap().push(runnable);
    }

    /// Runs registered hooks (unless the VM is still coming up) and
    /// terminates the process.
    pub fn exit(&self, thread: &mut JavaThreadState, status: i32) -> ! {
        if self.booted.load(Ordering::Acquire) {
            let hooks: Vec<HeapRef> = self.exit_hooks.lock().unwrap().drain(..).collect();
            for hook in hooks {
                let result = Interpreter::invoke_virtual_by_key(
                    thread,
                    &self.br.run_mk,
                    self,
                    vec![Value::Ref(hook)],
                );
                if let Err(e) = result {
                    warn!("exit hook failed: {}", e);
                }
            }
        }
        std::process::exit(status);
    }

    pub fn describe_throwable(&self, error: JvmError) -> String {
        match error {
            JvmError::JavaExceptionThrown(obj) => {
                let name = self
                    .heap_read()
                    .get_class_id(obj)
                    .ok()
                    .map(|class_id| {
                        self.interner
                            .resolve(&self.method_area_read().get_class(&class_id).get_name())
                            .replace('/', ".")
                    })
                    .unwrap_or_else(|| "<unknown throwable>".to_string());
                let message = self.throwable_message(obj);
                match message {
                    Some(message) => format!("{}: {}", name, message),
                    None => name,
                }
            }
            other => other.into_pretty_string(&self.interner),
        }
    }

    fn throwable_message(&self, obj: HeapRef) -> Option<String> {
        let class_id = self.heap_read().get_class_id(obj).ok()?;
        let detail_fk = crate::keys::FieldKey {
            name: self.interner.get_or_intern("detailMessage"),
            desc: self.br.string_desc,
        };
        let offset = {
            let ma = self.method_area_read();
            ma.get_instance_class(&class_id)
                .ok()?
                .lookup_instance_field(&detail_fk)?
                .offset
        };
        match self
            .heap_read()
            .read_field(obj, offset, AllocationType::Reference)
            .ok()?
        {
            Value::Ref(s) => self.read_java_string(s).ok(),
            _ => None,
        }
    }

    pub fn materialize_exception(
        &self,
        thread: &mut JavaThreadState,
        desc: JavaExceptionFromJvm,
    ) -> Result<HeapRef, JvmError> {
        throw::materialize_exception(self, thread, desc)
    }
}
