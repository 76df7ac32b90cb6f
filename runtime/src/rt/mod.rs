use crate::error::JvmError;
use crate::heap::HeapRef;
use crate::keys::{ClassId, FieldKey, MethodKey, ThreadId};
use crate::rt::array::{ObjectArrayClass, PrimitiveArrayClass};
use crate::rt::class::InstanceClass;
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::{InstanceField, StaticField};
use crate::rt::interface::InterfaceClass;
use crate::vm::Value;
use crate::{MethodId, Symbol};
use bonsai_classfile::descriptor::PrimitiveType;
use bonsai_classfile::flags::ClassFlags;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

pub mod array;
pub mod class;
pub mod constant_pool;
pub mod field;
pub mod interface;
pub mod method;

/// Monotonic class life cycle. `Failed` is terminal: a `<clinit>` escaped
/// with a throwable and later initiators get NoClassDefFoundError.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    Loaded = 0,
    Linked = 1,
    Initializing = 2,
    Initialized = 3,
    Failed = 4,
}

impl From<u8> for ClassState {
    fn from(v: u8) -> Self {
        match v {
            0 => ClassState::Loaded,
            1 => ClassState::Linked,
            2 => ClassState::Initializing,
            3 => ClassState::Initialized,
            4 => ClassState::Failed,
            _ => unreachable!(),
        }
    }
}

/// Detected by name during linking so the collector can grade referents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

pub trait ClassLike {
    fn base(&self) -> &BaseClass;

    fn get_clinit_method_id(&self) -> Option<&MethodId> {
        self.base().clinit.get()
    }

    fn has_clinit(&self) -> bool {
        self.base().clinit.get().is_some()
    }

    fn name(&self) -> Symbol {
        self.base().name
    }

    fn flags(&self) -> ClassFlags {
        self.base().flags
    }

    fn get_super(&self) -> Option<ClassId> {
        self.base().super_id
    }

    fn get_source_file(&self) -> Option<Symbol> {
        self.base().source_file
    }

    fn set_mirror_ref(&self, heap_ref: HeapRef) {
        self.base().mirror_ref.store(heap_ref, Ordering::Release);
    }

    fn get_mirror_ref(&self) -> Option<HeapRef> {
        match self.base().mirror_ref.load(Ordering::Acquire) {
            0 => None,
            mirror => Some(mirror),
        }
    }

    fn get_interfaces(&self) -> Result<&HashSet<ClassId>, JvmError> {
        self.base().get_interfaces()
    }

    fn get_direct_interfaces(&self) -> Result<&HashSet<ClassId>, JvmError> {
        self.base().get_direct_interfaces()
    }

    fn has_static_field(&self, field_key: &FieldKey) -> bool {
        self.base()
            .static_field_index
            .get()
            .is_some_and(|map| map.contains_key(field_key))
    }

    fn static_field_slot(&self, field_key: &FieldKey) -> Option<usize> {
        self.base().static_field_index.get()?.get(field_key).copied()
    }

    fn static_field_by_slot(&self, slot: usize) -> Result<&StaticField, JvmError> {
        self.base()
            .get_static_fields()?
            .get(slot)
            .ok_or_else(|| JvmError::IllegalInternalState("static slot out of range".to_string()))
    }

    fn set_static_field_value(&self, field_key: &FieldKey, value: Value) -> Result<(), JvmError> {
        let slot = self.static_field_slot(field_key).ok_or_else(|| {
            JvmError::IllegalInternalState("no such static field".to_string())
        })?;
        *self.static_field_by_slot(slot)?.value.write().unwrap() = value;
        Ok(())
    }

    fn get_static_field_value(&self, field_key: &FieldKey) -> Result<Value, JvmError> {
        let slot = self.static_field_slot(field_key).ok_or_else(|| {
            JvmError::IllegalInternalState("no such static field".to_string())
        })?;
        Ok(*self.static_field_by_slot(slot)?.value.read().unwrap())
    }

    fn state(&self) -> ClassState {
        self.base().state.load(Ordering::Acquire).into()
    }

    fn set_linked(&self) {
        self.base()
            .state
            .store(ClassState::Linked as u8, Ordering::Release);
    }

    /// Records the initiating thread along with the state switch.
    fn begin_initializing(&self, thread_id: ThreadId) {
        self.base()
            .init_thread
            .store(thread_id.into_raw(), Ordering::Relaxed);
        self.base()
            .state
            .store(ClassState::Initializing as u8, Ordering::Release);
    }

    fn initializing_thread(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.base().init_thread.load(Ordering::Relaxed))
    }

    fn set_initialized(&self) {
        self.base().init_thread.store(0, Ordering::Relaxed);
        self.base()
            .state
            .store(ClassState::Initialized as u8, Ordering::Release);
    }

    fn set_failed(&self) {
        self.base().init_thread.store(0, Ordering::Relaxed);
        self.base()
            .state
            .store(ClassState::Failed as u8, Ordering::Release);
    }
}

pub struct BaseClass {
    name: Symbol,
    flags: ClassFlags,
    super_id: Option<ClassId>,
    state: AtomicU8,
    init_thread: AtomicU32,
    /// Heap address of the java/lang/Class mirror; rewritten when the
    /// compactor moves it, hence not a once-cell.
    mirror_ref: AtomicUsize,
    interfaces: OnceCell<HashSet<ClassId>>,
    direct_interfaces: OnceCell<HashSet<ClassId>>,
    static_fields: OnceCell<Vec<StaticField>>,
    static_field_index: OnceCell<HashMap<FieldKey, usize>>,
    clinit: OnceCell<MethodId>,
    source_file: Option<Symbol>,
    /// Set during linking for java/lang/ref subclasses.
    reference_kind: OnceCell<ReferenceKind>,
    /// The class (or a superclass) declares a non-trivial finalizer.
    has_finalizer: OnceCell<bool>,
}

impl BaseClass {
    pub fn new(
        name: Symbol,
        flags: ClassFlags,
        super_id: Option<ClassId>,
        source_file: Option<Symbol>,
    ) -> Self {
        Self {
            name,
            flags,
            super_id,
            source_file,
            state: AtomicU8::new(ClassState::Loaded as u8),
            init_thread: AtomicU32::new(0),
            mirror_ref: AtomicUsize::new(0),
            interfaces: OnceCell::new(),
            direct_interfaces: OnceCell::new(),
            static_fields: OnceCell::new(),
            static_field_index: OnceCell::new(),
            clinit: OnceCell::new(),
            reference_kind: OnceCell::new(),
            has_finalizer: OnceCell::new(),
        }
    }

    pub(crate) fn set_clinit(&self, method_id: MethodId) -> Result<(), JvmError> {
        self.clinit
            .set(method_id)
            .map_err(|_| JvmError::IllegalInternalState("clinit already set".to_string()))
    }

    pub(crate) fn get_interfaces(&self) -> Result<&HashSet<ClassId>, JvmError> {
        self.interfaces
            .get()
            .ok_or_else(|| JvmError::IllegalInternalState("interfaces not linked yet".to_string()))
    }

    pub(crate) fn get_direct_interfaces(&self) -> Result<&HashSet<ClassId>, JvmError> {
        self.direct_interfaces.get().ok_or_else(|| {
            JvmError::IllegalInternalState("direct interfaces not linked yet".to_string())
        })
    }

    pub(crate) fn set_interfaces(&self, interfaces: HashSet<ClassId>) -> Result<(), JvmError> {
        self.interfaces
            .set(interfaces)
            .map_err(|_| JvmError::IllegalInternalState("interfaces already set".to_string()))
    }

    pub(crate) fn set_direct_interfaces(
        &self,
        interfaces: HashSet<ClassId>,
    ) -> Result<(), JvmError> {
        self.direct_interfaces
            .set(interfaces)
            .map_err(|_| JvmError::IllegalInternalState("direct interfaces already set".to_string()))
    }

    pub(crate) fn set_static_fields(
        &self,
        fields: Vec<StaticField>,
        index: HashMap<FieldKey, usize>,
    ) -> Result<(), JvmError> {
        self.static_fields
            .set(fields)
            .map_err(|_| JvmError::IllegalInternalState("static fields already set".to_string()))?;
        self.static_field_index
            .set(index)
            .map_err(|_| JvmError::IllegalInternalState("static index already set".to_string()))
    }

    pub(crate) fn get_static_fields(&self) -> Result<&Vec<StaticField>, JvmError> {
        self.static_fields.get().ok_or_else(|| {
            JvmError::IllegalInternalState("static fields not prepared yet".to_string())
        })
    }

    pub(crate) fn set_reference_kind(&self, kind: ReferenceKind) {
        let _ = self.reference_kind.set(kind);
    }

    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        self.reference_kind.get().copied()
    }

    pub(crate) fn set_has_finalizer(&self, value: bool) {
        let _ = self.has_finalizer.set(value);
    }

    pub fn has_finalizer(&self) -> bool {
        self.has_finalizer.get().copied().unwrap_or(false)
    }
}

pub enum JvmClass {
    Instance(Box<InstanceClass>),
    Interface(Box<InterfaceClass>),
    Primitive(PrimitiveClass),
    PrimitiveArray(PrimitiveArrayClass),
    InstanceArray(ObjectArrayClass),
}

impl Display for JvmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JvmClass::Instance(_) => write!(f, "InstanceClass"),
            JvmClass::Interface(_) => write!(f, "InterfaceClass"),
            JvmClass::Primitive(_) => write!(f, "PrimitiveClass"),
            JvmClass::PrimitiveArray(_) => write!(f, "PrimitiveArrayClass"),
            JvmClass::InstanceArray(_) => write!(f, "ObjectArrayClass"),
        }
    }
}

impl JvmClass {
    pub fn as_class_like(&self) -> Result<&dyn ClassLike, JvmError> {
        match self {
            JvmClass::Instance(inst) => Ok(inst.as_ref()),
            JvmClass::Interface(i) => Ok(i.as_ref()),
            other => Err(JvmError::IllegalInternalState(format!(
                "{} has no class body",
                other
            ))),
        }
    }

    pub fn get_cp(&self) -> Result<&RuntimeConstantPool, JvmError> {
        match self {
            JvmClass::Instance(inst) => Ok(&inst.cp),
            JvmClass::Interface(i) => Ok(&i.cp),
            other => Err(JvmError::IllegalInternalState(format!(
                "{} has no constant pool",
                other
            ))),
        }
    }

    pub fn get_name(&self) -> Symbol {
        match self {
            JvmClass::Instance(ic) => ic.name(),
            JvmClass::Interface(i) => i.name(),
            JvmClass::PrimitiveArray(pac) => pac.name,
            JvmClass::InstanceArray(oac) => oac.name,
            JvmClass::Primitive(pc) => pc.name,
        }
    }

    pub fn get_super_id(&self) -> Option<ClassId> {
        match self {
            JvmClass::Instance(i) => i.get_super(),
            JvmClass::Interface(i) => i.get_super(),
            JvmClass::PrimitiveArray(arr) => Some(arr.super_id),
            JvmClass::InstanceArray(arr) => Some(arr.super_id),
            JvmClass::Primitive(_) => None,
        }
    }

    pub fn get_interfaces_opt(&self) -> Option<&HashSet<ClassId>> {
        match self {
            JvmClass::Instance(i) => i.get_interfaces().ok(),
            JvmClass::Interface(i) => i.get_interfaces().ok(),
            _ => None,
        }
    }

    pub fn get_mirror_ref(&self) -> Option<HeapRef> {
        match self {
            JvmClass::Instance(ic) => ic.get_mirror_ref(),
            JvmClass::Interface(i) => i.get_mirror_ref(),
            JvmClass::PrimitiveArray(pac) => pac.get_mirror_ref(),
            JvmClass::InstanceArray(oac) => oac.get_mirror_ref(),
            JvmClass::Primitive(pc) => pc.get_mirror_ref(),
        }
    }

    pub fn set_mirror_ref(&self, mirror: HeapRef) {
        match self {
            JvmClass::Instance(ic) => ic.set_mirror_ref(mirror),
            JvmClass::Interface(i) => i.set_mirror_ref(mirror),
            JvmClass::PrimitiveArray(pac) => pac.set_mirror_ref(mirror),
            JvmClass::InstanceArray(oac) => oac.set_mirror_ref(mirror),
            JvmClass::Primitive(pc) => pc.set_mirror_ref(mirror),
        }
    }

    pub fn get_vtable_method_id(&self, index: u16) -> Result<MethodId, JvmError> {
        match self {
            JvmClass::Instance(inst) => inst.vtable_entry(index),
            JvmClass::PrimitiveArray(arr) => arr.vtable_entry(index),
            JvmClass::InstanceArray(arr) => arr.vtable_entry(index),
            other => Err(JvmError::IllegalInternalState(format!(
                "{} has no method table",
                other
            ))),
        }
    }

    pub fn lookup_virtual(&self, key: &MethodKey) -> Option<MethodId> {
        match self {
            JvmClass::Instance(inst) => inst.lookup_virtual(key),
            JvmClass::PrimitiveArray(arr) => arr.lookup_virtual(key),
            JvmClass::InstanceArray(arr) => arr.lookup_virtual(key),
            JvmClass::Interface(_) | JvmClass::Primitive(_) => None,
        }
    }

    pub fn get_instance_fields(&self) -> &[InstanceField] {
        match self {
            JvmClass::Instance(ic) => ic
                .instance_fields
                .get()
                .map_or(&[], |fields| fields.as_slice()),
            _ => &[],
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, JvmClass::Primitive(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            JvmClass::PrimitiveArray(_) | JvmClass::InstanceArray(_)
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, JvmClass::Interface(_))
    }

    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        match self {
            JvmClass::Instance(ic) => ic.base().reference_kind(),
            _ => None,
        }
    }

    pub fn has_finalizer(&self) -> bool {
        match self {
            JvmClass::Instance(ic) => ic.base().has_finalizer(),
            _ => false,
        }
    }
}

pub struct PrimitiveClass {
    pub name: Symbol,
    pub primitive_type: PrimitiveType,
    mirror_ref: AtomicUsize,
}

impl PrimitiveClass {
    pub fn new(name: Symbol, primitive_type: PrimitiveType) -> Self {
        Self {
            name,
            primitive_type,
            mirror_ref: AtomicUsize::new(0),
        }
    }

    pub fn get_mirror_ref(&self) -> Option<HeapRef> {
        match self.mirror_ref.load(Ordering::Acquire) {
            0 => None,
            mirror => Some(mirror),
        }
    }

    pub fn set_mirror_ref(&self, mirror: HeapRef) {
        self.mirror_ref.store(mirror, Ordering::Release);
    }
}
