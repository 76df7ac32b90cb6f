use crate::class_loader::{BootstrapClassLoader, is_valid_class_name};
use crate::debug_log;
use crate::error::JvmError;
use crate::heap::{Heap, HeapRef, SPECIAL_BIT};
use crate::keys::{
    ClassId, FieldDescriptorId, FieldKey, FullyQualifiedMethodKey, MethodDescriptorId, MethodKey,
};
use crate::rt::array::{ObjectArrayClass, PrimitiveArrayClass};
use crate::rt::class::InstanceClass;
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::InstanceField;
use crate::rt::interface::InterfaceClass;
use crate::rt::method::Method;
use crate::rt::{ClassLike, JvmClass, PrimitiveClass};
use crate::vm::Value;
use crate::vm::bootstrap_registry::BootstrapRegistry;
use crate::{MethodId, Symbol, build_exception, throw_exception};
use bonsai_classfile::ClassFile;
use bonsai_classfile::descriptor::{JavaType, MethodDescriptor, PrimitiveType};
use lasso::ThreadedRodeo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Owns every loaded class and method. Class bytes come in through the
/// bootstrap loader's sources; the table maps `(bootstrap, name)` to a
/// class id and reloading an already-present name is idempotent.
pub struct MethodArea {
    bootstrap_class_loader: BootstrapClassLoader,
    class_name_to_index: HashMap<Symbol, ClassId>,
    mirror_to_class_index: HashMap<HeapRef, ClassId>,
    classes: Vec<JvmClass>,
    methods: Vec<Method>,

    field_descriptors: Vec<JavaType>,
    field_descriptors_index: HashMap<Symbol, FieldDescriptorId>,

    method_descriptors: Vec<MethodDescriptor>,
    method_descriptors_index: HashMap<Symbol, MethodDescriptorId>,

    /// Names whose super chain is being loaded right now; re-entry through
    /// `super` means a cycle.
    loading: HashSet<Symbol>,

    interner: Arc<ThreadedRodeo>,
    bootstrap_registry: Arc<BootstrapRegistry>,
}

impl MethodArea {
    pub fn init(
        bootstrap_class_loader: BootstrapClassLoader,
        interner: Arc<ThreadedRodeo>,
    ) -> (Self, Arc<BootstrapRegistry>) {
        debug_log!("creating method area");
        let registry = Arc::new(BootstrapRegistry::new(&interner));
        let method_area = Self {
            bootstrap_class_loader,
            class_name_to_index: HashMap::new(),
            mirror_to_class_index: HashMap::new(),
            classes: Vec::with_capacity(256),
            methods: Vec::with_capacity(4096),
            field_descriptors: Vec::with_capacity(512),
            field_descriptors_index: HashMap::new(),
            method_descriptors: Vec::with_capacity(1024),
            method_descriptors_index: HashMap::new(),
            loading: HashSet::new(),
            bootstrap_registry: registry.clone(),
            interner,
        };
        (method_area, registry)
    }

    /// Loads the classes everything else presumes and registers the
    /// primitive pseudo-classes.
    pub fn preload_basic_classes(&mut self) -> Result<(), JvmError> {
        let object_id = self.get_class_id_or_load(self.br().java_lang_object_sym)?;
        self.bootstrap_registry.set_java_lang_object_id(object_id)?;

        let class_id = self.get_class_id_or_load(self.br().java_lang_class_sym)?;
        self.bootstrap_registry.set_java_lang_class_id(class_id)?;

        let string_id = self.get_class_id_or_load(self.br().java_lang_string_sym)?;
        self.bootstrap_registry.set_java_lang_string_id(string_id)?;

        let throwable_id = self.get_class_id_or_load(self.br().java_lang_throwable_sym)?;
        self.bootstrap_registry
            .set_java_lang_throwable_id(throwable_id)?;

        let thread_id = self.get_class_id_or_load(self.br().java_lang_thread_sym)?;
        self.bootstrap_registry.set_java_lang_thread_id(thread_id)?;

        let byte_array_id = self.get_class_id_or_load(self.br().byte_array_desc)?;
        self.bootstrap_registry.set_byte_array_class_id(byte_array_id)?;

        for primitive_type in PrimitiveType::values() {
            let name_sym = self.br().get_primitive_sym(*primitive_type);
            let class = JvmClass::Primitive(PrimitiveClass::new(name_sym, *primitive_type));
            let class_id = self.push_class(class);
            self.class_name_to_index.insert(name_sym, class_id);
        }

        Ok(())
    }

    pub fn classes(&self) -> &[JvmClass] {
        &self.classes
    }

    pub fn br(&self) -> &BootstrapRegistry {
        &self.bootstrap_registry
    }

    pub fn interner(&self) -> &ThreadedRodeo {
        &self.interner
    }

    // ---- registries ----

    pub fn push_class(&mut self, class: JvmClass) -> ClassId {
        self.classes.push(class);
        ClassId::from_usize(self.classes.len())
    }

    pub fn get_class(&self, class_id: &ClassId) -> &JvmClass {
        &self.classes[class_id.to_index()]
    }

    pub fn push_method(&mut self, method: Method) -> MethodId {
        self.methods.push(method);
        MethodId::from_usize(self.methods.len())
    }

    pub fn get_method(&self, method_id: &MethodId) -> &Method {
        &self.methods[method_id.to_index()]
    }

    pub fn get_instance_class(&self, class_id: &ClassId) -> Result<&InstanceClass, JvmError> {
        match self.get_class(class_id) {
            JvmClass::Instance(ic) => Ok(ic),
            other => Err(JvmError::IllegalInternalState(format!(
                "expected instance class, found {}",
                other
            ))),
        }
    }

    pub fn get_interface_class(&self, class_id: &ClassId) -> Result<&InterfaceClass, JvmError> {
        match self.get_class(class_id) {
            JvmClass::Interface(ic) => Ok(ic),
            other => Err(JvmError::IllegalInternalState(format!(
                "expected interface class, found {}",
                other
            ))),
        }
    }

    pub fn get_class_like(&self, class_id: &ClassId) -> Result<&dyn ClassLike, JvmError> {
        self.get_class(class_id).as_class_like()
    }

    pub fn get_cp(&self, class_id: &ClassId) -> Result<&RuntimeConstantPool, JvmError> {
        self.get_class(class_id).get_cp()
    }

    pub fn get_cp_by_method_id(
        &self,
        method_id: &MethodId,
    ) -> Result<&RuntimeConstantPool, JvmError> {
        let class_id = self.get_method(method_id).class_id();
        self.get_cp(&class_id)
    }

    pub fn lookup_class_id(&self, name_sym: Symbol) -> Option<ClassId> {
        self.class_name_to_index.get(&name_sym).copied()
    }

    // ---- descriptors ----

    pub fn get_field_descriptor(&self, id: &FieldDescriptorId) -> &JavaType {
        &self.field_descriptors[id.to_index()]
    }

    pub fn get_method_descriptor(&self, id: &MethodDescriptorId) -> &MethodDescriptor {
        &self.method_descriptors[id.to_index()]
    }

    pub fn get_method_descriptor_by_method_id(&self, method_id: &MethodId) -> &MethodDescriptor {
        let method = self.get_method(method_id);
        self.get_method_descriptor(&method.descriptor_id())
    }

    pub fn get_or_new_method_descriptor_id(
        &mut self,
        descriptor: &Symbol,
    ) -> Result<MethodDescriptorId, JvmError> {
        if let Some(id) = self.method_descriptors_index.get(descriptor) {
            return Ok(*id);
        }
        let descriptor_str = self.interner.resolve(descriptor);
        let parsed = MethodDescriptor::try_from(descriptor_str)
            .map_err(|e| build_exception!(ClassFormatError, "{}", e))?;
        self.method_descriptors.push(parsed);
        let id = MethodDescriptorId::from_usize(self.method_descriptors.len());
        self.method_descriptors_index.insert(*descriptor, id);
        Ok(id)
    }

    pub fn get_or_new_field_descriptor_id(
        &mut self,
        descriptor: Symbol,
    ) -> Result<FieldDescriptorId, JvmError> {
        if let Some(id) = self.field_descriptors_index.get(&descriptor) {
            return Ok(*id);
        }
        let descriptor_str = self.interner.resolve(&descriptor);
        let parsed = JavaType::try_from(descriptor_str)
            .map_err(|e| build_exception!(ClassFormatError, "{}", e))?;
        self.field_descriptors.push(parsed);
        let id = FieldDescriptorId::from_usize(self.field_descriptors.len());
        self.field_descriptors_index.insert(descriptor, id);
        Ok(id)
    }

    pub fn args_slots(&self, descriptor_id: MethodDescriptorId, is_static: bool) -> u16 {
        let slots = self.get_method_descriptor(&descriptor_id).arg_slot_count();
        (slots + usize::from(!is_static)) as u16
    }

    pub fn build_fully_qualified_native_method_key(
        &self,
        method_id: &MethodId,
    ) -> FullyQualifiedMethodKey {
        let method = self.get_method(method_id);
        let class_name = self.get_class(&method.class_id()).get_name();
        FullyQualifiedMethodKey::new(class_name, method.name, method.desc)
    }

    // ---- loading and linking ----

    pub fn get_class_id_or_load(&mut self, name_sym: Symbol) -> Result<ClassId, JvmError> {
        if let Some(class_id) = self.class_name_to_index.get(&name_sym) {
            return Ok(*class_id);
        }
        self.load_class(name_sym)
    }

    fn load_class(&mut self, name_sym: Symbol) -> Result<ClassId, JvmError> {
        let name_str = self.interner.resolve(&name_sym).to_string();
        if !is_valid_class_name(&name_str) {
            return throw_exception!(NoClassDefFoundError, "Illegal name: {}", name_str);
        }
        if name_str.starts_with('[') {
            return self.load_array_class(name_sym);
        }

        if !self.loading.insert(name_sym) {
            return throw_exception!(ClassCircularityError, class_sym: name_sym);
        }
        let result = self.load_instance_or_interface(name_sym, &name_str);
        self.loading.remove(&name_sym);
        let class_id = result?;
        self.class_name_to_index.insert(name_sym, class_id);
        Ok(class_id)
    }

    fn load_instance_or_interface(
        &mut self,
        name_sym: Symbol,
        name_str: &str,
    ) -> Result<ClassId, JvmError> {
        let data = self.bootstrap_class_loader.load(name_str)?;
        let cf = ClassFile::try_from(data.as_slice())
            .map_err(|e| build_exception!(ClassFormatError, "{}: {}", name_str, e))?;

        let cp = RuntimeConstantPool::new(&cf.cp, &self.interner)?;
        let declared_name = cp.get_class_sym(cf.this_class)?;
        if declared_name != name_sym {
            return throw_exception!(
                NoClassDefFoundError,
                "{} (wrong name: {})",
                name_str,
                self.interner.resolve(&declared_name)
            );
        }

        let super_id = match cf.get_super_class_name() {
            Some(super_name) => {
                let super_name =
                    super_name.map_err(|e| build_exception!(ClassFormatError, "{}", e))?;
                let super_sym = self.interner.get_or_intern(super_name);
                let super_id = self.get_class_id_or_load(super_sym)?;
                if self.get_class(&super_id).is_interface() {
                    return throw_exception!(IncompatibleClassChangeError, class_sym: super_sym);
                }
                Some(super_id)
            }
            None => None,
        };

        debug_log!("linking class {:?}", name_str);
        if cf.access_flags.is_interface() {
            InterfaceClass::load_and_link(cf, cp, self, super_id)
        } else {
            InstanceClass::load_and_link(cf, cp, self, super_id)
        }
    }

    pub(crate) fn load_array_class(&mut self, name_sym: Symbol) -> Result<ClassId, JvmError> {
        if let Some(class_id) = self.class_name_to_index.get(&name_sym) {
            return Ok(*class_id);
        }
        let descriptor_id = self.get_or_new_field_descriptor_id(name_sym)?;
        let descriptor = self.get_field_descriptor(&descriptor_id).clone();
        let object_id = self.br().get_java_lang_object_id()?;
        let object_class = self.get_instance_class(&object_id)?;
        let vtable = object_class.get_vtable()?.clone();
        let vtable_index = object_class.get_vtable_index()?.clone();

        let class = if let Some(primitive) = descriptor.get_primitive_array_element_type() {
            JvmClass::PrimitiveArray(PrimitiveArrayClass {
                name: name_sym,
                super_id: object_id,
                element_type: primitive,
                vtable,
                vtable_index,
                mirror_ref: Default::default(),
            })
        } else if let Some(element_name) = descriptor.get_instance_array_element_descriptor() {
            let element_sym = self.interner.get_or_intern(&element_name);
            let element_class_id = self.get_class_id_or_load(element_sym)?;
            let dimensions = self
                .interner
                .resolve(&name_sym)
                .bytes()
                .take_while(|b| *b == b'[')
                .count() as u8;
            JvmClass::InstanceArray(ObjectArrayClass {
                name: name_sym,
                super_id: object_id,
                element_class_id,
                dimensions,
                vtable,
                vtable_index,
                mirror_ref: Default::default(),
            })
        } else {
            return throw_exception!(NoClassDefFoundError, class_sym: name_sym);
        };
        let class_id = self.push_class(class);
        self.class_name_to_index.insert(name_sym, class_id);
        Ok(class_id)
    }

    // ---- type tests ----

    pub fn is_assignable_from(&self, this_class: ClassId, cls: ClassId) -> bool {
        self.is_subclass_of(cls, this_class)
    }

    pub fn is_subclass_of(&self, this_class: ClassId, target_class: ClassId) -> bool {
        if this_class == target_class {
            return true;
        }

        let this = self.get_class(&this_class);
        let target = self.get_class(&target_class);

        if this.is_array() {
            return match (this, target) {
                (JvmClass::PrimitiveArray(a), JvmClass::PrimitiveArray(b)) => {
                    a.element_type == b.element_type
                }
                (JvmClass::InstanceArray(a), JvmClass::InstanceArray(b)) => {
                    self.is_subclass_of(a.element_class_id, b.element_class_id)
                }
                // Arrays are Objects and implement the array interfaces'
                // super chain through Object only.
                _ => this
                    .get_super_id()
                    .is_some_and(|s| self.is_subclass_of(s, target_class)),
            };
        }

        if let Some(super_id) = this.get_super_id() {
            if self.is_subclass_of(super_id, target_class) {
                return true;
            }
        }

        if let Some(interfaces) = this.get_interfaces_opt() {
            for interface_id in interfaces {
                if self.is_subclass_of(*interface_id, target_class) {
                    return true;
                }
            }
        }

        false
    }

    /// Name-based test for exception-table matching; never loads.
    pub fn instance_of(&self, this_class_id: ClassId, other_sym: Symbol) -> bool {
        match self.class_name_to_index.get(&other_sym) {
            Some(other_id) => self.is_subclass_of(this_class_id, *other_id),
            None => false,
        }
    }

    // ---- member resolution ----

    /// Walks the class chain, then the interface graph.
    pub fn find_method(
        &self,
        class_id: ClassId,
        key: &MethodKey,
    ) -> Result<MethodId, JvmError> {
        let mut cur = Some(class_id);
        while let Some(id) = cur {
            match self.get_class(&id) {
                JvmClass::Instance(inst) => {
                    if let Some(found) = inst.lookup_method(key) {
                        return Ok(found);
                    }
                }
                JvmClass::Interface(i) => {
                    if let Some(found) = i.get_method_id(key) {
                        return Ok(found);
                    }
                }
                class @ (JvmClass::PrimitiveArray(_) | JvmClass::InstanceArray(_)) => {
                    if let Some(found) = class.lookup_virtual(key) {
                        return Ok(found);
                    }
                }
                JvmClass::Primitive(_) => break,
            }
            cur = self.get_class(&id).get_super_id();
        }

        if let Some(interfaces) = self.get_class(&class_id).get_interfaces_opt() {
            for interface_id in interfaces {
                if let Some(found) = self.get_interface_class(interface_id)?.get_method_id(key) {
                    return Ok(found);
                }
            }
        }

        let class_sym = self.get_class(&class_id).get_name();
        throw_exception!(NoSuchMethodError, method_key: *key, class_sym: class_sym)
    }

    /// Instance-field lookup on the receiver class; layouts already include
    /// superclass fields.
    pub fn find_instance_field(
        &self,
        class_id: ClassId,
        key: &FieldKey,
    ) -> Result<InstanceField, JvmError> {
        if let Ok(class) = self.get_instance_class(&class_id) {
            if let Some(field) = class.lookup_instance_field(key) {
                return Ok(*field);
            }
        }
        throw_exception!(
            NoSuchFieldError,
            "{}",
            self.interner.resolve(&key.name)
        )
    }

    /// Static-field resolution: the class itself, then supers, then the
    /// interface graph.
    pub fn resolve_static_field_class(
        &self,
        class_id: ClassId,
        field_key: &FieldKey,
    ) -> Result<ClassId, JvmError> {
        let mut cur = Some(class_id);
        while let Some(id) = cur {
            if let Ok(class_like) = self.get_class_like(&id) {
                if class_like.has_static_field(field_key) {
                    return Ok(id);
                }
            }
            if let Some(interfaces) = self.get_class(&id).get_interfaces_opt() {
                for interface_id in interfaces {
                    if let Ok(found) =
                        self.resolve_static_field_class(*interface_id, field_key)
                    {
                        return Ok(found);
                    }
                }
            }
            cur = self.get_class(&id).get_super_id();
        }
        throw_exception!(
            NoSuchFieldError,
            "{}",
            self.interner.resolve(&field_key.name)
        )
    }

    pub fn get_static_field_value(
        &self,
        class_id: &ClassId,
        key: &FieldKey,
    ) -> Result<Value, JvmError> {
        let holder = self.resolve_static_field_class(*class_id, key)?;
        self.get_class_like(&holder)?.get_static_field_value(key)
    }

    // ---- mirrors ----

    pub fn get_class_id_by_mirror(&self, mirror: &HeapRef) -> Result<ClassId, JvmError> {
        self.mirror_to_class_index
            .get(mirror)
            .copied()
            .ok_or(JvmError::WrongHeapAddress(*mirror))
    }

    /// Class objects live on the heap like everything else; the SPECIAL
    /// flag tells the collector to treat them as class roots.
    pub fn get_mirror_ref_or_create(
        &mut self,
        class_id: ClassId,
        heap: &mut Heap,
    ) -> Result<HeapRef, JvmError> {
        if let Some(mirror) = self.get_class(&class_id).get_mirror_ref() {
            return Ok(mirror);
        }
        let class_class_id = self.br().get_java_lang_class_id()?;
        let size = self
            .get_instance_class(&class_class_id)?
            .get_instance_size()?;
        let mirror = heap.alloc_instance(size, class_class_id)?;
        heap.set_flag(mirror, SPECIAL_BIT);
        self.mirror_to_class_index.insert(mirror, class_id);
        self.get_class(&class_id).set_mirror_ref(mirror);
        Ok(mirror)
    }

    // ---- collector support ----

    /// Precise non-stack roots owned by the class world: mirrors and
    /// reference-typed statics.
    pub fn for_each_root(&self, f: &mut dyn FnMut(HeapRef)) {
        for mirror in self.mirror_to_class_index.keys() {
            f(*mirror);
        }
        for class in &self.classes {
            if let Ok(class_like) = class.as_class_like() {
                if let Ok(statics) = class_like.base().get_static_fields() {
                    for field in statics {
                        if let Value::Ref(r) = *field.value.read().unwrap() {
                            f(r);
                        }
                    }
                }
            }
        }
    }

    /// Rewrites every heap reference this component owns after compaction.
    pub fn forward_heap_refs(&mut self, forward: &dyn Fn(HeapRef) -> HeapRef) {
        let mirrors = std::mem::take(&mut self.mirror_to_class_index);
        self.mirror_to_class_index = mirrors
            .into_iter()
            .map(|(mirror, class_id)| (forward(mirror), class_id))
            .collect();
        for class in &self.classes {
            if let Some(mirror) = class.get_mirror_ref() {
                class.set_mirror_ref(forward(mirror));
            }
            if let Ok(class_like) = class.as_class_like() {
                if let Ok(statics) = class_like.base().get_static_fields() {
                    for field in statics {
                        let mut value = field.value.write().unwrap();
                        if let Value::Ref(r) = *value {
                            *value = Value::Ref(forward(r));
                        }
                    }
                }
            }
        }
    }
}
