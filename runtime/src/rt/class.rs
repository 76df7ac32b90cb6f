use crate::error::JvmError;
use crate::heap::method_area::MethodArea;
use crate::keys::{ClassId, FieldKey, MethodKey};
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::{InstanceField, StaticField};
use crate::rt::method::Method;
use crate::MethodId;
use crate::rt::{BaseClass, ClassLike, JvmClass, ReferenceKind};
use bonsai_classfile::ClassFile;
use bonsai_classfile::descriptor::AllocationType;
use bonsai_classfile::flags::MethodFlags;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// One entry of the interface-dimension table: for every implemented
/// interface, a dense array mapping the interface's own method-table index
/// to this class's resolved implementation.
pub struct ItableEntry {
    pub interface_id: ClassId,
    pub methods: Vec<MethodId>,
}

pub struct InstanceClass {
    base: BaseClass,

    pub cp: RuntimeConstantPool,

    declared_method_index: OnceCell<HashMap<MethodKey, MethodId>>,
    vtable: OnceCell<Vec<MethodId>>,
    vtable_index: OnceCell<HashMap<MethodKey, u16>>,
    itable: OnceCell<Vec<ItableEntry>>,

    pub(crate) instance_fields: OnceCell<Vec<InstanceField>>,
    instance_field_index: OnceCell<HashMap<FieldKey, usize>>,
    instance_size: OnceCell<usize>,
    /// Run-length `[start, end)` byte ranges of reference-typed instance
    /// fields, super's ranges merged in; the collector traces objects by
    /// walking these without touching descriptors.
    ref_ranges: OnceCell<Vec<(u32, u32)>>,
    /// `(static slot, constant pool index)` for ConstantValue fields,
    /// applied when the class initializes.
    constant_statics: OnceCell<Vec<(usize, u16)>>,
}

impl InstanceClass {
    fn load(
        cf: &ClassFile,
        cp: RuntimeConstantPool,
        method_area: &mut MethodArea,
        super_id: Option<ClassId>,
    ) -> Result<ClassId, JvmError> {
        let name = cp.get_class_sym(cf.this_class)?;
        let source_file = cf
            .source_file()
            .map(|idx| cp.get_utf8_sym(idx))
            .transpose()?;

        let class = JvmClass::Instance(Box::new(Self {
            base: BaseClass::new(name, cf.access_flags, super_id, source_file),
            cp,
            declared_method_index: OnceCell::new(),
            vtable: OnceCell::new(),
            vtable_index: OnceCell::new(),
            itable: OnceCell::new(),
            instance_fields: OnceCell::new(),
            instance_field_index: OnceCell::new(),
            instance_size: OnceCell::new(),
            ref_ranges: OnceCell::new(),
            constant_statics: OnceCell::new(),
        }));

        Ok(method_area.push_class(class))
    }

    /// Field preparation. Reference-typed instance fields are packed
    /// contiguously right after the super's layout so the collector gets a
    /// short run-length table; primitives follow, each aligned to its size.
    fn link_fields(
        cf: &mut ClassFile,
        this_id: ClassId,
        super_id: Option<ClassId>,
        method_area: &mut MethodArea,
    ) -> Result<(), JvmError> {
        let super_class = super_id
            .map(|id| method_area.get_instance_class(&id))
            .transpose()?;
        let mut instance_fields = super_class
            .map(|c| c.get_instance_fields().cloned())
            .transpose()?
            .unwrap_or_default();
        let mut instance_field_index = super_class
            .map(|c| c.get_instance_field_index().cloned())
            .transpose()?
            .unwrap_or_default();
        let mut instance_size = super_class
            .map(|c| c.get_instance_size())
            .transpose()?
            .unwrap_or_default();
        let mut ref_ranges = super_class
            .map(|c| c.get_ref_ranges().map(|r| r.to_vec()))
            .transpose()?
            .unwrap_or_default();

        let mut static_fields = Vec::new();
        let mut static_index = HashMap::new();
        let mut constant_statics = Vec::new();

        struct Pending {
            key: FieldKey,
            field: bonsai_classfile::field::FieldInfo,
            descriptor_id: crate::keys::FieldDescriptorId,
            alloc: AllocationType,
        }

        let mut pending = Vec::with_capacity(cf.fields.len());
        for field in std::mem::take(&mut cf.fields) {
            let key = {
                let cp = &method_area.get_instance_class(&this_id)?.cp;
                FieldKey {
                    name: cp.get_utf8_sym(field.name_index)?,
                    desc: cp.get_utf8_sym(field.descriptor_index)?,
                }
            };
            let descriptor_id = method_area.get_or_new_field_descriptor_id(key.desc)?;
            let alloc = method_area
                .get_field_descriptor(&descriptor_id)
                .as_allocation_type();
            pending.push(Pending {
                key,
                field,
                descriptor_id,
                alloc,
            });
        }

        for p in &pending {
            if p.field.access_flags.is_static() {
                let initial = method_area.get_field_descriptor(&p.descriptor_id).into();
                if let Some(cv) = p.field.constant_value_index() {
                    constant_statics.push((static_fields.len(), cv));
                }
                static_index.insert(p.key, static_fields.len());
                static_fields.push(StaticField {
                    flags: p.field.access_flags,
                    descriptor_id: p.descriptor_id,
                    value: RwLock::new(initial),
                });
            }
        }

        // Pass one: references.
        let ref_size = AllocationType::Reference.byte_size();
        let mut ref_count = 0;
        for p in &pending {
            if p.field.access_flags.is_static() || !p.alloc.is_reference() {
                continue;
            }
            if ref_count == 0 {
                instance_size = (instance_size + ref_size - 1) & !(ref_size - 1);
            }
            let offset = instance_size;
            instance_size += ref_size;
            ref_count += 1;
            instance_field_index.insert(p.key, instance_fields.len());
            instance_fields.push(InstanceField {
                flags: p.field.access_flags,
                descriptor_id: p.descriptor_id,
                offset,
                declaring_class: this_id,
            });
        }
        if ref_count > 0 {
            let end = instance_size as u32;
            let start = end - (ref_count * ref_size) as u32;
            match ref_ranges.last_mut() {
                Some((_, prev_end)) if *prev_end == start => *prev_end = end,
                _ => ref_ranges.push((start, end)),
            }
        }

        // Pass two: primitives, aligned to their own width.
        for p in &pending {
            if p.field.access_flags.is_static() || p.alloc.is_reference() {
                continue;
            }
            let size = p.alloc.byte_size();
            instance_size = (instance_size + size - 1) & !(size - 1);
            let offset = instance_size;
            instance_size += size;
            instance_field_index.insert(p.key, instance_fields.len());
            instance_fields.push(InstanceField {
                flags: p.field.access_flags,
                descriptor_id: p.descriptor_id,
                offset,
                declaring_class: this_id,
            });
        }

        let this = method_area.get_instance_class(&this_id)?;
        this.instance_fields.set(instance_fields).map_err(|_| relinked())?;
        this.instance_field_index
            .set(instance_field_index)
            .map_err(|_| relinked())?;
        this.instance_size.set(instance_size).map_err(|_| relinked())?;
        this.ref_ranges.set(ref_ranges).map_err(|_| relinked())?;
        this.constant_statics
            .set(constant_statics)
            .map_err(|_| relinked())?;
        this.base.set_static_fields(static_fields, static_index)?;
        Ok(())
    }

    /// Method preparation: overriding methods inherit the super's table
    /// slot, new virtual methods get fresh slots at the end.
    fn prepare_methods(
        cf: &mut ClassFile,
        this_id: ClassId,
        super_id: Option<ClassId>,
        method_area: &mut MethodArea,
    ) -> Result<(Vec<MethodId>, HashMap<MethodKey, u16>), JvmError> {
        let mut declared_index = HashMap::new();
        let (mut vtable, mut vtable_index) = super_id
            .map(|id| method_area.get_instance_class(&id))
            .transpose()?
            .map(|class| -> Result<_, JvmError> {
                Ok((class.get_vtable()?.clone(), class.get_vtable_index()?.clone()))
            })
            .transpose()?
            .unwrap_or_default();

        for mut info in std::mem::take(&mut cf.methods) {
            let method_key = {
                let cp = &method_area.get_instance_class(&this_id)?.cp;
                MethodKey {
                    name: cp.get_utf8_sym(info.name_index)?,
                    desc: cp.get_utf8_sym(info.descriptor_index)?,
                }
            };
            let descriptor_id = method_area.get_or_new_method_descriptor_id(&method_key.desc)?;
            let flags = info.access_flags;
            let args_slots = method_area.args_slots(descriptor_id, flags.is_static());
            let method = Method::new(
                this_id,
                method_key.name,
                method_key.desc,
                descriptor_id,
                flags,
                args_slots,
                info.take_code(),
            )?;
            let is_constructor = method_key.name == method_area.br().init_sym
                || method_key.name == method_area.br().clinit_sym;
            let virtual_candidate = !flags.is_static() && !flags.is_private() && !is_constructor;
            let method_id = method_area.push_method(method);

            if virtual_candidate {
                let inherited_slot = vtable_index.get(&method_key).copied().filter(|slot| {
                    let overridden = method_area.get_method(&vtable[*slot as usize]);
                    can_override(overridden.flags())
                });
                let slot = match inherited_slot {
                    Some(slot) => {
                        vtable[slot as usize] = method_id;
                        slot
                    }
                    None => {
                        let slot = vtable.len() as u16;
                        vtable_index.insert(method_key, slot);
                        vtable.push(method_id);
                        slot
                    }
                };
                method_area.get_method(&method_id).set_vtable_index(slot);
            } else if method_key.name == method_area.br().clinit_sym {
                method_area
                    .get_instance_class(&this_id)?
                    .base
                    .set_clinit(method_id)?;
            } else {
                declared_index.insert(method_key, method_id);
            }
        }

        let this = method_area.get_instance_class(&this_id)?;
        this.declared_method_index
            .set(declared_index)
            .map_err(|_| relinked())?;
        Ok((vtable, vtable_index))
    }

    fn link_interfaces(
        cf: &ClassFile,
        this_id: ClassId,
        super_id: Option<ClassId>,
        method_area: &mut MethodArea,
    ) -> Result<(), JvmError> {
        let mut interface_ids = super_id
            .map(|id| method_area.get_instance_class(&id))
            .transpose()?
            .map(|class| class.base.get_interfaces().cloned())
            .transpose()?
            .unwrap_or_default();
        let mut direct_interfaces = HashSet::new();

        for interface in &cf.interfaces {
            let interface_name = {
                let cp = &method_area.get_instance_class(&this_id)?.cp;
                cp.get_class_sym(*interface)?
            };
            let interface_id = method_area.get_class_id_or_load(interface_name)?;
            if !method_area.get_class(&interface_id).is_interface() {
                return crate::throw_exception!(
                    IncompatibleClassChangeError,
                    class_sym: interface_name
                );
            }
            interface_ids.insert(interface_id);
            direct_interfaces.insert(interface_id);
            // Superinterfaces are implemented transitively.
            interface_ids.extend(
                method_area
                    .get_interface_class(&interface_id)?
                    .get_interfaces()?
                    .iter()
                    .copied(),
            );
        }
        let this = method_area.get_instance_class(&this_id)?;
        this.base.set_interfaces(interface_ids)?;
        this.base.set_direct_interfaces(direct_interfaces)?;
        Ok(())
    }

    /// Builds the per-interface offset arrays. Interface methods without an
    /// implementation materialize miranda stubs; default methods join the
    /// method table.
    fn link_itable(
        this_id: ClassId,
        method_area: &mut MethodArea,
        mut vtable: Vec<MethodId>,
        mut vtable_index: HashMap<MethodKey, u16>,
    ) -> Result<(), JvmError> {
        let interfaces: Vec<ClassId> = method_area
            .get_instance_class(&this_id)?
            .base
            .get_interfaces()?
            .iter()
            .copied()
            .collect();

        let mut itable = Vec::with_capacity(interfaces.len());
        for interface_id in interfaces {
            let interface_methods: Vec<MethodId> = method_area
                .get_interface_class(&interface_id)?
                .get_methods()
                .to_vec();
            let mut offsets = Vec::with_capacity(interface_methods.len());
            for interface_method_id in interface_methods {
                let (method_key, descriptor_id, args_slots, is_abstract) = {
                    let m = method_area.get_method(&interface_method_id);
                    (
                        MethodKey {
                            name: m.name,
                            desc: m.desc,
                        },
                        m.descriptor_id(),
                        m.args_slots(),
                        m.is_abstract(),
                    )
                };
                let resolved = match vtable_index.get(&method_key) {
                    Some(slot) => vtable[*slot as usize],
                    None if !is_abstract => {
                        // Interface default implementation.
                        let slot = vtable.len() as u16;
                        vtable_index.insert(method_key, slot);
                        vtable.push(interface_method_id);
                        method_area
                            .get_method(&interface_method_id)
                            .set_vtable_index(slot);
                        interface_method_id
                    }
                    None => {
                        let miranda = Method::miranda(
                            this_id,
                            method_key.name,
                            method_key.desc,
                            descriptor_id,
                            args_slots,
                        );
                        let miranda_id = method_area.push_method(miranda);
                        let slot = vtable.len() as u16;
                        vtable_index.insert(method_key, slot);
                        vtable.push(miranda_id);
                        method_area.get_method(&miranda_id).set_vtable_index(slot);
                        miranda_id
                    }
                };
                offsets.push(resolved);
            }
            itable.push(ItableEntry {
                interface_id,
                methods: offsets,
            });
        }

        let this = method_area.get_instance_class(&this_id)?;
        this.itable.set(itable).map_err(|_| relinked())?;
        this.vtable.set(vtable).map_err(|_| relinked())?;
        this.vtable_index.set(vtable_index).map_err(|_| relinked())?;
        Ok(())
    }

    /// Reference classes and finalizers are recognized here so allocation
    /// and collection can dispatch on class flags alone.
    fn detect_special(
        this_id: ClassId,
        super_id: Option<ClassId>,
        method_area: &MethodArea,
    ) -> Result<(), JvmError> {
        let br = method_area.br();
        let this = method_area.get_instance_class(&this_id)?;
        let name = this.name();

        let kind = if name == br.java_lang_ref_soft_sym {
            Some(ReferenceKind::Soft)
        } else if name == br.java_lang_ref_weak_sym {
            Some(ReferenceKind::Weak)
        } else if name == br.java_lang_ref_phantom_sym {
            Some(ReferenceKind::Phantom)
        } else {
            super_id
                .and_then(|id| method_area.get_instance_class(&id).ok())
                .and_then(|super_class| super_class.base.reference_kind())
        };
        if let Some(kind) = kind {
            this.base.set_reference_kind(kind);
        }

        let declares_finalizer = name != br.java_lang_object_sym
            && this
                .lookup_virtual(&br.finalize_mk)
                .map(|id| method_area.get_method(&id))
                .is_some_and(|m| !m.is_abstract() && m.class_id() != br.get_java_lang_object_id().unwrap_or(this_id));
        let inherited = super_id
            .and_then(|id| method_area.get_instance_class(&id).ok())
            .is_some_and(|c| c.base.has_finalizer());
        this.base.set_has_finalizer(declares_finalizer || inherited);
        Ok(())
    }

    pub fn load_and_link(
        mut cf: ClassFile,
        cp: RuntimeConstantPool,
        method_area: &mut MethodArea,
        super_id: Option<ClassId>,
    ) -> Result<ClassId, JvmError> {
        let this_id = Self::load(&cf, cp, method_area, super_id)?;

        Self::link_fields(&mut cf, this_id, super_id, method_area)?;
        let (vtable, vtable_index) =
            Self::prepare_methods(&mut cf, this_id, super_id, method_area)?;
        Self::link_interfaces(&cf, this_id, super_id, method_area)?;
        Self::link_itable(this_id, method_area, vtable, vtable_index)?;
        Self::detect_special(this_id, super_id, method_area)?;

        let this = method_area.get_instance_class(&this_id)?;
        this.set_linked();
        Ok(this_id)
    }

    pub fn get_instance_field(&self, field_key: &FieldKey) -> Result<&InstanceField, JvmError> {
        let idx = self
            .get_instance_field_index()?
            .get(field_key)
            .copied()
            .ok_or_else(|| JvmError::IllegalInternalState("no such instance field".to_string()))?;
        Ok(&self.get_instance_fields()?[idx])
    }

    pub fn lookup_instance_field(&self, field_key: &FieldKey) -> Option<&InstanceField> {
        let idx = self.instance_field_index.get()?.get(field_key)?;
        Some(&self.instance_fields.get()?[*idx])
    }

    pub fn vtable_entry(&self, index: u16) -> Result<MethodId, JvmError> {
        self.get_vtable()?
            .get(index as usize)
            .copied()
            .ok_or_else(|| JvmError::IllegalInternalState("vtable index out of range".to_string()))
    }

    pub fn lookup_virtual(&self, key: &MethodKey) -> Option<MethodId> {
        let slot = self.vtable_index.get()?.get(key)?;
        Some(self.vtable.get()?[*slot as usize])
    }

    pub fn lookup_declared(&self, key: &MethodKey) -> Option<MethodId> {
        self.declared_method_index.get()?.get(key).copied()
    }

    /// Declared statics/privates/constructors first, then the method table.
    pub fn lookup_method(&self, key: &MethodKey) -> Option<MethodId> {
        self.lookup_declared(key).or_else(|| self.lookup_virtual(key))
    }

    pub fn itable_lookup(&self, interface_id: ClassId) -> Option<&ItableEntry> {
        self.itable
            .get()?
            .iter()
            .find(|entry| entry.interface_id == interface_id)
    }

    pub(crate) fn get_vtable(&self) -> Result<&Vec<MethodId>, JvmError> {
        self.vtable
            .get()
            .ok_or_else(|| JvmError::IllegalInternalState("vtable not linked yet".to_string()))
    }

    pub(crate) fn get_vtable_index(&self) -> Result<&HashMap<MethodKey, u16>, JvmError> {
        self.vtable_index
            .get()
            .ok_or_else(|| JvmError::IllegalInternalState("vtable index not linked yet".to_string()))
    }

    pub(crate) fn get_instance_fields(&self) -> Result<&Vec<InstanceField>, JvmError> {
        self.instance_fields
            .get()
            .ok_or_else(|| JvmError::IllegalInternalState("fields not prepared yet".to_string()))
    }

    fn get_instance_field_index(&self) -> Result<&HashMap<FieldKey, usize>, JvmError> {
        self.instance_field_index
            .get()
            .ok_or_else(|| JvmError::IllegalInternalState("field index not prepared yet".to_string()))
    }

    pub fn get_instance_size(&self) -> Result<usize, JvmError> {
        self.instance_size
            .get()
            .copied()
            .ok_or_else(|| JvmError::IllegalInternalState("instance size not prepared yet".to_string()))
    }

    pub fn get_ref_ranges(&self) -> Result<&[(u32, u32)], JvmError> {
        self.ref_ranges
            .get()
            .map(|v| v.as_slice())
            .ok_or_else(|| JvmError::IllegalInternalState("ref ranges not prepared yet".to_string()))
    }

    pub fn constant_statics(&self) -> &[(usize, u16)] {
        self.constant_statics.get().map_or(&[], |v| v.as_slice())
    }
}

impl ClassLike for InstanceClass {
    fn base(&self) -> &BaseClass {
        &self.base
    }
}

fn relinked() -> JvmError {
    JvmError::IllegalInternalState("class linked twice".to_string())
}

/// Private, static and final methods never yield their slot to a subclass.
fn can_override(super_flags: MethodFlags) -> bool {
    !super_flags.is_private()
        && !super_flags.is_static()
        && !super_flags.contains(MethodFlags::FINAL)
}
