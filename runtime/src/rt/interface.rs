use crate::MethodId;
use crate::error::JvmError;
use crate::heap::method_area::MethodArea;
use crate::keys::{ClassId, FieldKey, MethodKey};
use crate::rt::constant_pool::RuntimeConstantPool;
use crate::rt::field::StaticField;
use crate::rt::method::Method;
use crate::rt::{BaseClass, ClassLike, JvmClass};
use bonsai_classfile::ClassFile;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

pub struct InterfaceClass {
    pub base: BaseClass,
    pub cp: RuntimeConstantPool,
    /// Declared methods in declaration order; the position is the method's
    /// interface-table index used by `invokeinterface` dispatch.
    methods: OnceCell<Vec<MethodId>>,
    method_index: OnceCell<HashMap<MethodKey, u16>>,
}

impl InterfaceClass {
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

        let class = JvmClass::Interface(Box::new(Self {
            base: BaseClass::new(name, cf.access_flags, super_id, source_file),
            cp,
            methods: OnceCell::new(),
            method_index: OnceCell::new(),
        }));

        Ok(method_area.push_class(class))
    }

    fn link_methods(
        cf: &mut ClassFile,
        this_id: ClassId,
        method_area: &mut MethodArea,
    ) -> Result<(), JvmError> {
        let mut ordered = Vec::new();
        let mut index = HashMap::new();
        for mut info in std::mem::take(&mut cf.methods) {
            let method_key = {
                let cp = &method_area.get_interface_class(&this_id)?.cp;
                MethodKey {
                    name: cp.get_utf8_sym(info.name_index)?,
                    desc: cp.get_utf8_sym(info.descriptor_index)?,
                }
            };
            let descriptor_id = method_area.get_or_new_method_descriptor_id(&method_key.desc)?;
            let args_slots = method_area.args_slots(descriptor_id, info.access_flags.is_static());
            let method = Method::new(
                this_id,
                method_key.name,
                method_key.desc,
                descriptor_id,
                info.access_flags,
                args_slots,
                info.take_code(),
            )?;
            let method_id = method_area.push_method(method);
            if method_key.name == method_area.br().clinit_sym {
                method_area
                    .get_interface_class(&this_id)?
                    .base
                    .set_clinit(method_id)?;
            } else {
                index.insert(method_key, ordered.len() as u16);
                ordered.push(method_id);
            }
        }

        let this = method_area.get_interface_class(&this_id)?;
        this.methods.set(ordered).map_err(|_| {
            JvmError::IllegalInternalState("interface methods already linked".to_string())
        })?;
        this.method_index.set(index).map_err(|_| {
            JvmError::IllegalInternalState("interface method index already linked".to_string())
        })?;
        Ok(())
    }

    fn link_fields(
        cf: &mut ClassFile,
        this_id: ClassId,
        method_area: &mut MethodArea,
    ) -> Result<(), JvmError> {
        let mut static_fields = Vec::new();
        let mut static_index = HashMap::new();

        for field in std::mem::take(&mut cf.fields) {
            let field_key = {
                let cp = &method_area.get_interface_class(&this_id)?.cp;
                FieldKey {
                    name: cp.get_utf8_sym(field.name_index)?,
                    desc: cp.get_utf8_sym(field.descriptor_index)?,
                }
            };
            let descriptor_id = method_area.get_or_new_field_descriptor_id(field_key.desc)?;
            let initial = method_area.get_field_descriptor(&descriptor_id).into();
            static_index.insert(field_key, static_fields.len());
            static_fields.push(StaticField {
                flags: field.access_flags,
                descriptor_id,
                value: RwLock::new(initial),
            });
        }

        let this = method_area.get_interface_class(&this_id)?;
        this.base.set_static_fields(static_fields, static_index)?;
        Ok(())
    }

    fn link_interfaces(
        cf: &ClassFile,
        this_id: ClassId,
        method_area: &mut MethodArea,
    ) -> Result<(), JvmError> {
        let mut interface_ids = HashSet::new();
        let mut direct_interfaces = HashSet::new();

        for interface in &cf.interfaces {
            let interface_name = {
                let cp = &method_area.get_interface_class(&this_id)?.cp;
                cp.get_class_sym(*interface)?
            };
            let interface_id = method_area.get_class_id_or_load(interface_name)?;
            interface_ids.insert(interface_id);
            direct_interfaces.insert(interface_id);
            interface_ids.extend(
                method_area
                    .get_interface_class(&interface_id)?
                    .get_interfaces()?
                    .iter()
                    .copied(),
            );
        }
        let this = method_area.get_interface_class(&this_id)?;
        this.base.set_interfaces(interface_ids)?;
        this.base.set_direct_interfaces(direct_interfaces)?;
        Ok(())
    }

    pub fn load_and_link(
        mut cf: ClassFile,
        cp: RuntimeConstantPool,
        method_area: &mut MethodArea,
        super_id: Option<ClassId>,
    ) -> Result<ClassId, JvmError> {
        let this_id = Self::load(&cf, cp, method_area, super_id)?;

        Self::link_methods(&mut cf, this_id, method_area)?;
        Self::link_fields(&mut cf, this_id, method_area)?;
        Self::link_interfaces(&cf, this_id, method_area)?;

        let this = method_area.get_interface_class(&this_id)?;
        this.set_linked();
        Ok(this_id)
    }

    pub fn get_methods(&self) -> &[MethodId] {
        self.methods.get().map_or(&[], |v| v.as_slice())
    }

    pub fn method_table_index(&self, key: &MethodKey) -> Option<u16> {
        self.method_index.get()?.get(key).copied()
    }

    pub fn method_by_table_index(&self, index: u16) -> Option<MethodId> {
        self.methods.get()?.get(index as usize).copied()
    }

    pub fn get_method_id(&self, key: &MethodKey) -> Option<MethodId> {
        self.method_by_table_index(self.method_table_index(key)?)
    }
}

impl ClassLike for InterfaceClass {
    fn base(&self) -> &BaseClass {
        &self.base
    }
}
