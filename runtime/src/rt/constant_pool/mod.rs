use crate::error::JvmError;
use crate::keys::{FieldKey, MethodKey, Symbol};
use crate::throw_exception;
use bonsai_classfile::constant::{ConstantInfo, ConstantPool};
use lasso::ThreadedRodeo;
use std::fmt::Display;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RuntimeConstantType {
    Unused,
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    String,
    Method,
    InterfaceMethod,
    Field,
    NameAndType,
    MethodType,
    MethodHandle,
    Dynamic,
}

impl Display for RuntimeConstantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A symbolic member reference: owning class plus name-and-type key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef {
    pub class: Symbol,
    pub name: Symbol,
    pub desc: Symbol,
}

impl MemberRef {
    pub fn field_key(&self) -> FieldKey {
        FieldKey {
            name: self.name,
            desc: self.desc,
        }
    }

    pub fn method_key(&self) -> MethodKey {
        MethodKey {
            name: self.name,
            desc: self.desc,
        }
    }
}

/// Entries arrive symbolic; every UTF-8 has already gone through the
/// process-wide symbol cache, so equal names and descriptors compare by key.
/// Resolution results are cached in the quickened instruction stream, not
/// here, so the pool itself stays immutable after loading.
pub enum RuntimeConstant {
    Unused,
    Utf8(Symbol),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(Symbol),
    String(Symbol),
    Method(MemberRef),
    InterfaceMethod(MemberRef),
    Field(MemberRef),
    NameAndType { name: Symbol, desc: Symbol },
    MethodType(Symbol),
    MethodHandle { kind: u8, reference_index: u16 },
    Dynamic,
}

impl RuntimeConstant {
    pub fn get_type(&self) -> RuntimeConstantType {
        match self {
            RuntimeConstant::Unused => RuntimeConstantType::Unused,
            RuntimeConstant::Utf8(_) => RuntimeConstantType::Utf8,
            RuntimeConstant::Integer(_) => RuntimeConstantType::Integer,
            RuntimeConstant::Float(_) => RuntimeConstantType::Float,
            RuntimeConstant::Long(_) => RuntimeConstantType::Long,
            RuntimeConstant::Double(_) => RuntimeConstantType::Double,
            RuntimeConstant::Class(_) => RuntimeConstantType::Class,
            RuntimeConstant::String(_) => RuntimeConstantType::String,
            RuntimeConstant::Method(_) => RuntimeConstantType::Method,
            RuntimeConstant::InterfaceMethod(_) => RuntimeConstantType::InterfaceMethod,
            RuntimeConstant::Field(_) => RuntimeConstantType::Field,
            RuntimeConstant::NameAndType { .. } => RuntimeConstantType::NameAndType,
            RuntimeConstant::MethodType(_) => RuntimeConstantType::MethodType,
            RuntimeConstant::MethodHandle { .. } => RuntimeConstantType::MethodHandle,
            RuntimeConstant::Dynamic => RuntimeConstantType::Dynamic,
        }
    }
}

pub struct RuntimeConstantPool {
    entries: Vec<RuntimeConstant>,
}

impl RuntimeConstantPool {
    /// Converts the parsed pool, interning every UTF-8 entry.
    pub fn new(cp: &ConstantPool, interner: &ThreadedRodeo) -> Result<Self, JvmError> {
        let mut entries = Vec::with_capacity(cp.inner.len());
        for info in &cp.inner {
            let entry = match info {
                ConstantInfo::Unusable => RuntimeConstant::Unused,
                ConstantInfo::Utf8(s) => RuntimeConstant::Utf8(interner.get_or_intern(s)),
                ConstantInfo::Integer(v) => RuntimeConstant::Integer(*v),
                ConstantInfo::Float(v) => RuntimeConstant::Float(*v),
                ConstantInfo::Long(v) => RuntimeConstant::Long(*v),
                ConstantInfo::Double(v) => RuntimeConstant::Double(*v),
                ConstantInfo::Class { name_index } => {
                    RuntimeConstant::Class(interner.get_or_intern(cp.get_utf8(*name_index)?))
                }
                ConstantInfo::String { string_index } => {
                    RuntimeConstant::String(interner.get_or_intern(cp.get_utf8(*string_index)?))
                }
                ConstantInfo::FieldRef { class_index, name_and_type_index }
                | ConstantInfo::MethodRef { class_index, name_and_type_index }
                | ConstantInfo::InterfaceMethodRef { class_index, name_and_type_index } => {
                    let class = interner.get_or_intern(cp.get_class_name(*class_index)?);
                    let (name, desc) = cp.get_name_and_type(*name_and_type_index)?;
                    let member = MemberRef {
                        class,
                        name: interner.get_or_intern(name),
                        desc: interner.get_or_intern(desc),
                    };
                    match info {
                        ConstantInfo::FieldRef { .. } => RuntimeConstant::Field(member),
                        ConstantInfo::MethodRef { .. } => RuntimeConstant::Method(member),
                        _ => RuntimeConstant::InterfaceMethod(member),
                    }
                }
                ConstantInfo::NameAndType { name_index, descriptor_index } => {
                    RuntimeConstant::NameAndType {
                        name: interner.get_or_intern(cp.get_utf8(*name_index)?),
                        desc: interner.get_or_intern(cp.get_utf8(*descriptor_index)?),
                    }
                }
                ConstantInfo::MethodType { descriptor_index } => {
                    RuntimeConstant::MethodType(interner.get_or_intern(cp.get_utf8(*descriptor_index)?))
                }
                ConstantInfo::MethodHandle { reference_kind, reference_index } => {
                    RuntimeConstant::MethodHandle {
                        kind: *reference_kind,
                        reference_index: *reference_index,
                    }
                }
                ConstantInfo::Dynamic { .. }
                | ConstantInfo::InvokeDynamic { .. }
                | ConstantInfo::Module { .. }
                | ConstantInfo::Package { .. } => RuntimeConstant::Dynamic,
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, index: u16) -> Result<&RuntimeConstant, JvmError> {
        match self.entries.get(index as usize) {
            None | Some(RuntimeConstant::Unused) => throw_exception!(
                ClassFormatError,
                "constant pool index {} out of range",
                index
            ),
            Some(entry) => Ok(entry),
        }
    }

    fn mismatch(&self, index: u16, expected: RuntimeConstantType) -> JvmError {
        let actual = self
            .entries
            .get(index as usize)
            .map(RuntimeConstant::get_type)
            .unwrap_or(RuntimeConstantType::Unused);
        crate::build_exception!(
            IncompatibleClassChangeError,
            "constant pool index {}: expected {}, found {}",
            index,
            expected,
            actual
        )
    }

    pub fn get_utf8_sym(&self, index: u16) -> Result<Symbol, JvmError> {
        match self.get(index)? {
            RuntimeConstant::Utf8(sym) => Ok(*sym),
            _ => Err(self.mismatch(index, RuntimeConstantType::Utf8)),
        }
    }

    pub fn get_class_sym(&self, index: u16) -> Result<Symbol, JvmError> {
        match self.get(index)? {
            RuntimeConstant::Class(sym) => Ok(*sym),
            _ => Err(self.mismatch(index, RuntimeConstantType::Class)),
        }
    }

    pub fn get_field_ref(&self, index: u16) -> Result<MemberRef, JvmError> {
        match self.get(index)? {
            RuntimeConstant::Field(member) => Ok(*member),
            _ => Err(self.mismatch(index, RuntimeConstantType::Field)),
        }
    }

    pub fn get_method_ref(&self, index: u16) -> Result<MemberRef, JvmError> {
        match self.get(index)? {
            RuntimeConstant::Method(member) => Ok(*member),
            _ => Err(self.mismatch(index, RuntimeConstantType::Method)),
        }
    }

    pub fn get_interface_method_ref(&self, index: u16) -> Result<MemberRef, JvmError> {
        match self.get(index)? {
            RuntimeConstant::InterfaceMethod(member) => Ok(*member),
            // invokeinterface through a plain MethodRef is tolerated the way
            // HotSpot tolerates it for methods inherited from Object.
            RuntimeConstant::Method(member) => Ok(*member),
            _ => Err(self.mismatch(index, RuntimeConstantType::InterfaceMethod)),
        }
    }

    /// Any method-shaped entry; `invokespecial`/`invokestatic` accept both
    /// Method and InterfaceMethod tags.
    pub fn get_any_method_ref(&self, index: u16) -> Result<MemberRef, JvmError> {
        match self.get(index)? {
            RuntimeConstant::Method(member) | RuntimeConstant::InterfaceMethod(member) => {
                Ok(*member)
            }
            _ => Err(self.mismatch(index, RuntimeConstantType::Method)),
        }
    }
}
