use crate::error::JvmError;
use crate::heap::HeapRef;
use crate::keys::{ClassId, MethodKey};
use crate::{MethodId, Symbol};
use bonsai_classfile::descriptor::PrimitiveType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Array classes synthesize no methods of their own; they share
/// java/lang/Object's dispatch table.
pub struct PrimitiveArrayClass {
    pub name: Symbol,
    pub super_id: ClassId,
    pub element_type: PrimitiveType,
    pub vtable: Vec<MethodId>,
    pub vtable_index: HashMap<MethodKey, u16>,
    pub(crate) mirror_ref: AtomicUsize,
}

pub struct ObjectArrayClass {
    pub name: Symbol,
    pub super_id: ClassId,
    pub element_class_id: ClassId,
    /// Array-of-array nesting depth, 1 for a plain `[L...;`.
    pub dimensions: u8,
    pub vtable: Vec<MethodId>,
    pub vtable_index: HashMap<MethodKey, u16>,
    pub(crate) mirror_ref: AtomicUsize,
}

macro_rules! array_class_common {
    ($ty:ident) => {
        impl $ty {
            pub fn get_mirror_ref(&self) -> Option<HeapRef> {
                match self.mirror_ref.load(Ordering::Acquire) {
                    0 => None,
                    mirror => Some(mirror),
                }
            }

            pub fn set_mirror_ref(&self, mirror: HeapRef) {
                self.mirror_ref.store(mirror, Ordering::Release);
            }

            pub fn vtable_entry(&self, index: u16) -> Result<MethodId, JvmError> {
                self.vtable.get(index as usize).copied().ok_or_else(|| {
                    JvmError::IllegalInternalState("vtable index out of range".to_string())
                })
            }

            pub fn lookup_virtual(&self, key: &MethodKey) -> Option<MethodId> {
                let index = self.vtable_index.get(key)?;
                self.vtable.get(*index as usize).copied()
            }
        }
    };
}

array_class_common!(PrimitiveArrayClass);
array_class_common!(ObjectArrayClass);
