use crate::keys::{ClassId, FieldDescriptorId};
use crate::vm::Value;
use bonsai_classfile::flags::FieldFlags;
use std::sync::RwLock;

#[derive(Debug, Copy, Clone)]
pub struct InstanceField {
    pub flags: FieldFlags,
    pub descriptor_id: FieldDescriptorId,
    /// Byte offset within the object payload.
    pub offset: usize,
    pub declaring_class: ClassId,
}

/// A static slot aliases its storage: the value lives here, not on the heap.
#[derive(Debug)]
pub struct StaticField {
    pub flags: FieldFlags,
    pub descriptor_id: FieldDescriptorId,
    pub value: RwLock<Value>,
}
