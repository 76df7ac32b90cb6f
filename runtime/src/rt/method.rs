use crate::error::JvmError;
use crate::interpreter::prepare::PreparedCode;
use crate::keys::{ClassId, MethodDescriptorId, Symbol};
use crate::throw_exception;
use bonsai_classfile::attribute::{CodeAttribute, ExceptionTableEntry, LineNumberEntry};
use bonsai_classfile::flags::MethodFlags;
use once_cell::sync::OnceCell;
use std::sync::Mutex;

pub struct CodeBody {
    pub code: Box<[u8]>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub exception_table: Vec<ExceptionTableEntry>,
    line_numbers: Option<Vec<LineNumberEntry>>,
    /// Filled on first entry; the prepare lock serializes concurrent
    /// first-callers. Boxed so the prepared code keeps its address while
    /// the method registry grows.
    prepared: OnceCell<Box<PreparedCode>>,
    prepare_lock: Mutex<()>,
}

impl CodeBody {
    /// Prepares on first use, idempotently; concurrent first-callers block
    /// on the prepare lock.
    pub fn prepared_code(&self) -> Result<&PreparedCode, JvmError> {
        if let Some(prepared) = self.prepared.get() {
            return Ok(prepared);
        }
        let _guard = self.prepare_lock.lock().unwrap();
        if self.prepared.get().is_none() {
            let prepared = crate::interpreter::prepare::prepare(self)?;
            let _ = self.prepared.set(Box::new(prepared));
        }
        Ok(self.prepared.get().expect("prepare just completed"))
    }
}

impl From<CodeAttribute> for CodeBody {
    fn from(attr: CodeAttribute) -> Self {
        Self {
            code: attr.code.into_boxed_slice(),
            max_stack: attr.max_stack,
            max_locals: attr.max_locals,
            exception_table: attr.exception_table,
            line_numbers: attr.line_numbers,
            prepared: OnceCell::new(),
            prepare_lock: Mutex::new(()),
        }
    }
}

pub enum MethodBody {
    Interpreted(CodeBody),
    Native,
    Abstract,
}

pub struct Method {
    class_id: ClassId,
    pub name: Symbol,
    pub desc: Symbol,
    descriptor_id: MethodDescriptorId,
    flags: MethodFlags,
    /// Stack slots consumed by an invoke: descriptor slots plus the
    /// receiver for instance methods.
    args_slots: u16,
    /// Slot in the virtual dispatch table, for methods that have one.
    vtable_index: OnceCell<u16>,
    body: MethodBody,
}

impl Method {
    pub fn new(
        class_id: ClassId,
        name: Symbol,
        desc: Symbol,
        descriptor_id: MethodDescriptorId,
        flags: MethodFlags,
        args_slots: u16,
        code: Option<CodeAttribute>,
    ) -> Result<Self, JvmError> {
        let body = if flags.is_abstract() {
            MethodBody::Abstract
        } else if flags.is_native() {
            MethodBody::Native
        } else {
            let attr = code.ok_or_else(|| {
                crate::build_exception!(ClassFormatError, "non-native method without Code")
            })?;
            MethodBody::Interpreted(CodeBody::from(attr))
        };
        Ok(Self {
            class_id,
            name,
            desc,
            descriptor_id,
            flags,
            args_slots,
            vtable_index: OnceCell::new(),
            body,
        })
    }

    /// A synthetic abstract stub satisfying an inherited interface method
    /// that no concrete implementation covers.
    pub fn miranda(
        class_id: ClassId,
        name: Symbol,
        desc: Symbol,
        descriptor_id: MethodDescriptorId,
        args_slots: u16,
    ) -> Self {
        Self {
            class_id,
            name,
            desc,
            descriptor_id,
            flags: MethodFlags::PUBLIC | MethodFlags::ABSTRACT | MethodFlags::SYNTHETIC,
            args_slots,
            vtable_index: OnceCell::new(),
            body: MethodBody::Abstract,
        }
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.is_abstract()
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native()
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.is_synchronized()
    }

    pub fn descriptor_id(&self) -> MethodDescriptorId {
        self.descriptor_id
    }

    pub fn args_slots(&self) -> u16 {
        self.args_slots
    }

    pub fn set_vtable_index(&self, index: u16) {
        // Idempotent: re-linking a shared slot writes the same value.
        let _ = self.vtable_index.set(index);
    }

    pub fn get_vtable_index(&self) -> Option<u16> {
        self.vtable_index.get().copied()
    }

    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    pub fn code_body(&self) -> Result<&CodeBody, JvmError> {
        match &self.body {
            MethodBody::Interpreted(code_body) => Ok(code_body),
            _ => throw_exception!(InternalError, "method has no bytecode body"),
        }
    }

    pub fn get_exception_table(&self) -> Result<&[ExceptionTableEntry], JvmError> {
        Ok(&self.code_body()?.exception_table)
    }

    pub fn get_frame_attributes(&self) -> Result<(u16, u16), JvmError> {
        let body = self.code_body()?;
        Ok((body.max_stack, body.max_locals))
    }

    /// Source line for a byte offset into the original code.
    pub fn get_line_number_by_bci(&self, bci: usize) -> Option<u16> {
        let MethodBody::Interpreted(body) = &self.body else {
            return None;
        };
        let table = body.line_numbers.as_ref()?;
        let mut result = None;
        for entry in table {
            if entry.start_pc as usize <= bci {
                result = Some(entry.line_number);
            } else {
                break;
            }
        }
        result.or_else(|| table.first().map(|e| e.line_number))
    }
}
