use crate::constant::ConstantPool;
use crate::error::ParseError;
use crate::reader::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the catch class, 0 for catch-all.
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Option<Vec<LineNumberEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerClassEntry {
    pub inner_class_index: u16,
    pub outer_class_index: u16,
    pub inner_name_index: u16,
    pub access_flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassAttr {
    SourceFile(u16),
    InnerClasses(Vec<InnerClassEntry>),
    EnclosingMethod { class_index: u16, method_index: u16 },
    Signature(u16),
    Synthetic,
    RuntimeVisibleAnnotations(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldAttr {
    ConstantValue(u16),
    Signature(u16),
    Synthetic,
    RuntimeVisibleAnnotations(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodAttr {
    Code(CodeAttribute),
    Exceptions(Vec<u16>),
    Signature(u16),
    Synthetic,
    RuntimeVisibleAnnotations(Vec<u8>),
    RuntimeVisibleParameterAnnotations(Vec<u8>),
    AnnotationDefault(Vec<u8>),
}

fn parse_code(r: &mut Reader, cp: &ConstantPool) -> Result<CodeAttribute, ParseError> {
    let max_stack = r.u16()?;
    let max_locals = r.u16()?;
    let code_length = r.u32()? as usize;
    let code = r.bytes(code_length)?;

    let exception_count = r.u16()?;
    let mut exception_table = Vec::with_capacity(exception_count as usize);
    for _ in 0..exception_count {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.u16()?,
            end_pc: r.u16()?,
            handler_pc: r.u16()?,
            catch_type: r.u16()?,
        });
    }

    // Nested code attributes: only LineNumberTable is retained.
    let mut line_numbers: Option<Vec<LineNumberEntry>> = None;
    let attr_count = r.u16()?;
    for _ in 0..attr_count {
        let name_index = r.u16()?;
        let length = r.u32()? as usize;
        match cp.get_utf8(name_index)? {
            "LineNumberTable" => {
                let count = r.u16()?;
                let entries = line_numbers.get_or_insert_with(Vec::new);
                entries.reserve(count as usize);
                for _ in 0..count {
                    entries.push(LineNumberEntry {
                        start_pc: r.u16()?,
                        line_number: r.u16()?,
                    });
                }
            }
            _ => r.skip(length)?,
        }
    }

    Ok(CodeAttribute {
        max_stack,
        max_locals,
        code,
        exception_table,
        line_numbers,
    })
}

pub(crate) fn parse_class_attrs(
    r: &mut Reader,
    cp: &ConstantPool,
) -> Result<Vec<ClassAttr>, ParseError> {
    let count = r.u16()?;
    let mut attrs = Vec::new();
    for _ in 0..count {
        let name_index = r.u16()?;
        let length = r.u32()? as usize;
        match cp.get_utf8(name_index)? {
            "SourceFile" => attrs.push(ClassAttr::SourceFile(r.u16()?)),
            "InnerClasses" => {
                let n = r.u16()?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    entries.push(InnerClassEntry {
                        inner_class_index: r.u16()?,
                        outer_class_index: r.u16()?,
                        inner_name_index: r.u16()?,
                        access_flags: r.u16()?,
                    });
                }
                attrs.push(ClassAttr::InnerClasses(entries));
            }
            "EnclosingMethod" => attrs.push(ClassAttr::EnclosingMethod {
                class_index: r.u16()?,
                method_index: r.u16()?,
            }),
            "Signature" => attrs.push(ClassAttr::Signature(r.u16()?)),
            "Synthetic" => attrs.push(ClassAttr::Synthetic),
            "RuntimeVisibleAnnotations" => {
                attrs.push(ClassAttr::RuntimeVisibleAnnotations(r.bytes(length)?));
            }
            _ => r.skip(length)?,
        }
    }
    Ok(attrs)
}

pub(crate) fn parse_field_attrs(
    r: &mut Reader,
    cp: &ConstantPool,
) -> Result<Vec<FieldAttr>, ParseError> {
    let count = r.u16()?;
    let mut attrs = Vec::new();
    for _ in 0..count {
        let name_index = r.u16()?;
        let length = r.u32()? as usize;
        match cp.get_utf8(name_index)? {
            "ConstantValue" => attrs.push(FieldAttr::ConstantValue(r.u16()?)),
            "Signature" => attrs.push(FieldAttr::Signature(r.u16()?)),
            "Synthetic" => attrs.push(FieldAttr::Synthetic),
            "RuntimeVisibleAnnotations" => {
                attrs.push(FieldAttr::RuntimeVisibleAnnotations(r.bytes(length)?));
            }
            _ => r.skip(length)?,
        }
    }
    Ok(attrs)
}

pub(crate) fn parse_method_attrs(
    r: &mut Reader,
    cp: &ConstantPool,
) -> Result<Vec<MethodAttr>, ParseError> {
    let count = r.u16()?;
    let mut attrs = Vec::new();
    for _ in 0..count {
        let name_index = r.u16()?;
        let length = r.u32()? as usize;
        match cp.get_utf8(name_index)? {
            "Code" => attrs.push(MethodAttr::Code(parse_code(r, cp)?)),
            "Exceptions" => {
                let n = r.u16()?;
                let mut indexes = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    indexes.push(r.u16()?);
                }
                attrs.push(MethodAttr::Exceptions(indexes));
            }
            "Signature" => attrs.push(MethodAttr::Signature(r.u16()?)),
            "Synthetic" => attrs.push(MethodAttr::Synthetic),
            "RuntimeVisibleAnnotations" => {
                attrs.push(MethodAttr::RuntimeVisibleAnnotations(r.bytes(length)?));
            }
            "RuntimeVisibleParameterAnnotations" => {
                attrs.push(MethodAttr::RuntimeVisibleParameterAnnotations(r.bytes(length)?));
            }
            "AnnotationDefault" => attrs.push(MethodAttr::AnnotationDefault(r.bytes(length)?)),
            _ => r.skip(length)?,
        }
    }
    Ok(attrs)
}
