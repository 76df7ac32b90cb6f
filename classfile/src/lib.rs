//! Parser and writer for the Java class-file binary format.
//!
//! The parser validates structure (magic word, constant-pool tags, attribute
//! framing) but performs no bytecode verification; that is the runtime's
//! business.

pub mod attribute;
pub mod constant;
pub mod descriptor;
pub mod error;
pub mod field;
pub mod flags;
pub mod method;
pub mod opcode;
pub mod reader;
pub mod writer;

use crate::attribute::{ClassAttr, parse_class_attrs};
use crate::constant::ConstantPool;
use crate::error::ParseError;
use crate::field::FieldInfo;
use crate::flags::ClassFlags;
use crate::method::MethodInfo;
use crate::reader::Reader;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub cp: ConstantPool,
    pub access_flags: ClassFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<ClassAttr>,
}

impl ClassFile {
    pub fn this_class_name(&self) -> Result<&str, ParseError> {
        self.cp.get_class_name(self.this_class)
    }

    /// `None` for java/lang/Object, which has super index 0.
    pub fn get_super_class_name(&self) -> Option<Result<&str, ParseError>> {
        if self.super_class == 0 {
            return None;
        }
        Some(self.cp.get_class_name(self.super_class))
    }

    pub fn source_file(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            ClassAttr::SourceFile(idx) => Some(*idx),
            _ => None,
        })
    }
}

impl TryFrom<&[u8]> for ClassFile {
    type Error = ParseError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let mut r = Reader::new(data);

        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ParseError::BadMagic(magic));
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;

        let cp = ConstantPool::parse(&mut r)?;

        let access_flags = ClassFlags::from_bits_retain(r.u16()?);
        let this_class = r.u16()?;
        let super_class = r.u16()?;

        let interface_count = r.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(r.u16()?);
        }

        let field_count = r.u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(FieldInfo::parse(&mut r, &cp)?);
        }

        let method_count = r.u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(MethodInfo::parse(&mut r, &cp)?);
        }

        let attributes = parse_class_attrs(&mut r, &cp)?;

        if r.remaining() != 0 {
            return Err(ParseError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            cp,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }
}

impl TryFrom<Vec<u8>> for ClassFile {
    type Error = ParseError;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        ClassFile::try_from(data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ClassWriter;

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(matches!(
            ClassFile::try_from(&bytes[..]),
            Err(ParseError::BadMagic(0))
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0x00];
        assert!(matches!(
            ClassFile::try_from(&bytes[..]),
            Err(ParseError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn parses_writer_output() {
        let bytes = ClassWriter::new("com/example/Empty", Some("java/lang/Object")).finish();
        let cf = ClassFile::try_from(bytes.as_slice()).unwrap();
        assert_eq!(cf.this_class_name().unwrap(), "com/example/Empty");
        assert_eq!(
            cf.get_super_class_name().unwrap().unwrap(),
            "java/lang/Object"
        );
        assert!(cf.fields.is_empty());
        assert!(cf.methods.is_empty());
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut bytes = ClassWriter::new("A", Some("java/lang/Object")).finish();
        bytes.push(0);
        assert!(matches!(
            ClassFile::try_from(bytes.as_slice()),
            Err(ParseError::TrailingBytes(1))
        ));
    }
}
