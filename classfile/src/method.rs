use crate::attribute::{CodeAttribute, MethodAttr, parse_method_attrs};
use crate::constant::ConstantPool;
use crate::error::ParseError;
use crate::flags::MethodFlags;
use crate::reader::Reader;

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access_flags: MethodFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<MethodAttr>,
}

impl MethodInfo {
    pub(crate) fn parse(r: &mut Reader, cp: &ConstantPool) -> Result<Self, ParseError> {
        Ok(Self {
            access_flags: MethodFlags::from_bits_retain(r.u16()?),
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: parse_method_attrs(r, cp)?,
        })
    }

    pub fn take_code(&mut self) -> Option<CodeAttribute> {
        let pos = self
            .attributes
            .iter()
            .position(|a| matches!(a, MethodAttr::Code(_)))?;
        match self.attributes.remove(pos) {
            MethodAttr::Code(code) => Some(code),
            _ => unreachable!(),
        }
    }
}
