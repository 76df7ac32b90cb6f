use crate::attribute::{FieldAttr, parse_field_attrs};
use crate::constant::ConstantPool;
use crate::error::ParseError;
use crate::flags::FieldFlags;
use crate::reader::Reader;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub access_flags: FieldFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<FieldAttr>,
}

impl FieldInfo {
    pub(crate) fn parse(r: &mut Reader, cp: &ConstantPool) -> Result<Self, ParseError> {
        Ok(Self {
            access_flags: FieldFlags::from_bits_retain(r.u16()?),
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: parse_field_attrs(r, cp)?,
        })
    }

    pub fn constant_value_index(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            FieldAttr::ConstantValue(idx) => Some(*idx),
            _ => None,
        })
    }
}
