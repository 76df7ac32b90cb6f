use crate::error::ParseError;
use crate::reader::Reader;
use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConstantTag {
    Utf8 = 1,
    Integer = 3,
    Float = 4,
    Long = 5,
    Double = 6,
    Class = 7,
    String = 8,
    FieldRef = 9,
    MethodRef = 10,
    InterfaceMethodRef = 11,
    NameAndType = 12,
    MethodHandle = 15,
    MethodType = 16,
    Dynamic = 17,
    InvokeDynamic = 18,
    Module = 19,
    Package = 20,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantInfo {
    /// Second slot of a long/double entry; never referenced directly.
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// The parsed constant pool. Entry 0 is a placeholder so indices from the
/// class file can be used directly; longs and doubles occupy two slots with
/// the second marked `Unusable`.
#[derive(Debug, PartialEq)]
pub struct ConstantPool {
    pub inner: Vec<ConstantInfo>,
}

impl ConstantPool {
    pub fn parse(r: &mut Reader) -> Result<Self, ParseError> {
        let count = r.u16()?;
        let mut inner = Vec::with_capacity(count as usize);
        inner.push(ConstantInfo::Unusable);

        let mut index: u16 = 1;
        while index < count {
            let raw_tag = r.u8()?;
            let tag = ConstantTag::try_from(raw_tag)
                .map_err(|_| ParseError::UnknownConstantTag { tag: raw_tag, index })?;
            let two_slots = matches!(tag, ConstantTag::Long | ConstantTag::Double);

            let entry = match tag {
                ConstantTag::Utf8 => {
                    let len = r.u16()? as usize;
                    let bytes = r.bytes(len)?;
                    ConstantInfo::Utf8(decode_modified_utf8(&bytes).ok_or(ParseError::BadUtf8(index))?)
                }
                ConstantTag::Integer => ConstantInfo::Integer(r.i32()?),
                ConstantTag::Float => ConstantInfo::Float(r.f32()?),
                ConstantTag::Long => ConstantInfo::Long(r.i64()?),
                ConstantTag::Double => ConstantInfo::Double(r.f64()?),
                ConstantTag::Class => ConstantInfo::Class { name_index: r.u16()? },
                ConstantTag::String => ConstantInfo::String { string_index: r.u16()? },
                ConstantTag::FieldRef => ConstantInfo::FieldRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                ConstantTag::MethodRef => ConstantInfo::MethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                ConstantTag::InterfaceMethodRef => ConstantInfo::InterfaceMethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                ConstantTag::NameAndType => ConstantInfo::NameAndType {
                    name_index: r.u16()?,
                    descriptor_index: r.u16()?,
                },
                ConstantTag::MethodHandle => ConstantInfo::MethodHandle {
                    reference_kind: r.u8()?,
                    reference_index: r.u16()?,
                },
                ConstantTag::MethodType => ConstantInfo::MethodType { descriptor_index: r.u16()? },
                ConstantTag::Dynamic => ConstantInfo::Dynamic {
                    bootstrap_method_attr_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                ConstantTag::InvokeDynamic => ConstantInfo::InvokeDynamic {
                    bootstrap_method_attr_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                ConstantTag::Module => ConstantInfo::Module { name_index: r.u16()? },
                ConstantTag::Package => ConstantInfo::Package { name_index: r.u16()? },
            };

            inner.push(entry);
            index += 1;
            if two_slots {
                inner.push(ConstantInfo::Unusable);
                index += 1;
            }
        }

        Ok(Self { inner })
    }

    pub fn get(&self, index: u16) -> Result<&ConstantInfo, ParseError> {
        match self.inner.get(index as usize) {
            None | Some(ConstantInfo::Unusable) => Err(ParseError::BadConstantIndex(index)),
            Some(entry) => Ok(entry),
        }
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ParseError> {
        match self.get(index)? {
            ConstantInfo::Utf8(s) => Ok(s),
            _ => Err(ParseError::WrongConstantType { index, expected: "Utf8" }),
        }
    }

    /// Resolves a `Class` entry to its binary name string.
    pub fn get_class_name(&self, index: u16) -> Result<&str, ParseError> {
        match self.get(index)? {
            ConstantInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ParseError::WrongConstantType { index, expected: "Class" }),
        }
    }

    pub fn get_name_and_type(&self, index: u16) -> Result<(&str, &str), ParseError> {
        match self.get(index)? {
            ConstantInfo::NameAndType { name_index, descriptor_index } => {
                Ok((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?))
            }
            _ => Err(ParseError::WrongConstantType { index, expected: "NameAndType" }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() <= 1
    }
}

/// Decodes the class-file flavor of UTF-8: NUL is encoded as 0xC0 0x80 and
/// supplementary characters arrive as CESU-8 surrogate pairs.
fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let unit = if b & 0x80 == 0 {
            i += 1;
            b as u16
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1)?;
            if b2 & 0xC0 != 0x80 {
                return None;
            }
            i += 2;
            ((b as u16 & 0x1F) << 6) | (b2 as u16 & 0x3F)
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1)?;
            let b3 = *bytes.get(i + 2)?;
            if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                return None;
            }
            i += 3;
            ((b as u16 & 0x0F) << 12) | ((b2 as u16 & 0x3F) << 6) | (b3 as u16 & 0x3F)
        } else {
            return None;
        };
        units.push(unit);
    }
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(bytes: &[u8]) -> Result<ConstantPool, ParseError> {
        let mut r = Reader::new(bytes);
        ConstantPool::parse(&mut r)
    }

    #[test]
    fn long_occupies_two_slots() {
        // count=4: [1]=Long, [2]=unusable, [3]=Utf8 "x"
        let bytes = [0x00, 0x04, 5, 0, 0, 0, 0, 0, 0, 0, 42, 1, 0, 1, b'x'];
        let cp = pool_of(&bytes).unwrap();
        assert_eq!(cp.get(1).unwrap(), &ConstantInfo::Long(42));
        assert_eq!(cp.get(2), Err(ParseError::BadConstantIndex(2)));
        assert_eq!(cp.get_utf8(3).unwrap(), "x");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = [0x00, 0x02, 99];
        assert_eq!(
            pool_of(&bytes),
            Err(ParseError::UnknownConstantTag { tag: 99, index: 1 })
        );
    }

    #[test]
    fn modified_utf8_null_encoding() {
        assert_eq!(decode_modified_utf8(&[0xC0, 0x80]).unwrap(), "\0");
        assert_eq!(decode_modified_utf8(&[b'h', b'i']).unwrap(), "hi");
        assert!(decode_modified_utf8(&[0xF8]).is_none());
    }
}
