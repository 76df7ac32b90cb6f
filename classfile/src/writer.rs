//! A small class-file writer. Enough to synthesize classes for tools and
//! tests without a Java compiler; not a general-purpose assembler.

use crate::MAGIC;
use crate::attribute::ExceptionTableEntry;
use crate::flags::{ClassFlags, FieldFlags, MethodFlags};
use byteorder::{BigEndian, WriteBytesExt};

#[derive(Clone, PartialEq)]
enum PoolEntry {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
}

impl PoolEntry {
    fn tag(&self) -> u8 {
        match self {
            PoolEntry::Utf8(_) => 1,
            PoolEntry::Integer(_) => 3,
            PoolEntry::Float(_) => 4,
            PoolEntry::Long(_) => 5,
            PoolEntry::Double(_) => 6,
            PoolEntry::Class(_) => 7,
            PoolEntry::String(_) => 8,
            PoolEntry::FieldRef(..) => 9,
            PoolEntry::MethodRef(..) => 10,
            PoolEntry::InterfaceMethodRef(..) => 11,
            PoolEntry::NameAndType(..) => 12,
        }
    }

    fn slots(&self) -> u16 {
        match self {
            PoolEntry::Long(_) | PoolEntry::Double(_) => 2,
            _ => 1,
        }
    }
}

struct FieldDecl {
    flags: FieldFlags,
    name_index: u16,
    descriptor_index: u16,
    constant_value: Option<u16>,
}

struct MethodDecl {
    flags: MethodFlags,
    name_index: u16,
    descriptor_index: u16,
    code: Option<MethodCode>,
}

pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
}

pub struct ClassWriter {
    pool: Vec<PoolEntry>,
    next_index: u16,
    flags: ClassFlags,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodDecl>,
    code_attr_name: u16,
    constant_value_attr_name: u16,
}

impl ClassWriter {
    pub fn new(this_name: &str, super_name: Option<&str>) -> Self {
        let mut w = Self {
            pool: Vec::new(),
            next_index: 1,
            flags: ClassFlags::PUBLIC | ClassFlags::SUPER,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            code_attr_name: 0,
            constant_value_attr_name: 0,
        };
        w.code_attr_name = w.utf8("Code");
        w.constant_value_attr_name = w.utf8("ConstantValue");
        w.this_class = w.class(this_name);
        w.super_class = match super_name {
            Some(name) => w.class(name),
            None => 0,
        };
        w
    }

    pub fn flags(&mut self, flags: ClassFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    fn push(&mut self, entry: PoolEntry) -> u16 {
        // Linear dedup; pools built here stay small.
        let mut index = 1;
        for existing in &self.pool {
            if *existing == entry {
                return index;
            }
            index += existing.slots();
        }
        let assigned = self.next_index;
        self.next_index += entry.slots();
        self.pool.push(entry);
        assigned
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let bytes = encode_modified_utf8(s);
        self.push(PoolEntry::Utf8(bytes))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.push(PoolEntry::Class(name_index))
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let idx = self.utf8(value);
        self.push(PoolEntry::String(idx))
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.push(PoolEntry::Integer(value))
    }

    pub fn float(&mut self, value: f32) -> u16 {
        self.push(PoolEntry::Float(value))
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.push(PoolEntry::Long(value))
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.push(PoolEntry::Double(value))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.push(PoolEntry::NameAndType(name_index, descriptor_index))
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let nat = self.name_and_type(name, descriptor);
        self.push(PoolEntry::FieldRef(class_index, nat))
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let nat = self.name_and_type(name, descriptor);
        self.push(PoolEntry::MethodRef(class_index, nat))
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let nat = self.name_and_type(name, descriptor);
        self.push(PoolEntry::InterfaceMethodRef(class_index, nat))
    }

    pub fn add_interface(&mut self, name: &str) -> &mut Self {
        let idx = self.class(name);
        self.interfaces.push(idx);
        self
    }

    pub fn add_field(&mut self, flags: FieldFlags, name: &str, descriptor: &str) -> &mut Self {
        self.add_field_with_constant(flags, name, descriptor, None)
    }

    pub fn add_field_with_constant(
        &mut self,
        flags: FieldFlags,
        name: &str,
        descriptor: &str,
        constant_value: Option<u16>,
    ) -> &mut Self {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.fields.push(FieldDecl {
            flags,
            name_index,
            descriptor_index,
            constant_value,
        });
        self
    }

    /// A method without a Code attribute: native or abstract.
    pub fn add_bodyless_method(
        &mut self,
        flags: MethodFlags,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.methods.push(MethodDecl {
            flags,
            name_index,
            descriptor_index,
            code: None,
        });
        self
    }

    pub fn add_method(
        &mut self,
        flags: MethodFlags,
        name: &str,
        descriptor: &str,
        code: MethodCode,
    ) -> &mut Self {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.methods.push(MethodDecl {
            flags,
            name_index,
            descriptor_index,
            code: Some(code),
        });
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(256);
        out.write_u32::<BigEndian>(MAGIC).unwrap();
        out.write_u16::<BigEndian>(0).unwrap(); // minor
        out.write_u16::<BigEndian>(52).unwrap(); // major: 1.8-era

        out.write_u16::<BigEndian>(self.next_index).unwrap();
        for entry in &self.pool {
            out.push(entry.tag());
            match entry {
                PoolEntry::Utf8(bytes) => {
                    out.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
                    out.extend_from_slice(bytes);
                }
                PoolEntry::Integer(v) => out.write_i32::<BigEndian>(*v).unwrap(),
                PoolEntry::Float(v) => out.write_u32::<BigEndian>(v.to_bits()).unwrap(),
                PoolEntry::Long(v) => out.write_i64::<BigEndian>(*v).unwrap(),
                PoolEntry::Double(v) => out.write_u64::<BigEndian>(v.to_bits()).unwrap(),
                PoolEntry::Class(i) | PoolEntry::String(i) => {
                    out.write_u16::<BigEndian>(*i).unwrap();
                }
                PoolEntry::FieldRef(a, b)
                | PoolEntry::MethodRef(a, b)
                | PoolEntry::InterfaceMethodRef(a, b)
                | PoolEntry::NameAndType(a, b) => {
                    out.write_u16::<BigEndian>(*a).unwrap();
                    out.write_u16::<BigEndian>(*b).unwrap();
                }
            }
        }

        out.write_u16::<BigEndian>(self.flags.bits()).unwrap();
        out.write_u16::<BigEndian>(self.this_class).unwrap();
        out.write_u16::<BigEndian>(self.super_class).unwrap();

        out.write_u16::<BigEndian>(self.interfaces.len() as u16).unwrap();
        for idx in &self.interfaces {
            out.write_u16::<BigEndian>(*idx).unwrap();
        }

        out.write_u16::<BigEndian>(self.fields.len() as u16).unwrap();
        for field in &self.fields {
            out.write_u16::<BigEndian>(field.flags.bits()).unwrap();
            out.write_u16::<BigEndian>(field.name_index).unwrap();
            out.write_u16::<BigEndian>(field.descriptor_index).unwrap();
            match field.constant_value {
                Some(cv) => {
                    out.write_u16::<BigEndian>(1).unwrap();
                    out.write_u16::<BigEndian>(self.constant_value_attr_name).unwrap();
                    out.write_u32::<BigEndian>(2).unwrap();
                    out.write_u16::<BigEndian>(cv).unwrap();
                }
                None => out.write_u16::<BigEndian>(0).unwrap(),
            }
        }

        out.write_u16::<BigEndian>(self.methods.len() as u16).unwrap();
        for method in &self.methods {
            out.write_u16::<BigEndian>(method.flags.bits()).unwrap();
            out.write_u16::<BigEndian>(method.name_index).unwrap();
            out.write_u16::<BigEndian>(method.descriptor_index).unwrap();
            match &method.code {
                Some(code) => {
                    let attr_len = 2 + 2 + 4 + code.code.len() + 2
                        + code.exception_table.len() * 8
                        + 2;
                    out.write_u16::<BigEndian>(1).unwrap();
                    out.write_u16::<BigEndian>(self.code_attr_name).unwrap();
                    out.write_u32::<BigEndian>(attr_len as u32).unwrap();
                    out.write_u16::<BigEndian>(code.max_stack).unwrap();
                    out.write_u16::<BigEndian>(code.max_locals).unwrap();
                    out.write_u32::<BigEndian>(code.code.len() as u32).unwrap();
                    out.extend_from_slice(&code.code);
                    out.write_u16::<BigEndian>(code.exception_table.len() as u16).unwrap();
                    for entry in &code.exception_table {
                        out.write_u16::<BigEndian>(entry.start_pc).unwrap();
                        out.write_u16::<BigEndian>(entry.end_pc).unwrap();
                        out.write_u16::<BigEndian>(entry.handler_pc).unwrap();
                        out.write_u16::<BigEndian>(entry.catch_type).unwrap();
                    }
                    out.write_u16::<BigEndian>(0).unwrap(); // no nested attrs
                }
                None => out.write_u16::<BigEndian>(0).unwrap(),
            }
        }

        out.write_u16::<BigEndian>(0).unwrap(); // class attributes
        out
    }
}

fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) as u8 & 0x1F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) as u8 & 0x0F));
                out.push(0x80 | ((unit >> 6) as u8 & 0x3F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClassFile;
    use crate::opcode::Opcode;

    #[test]
    fn writes_a_method_with_code() {
        let mut w = ClassWriter::new("T", Some("java/lang/Object"));
        w.add_method(
            MethodFlags::PUBLIC | MethodFlags::STATIC,
            "answer",
            "()I",
            MethodCode {
                max_stack: 1,
                max_locals: 0,
                code: vec![Opcode::Bipush as u8, 42, Opcode::Ireturn as u8],
                exception_table: vec![],
            },
        );
        let cf = ClassFile::try_from(w.finish().as_slice()).unwrap();
        assert_eq!(cf.methods.len(), 1);
        let mut m = cf.methods.into_iter().next().unwrap();
        let code = m.take_code().unwrap();
        assert_eq!(code.code, vec![Opcode::Bipush as u8, 42, Opcode::Ireturn as u8]);
        assert_eq!(code.max_stack, 1);
    }

    #[test]
    fn dedups_pool_entries() {
        let mut w = ClassWriter::new("T", Some("java/lang/Object"));
        let a = w.method_ref("T", "m", "()V");
        let b = w.method_ref("T", "m", "()V");
        assert_eq!(a, b);
    }

    #[test]
    fn modified_utf8_encodes_nul_as_two_bytes() {
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        assert_eq!(encode_modified_utf8("ab"), vec![b'a', b'b']);
    }
}
