use crate::error::ParseError;
use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveType {
    pub fn values() -> &'static [PrimitiveType] {
        use PrimitiveType::*;
        &[Boolean, Byte, Char, Short, Int, Long, Float, Double]
    }

    pub fn java_name(&self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Byte => "byte",
            PrimitiveType::Char => "char",
            PrimitiveType::Short => "short",
            PrimitiveType::Int => "int",
            PrimitiveType::Long => "long",
            PrimitiveType::Float => "float",
            PrimitiveType::Double => "double",
        }
    }

    pub fn descriptor_char(&self) -> char {
        match self {
            PrimitiveType::Boolean => 'Z',
            PrimitiveType::Byte => 'B',
            PrimitiveType::Char => 'C',
            PrimitiveType::Short => 'S',
            PrimitiveType::Int => 'I',
            PrimitiveType::Long => 'J',
            PrimitiveType::Float => 'F',
            PrimitiveType::Double => 'D',
        }
    }
}

/// Storage category of a field or array element, with its in-heap width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AllocationType {
    Boolean = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Reference = 8,
}

impl AllocationType {
    pub fn byte_size(&self) -> usize {
        match self {
            AllocationType::Boolean | AllocationType::Byte => 1,
            AllocationType::Char | AllocationType::Short => 2,
            AllocationType::Int | AllocationType::Float => 4,
            AllocationType::Long | AllocationType::Double => 8,
            AllocationType::Reference => size_of::<usize>(),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, AllocationType::Reference)
    }
}

impl From<PrimitiveType> for AllocationType {
    fn from(p: PrimitiveType) -> Self {
        match p {
            PrimitiveType::Boolean => AllocationType::Boolean,
            PrimitiveType::Byte => AllocationType::Byte,
            PrimitiveType::Char => AllocationType::Char,
            PrimitiveType::Short => AllocationType::Short,
            PrimitiveType::Int => AllocationType::Int,
            PrimitiveType::Long => AllocationType::Long,
            PrimitiveType::Float => AllocationType::Float,
            PrimitiveType::Double => AllocationType::Double,
        }
    }
}

/// The `atype` operand of the `newarray` bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ArrayType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl ArrayType {
    pub fn descriptor(&self) -> &'static str {
        match self {
            ArrayType::Boolean => "[Z",
            ArrayType::Char => "[C",
            ArrayType::Float => "[F",
            ArrayType::Double => "[D",
            ArrayType::Byte => "[B",
            ArrayType::Short => "[S",
            ArrayType::Int => "[I",
            ArrayType::Long => "[J",
        }
    }

    pub fn element_type(&self) -> PrimitiveType {
        match self {
            ArrayType::Boolean => PrimitiveType::Boolean,
            ArrayType::Char => PrimitiveType::Char,
            ArrayType::Float => PrimitiveType::Float,
            ArrayType::Double => PrimitiveType::Double,
            ArrayType::Byte => PrimitiveType::Byte,
            ArrayType::Short => PrimitiveType::Short,
            ArrayType::Int => PrimitiveType::Int,
            ArrayType::Long => PrimitiveType::Long,
        }
    }
}

/// A parsed field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JavaType {
    Primitive(PrimitiveType),
    Instance(String),
    Array(Box<JavaType>),
}

impl JavaType {
    pub fn as_allocation_type(&self) -> AllocationType {
        match self {
            JavaType::Primitive(p) => AllocationType::from(*p),
            JavaType::Instance(_) | JavaType::Array(_) => AllocationType::Reference,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.as_allocation_type().is_reference()
    }

    /// Slots in the two-word sense: longs and doubles take two.
    pub fn slot_count(&self) -> usize {
        match self {
            JavaType::Primitive(PrimitiveType::Long | PrimitiveType::Double) => 2,
            _ => 1,
        }
    }

    pub fn get_primitive_array_element_type(&self) -> Option<PrimitiveType> {
        match self {
            JavaType::Array(elem) => match elem.as_ref() {
                JavaType::Primitive(p) => Some(*p),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_instance_array_element_descriptor(&self) -> Option<String> {
        match self {
            JavaType::Array(elem) => match elem.as_ref() {
                JavaType::Instance(name) => Some(name.clone()),
                JavaType::Array(_) => Some(elem.descriptor_string()),
                JavaType::Primitive(_) => None,
            },
            _ => None,
        }
    }

    pub fn descriptor_string(&self) -> String {
        match self {
            JavaType::Primitive(p) => p.descriptor_char().to_string(),
            JavaType::Instance(name) => format!("L{};", name),
            JavaType::Array(elem) => format!("[{}", elem.descriptor_string()),
        }
    }

    fn parse(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<JavaType> {
        match chars.next()? {
            'Z' => Some(JavaType::Primitive(PrimitiveType::Boolean)),
            'B' => Some(JavaType::Primitive(PrimitiveType::Byte)),
            'C' => Some(JavaType::Primitive(PrimitiveType::Char)),
            'S' => Some(JavaType::Primitive(PrimitiveType::Short)),
            'I' => Some(JavaType::Primitive(PrimitiveType::Int)),
            'J' => Some(JavaType::Primitive(PrimitiveType::Long)),
            'F' => Some(JavaType::Primitive(PrimitiveType::Float)),
            'D' => Some(JavaType::Primitive(PrimitiveType::Double)),
            '[' => Some(JavaType::Array(Box::new(JavaType::parse(chars)?))),
            'L' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        ';' => break,
                        c => name.push(c),
                    }
                }
                if name.is_empty() {
                    return None;
                }
                Some(JavaType::Instance(name))
            }
            _ => None,
        }
    }
}

impl TryFrom<&str> for JavaType {
    type Error = ParseError;

    fn try_from(desc: &str) -> Result<Self, Self::Error> {
        let mut chars = desc.chars().peekable();
        let ty = JavaType::parse(&mut chars)
            .ok_or_else(|| ParseError::BadFieldDescriptor(desc.to_string()))?;
        if chars.next().is_some() {
            return Err(ParseError::BadFieldDescriptor(desc.to_string()));
        }
        Ok(ty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Value(JavaType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<JavaType>,
    pub return_type: ReturnType,
}

impl MethodDescriptor {
    /// Argument slots consumed on the operand stack, not counting `this`.
    pub fn arg_slot_count(&self) -> usize {
        self.params.iter().map(JavaType::slot_count).sum()
    }

    pub fn returns_value(&self) -> bool {
        matches!(self.return_type, ReturnType::Value(_))
    }

    pub fn to_java_signature(&self, class_name: &str, method_name: &str) -> String {
        let params = self
            .params
            .iter()
            .map(|p| match p {
                JavaType::Primitive(p) => p.java_name().to_string(),
                JavaType::Instance(name) => name.replace('/', "."),
                JavaType::Array(_) => p.descriptor_string().replace('/', "."),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}.{}({})", class_name.replace('/', "."), method_name, params)
    }
}

impl TryFrom<&str> for MethodDescriptor {
    type Error = ParseError;

    fn try_from(desc: &str) -> Result<Self, Self::Error> {
        let bad = || ParseError::BadMethodDescriptor(desc.to_string());
        let mut chars = desc.chars().peekable();
        if chars.next() != Some('(') {
            return Err(bad());
        }
        let mut params = Vec::new();
        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                Some(_) => params.push(JavaType::parse(&mut chars).ok_or_else(bad)?),
                None => return Err(bad()),
            }
        }
        let return_type = match chars.peek() {
            Some('V') => {
                chars.next();
                ReturnType::Void
            }
            Some(_) => ReturnType::Value(JavaType::parse(&mut chars).ok_or_else(bad)?),
            None => return Err(bad()),
        };
        if chars.next().is_some() {
            return Err(bad());
        }
        Ok(Self { params, return_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_descriptors() {
        assert_eq!(
            JavaType::try_from("I").unwrap(),
            JavaType::Primitive(PrimitiveType::Int)
        );
        assert_eq!(
            JavaType::try_from("Ljava/lang/String;").unwrap(),
            JavaType::Instance("java/lang/String".to_string())
        );
        let arr = JavaType::try_from("[[D").unwrap();
        assert_eq!(arr.descriptor_string(), "[[D");
        assert!(JavaType::try_from("L;").is_err());
        assert!(JavaType::try_from("II").is_err());
    }

    #[test]
    fn parses_method_descriptors() {
        let d = MethodDescriptor::try_from("(I[Ljava/lang/String;J)V").unwrap();
        assert_eq!(d.params.len(), 3);
        assert_eq!(d.arg_slot_count(), 4);
        assert_eq!(d.return_type, ReturnType::Void);

        let d = MethodDescriptor::try_from("()Ljava/lang/Object;").unwrap();
        assert!(d.returns_value());
        assert!(MethodDescriptor::try_from("(I").is_err());
        assert!(MethodDescriptor::try_from("(I)VV").is_err());
    }

    #[test]
    fn java_signature_rendering() {
        let d = MethodDescriptor::try_from("(ILjava/lang/String;)V").unwrap();
        assert_eq!(
            d.to_java_signature("com/example/Main", "run"),
            "com.example.Main.run(int, java.lang.String)"
        );
    }
}
