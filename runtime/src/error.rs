use crate::heap::HeapRef;
use crate::keys::{MethodKey, Symbol};
use bonsai_classfile::descriptor::MethodDescriptor;
use bonsai_classfile::error::ParseError;
use lasso::ThreadedRodeo;
use std::fmt::Display;

/// Errors carried on a thread while it runs VM code. Java-level throwables
/// travel as `JavaException` (description, not yet allocated) or
/// `JavaExceptionThrown` (already materialized on the heap); everything else
/// is a VM-internal failure that aborts the current operation.
#[derive(Debug)]
pub enum JvmError {
    MainClassNotFound(String),
    ClassFormat(ParseError),
    StackOverflow,
    FrameStackIsEmpty,
    OperandStackIsEmpty,
    HeapExhausted(usize),
    LocalVariableNotFound(u16),
    UnexpectedType(String),
    WrongHeapAddress(HeapRef),
    IllegalInternalState(String),
    JavaException(JavaExceptionFromJvm),
    JavaExceptionThrown(HeapRef),
}

impl From<ParseError> for JvmError {
    fn from(value: ParseError) -> Self {
        JvmError::ClassFormat(value)
    }
}

impl From<JavaExceptionFromJvm> for JvmError {
    fn from(value: JavaExceptionFromJvm) -> Self {
        JvmError::JavaException(value)
    }
}

impl Display for JvmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl JvmError {
    pub fn into_pretty_string(self, interner: &ThreadedRodeo) -> String {
        match self {
            JvmError::JavaException(ex) => {
                let mut result = ex.kind.class_name_dot();
                if let Some(message) = ex.message {
                    result.push_str(": ");
                    result.push_str(&message.into_resolved(interner));
                }
                if let Some(cause) = ex.cause {
                    result.push_str(&format!(
                        "\nCaused by: {}",
                        JvmError::JavaException(*cause).into_pretty_string(interner)
                    ));
                }
                result
            }
            _ => format!("{:?}", self),
        }
    }
}

/// How to construct the Java-level object for a pending exception.
pub struct JavaExceptionReference {
    pub class: &'static str,
    pub name: &'static str,
    pub descriptor: &'static str,
}

/// Messages stay symbolic until someone actually needs the string.
#[derive(Debug, Clone)]
pub enum ExceptionMessage {
    Resolved(String),
    MethodNotFound(MethodKey, Symbol),
    ClassName(Symbol),
}

impl ExceptionMessage {
    pub fn into_resolved(self, interner: &ThreadedRodeo) -> String {
        match self {
            ExceptionMessage::Resolved(s) => s,
            ExceptionMessage::MethodNotFound(method_key, class_sym) => {
                let desc_str = interner.resolve(&method_key.desc);
                let class_name = interner.resolve(&class_sym);
                let method_name = interner.resolve(&method_key.name);
                match MethodDescriptor::try_from(desc_str) {
                    Ok(desc) => desc.to_java_signature(class_name, method_name),
                    Err(_) => format!("{}.{}{}", class_name, method_name, desc_str),
                }
            }
            ExceptionMessage::ClassName(sym) => interner.resolve(&sym).replace('/', "."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JavaExceptionKind {
    // Format and linkage
    ClassFormatError,
    LinkageError,
    NoClassDefFoundError,
    ClassNotFoundException,
    ClassCircularityError,
    IncompatibleClassChangeError,
    NoSuchFieldError,
    NoSuchMethodError,
    IllegalAccessError,
    AbstractMethodError,
    ExceptionInInitializerError,
    UnsatisfiedLinkError,
    // Runtime checks
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    ClassCastException,
    ArithmeticException,
    NegativeArraySizeException,
    // Resources
    OutOfMemoryError,
    StackOverflowError,
    // Concurrency
    IllegalMonitorStateException,
    InterruptedException,
    IllegalThreadStateException,
    IllegalArgumentException,
    // Misc
    InternalError,
    IOException,
    CloneNotSupportedException,
}

impl JavaExceptionKind {
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::ClassFormatError => "java/lang/ClassFormatError",
            Self::LinkageError => "java/lang/LinkageError",
            Self::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            Self::ClassNotFoundException => "java/lang/ClassNotFoundException",
            Self::ClassCircularityError => "java/lang/ClassCircularityError",
            Self::IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError",
            Self::NoSuchFieldError => "java/lang/NoSuchFieldError",
            Self::NoSuchMethodError => "java/lang/NoSuchMethodError",
            Self::IllegalAccessError => "java/lang/IllegalAccessError",
            Self::AbstractMethodError => "java/lang/AbstractMethodError",
            Self::ExceptionInInitializerError => "java/lang/ExceptionInInitializerError",
            Self::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::OutOfMemoryError => "java/lang/OutOfMemoryError",
            Self::StackOverflowError => "java/lang/StackOverflowError",
            Self::IllegalMonitorStateException => "java/lang/IllegalMonitorStateException",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::IllegalThreadStateException => "java/lang/IllegalThreadStateException",
            Self::IllegalArgumentException => "java/lang/IllegalArgumentException",
            Self::InternalError => "java/lang/InternalError",
            Self::IOException => "java/io/IOException",
            Self::CloneNotSupportedException => "java/lang/CloneNotSupportedException",
        }
    }

    pub fn class_name_dot(self) -> String {
        self.class_name().replace('/', ".")
    }

    /// Errors (as opposed to exceptions) pass through `<clinit>` failure
    /// unwrapped.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            Self::NullPointerException
                | Self::ArrayIndexOutOfBoundsException
                | Self::ArrayStoreException
                | Self::ClassCastException
                | Self::ArithmeticException
                | Self::NegativeArraySizeException
                | Self::IllegalMonitorStateException
                | Self::InterruptedException
                | Self::IllegalThreadStateException
                | Self::IllegalArgumentException
                | Self::ClassNotFoundException
                | Self::IOException
                | Self::CloneNotSupportedException
        )
    }
}

#[derive(Debug, Clone)]
pub struct JavaExceptionFromJvm {
    pub kind: JavaExceptionKind,
    pub message: Option<ExceptionMessage>,
    pub cause: Option<Box<JavaExceptionFromJvm>>,
}

impl JavaExceptionFromJvm {
    const CONSTRUCTOR_NAME: &'static str = "<init>";
    const STRING_PARAM_CONSTRUCTOR: &'static str = "(Ljava/lang/String;)V";
    const NO_PARAM_CONSTRUCTOR: &'static str = "()V";

    pub fn new(kind: JavaExceptionKind) -> Self {
        Self {
            kind,
            message: None,
            cause: None,
        }
    }

    pub fn with_message(kind: JavaExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::Resolved(message.into())),
            cause: None,
        }
    }

    pub fn with_method_not_found(
        kind: JavaExceptionKind,
        key: MethodKey,
        class_sym: Symbol,
    ) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::MethodNotFound(key, class_sym)),
            cause: None,
        }
    }

    pub fn with_class_name(kind: JavaExceptionKind, class_sym: Symbol) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::ClassName(class_sym)),
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: JavaExceptionFromJvm) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn as_reference(&self) -> JavaExceptionReference {
        JavaExceptionReference {
            class: self.kind.class_name(),
            name: Self::CONSTRUCTOR_NAME,
            descriptor: if self.message.is_some() {
                Self::STRING_PARAM_CONSTRUCTOR
            } else {
                Self::NO_PARAM_CONSTRUCTOR
            },
        }
    }
}
