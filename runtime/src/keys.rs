use lasso::ThreadedRodeo;
use std::num::NonZeroU32;

/// Interned UTF-8. Identical names and descriptors compare by key.
pub type Symbol = lasso::Spur;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            pub fn new(raw: NonZeroU32) -> Self {
                Self(raw)
            }

            /// One-based: `from_usize(len)` right after a push yields the id
            /// of the pushed element.
            pub fn from_usize(index: usize) -> Self {
                Self(NonZeroU32::new(index as u32).expect("id must be non-zero"))
            }

            pub fn to_index(self) -> usize {
                self.0.get() as usize - 1
            }

            pub fn into_inner(self) -> NonZeroU32 {
                self.0
            }

            pub fn into_raw(self) -> u32 {
                self.0.get()
            }

            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }
        }
    };
}

id_type!(ClassId);
id_type!(MethodId);
id_type!(ThreadId);
id_type!(MonitorId);
id_type!(FieldDescriptorId);
id_type!(MethodDescriptorId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub name: Symbol,
    pub desc: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: Symbol,
    pub desc: Symbol,
}

/// Key of the in-process native table: `(class, name, descriptor)`.
/// `class == None` matches on any receiver class; used for the array clone
/// special case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullyQualifiedMethodKey {
    pub class: Option<Symbol>,
    pub name: Symbol,
    pub desc: Symbol,
}

impl FullyQualifiedMethodKey {
    pub fn new(class: Symbol, name: Symbol, desc: Symbol) -> Self {
        Self {
            class: Some(class),
            name,
            desc,
        }
    }

    pub fn new_with_str(
        class: &str,
        name: &str,
        desc: &str,
        interner: &ThreadedRodeo,
    ) -> Self {
        Self {
            class: Some(interner.get_or_intern(class)),
            name: interner.get_or_intern(name),
            desc: interner.get_or_intern(desc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_one_based() {
        let id = ClassId::from_usize(1);
        assert_eq!(id.to_index(), 0);
        assert_eq!(ClassId::from_usize(17).to_index(), 16);
    }

    #[test]
    #[should_panic]
    fn zero_id_is_rejected() {
        let _ = MethodId::from_usize(0);
    }
}
