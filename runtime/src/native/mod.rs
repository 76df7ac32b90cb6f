use crate::VirtualMachine;
use crate::error::JvmError;
use crate::keys::FullyQualifiedMethodKey;
use crate::thread::JavaThreadState;
use crate::vm::Value;
use dashmap::DashMap;
use lasso::ThreadedRodeo;
use std::collections::HashMap;
use std::sync::Arc;

pub mod dll;
mod preregistered;

pub type NativeRet = Result<Option<Value>, JvmError>;
pub type NativeFn = fn(&VirtualMachine, &mut JavaThreadState, &[Value]) -> NativeRet;

/// The in-process native table: `(class, name, descriptor)` to a built-in
/// entry point. Dynamically loaded natives resolve through the dll cache
/// on their first call and land in the `dynamic` side table.
pub struct NativeRegistry {
    table: HashMap<FullyQualifiedMethodKey, NativeFn>,
    dynamic: DashMap<FullyQualifiedMethodKey, NativeFn>,
    pub string_interner: Arc<ThreadedRodeo>,
}

impl NativeRegistry {
    pub fn new(string_interner: Arc<ThreadedRodeo>) -> Self {
        let mut registry = Self {
            table: HashMap::new(),
            dynamic: DashMap::new(),
            string_interner,
        };
        preregistered::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, key: FullyQualifiedMethodKey, f: NativeFn) {
        self.table.insert(key, f);
    }

    /// Lazily resolved symbols go here; the bind happens at most once per
    /// key and later callers hit the cache.
    pub fn register_dynamic(&self, key: FullyQualifiedMethodKey, f: NativeFn) {
        self.dynamic.insert(key, f);
    }

    /// Exact class match first (built-in then dynamically bound), then the
    /// class-agnostic entry (used by the array clone special case).
    pub fn get(&self, key: &FullyQualifiedMethodKey) -> Option<NativeFn> {
        if let Some(f) = self.table.get(key) {
            return Some(*f);
        }
        if let Some(f) = self.dynamic.get(key) {
            return Some(*f);
        }
        let wildcard = FullyQualifiedMethodKey {
            class: None,
            name: key.name,
            desc: key.desc,
        };
        self.table.get(&wildcard).copied()
    }
}
