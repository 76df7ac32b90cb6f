use crate::keys::FullyQualifiedMethodKey;
use crate::native::{NativeFn, NativeRegistry};

mod java_io;
mod java_lang;
mod java_lang_ref;

pub(super) fn register_all(registry: &mut NativeRegistry) {
    java_lang::register(registry);
    java_io::register(registry);
    java_lang_ref::register(registry);
}

pub(self) fn reg(
    registry: &mut NativeRegistry,
    class: &str,
    name: &str,
    desc: &str,
    f: NativeFn,
) {
    let key =
        FullyQualifiedMethodKey::new_with_str(class, name, desc, &registry.string_interner);
    registry.register(key, f);
}

/// Class-agnostic registration, for entries dispatched on any receiver.
pub(self) fn reg_any(registry: &mut NativeRegistry, name: &str, desc: &str, f: NativeFn) {
    let key = FullyQualifiedMethodKey {
        class: None,
        name: registry.string_interner.get_or_intern(name),
        desc: registry.string_interner.get_or_intern(desc),
    };
    registry.register(key, f);
}
