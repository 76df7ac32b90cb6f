use crate::heap::HeapRef;
use crate::native::NativeFn;
use dashmap::DashMap;

/// The dynamic-loader collaborator. The core never touches the platform
/// linker itself; an embedder supplies this, and resolved symbols must
/// already be bridged to the VM's native calling convention.
pub trait NativeLibraryLoader: Send + Sync {
    fn open(&self, library_name: &str) -> Option<usize>;
    fn symbol(&self, handle: usize, mangled_name: &str) -> Option<NativeFn>;
    fn close(&self, handle: usize);
}

/// Handles keyed by `(library, defining class loader)`; the bootstrap
/// loader is `None`.
pub struct DllCache {
    handles: DashMap<(String, Option<HeapRef>), usize>,
}

impl Default for DllCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DllCache {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    pub fn open(
        &self,
        loader: &dyn NativeLibraryLoader,
        library: &str,
        class_loader: Option<HeapRef>,
    ) -> Option<usize> {
        let key = (library.to_string(), class_loader);
        if let Some(handle) = self.handles.get(&key) {
            return Some(*handle);
        }
        let handle = loader.open(library)?;
        self.handles.insert(key, handle);
        Some(handle)
    }

    /// Walks every open library looking for a mangled entry point; first
    /// hit wins, the way the original resolves lazily bound natives.
    pub fn search_symbol(
        &self,
        loader: &dyn NativeLibraryLoader,
        mangled_name: &str,
    ) -> Option<NativeFn> {
        self.handles
            .iter()
            .find_map(|entry| loader.symbol(*entry.value(), mangled_name))
    }

    pub fn close_all(&self, loader: &dyn NativeLibraryLoader) {
        for entry in self.handles.iter() {
            loader.close(*entry.value());
        }
        self.handles.clear();
    }
}

/// Standard JNI short-name mangling: `Java_` + mangled class + `_` +
/// mangled method, with `_`, `;` and `[` escaped as `_1`, `_2`, `_3` and
/// non-ASCII as `_0xxxx`.
pub fn mangle_native_name(class_name: &str, method_name: &str) -> String {
    let mut out = String::from("Java_");
    mangle_into(&mut out, &class_name.replace('/', "."));
    out.push('_');
    mangle_into(&mut out, method_name);
    out
}

/// The long form used for overloaded natives: short name + `__` + the
/// mangled argument part of the descriptor.
pub fn mangle_native_name_with_descriptor(
    class_name: &str,
    method_name: &str,
    descriptor: &str,
) -> String {
    let mut out = mangle_native_name(class_name, method_name);
    out.push_str("__");
    let params = descriptor
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map_or("", |(params, _)| params);
    mangle_into(&mut out, &params.replace('/', "."));
    out
}

fn mangle_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '.' => out.push('_'),
            '_' => out.push_str("_1"),
            ';' => out.push_str("_2"),
            '[' => out.push_str("_3"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => out.push_str(&format!("_0{:04x}", c as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeRet;
    use crate::thread::JavaThreadState;
    use crate::vm::{Value, VirtualMachine};

    #[test]
    fn mangles_per_jni_spec() {
        assert_eq!(
            mangle_native_name("java/lang/Object", "hashCode"),
            "Java_java_lang_Object_hashCode"
        );
        assert_eq!(
            mangle_native_name("pkg/Cls_x", "do_it"),
            "Java_pkg_Cls_1x_do_1it"
        );
    }

    #[test]
    fn long_name_carries_the_argument_signature() {
        assert_eq!(
            mangle_native_name_with_descriptor("pkg/Cls", "m", "(Ljava/lang/String;I)V"),
            "Java_pkg_Cls_m__Ljava_lang_String_2I"
        );
        assert_eq!(
            mangle_native_name_with_descriptor("pkg/Cls", "m", "()V"),
            "Java_pkg_Cls_m__"
        );
    }

    fn stub_native(
        _vm: &VirtualMachine,
        _thread: &mut JavaThreadState,
        _args: &[Value],
    ) -> NativeRet {
        Ok(None)
    }

    struct OneLibrary;

    impl NativeLibraryLoader for OneLibrary {
        fn open(&self, library_name: &str) -> Option<usize> {
            (library_name == "present").then_some(7)
        }

        fn symbol(&self, handle: usize, mangled_name: &str) -> Option<NativeFn> {
            (handle == 7 && mangled_name == "Java_X_found").then_some(stub_native as NativeFn)
        }

        fn close(&self, _handle: usize) {}
    }

    #[test]
    fn cache_reuses_handles_and_finds_symbols() {
        let cache = DllCache::new();
        let loader = OneLibrary;
        assert_eq!(cache.open(&loader, "present", None), Some(7));
        assert_eq!(cache.open(&loader, "present", None), Some(7));
        assert_eq!(cache.open(&loader, "absent", None), None);
        assert!(cache.search_symbol(&loader, "Java_X_found").is_some());
        assert!(cache.search_symbol(&loader, "Java_X_missing").is_none());
    }
}
