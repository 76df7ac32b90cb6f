mod common;

use bonsai_classfile::flags::MethodFlags;
use bonsai_classfile::writer::ClassWriter;
use bonsai_runtime::native::dll::NativeLibraryLoader;
use bonsai_runtime::native::{NativeFn, NativeRet};
use bonsai_runtime::thread::JavaThreadState;
use bonsai_runtime::vm::{Value, VirtualMachine};
use common::*;

fn native_magic(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Integer(77)))
}

/// A stand-in for the platform linker: one library exposing one symbol
/// under its JNI-mangled name.
struct FakeLinker;

impl NativeLibraryLoader for FakeLinker {
    fn open(&self, library_name: &str) -> Option<usize> {
        (library_name == "bits").then_some(1)
    }

    fn symbol(&self, handle: usize, mangled_name: &str) -> Option<NativeFn> {
        (handle == 1 && mangled_name == "Java_NativeBits_magic")
            .then_some(native_magic as NativeFn)
    }

    fn close(&self, _handle: usize) {}
}

fn native_bits_class() -> Vec<u8> {
    let mut w = ClassWriter::new("NativeBits", Some(OBJECT));
    w.add_bodyless_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC | MethodFlags::NATIVE,
        "magic",
        "()I",
    );
    w.add_bodyless_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC | MethodFlags::NATIVE,
        "missing",
        "()I",
    );
    w.finish()
}

/// A native method the built-in table does not know resolves through the
/// dynamic-loader collaborator on first call; the bound entry is cached so
/// the second call skips the search.
#[test]
fn unknown_native_binds_through_the_library_loader() {
    let (vm, mut thread) = boot_vm(vec![("NativeBits", native_bits_class())]);
    vm.install_native_loader(Box::new(FakeLinker));
    assert!(vm.load_native_library("bits", None));
    assert!(!vm.load_native_library("other", None));

    for _ in 0..2 {
        let result =
            call_static(&vm, &mut thread, "NativeBits", "magic", "()I", vec![]).unwrap();
        assert_eq!(result, Some(Value::Integer(77)));
    }

    // A symbol no library exports still surfaces as UnsatisfiedLinkError.
    let err =
        call_static(&vm, &mut thread, "NativeBits", "missing", "()I", vec![]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/UnsatisfiedLinkError");
}

/// Without an installed loader the old behavior stands.
#[test]
fn no_loader_means_unsatisfied_link() {
    let (vm, mut thread) = boot_vm(vec![("NativeBits", native_bits_class())]);
    let err = call_static(&vm, &mut thread, "NativeBits", "magic", "()I", vec![]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/UnsatisfiedLinkError");
}
