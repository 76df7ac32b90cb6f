mod common;

use bonsai_classfile::flags::{ClassFlags, FieldFlags, MethodFlags};
use bonsai_classfile::opcode::Opcode::*;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::vm::Value;
use common::*;

#[test]
fn garbage_bytes_raise_class_format_error() {
    let (vm, mut thread) = boot_vm(vec![("Broken", vec![0xde, 0xad, 0xbe, 0xef])]);
    let err = load_class(&vm, &mut thread, "Broken").unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/ClassFormatError");
}

#[test]
fn missing_class_raises_no_class_def_found() {
    let (vm, mut thread) = boot_vm(vec![]);
    let err = load_class(&vm, &mut thread, "does/not/Exist").unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/NoClassDefFoundError");
}

#[test]
fn malformed_names_are_rejected_before_lookup() {
    let (vm, mut thread) = boot_vm(vec![]);
    for bad in ["", "a//b", "/X", "X/", "[Q"] {
        let err = load_class(&vm, &mut thread, bad).unwrap_err();
        assert_eq!(
            thrown_class_name(&vm, err),
            "java/lang/NoClassDefFoundError",
            "name {:?}",
            bad
        );
    }
}

#[test]
fn super_cycle_raises_circularity_error() {
    let a = ClassWriter::new("A", Some("B")).finish();
    let b = ClassWriter::new("B", Some("A")).finish();
    let (vm, mut thread) = boot_vm(vec![("A", a), ("B", b)]);
    let err = load_class(&vm, &mut thread, "A").unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/ClassCircularityError");
}

#[test]
fn loading_is_idempotent_for_the_bootstrap_path() {
    let simple = ClassWriter::new("Simple", Some(OBJECT)).finish();
    let (vm, mut thread) = boot_vm(vec![("Simple", simple)]);
    let first = load_class(&vm, &mut thread, "Simple").unwrap();
    let second = load_class(&vm, &mut thread, "Simple").unwrap();
    assert_eq!(first, second);
}

#[test]
fn wrong_declared_name_is_rejected() {
    // Bytes declare class "X" but are served under the name "Y".
    let x = ClassWriter::new("X", Some(OBJECT)).finish();
    let (vm, mut thread) = boot_vm(vec![("Y", x)]);
    let err = load_class(&vm, &mut thread, "Y").unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/NoClassDefFoundError");
}

#[test]
fn extending_an_interface_is_an_incompatible_class_change() {
    let mut iface = ClassWriter::new("SomeIface", Some(OBJECT));
    iface.flags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT);
    let sub = ClassWriter::new("Sub", Some("SomeIface")).finish();
    let (vm, mut thread) = boot_vm(vec![("SomeIface", iface.finish()), ("Sub", sub)]);
    let err = load_class(&vm, &mut thread, "Sub").unwrap_err();
    assert_eq!(
        thrown_class_name(&vm, err),
        "java/lang/IncompatibleClassChangeError"
    );
}

#[test]
fn array_classes_synthesize_on_demand() {
    let (vm, mut thread) = boot_vm(vec![]);
    let ints = load_class(&vm, &mut thread, "[I").unwrap();
    let ints_again = load_class(&vm, &mut thread, "[I").unwrap();
    assert_eq!(ints, ints_again);
    let strings = load_class(&vm, &mut thread, "[[Ljava/lang/String;").unwrap();
    let ma = vm.method_area_read();
    assert!(ma.get_class(&strings).is_array());
    // Arrays are assignable to Object.
    let object = ma
        .lookup_class_id(vm.interner().get_or_intern(OBJECT))
        .unwrap();
    assert!(ma.is_subclass_of(ints, object));
}

#[test]
fn constant_value_statics_apply_at_initialization() {
    let mut w = ClassWriter::new("Consts", Some(OBJECT));
    let answer = w.integer(42);
    let greeting = w.string("hi there");
    let big = w.long(1 << 40);
    w.add_field_with_constant(
        FieldFlags::PUBLIC | FieldFlags::STATIC | FieldFlags::FINAL,
        "ANSWER",
        "I",
        Some(answer),
    );
    w.add_field_with_constant(
        FieldFlags::PUBLIC | FieldFlags::STATIC | FieldFlags::FINAL,
        "GREETING",
        "Ljava/lang/String;",
        Some(greeting),
    );
    w.add_field_with_constant(
        FieldFlags::PUBLIC | FieldFlags::STATIC | FieldFlags::FINAL,
        "BIG",
        "J",
        Some(big),
    );
    w.add_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        "touch",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 0,
            code: vec![op(Return)],
            exception_table: vec![],
        },
    );

    let (vm, mut thread) = boot_vm(vec![("Consts", w.finish())]);
    call_static(&vm, &mut thread, "Consts", "touch", "()V", vec![]).unwrap();
    assert_eq!(static_field(&vm, "Consts", "ANSWER", "I"), Value::Integer(42));
    assert_eq!(static_field(&vm, "Consts", "BIG", "J"), Value::Long(1 << 40));
    let greeting = static_field(&vm, "Consts", "GREETING", "Ljava/lang/String;");
    let Value::Ref(s) = greeting else {
        panic!("expected an interned string, got {:?}", greeting)
    };
    assert_eq!(vm.read_java_string(s).unwrap(), "hi there");
}

#[test]
fn failed_clinit_poisons_the_class() {
    let mut w = ClassWriter::new("Doomed", Some(OBJECT));
    let npe = w.class("java/lang/NullPointerException");
    let npe_init = w.method_ref("java/lang/NullPointerException", "<init>", "()V");
    let mut code = vec![op(New)];
    code.extend_from_slice(&idx(npe));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(npe_init));
    code.push(op(Athrow));
    w.add_method(
        MethodFlags::STATIC,
        "<clinit>",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );
    w.add_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        "touch",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 0,
            code: vec![op(Return)],
            exception_table: vec![],
        },
    );

    let (vm, mut thread) = boot_vm(vec![("Doomed", w.finish())]);
    // First initiation wraps the NPE in ExceptionInInitializerError.
    let err = call_static(&vm, &mut thread, "Doomed", "touch", "()V", vec![]).unwrap_err();
    assert_eq!(
        thrown_class_name(&vm, err),
        "java/lang/ExceptionInInitializerError"
    );
    // Later initiations observe the poisoned state.
    let err = call_static(&vm, &mut thread, "Doomed", "touch", "()V", vec![]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/NoClassDefFoundError");
}
