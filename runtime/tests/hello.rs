mod common;

use bonsai_classfile::flags::MethodFlags;
use bonsai_classfile::opcode::Opcode::*;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::vm::Value;
use common::*;

/// The classic smoke test: `main` prints through the native println bridge
/// and returns. Exercises string interning, static resolution and native
/// dispatch in one go.
#[test]
fn hello_world_main_runs_to_completion() {
    let mut w = ClassWriter::new("HelloWorld", Some(OBJECT));
    let hi = w.string("Hi");
    let println = w.method_ref("java/lang/System", "println", "(Ljava/lang/String;)V");
    let mut code = vec![op(LdcW)];
    code.extend_from_slice(&idx(hi));
    code.push(op(Invokestatic));
    code.extend_from_slice(&idx(println));
    code.push(op(Return));
    w.add_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        "main",
        "([Ljava/lang/String;)V",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code,
            exception_table: vec![],
        },
    );

    let (vm, mut thread) = boot_vm(vec![("HelloWorld", w.finish())]);
    let result = call_static(
        &vm,
        &mut thread,
        "HelloWorld",
        "main",
        "([Ljava/lang/String;)V",
        vec![Value::Null],
    );
    assert!(result.is_ok(), "main failed: {:?}", result.err());
}
