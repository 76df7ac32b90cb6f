mod common;

use bonsai_classfile::flags::{FieldFlags, MethodFlags};
use bonsai_classfile::opcode::Opcode::*;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::interpreter::Interpreter;
use bonsai_runtime::vm::Value;
use common::*;

const WORKERS: usize = 2;
const INCREMENTS: i32 = 10_000;

fn counter_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Counter", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "count", "I");
    let count = w.field_ref("Counter", "count", "I");
    let mut code = vec![op(Getstatic)];
    code.extend_from_slice(&idx(count));
    code.push(op(Iconst1));
    code.push(op(Iadd));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(count));
    code.push(op(Return));
    // The contended section: a synchronized static increment.
    w.add_method(
        MethodFlags::PUBLIC | MethodFlags::STATIC | MethodFlags::SYNCHRONIZED,
        "inc",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

fn worker_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Worker", Some("java/lang/Thread"));
    let ctor = default_ctor(&mut w, "java/lang/Thread");
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let limit = w.integer(INCREMENTS);
    let inc = w.method_ref("Counter", "inc", "()V");
    // for (int i = 0; i < INCREMENTS; i++) Counter.inc();
    let mut code = vec![
        op(Iconst0),
        op(Istore1),
        op(Iload1), // 2: loop head
        op(LdcW),
    ];
    code.extend_from_slice(&idx(limit));
    code.push(op(IfIcmpge)); // 6
    code.extend_from_slice(&12i16.to_be_bytes()); // -> 18
    code.push(op(Invokestatic)); // 9
    code.extend_from_slice(&idx(inc));
    code.push(op(Iinc)); // 12
    code.push(1);
    code.push(1);
    code.push(op(Goto)); // 15
    code.extend_from_slice(&(-13i16).to_be_bytes()); // -> 2
    code.push(op(Return)); // 18
    w.add_method(
        MethodFlags::PUBLIC,
        "run",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

/// Two Java threads hammer one synchronized counter; whatever mix of thin
/// and inflated locking happens along the way, no increment may be lost.
#[test]
fn contended_synchronized_counter_is_exact() {
    let (vm, mut thread) = boot_vm(vec![
        ("Counter", counter_class()),
        ("Worker", worker_class()),
    ]);

    let worker_class_id = load_class(&vm, &mut thread, "Worker").unwrap();
    let ctor = find_static(&vm, worker_class_id, "<init>", "()V");

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let obj = vm.alloc_instance_auto(&mut thread, worker_class_id).unwrap();
        Interpreter::invoke_instance_method(&mut thread, ctor, &vm, vec![Value::Ref(obj)])
            .unwrap();
        workers.push(obj);
    }
    for worker in &workers {
        vm.spawn_java_thread(&mut thread, *worker).unwrap();
    }
    for worker in &workers {
        vm.join_thread(&thread, *worker, None).unwrap();
    }

    assert_eq!(
        static_field(&vm, "Counter", "count", "I"),
        Value::Integer(INCREMENTS * WORKERS as i32)
    );
}

/// Thread.sleep responds to interrupt0 with an InterruptedException whose
/// delivery clears the flag.
#[test]
fn sleeping_java_thread_can_be_interrupted() {
    let mut sleeper = ClassWriter::new("Sleeper", Some("java/lang/Thread"));
    let ctor = default_ctor(&mut sleeper, "java/lang/Thread");
    sleeper.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    sleeper.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "interrupted", "I");

    let sleep = sleeper.method_ref("java/lang/Thread", "sleep", "(J)V");
    let interrupted_exc = sleeper.class("java/lang/InterruptedException");
    let flag = sleeper.field_ref("Sleeper", "interrupted", "I");
    // try { Thread.sleep(60000); } catch (InterruptedException e) {
    //     interrupted = 1; }
    let mut code = Vec::new();
    code.push(op(Ldc2W));
    let sixty_seconds = sleeper.long(60_000);
    code.extend_from_slice(&idx(sixty_seconds));
    code.push(op(Invokestatic));
    code.extend_from_slice(&idx(sleep));
    code.push(op(Return)); // 6
    code.push(op(Pop)); // 7: handler
    code.push(op(Iconst1));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(flag));
    code.push(op(Return));
    sleeper.add_method(
        MethodFlags::PUBLIC,
        "run",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 1,
            code,
            exception_table: vec![bonsai_classfile::attribute::ExceptionTableEntry {
                start_pc: 0,
                end_pc: 6,
                handler_pc: 7,
                catch_type: interrupted_exc,
            }],
        },
    );

    let (vm, mut thread) = boot_vm(vec![("Sleeper", sleeper.finish())]);
    let class_id = load_class(&vm, &mut thread, "Sleeper").unwrap();
    let ctor = find_static(&vm, class_id, "<init>", "()V");
    let obj = vm.alloc_instance_auto(&mut thread, class_id).unwrap();
    Interpreter::invoke_instance_method(&mut thread, ctor, &vm, vec![Value::Ref(obj)]).unwrap();

    vm.spawn_java_thread(&mut thread, obj).unwrap();
    // Give the sleeper time to park, then interrupt it.
    std::thread::sleep(std::time::Duration::from_millis(200));
    let handle = vm
        .handle_for_thread_obj(obj)
        .expect("sleeper is still alive");
    bonsai_runtime::thread::interrupt_thread(&vm.monitors, &handle);

    vm.join_thread(&thread, obj, None).unwrap();
    assert_eq!(
        static_field(&vm, "Sleeper", "interrupted", "I"),
        Value::Integer(1)
    );
}
