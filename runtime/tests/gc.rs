mod common;

use bonsai_classfile::descriptor::ArrayType;
use bonsai_classfile::flags::{FieldFlags, MethodFlags};
use bonsai_classfile::opcode::Opcode::*;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::heap::gc::GcOptions;
use bonsai_runtime::vm::Value;
use common::*;
use std::time::{Duration, Instant};

fn statics() -> MethodFlags {
    MethodFlags::PUBLIC | MethodFlags::STATIC
}

/// Tight allocation loop with no retained references on a heap pinned at
/// 256 KB: collections must keep it alive and most of the heap comes back.
#[test]
fn unretained_allocations_recycle_the_heap() {
    let mut config = small_config();
    config.initial_heap_size = 256 * 1024;
    config.max_heap_size = 256 * 1024;
    let (vm, mut thread) = boot_vm_with(config, vec![]);

    // 16384 blocks of 256 bytes each, 4 MB total through a 256 KB heap.
    for _ in 0..16384 {
        vm.alloc_primitive_array(&mut thread, ArrayType::Byte, 232)
            .expect("allocation must survive via collection");
    }

    vm.collect(
        &mut thread,
        GcOptions {
            keep_soft: true,
            compact: false,
        },
    );
    assert!(
        vm.heap_read().free_bytes() >= 192 * 1024,
        "expected at least 192 KB free, have {}",
        vm.heap_read().free_bytes()
    );
}

fn weak_holder(ref_class: &str) -> Vec<u8> {
    let ref_desc = format!("L{};", ref_class);
    let mut w = ClassWriter::new("Holder", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "keep", "Ljava/lang/Object;");
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "wref", &ref_desc);
    w.add_field(
        FieldFlags::PUBLIC | FieldFlags::STATIC,
        "q",
        "Ljava/lang/ref/ReferenceQueue;",
    );

    let keep = w.field_ref("Holder", "keep", "Ljava/lang/Object;");
    let wref = w.field_ref("Holder", "wref", &ref_desc);
    let q = w.field_ref("Holder", "q", "Ljava/lang/ref/ReferenceQueue;");
    let object = w.class(OBJECT);
    let object_init = w.method_ref(OBJECT, "<init>", "()V");
    let queue_class = w.class("java/lang/ref/ReferenceQueue");
    let queue_init = w.method_ref("java/lang/ref/ReferenceQueue", "<init>", "()V");
    let ref_class_idx = w.class(ref_class);
    let ref_init = w.method_ref(
        ref_class,
        "<init>",
        "(Ljava/lang/Object;Ljava/lang/ref/ReferenceQueue;)V",
    );

    let mut code = Vec::new();
    // keep = new Object()
    code.push(op(New));
    code.extend_from_slice(&idx(object));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(object_init));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(keep));
    // q = new ReferenceQueue()
    code.push(op(New));
    code.extend_from_slice(&idx(queue_class));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(queue_init));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(q));
    // wref = new WeakReference(keep, q)
    code.push(op(New));
    code.extend_from_slice(&idx(ref_class_idx));
    code.push(op(Dup));
    code.push(op(Getstatic));
    code.extend_from_slice(&idx(keep));
    code.push(op(Getstatic));
    code.extend_from_slice(&idx(q));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(ref_init));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(wref));
    code.push(op(Return));
    w.add_method(
        statics(),
        "setup",
        "()V",
        MethodCode {
            max_stack: 4,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );

    let keep = w.field_ref("Holder", "keep", "Ljava/lang/Object;");
    w.add_method(
        statics(),
        "drop",
        "()V",
        MethodCode {
            max_stack: 1,
            max_locals: 0,
            code: {
                let mut code = vec![op(AconstNull), op(Putstatic)];
                code.extend_from_slice(&idx(keep));
                code.push(op(Return));
                code
            },
            exception_table: vec![],
        },
    );

    let wref = w.field_ref("Holder", "wref", &ref_desc);
    let get = w.method_ref("java/lang/ref/Reference", "get", "()Ljava/lang/Object;");
    w.add_method(
        statics(),
        "getRef",
        "()Ljava/lang/Object;",
        MethodCode {
            max_stack: 1,
            max_locals: 0,
            code: {
                let mut code = vec![op(Getstatic)];
                code.extend_from_slice(&idx(wref));
                code.push(op(Invokevirtual));
                code.extend_from_slice(&idx(get));
                code.push(op(Areturn));
                code
            },
            exception_table: vec![],
        },
    );

    let q = w.field_ref("Holder", "q", "Ljava/lang/ref/ReferenceQueue;");
    let poll = w.method_ref(
        "java/lang/ref/ReferenceQueue",
        "poll",
        "()Ljava/lang/ref/Reference;",
    );
    w.add_method(
        statics(),
        "poll",
        "()Ljava/lang/ref/Reference;",
        MethodCode {
            max_stack: 1,
            max_locals: 0,
            code: {
                let mut code = vec![op(Getstatic)];
                code.extend_from_slice(&idx(q));
                code.push(op(Invokevirtual));
                code.extend_from_slice(&idx(poll));
                code.push(op(Areturn));
                code
            },
            exception_table: vec![],
        },
    );
    w.finish()
}

#[test]
fn weak_reference_clears_and_enqueues_exactly_once() {
    let (vm, mut thread) = boot_vm(vec![(
        "Holder",
        weak_holder("java/lang/ref/WeakReference"),
    )]);
    call_static(&vm, &mut thread, "Holder", "setup", "()V", vec![]).unwrap();

    let sweep = GcOptions {
        keep_soft: true,
        compact: false,
    };

    // Strongly reachable referent survives a collection.
    vm.collect(&mut thread, sweep);
    let value = call_static(&vm, &mut thread, "Holder", "getRef", "()Ljava/lang/Object;", vec![])
        .unwrap()
        .unwrap();
    assert!(matches!(value, Value::Ref(_)));

    // Drop the strong reference; the next collection clears the referent.
    call_static(&vm, &mut thread, "Holder", "drop", "()V", vec![]).unwrap();
    vm.collect(&mut thread, sweep);
    let value = call_static(&vm, &mut thread, "Holder", "getRef", "()Ljava/lang/Object;", vec![])
        .unwrap()
        .unwrap();
    assert_eq!(value, Value::Null);

    // The reference handler delivers it to the queue, exactly once.
    let expected = static_field(&vm, "Holder", "wref", "Ljava/lang/ref/WeakReference;");
    let deadline = Instant::now() + Duration::from_secs(5);
    let polled = loop {
        let polled = call_static(
            &vm,
            &mut thread,
            "Holder",
            "poll",
            "()Ljava/lang/ref/Reference;",
            vec![],
        )
        .unwrap()
        .unwrap();
        if polled != Value::Null {
            break polled;
        }
        assert!(Instant::now() < deadline, "reference never reached its queue");
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(polled, expected);
    let again = call_static(
        &vm,
        &mut thread,
        "Holder",
        "poll",
        "()Ljava/lang/ref/Reference;",
        vec![],
    )
    .unwrap()
    .unwrap();
    assert_eq!(again, Value::Null);
}

#[test]
fn soft_reference_survives_until_the_clearing_collection() {
    let (vm, mut thread) = boot_vm(vec![(
        "Holder",
        weak_holder("java/lang/ref/SoftReference"),
    )]);
    call_static(&vm, &mut thread, "Holder", "setup", "()V", vec![]).unwrap();
    call_static(&vm, &mut thread, "Holder", "drop", "()V", vec![]).unwrap();

    // Softs are treated as strong by a normal collection.
    vm.collect(
        &mut thread,
        GcOptions {
            keep_soft: true,
            compact: false,
        },
    );
    let value = call_static(&vm, &mut thread, "Holder", "getRef", "()Ljava/lang/Object;", vec![])
        .unwrap()
        .unwrap();
    assert!(matches!(value, Value::Ref(_)));

    // The last-ditch collection clears them.
    vm.collect(
        &mut thread,
        GcOptions {
            keep_soft: false,
            compact: true,
        },
    );
    let value = call_static(&vm, &mut thread, "Holder", "getRef", "()Ljava/lang/Object;", vec![])
        .unwrap()
        .unwrap();
    assert_eq!(value, Value::Null);
}

fn hash_holder() -> Vec<u8> {
    let mut w = ClassWriter::new("HashHolder", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "keep", "Ljava/lang/Object;");
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "hash", "I");

    let keep = w.field_ref("HashHolder", "keep", "Ljava/lang/Object;");
    let hash = w.field_ref("HashHolder", "hash", "I");
    let object = w.class(OBJECT);
    let object_init = w.method_ref(OBJECT, "<init>", "()V");
    let identity = w.method_ref(
        "java/lang/System",
        "identityHashCode",
        "(Ljava/lang/Object;)I",
    );

    let mut code = Vec::new();
    code.push(op(New));
    code.extend_from_slice(&idx(object));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(object_init));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(keep));
    code.push(op(Getstatic));
    code.extend_from_slice(&idx(keep));
    code.push(op(Invokestatic));
    code.extend_from_slice(&idx(identity));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(hash));
    code.push(op(Return));
    w.add_method(
        statics(),
        "make",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );

    let keep = w.field_ref("HashHolder", "keep", "Ljava/lang/Object;");
    let hash = w.field_ref("HashHolder", "hash", "I");
    let identity = w.method_ref(
        "java/lang/System",
        "identityHashCode",
        "(Ljava/lang/Object;)I",
    );
    let mut code = Vec::new();
    code.push(op(Getstatic));
    code.extend_from_slice(&idx(keep));
    code.push(op(Invokestatic));
    code.extend_from_slice(&idx(identity));
    code.push(op(Getstatic));
    code.extend_from_slice(&idx(hash));
    let if_target_offset: i16 = 5; // if_icmpeq -> iconst_1
    code.push(op(IfIcmpeq));
    code.extend_from_slice(&if_target_offset.to_be_bytes());
    code.push(op(Iconst0));
    code.push(op(Ireturn));
    code.push(op(Iconst1));
    code.push(op(Ireturn));
    w.add_method(
        statics(),
        "check",
        "()I",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

fn finalizable_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Fin", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "finalized", "I");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let flag = w.field_ref("Fin", "finalized", "I");
    let mut code = vec![op(Getstatic)];
    code.extend_from_slice(&idx(flag));
    code.push(op(Iconst1));
    code.push(op(Iadd));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(flag));
    code.push(op(Return));
    w.add_method(
        MethodFlags::PROTECTED,
        "finalize",
        "()V",
        MethodCode {
            max_stack: 2,
            max_locals: 1,
            code,
            exception_table: vec![],
        },
    );

    let fin = w.class("Fin");
    let init = w.method_ref("Fin", "<init>", "()V");
    let mut code = vec![op(New)];
    code.extend_from_slice(&idx(fin));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(init));
    code.push(op(Pop));
    code.push(op(Return));
    w.add_method(
        statics(),
        "make",
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

/// An unreachable finalizable object gets queued by the collection and its
/// finalizer runs on the finalizer thread, exactly once.
#[test]
fn finalizer_runs_once_for_unreachable_object() {
    let (vm, mut thread) = boot_vm(vec![("Fin", finalizable_class())]);
    call_static(&vm, &mut thread, "Fin", "make", "()V", vec![]).unwrap();

    let sweep = GcOptions {
        keep_soft: true,
        compact: false,
    };
    vm.collect(&mut thread, sweep);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if static_field(&vm, "Fin", "finalized", "I") == Value::Integer(1) {
            break;
        }
        assert!(Instant::now() < deadline, "finalizer never ran");
        std::thread::sleep(Duration::from_millis(10));
    }

    // A second collection reclaims the object without re-finalizing it.
    vm.collect(&mut thread, sweep);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(static_field(&vm, "Fin", "finalized", "I"), Value::Integer(1));
}

/// Compaction slides survivors over dead space; the identity hashcode must
/// not change when the object moves.
#[test]
fn identity_hashcode_is_stable_across_compaction() {
    let (vm, mut thread) = boot_vm(vec![("HashHolder", hash_holder())]);

    // Garbage below the survivor, so compaction actually moves it.
    for _ in 0..64 {
        vm.alloc_primitive_array(&mut thread, ArrayType::Byte, 128)
            .unwrap();
    }
    call_static(&vm, &mut thread, "HashHolder", "make", "()V", vec![]).unwrap();

    vm.collect(
        &mut thread,
        GcOptions {
            keep_soft: true,
            compact: true,
        },
    );

    let result = call_static(&vm, &mut thread, "HashHolder", "check", "()I", vec![])
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::Integer(1));

    // And again, now that the stored hash word carries the value.
    vm.collect(
        &mut thread,
        GcOptions {
            keep_soft: true,
            compact: true,
        },
    );
    let result = call_static(&vm, &mut thread, "HashHolder", "check", "()I", vec![])
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::Integer(1));
}
