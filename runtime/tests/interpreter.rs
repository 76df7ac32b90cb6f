mod common;

use bonsai_classfile::attribute::ExceptionTableEntry;
use bonsai_classfile::flags::{ClassFlags, FieldFlags, MethodFlags};
use bonsai_classfile::opcode::Opcode::*;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::vm::Value;
use common::*;

fn statics() -> MethodFlags {
    MethodFlags::PUBLIC | MethodFlags::STATIC
}

fn arithmetic_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Arith", Some(OBJECT));
    w.add_method(
        statics(),
        "add",
        "(II)I",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code: vec![op(Iload0), op(Iload1), op(Iadd), op(Ireturn)],
            exception_table: vec![],
        },
    );
    w.add_method(
        statics(),
        "mulLong",
        "(JJ)J",
        MethodCode {
            max_stack: 4,
            max_locals: 4,
            code: vec![op(Lload0), op(Lload2), op(Lmul), op(Lreturn)],
            exception_table: vec![],
        },
    );
    // sum of 0..n: the usual counting loop.
    w.add_method(
        statics(),
        "sum",
        "(I)I",
        MethodCode {
            max_stack: 2,
            max_locals: 3,
            code: vec![
                op(Iconst0),
                op(Istore1),
                op(Iconst0),
                op(Istore2),
                op(Iload2), // 4: loop head
                op(Iload0),
                op(IfIcmpge),
                0,
                13, // 6 -> 19
                op(Iload1),
                op(Iload2),
                op(Iadd),
                op(Istore1),
                op(Iinc),
                2,
                1,
                op(Goto),
                0xff,
                0xf4, // 16 -> 4
                op(Iload1), // 19
                op(Ireturn),
            ],
            exception_table: vec![],
        },
    );
    w.add_method(
        statics(),
        "divByZero",
        "()I",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code: vec![op(Iconst1), op(Iconst0), op(Idiv), op(Ireturn)],
            exception_table: vec![],
        },
    );
    let arith = w.class("java/lang/ArithmeticException");
    w.add_method(
        statics(),
        "catchDivByZero",
        "()I",
        MethodCode {
            max_stack: 2,
            max_locals: 1,
            code: vec![
                op(Iconst1),
                op(Iconst0),
                op(Idiv),
                op(Ireturn),
                op(Pop), // 4: handler, discard the throwable
                op(Bipush),
                42,
                op(Ireturn),
            ],
            exception_table: vec![ExceptionTableEntry {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: arith,
            }],
        },
    );
    w.finish()
}

#[test]
fn arithmetic_and_loops() {
    let (vm, mut thread) = boot_vm(vec![("Arith", arithmetic_class())]);
    let result = call_static(
        &vm,
        &mut thread,
        "Arith",
        "add",
        "(II)I",
        vec![Value::Integer(40), Value::Integer(2)],
    )
    .unwrap();
    assert_eq!(result, Some(Value::Integer(42)));

    let result = call_static(
        &vm,
        &mut thread,
        "Arith",
        "mulLong",
        "(JJ)J",
        vec![Value::Long(1 << 33), Value::Long(3)],
    )
    .unwrap();
    assert_eq!(result, Some(Value::Long(3 << 33)));

    let result = call_static(
        &vm,
        &mut thread,
        "Arith",
        "sum",
        "(I)I",
        vec![Value::Integer(100)],
    )
    .unwrap();
    assert_eq!(result, Some(Value::Integer(4950)));

    // Second call runs the quickened instruction stream.
    let result = call_static(
        &vm,
        &mut thread,
        "Arith",
        "sum",
        "(I)I",
        vec![Value::Integer(10)],
    )
    .unwrap();
    assert_eq!(result, Some(Value::Integer(45)));
}

#[test]
fn arithmetic_exception_thrown_and_caught() {
    let (vm, mut thread) = boot_vm(vec![("Arith", arithmetic_class())]);
    let err = call_static(&vm, &mut thread, "Arith", "divByZero", "()I", vec![]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/ArithmeticException");

    let result =
        call_static(&vm, &mut thread, "Arith", "catchDivByZero", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(42)));
}

fn point_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Point", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC, "x", "I");
    w.add_field(FieldFlags::PUBLIC, "y", "I");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let point = w.class("Point");
    let init = w.method_ref("Point", "<init>", "()V");
    let field_x = w.field_ref("Point", "x", "I");
    let field_y = w.field_ref("Point", "y", "I");
    let mut code = vec![op(New)];
    code.extend_from_slice(&idx(point));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(init));
    code.push(op(Astore0));
    // p.x = 7
    code.push(op(Aload0));
    code.push(op(Bipush));
    code.push(7);
    code.push(op(Putfield));
    code.extend_from_slice(&idx(field_x));
    // p.y = 35
    code.push(op(Aload0));
    code.push(op(Bipush));
    code.push(35);
    code.push(op(Putfield));
    code.extend_from_slice(&idx(field_y));
    // return p.x + p.y
    code.push(op(Aload0));
    code.push(op(Getfield));
    code.extend_from_slice(&idx(field_x));
    code.push(op(Aload0));
    code.push(op(Getfield));
    code.extend_from_slice(&idx(field_y));
    code.push(op(Iadd));
    code.push(op(Ireturn));
    w.add_method(
        statics(),
        "roundTrip",
        "()I",
        MethodCode {
            max_stack: 2,
            max_locals: 1,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

#[test]
fn object_fields_round_trip_through_bytecode() {
    let (vm, mut thread) = boot_vm(vec![("Point", point_class())]);
    for _ in 0..3 {
        let result =
            call_static(&vm, &mut thread, "Point", "roundTrip", "()I", vec![]).unwrap();
        assert_eq!(result, Some(Value::Integer(42)));
    }
}

fn dispatch_classes() -> Vec<(&'static str, Vec<u8>)> {
    let mut animal = ClassWriter::new("Animal", Some(OBJECT));
    let ctor = default_ctor(&mut animal, OBJECT);
    animal.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    animal.add_method(
        MethodFlags::PUBLIC,
        "legs",
        "()I",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code: vec![op(Iconst0), op(Ireturn)],
            exception_table: vec![],
        },
    );

    let mut dog = ClassWriter::new("Dog", Some("Animal"));
    let ctor = default_ctor(&mut dog, "Animal");
    dog.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    dog.add_method(
        MethodFlags::PUBLIC,
        "legs",
        "()I",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code: vec![op(Iconst4), op(Ireturn)],
            exception_table: vec![],
        },
    );

    let mut driver = ClassWriter::new("Driver", Some(OBJECT));
    let dog_class = driver.class("Dog");
    let dog_init = driver.method_ref("Dog", "<init>", "()V");
    let legs = driver.method_ref("Animal", "legs", "()I");
    let mut code = vec![op(New)];
    code.extend_from_slice(&idx(dog_class));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(dog_init));
    code.push(op(Invokevirtual));
    code.extend_from_slice(&idx(legs));
    code.push(op(Ireturn));
    driver.add_method(
        statics(),
        "dogLegs",
        "()I",
        MethodCode {
            max_stack: 2,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );
    vec![
        ("Animal", animal.finish()),
        ("Dog", dog.finish()),
        ("Driver", driver.finish()),
    ]
}

#[test]
fn virtual_dispatch_selects_the_override() {
    let (vm, mut thread) = boot_vm(dispatch_classes());
    for _ in 0..2 {
        let result = call_static(&vm, &mut thread, "Driver", "dogLegs", "()I", vec![]).unwrap();
        assert_eq!(result, Some(Value::Integer(4)));
    }
}

fn interface_classes() -> Vec<(&'static str, Vec<u8>)> {
    // Interfaces still name Object as their super in the class file.
    let mut w = ClassWriter::new("Greeter", Some(OBJECT));
    w.flags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT);
    w.add_bodyless_method(
        MethodFlags::PUBLIC | MethodFlags::ABSTRACT,
        "greet",
        "()I",
    );
    let greeter_bytes = w.finish();

    let mut polite = ClassWriter::new("Polite", Some(OBJECT));
    polite.add_interface("Greeter");
    let ctor = default_ctor(&mut polite, OBJECT);
    polite.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    polite.add_method(
        MethodFlags::PUBLIC,
        "greet",
        "()I",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code: vec![op(Bipush), 11, op(Ireturn)],
            exception_table: vec![],
        },
    );

    // Implements the interface but forgets the method; dispatch must raise
    // AbstractMethodError through the synthesized stub.
    let mut rude = ClassWriter::new("Rude", Some(OBJECT));
    rude.add_interface("Greeter");
    let ctor = default_ctor(&mut rude, OBJECT);
    rude.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let mut driver = ClassWriter::new("IfaceDriver", Some(OBJECT));
    for (method, target) in [("politeGreet", "Polite"), ("rudeGreet", "Rude")] {
        let class_idx = driver.class(target);
        let init = driver.method_ref(target, "<init>", "()V");
        let greet = driver.interface_method_ref("Greeter", "greet", "()I");
        let mut code = vec![op(New)];
        code.extend_from_slice(&idx(class_idx));
        code.push(op(Dup));
        code.push(op(Invokespecial));
        code.extend_from_slice(&idx(init));
        code.push(op(Invokeinterface));
        code.extend_from_slice(&idx(greet));
        code.push(1); // count
        code.push(0);
        code.push(op(Ireturn));
        driver.add_method(
            statics(),
            method,
            "()I",
            MethodCode {
                max_stack: 2,
                max_locals: 0,
                code,
                exception_table: vec![],
            },
        );
    }
    vec![
        ("Greeter", greeter_bytes),
        ("Polite", polite.finish()),
        ("Rude", rude.finish()),
        ("IfaceDriver", driver.finish()),
    ]
}

#[test]
fn interface_dispatch_and_miranda_stub() {
    let (vm, mut thread) = boot_vm(interface_classes());
    // Twice: the second round goes through the one-entry dispatch cache.
    for _ in 0..2 {
        let result =
            call_static(&vm, &mut thread, "IfaceDriver", "politeGreet", "()I", vec![]).unwrap();
        assert_eq!(result, Some(Value::Integer(11)));
    }
    let err =
        call_static(&vm, &mut thread, "IfaceDriver", "rudeGreet", "()I", vec![]).unwrap_err();
    assert_eq!(thrown_class_name(&vm, err), "java/lang/AbstractMethodError");
}

fn recursion_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Deep", Some(OBJECT));
    let recurse = w.method_ref("Deep", "recurse", "()V");
    let mut code = vec![op(Invokestatic)];
    code.extend_from_slice(&idx(recurse));
    code.push(op(Return));
    w.add_method(
        statics(),
        "recurse",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 0,
            code,
            exception_table: vec![],
        },
    );

    let soe = w.class("java/lang/StackOverflowError");
    let recurse = w.method_ref("Deep", "recurse", "()V");
    let mut code = vec![op(Invokestatic)];
    code.extend_from_slice(&idx(recurse));
    code.push(op(Iconst0)); // 3
    code.push(op(Ireturn));
    code.push(op(Pop)); // 5: handler
    code.push(op(Iconst1));
    code.push(op(Ireturn));
    w.add_method(
        statics(),
        "tryDeep",
        "()I",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code,
            exception_table: vec![ExceptionTableEntry {
                start_pc: 0,
                end_pc: 3,
                handler_pc: 5,
                catch_type: soe,
            }],
        },
    );
    w.finish()
}

#[test]
fn stack_overflow_is_caught_and_the_red_zone_restores() {
    let (vm, mut thread) = boot_vm(vec![("Deep", recursion_class())]);
    // First deep recursion overflows and is caught.
    let result = call_static(&vm, &mut thread, "Deep", "tryDeep", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(1)));
    // The red zone was restored: a second run behaves identically.
    let result = call_static(&vm, &mut thread, "Deep", "tryDeep", "()I", vec![]).unwrap();
    assert_eq!(result, Some(Value::Integer(1)));
}

fn cycle_class() -> Vec<u8> {
    let mut w = ClassWriter::new("Cycle", Some(OBJECT));
    w.add_field(FieldFlags::PUBLIC | FieldFlags::STATIC, "count", "I");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let count = w.field_ref("Cycle", "count", "I");
    let cycle = w.class("Cycle");
    let init = w.method_ref("Cycle", "<init>", "()V");
    // count++; new Cycle();  -- the constructor call re-enters the class
    // while it is still INITING.
    let mut code = vec![op(Getstatic)];
    code.extend_from_slice(&idx(count));
    code.push(op(Iconst1));
    code.push(op(Iadd));
    code.push(op(Putstatic));
    code.extend_from_slice(&idx(count));
    code.push(op(New));
    code.extend_from_slice(&idx(cycle));
    code.push(op(Dup));
    code.push(op(Invokespecial));
    code.extend_from_slice(&idx(init));
    code.push(op(Pop));
    code.push(op(Return));
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
        statics(),
        "touch",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 0,
            code: vec![op(Return)],
            exception_table: vec![],
        },
    );
    w.finish()
}

#[test]
fn clinit_runs_exactly_once_despite_recursive_entry() {
    let (vm, mut thread) = boot_vm(vec![("Cycle", cycle_class())]);
    call_static(&vm, &mut thread, "Cycle", "touch", "()V", vec![]).unwrap();
    call_static(&vm, &mut thread, "Cycle", "touch", "()V", vec![]).unwrap();
    assert_eq!(static_field(&vm, "Cycle", "count", "I"), Value::Integer(1));
}

#[test]
fn ldc_string_interns_one_instance() {
    let mut w = ClassWriter::new("Strings", Some(OBJECT));
    let hello = w.string("hello");
    let mut code = vec![op(Ldc), hello as u8, op(Areturn)];
    assert!(hello <= 0xff);
    w.add_method(
        statics(),
        "hello",
        "()Ljava/lang/String;",
        MethodCode {
            max_stack: 1,
            max_locals: 0,
            code: std::mem::take(&mut code),
            exception_table: vec![],
        },
    );
    let (vm, mut thread) = boot_vm(vec![("Strings", w.finish())]);
    let a = call_static(&vm, &mut thread, "Strings", "hello", "()Ljava/lang/String;", vec![])
        .unwrap()
        .unwrap();
    let b = call_static(&vm, &mut thread, "Strings", "hello", "()Ljava/lang/String;", vec![])
        .unwrap()
        .unwrap();
    // Same interned instance both times.
    assert_eq!(a, b);
    let Value::Ref(s) = a else { panic!("expected a reference") };
    assert_eq!(vm.read_java_string(s).unwrap(), "hello");
}
