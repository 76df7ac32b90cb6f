//! Test scaffolding: a minimal synthesized class library plus VM boot
//! helpers, so the integration suites run without a JDK on disk.

use bonsai_classfile::flags::{ClassFlags, FieldFlags, MethodFlags};
use bonsai_classfile::opcode::Opcode;
use bonsai_classfile::writer::{ClassWriter, MethodCode};
use bonsai_runtime::class_loader::{ClassBytesSource, MapClassSource};
use bonsai_runtime::error::JvmError;
use bonsai_runtime::interpreter::Interpreter;
use bonsai_runtime::keys::{ClassId, FieldKey, MethodKey};
use bonsai_runtime::thread::JavaThreadState;
use bonsai_runtime::vm::{Value, VirtualMachine};
use bonsai_runtime::VmConfig;
use std::sync::Arc;

pub const OBJECT: &str = "java/lang/Object";

pub fn op(o: Opcode) -> u8 {
    o as u8
}

pub fn idx(i: u16) -> [u8; 2] {
    i.to_be_bytes()
}

/// `aload_0; invokespecial super.<init>()V; return`
pub fn default_ctor(w: &mut ClassWriter, super_name: &str) -> MethodCode {
    let super_init = w.method_ref(super_name, "<init>", "()V");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_init));
    code.push(op(Opcode::Return));
    MethodCode {
        max_stack: 1,
        max_locals: 1,
        code,
        exception_table: vec![],
    }
}

fn native(w: &mut ClassWriter, flags: MethodFlags, name: &str, desc: &str) {
    w.add_bodyless_method(flags | MethodFlags::NATIVE, name, desc);
}

fn java_lang_object() -> Vec<u8> {
    let mut w = ClassWriter::new(OBJECT, None);
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 1,
            code: vec![op(Opcode::Return)],
            exception_table: vec![],
        },
    );
    // aload_0; aload_1; if_acmpeq ->7; iconst_0; ireturn; iconst_1; ireturn
    w.add_method(
        MethodFlags::PUBLIC,
        "equals",
        "(Ljava/lang/Object;)Z",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code: vec![
                op(Opcode::Aload0),
                op(Opcode::Aload1),
                op(Opcode::IfAcmpeq),
                0,
                5,
                op(Opcode::Iconst0),
                op(Opcode::Ireturn),
                op(Opcode::Iconst1),
                op(Opcode::Ireturn),
            ],
            exception_table: vec![],
        },
    );
    native(&mut w, MethodFlags::PUBLIC, "hashCode", "()I");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "getClass", "()Ljava/lang/Class;");
    native(&mut w, MethodFlags::PROTECTED, "clone", "()Ljava/lang/Object;");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "wait", "(J)V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "notify", "()V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "notifyAll", "()V");
    w.finish()
}

fn java_lang_class() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/Class", Some(OBJECT));
    w.add_field(FieldFlags::PRIVATE, "name", "Ljava/lang/String;");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PRIVATE, "<init>", "()V", ctor);
    w.finish()
}

fn java_lang_string() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/String", Some(OBJECT));
    w.flags(ClassFlags::PUBLIC | ClassFlags::SUPER | ClassFlags::FINAL);
    w.add_field(FieldFlags::PRIVATE | FieldFlags::FINAL, "value", "[B");
    w.add_field(FieldFlags::PRIVATE | FieldFlags::FINAL, "coder", "B");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    native(&mut w, MethodFlags::PUBLIC, "intern", "()Ljava/lang/String;");
    w.finish()
}

fn java_lang_throwable() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/Throwable", Some(OBJECT));
    w.add_field(FieldFlags::PRIVATE, "detailMessage", "Ljava/lang/String;");
    w.add_field(FieldFlags::PRIVATE, "cause", "Ljava/lang/Throwable;");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let super_init = w.method_ref(OBJECT, "<init>", "()V");
    let detail = w.field_ref("java/lang/Throwable", "detailMessage", "Ljava/lang/String;");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_init));
    code.push(op(Opcode::Aload0));
    code.push(op(Opcode::Aload1));
    code.push(op(Opcode::Putfield));
    code.extend_from_slice(&idx(detail));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/String;)V",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code,
            exception_table: vec![],
        },
    );

    let detail = w.field_ref("java/lang/Throwable", "detailMessage", "Ljava/lang/String;");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Getfield)];
    code.extend_from_slice(&idx(detail));
    code.push(op(Opcode::Areturn));
    w.add_method(
        MethodFlags::PUBLIC,
        "getMessage",
        "()Ljava/lang/String;",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

/// A throwable subclass with the two conventional constructors.
fn throwable_subclass(name: &str, super_name: &str) -> Vec<u8> {
    let mut w = ClassWriter::new(name, Some(super_name));
    let ctor = default_ctor(&mut w, super_name);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);

    let super_init = w.method_ref(super_name, "<init>", "(Ljava/lang/String;)V");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Aload1), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_init));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/String;)V",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

fn java_lang_thread() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/Thread", Some(OBJECT));
    w.add_field(FieldFlags::PRIVATE, "name", "Ljava/lang/String;");
    w.add_field(FieldFlags::PRIVATE, "daemon", "Z");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    w.add_method(
        MethodFlags::PUBLIC,
        "run",
        "()V",
        MethodCode {
            max_stack: 0,
            max_locals: 1,
            code: vec![op(Opcode::Return)],
            exception_table: vec![],
        },
    );
    native(&mut w, MethodFlags::PUBLIC, "start0", "()V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "join", "(J)V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::FINAL, "isAlive", "()Z");
    native(&mut w, MethodFlags::PRIVATE, "interrupt0", "()V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::STATIC, "sleep", "(J)V");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::STATIC, "currentThread", "()Ljava/lang/Thread;");
    native(&mut w, MethodFlags::PUBLIC | MethodFlags::STATIC, "yield", "()V");
    w.finish()
}

fn java_lang_system() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/System", Some(OBJECT));
    let statics = MethodFlags::PUBLIC | MethodFlags::STATIC;
    native(&mut w, statics, "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V");
    native(&mut w, statics, "currentTimeMillis", "()J");
    native(&mut w, statics, "nanoTime", "()J");
    native(&mut w, statics, "identityHashCode", "(Ljava/lang/Object;)I");
    native(&mut w, statics, "exit", "(I)V");
    native(&mut w, statics, "gc", "()V");
    native(&mut w, statics, "print", "(Ljava/lang/String;)V");
    native(&mut w, statics, "println", "(Ljava/lang/String;)V");
    native(&mut w, statics, "printErr", "(Ljava/lang/String;)V");
    w.finish()
}

fn java_lang_ref_reference() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/ref/Reference", Some(OBJECT));
    w.add_field(FieldFlags::PRIVATE, "referent", "Ljava/lang/Object;");
    w.add_field(FieldFlags::PRIVATE, "queue", "Ljava/lang/ref/ReferenceQueue;");
    w.add_field(FieldFlags::PRIVATE, "next", "Ljava/lang/ref/Reference;");

    let super_init = w.method_ref(OBJECT, "<init>", "()V");
    let referent = w.field_ref("java/lang/ref/Reference", "referent", "Ljava/lang/Object;");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_init));
    code.push(op(Opcode::Aload0));
    code.push(op(Opcode::Aload1));
    code.push(op(Opcode::Putfield));
    code.extend_from_slice(&idx(referent));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/Object;)V",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code,
            exception_table: vec![],
        },
    );

    let queue = w.field_ref(
        "java/lang/ref/Reference",
        "queue",
        "Ljava/lang/ref/ReferenceQueue;",
    );
    let referent = w.field_ref("java/lang/ref/Reference", "referent", "Ljava/lang/Object;");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_init));
    code.push(op(Opcode::Aload0));
    code.push(op(Opcode::Aload1));
    code.push(op(Opcode::Putfield));
    code.extend_from_slice(&idx(referent));
    code.push(op(Opcode::Aload0));
    code.push(op(Opcode::Aload2));
    code.push(op(Opcode::Putfield));
    code.extend_from_slice(&idx(queue));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/Object;Ljava/lang/ref/ReferenceQueue;)V",
        MethodCode {
            max_stack: 2,
            max_locals: 3,
            code,
            exception_table: vec![],
        },
    );

    let referent = w.field_ref("java/lang/ref/Reference", "referent", "Ljava/lang/Object;");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Getfield)];
    code.extend_from_slice(&idx(referent));
    code.push(op(Opcode::Areturn));
    w.add_method(
        MethodFlags::PUBLIC,
        "get",
        "()Ljava/lang/Object;",
        MethodCode {
            max_stack: 1,
            max_locals: 1,
            code,
            exception_table: vec![],
        },
    );
    native(&mut w, MethodFlags::PRIVATE, "refersTo0", "(Ljava/lang/Object;)Z");
    w.finish()
}

fn reference_subclass(name: &str) -> Vec<u8> {
    let super_name = "java/lang/ref/Reference";
    let mut w = ClassWriter::new(name, Some(super_name));

    let super_one = w.method_ref(super_name, "<init>", "(Ljava/lang/Object;)V");
    let mut code = vec![op(Opcode::Aload0), op(Opcode::Aload1), op(Opcode::Invokespecial)];
    code.extend_from_slice(&idx(super_one));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/Object;)V",
        MethodCode {
            max_stack: 2,
            max_locals: 2,
            code,
            exception_table: vec![],
        },
    );

    let super_two = w.method_ref(
        super_name,
        "<init>",
        "(Ljava/lang/Object;Ljava/lang/ref/ReferenceQueue;)V",
    );
    let mut code = vec![
        op(Opcode::Aload0),
        op(Opcode::Aload1),
        op(Opcode::Aload2),
        op(Opcode::Invokespecial),
    ];
    code.extend_from_slice(&idx(super_two));
    code.push(op(Opcode::Return));
    w.add_method(
        MethodFlags::PUBLIC,
        "<init>",
        "(Ljava/lang/Object;Ljava/lang/ref/ReferenceQueue;)V",
        MethodCode {
            max_stack: 3,
            max_locals: 3,
            code,
            exception_table: vec![],
        },
    );
    w.finish()
}

fn java_lang_ref_queue() -> Vec<u8> {
    let mut w = ClassWriter::new("java/lang/ref/ReferenceQueue", Some(OBJECT));
    w.add_field(FieldFlags::PRIVATE, "head", "Ljava/lang/ref/Reference;");
    let ctor = default_ctor(&mut w, OBJECT);
    w.add_method(MethodFlags::PUBLIC, "<init>", "()V", ctor);
    native(&mut w, MethodFlags::PUBLIC, "poll", "()Ljava/lang/ref/Reference;");
    w.finish()
}

/// The minimal bootstrap library every integration test boots with.
pub fn core_library() -> MapClassSource {
    let mut source = MapClassSource::new();
    source.insert(OBJECT, java_lang_object());
    source.insert("java/lang/Class", java_lang_class());
    source.insert("java/lang/String", java_lang_string());
    source.insert("java/lang/Throwable", java_lang_throwable());
    source.insert("java/lang/Thread", java_lang_thread());
    source.insert("java/lang/System", java_lang_system());

    source.insert("java/lang/Error", throwable_subclass("java/lang/Error", "java/lang/Throwable"));
    source.insert(
        "java/lang/Exception",
        throwable_subclass("java/lang/Exception", "java/lang/Throwable"),
    );
    source.insert(
        "java/lang/RuntimeException",
        throwable_subclass("java/lang/RuntimeException", "java/lang/Exception"),
    );

    for error in [
        "java/lang/LinkageError",
        "java/lang/ClassFormatError",
        "java/lang/NoClassDefFoundError",
        "java/lang/ClassCircularityError",
        "java/lang/IncompatibleClassChangeError",
        "java/lang/NoSuchFieldError",
        "java/lang/NoSuchMethodError",
        "java/lang/IllegalAccessError",
        "java/lang/AbstractMethodError",
        "java/lang/ExceptionInInitializerError",
        "java/lang/UnsatisfiedLinkError",
        "java/lang/OutOfMemoryError",
        "java/lang/StackOverflowError",
        "java/lang/InternalError",
    ] {
        source.insert(error, throwable_subclass(error, "java/lang/Error"));
    }
    for exception in [
        "java/lang/NullPointerException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/ArrayStoreException",
        "java/lang/ClassCastException",
        "java/lang/ArithmeticException",
        "java/lang/NegativeArraySizeException",
        "java/lang/IllegalMonitorStateException",
        "java/lang/IllegalThreadStateException",
        "java/lang/IllegalArgumentException",
    ] {
        source.insert(exception, throwable_subclass(exception, "java/lang/RuntimeException"));
    }
    for exception in [
        "java/lang/InterruptedException",
        "java/lang/ClassNotFoundException",
        "java/lang/CloneNotSupportedException",
        "java/io/IOException",
    ] {
        source.insert(exception, throwable_subclass(exception, "java/lang/Exception"));
    }

    source.insert("java/lang/ref/Reference", java_lang_ref_reference());
    source.insert(
        "java/lang/ref/SoftReference",
        reference_subclass("java/lang/ref/SoftReference"),
    );
    source.insert(
        "java/lang/ref/WeakReference",
        reference_subclass("java/lang/ref/WeakReference"),
    );
    source.insert(
        "java/lang/ref/PhantomReference",
        reference_subclass("java/lang/ref/PhantomReference"),
    );
    source.insert("java/lang/ref/ReferenceQueue", java_lang_ref_queue());
    source
}

pub fn small_config() -> VmConfig {
    let mut config = VmConfig::with_main_class("Test");
    config.initial_heap_size = 1024 * 1024;
    config.max_heap_size = 4 * 1024 * 1024;
    config.frame_stack_depth = 256;
    config
}

/// Boots a VM over the core library plus any extra classes and attaches a
/// main thread.
pub fn boot_vm_with(
    config: VmConfig,
    extra: Vec<(&str, Vec<u8>)>,
) -> (Arc<VirtualMachine>, JavaThreadState) {
    let mut source = core_library();
    for (name, bytes) in extra {
        source.insert(name, bytes);
    }
    let sources: Vec<Box<dyn ClassBytesSource>> = vec![Box::new(source)];
    let vm = VirtualMachine::boot(config, sources).expect("VM boot failed");
    let thread = vm.attach_main_thread().expect("main thread attach failed");
    vm.start_vm_threads();
    (vm, thread)
}

pub fn boot_vm(extra: Vec<(&str, Vec<u8>)>) -> (Arc<VirtualMachine>, JavaThreadState) {
    boot_vm_with(small_config(), extra)
}

pub fn load_class(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    name: &str,
) -> Result<ClassId, JvmError> {
    let _ = thread;
    let sym = vm.interner().get_or_intern(name);
    vm.method_area_write().get_class_id_or_load(sym)
}

pub fn find_static(
    vm: &VirtualMachine,
    class_id: ClassId,
    name: &str,
    desc: &str,
) -> bonsai_runtime::MethodId {
    let key = MethodKey {
        name: vm.interner().get_or_intern(name),
        desc: vm.interner().get_or_intern(desc),
    };
    let ma = vm.method_area_read();
    ma.get_instance_class(&class_id)
        .expect("instance class")
        .lookup_method(&key)
        .expect("method present")
}

pub fn call_static(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    class: &str,
    name: &str,
    desc: &str,
    args: Vec<Value>,
) -> Result<Option<Value>, JvmError> {
    let class_id = load_class(vm, thread, class)?;
    let method_id = find_static(vm, class_id, name, desc);
    Interpreter::invoke_static_method(thread, method_id, vm, args)
}

pub fn static_field(vm: &VirtualMachine, class: &str, name: &str, desc: &str) -> Value {
    let sym = vm.interner().get_or_intern(class);
    let class_id = vm
        .method_area_read()
        .lookup_class_id(sym)
        .expect("class loaded");
    let key = FieldKey {
        name: vm.interner().get_or_intern(name),
        desc: vm.interner().get_or_intern(desc),
    };
    vm.method_area_read()
        .get_static_field_value(&class_id, &key)
        .expect("static field")
}

/// Unwraps a thrown Java exception and names its class.
pub fn thrown_class_name(vm: &VirtualMachine, error: JvmError) -> String {
    match error {
        JvmError::JavaExceptionThrown(obj) => {
            let class_id = vm.heap_read().get_class_id(obj).expect("throwable class");
            vm.interner()
                .resolve(&vm.method_area_read().get_class(&class_id).get_name())
                .to_string()
        }
        JvmError::JavaException(desc) => desc.kind.class_name().to_string(),
        other => panic!("expected a Java exception, got {:?}", other),
    }
}
