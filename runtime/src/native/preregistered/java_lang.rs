use crate::error::JvmError;
use crate::native::preregistered::{reg, reg_any};
use crate::native::{NativeRegistry, NativeRet};
use crate::thread::JavaThreadState;
use crate::vm::Value;
use crate::{VirtualMachine, build_exception, throw_exception};
use std::sync::atomic::Ordering;
use std::time::Duration;

pub(super) fn register(registry: &mut NativeRegistry) {
    reg(registry, "java/lang/Object", "getClass", "()Ljava/lang/Class;", object_get_class);
    reg(registry, "java/lang/Object", "hashCode", "()I", object_hash_code);
    reg(registry, "java/lang/Object", "clone", "()Ljava/lang/Object;", object_clone);
    reg_any(registry, "clone", "()Ljava/lang/Object;", object_clone);
    reg(registry, "java/lang/Object", "notify", "()V", object_notify);
    reg(registry, "java/lang/Object", "notifyAll", "()V", object_notify_all);
    reg(registry, "java/lang/Object", "wait", "(J)V", object_wait);

    reg(registry, "java/lang/System", "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V", system_arraycopy);
    reg(registry, "java/lang/System", "currentTimeMillis", "()J", system_current_time_millis);
    reg(registry, "java/lang/System", "nanoTime", "()J", system_nano_time);
    reg(registry, "java/lang/System", "identityHashCode", "(Ljava/lang/Object;)I", system_identity_hash_code);
    reg(registry, "java/lang/System", "exit", "(I)V", system_exit);
    reg(registry, "java/lang/System", "gc", "()V", runtime_gc);

    reg(registry, "java/lang/Runtime", "maxMemory", "()J", runtime_max_memory);
    reg(registry, "java/lang/Runtime", "totalMemory", "()J", runtime_total_memory);
    reg(registry, "java/lang/Runtime", "freeMemory", "()J", runtime_free_memory);
    reg(registry, "java/lang/Runtime", "gc", "()V", runtime_gc);
    reg(registry, "java/lang/Runtime", "availableProcessors", "()I", runtime_available_processors);

    reg(registry, "java/lang/Float", "floatToRawIntBits", "(F)I", float_to_raw_int_bits);
    reg(registry, "java/lang/Float", "intBitsToFloat", "(I)F", int_bits_to_float);
    reg(registry, "java/lang/Double", "doubleToRawLongBits", "(D)J", double_to_raw_long_bits);
    reg(registry, "java/lang/Double", "longBitsToDouble", "(J)D", long_bits_to_double);

    reg(registry, "java/lang/String", "intern", "()Ljava/lang/String;", string_intern);

    reg(registry, "java/lang/Thread", "currentThread", "()Ljava/lang/Thread;", thread_current);
    reg(registry, "java/lang/Thread", "start0", "()V", thread_start0);
    reg(registry, "java/lang/Thread", "sleep", "(J)V", thread_sleep);
    reg(registry, "java/lang/Thread", "yield", "()V", thread_yield);
    reg(registry, "java/lang/Thread", "interrupt0", "()V", thread_interrupt0);
    reg(registry, "java/lang/Thread", "interrupted", "()Z", thread_interrupted);
    reg(registry, "java/lang/Thread", "isAlive", "()Z", thread_is_alive);
    reg(registry, "java/lang/Thread", "join", "(J)V", thread_join);
    reg(registry, "java/lang/Thread", "holdsLock", "(Ljava/lang/Object;)Z", thread_holds_lock);

    reg(registry, "java/lang/Throwable", "fillInStackTrace", "(I)Ljava/lang/Throwable;", throwable_fill_in_stack_trace);
    reg(registry, "java/lang/Throwable", "fillInStackTrace", "()Ljava/lang/Throwable;", throwable_fill_in_stack_trace);
}

fn object_get_class(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    let class_id = vm.heap_read().get_class_id(obj)?;
    let mirror = vm.mirror_for(thread, class_id)?;
    Ok(Some(Value::Ref(mirror)))
}

fn object_hash_code(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    Ok(Some(Value::Integer(vm.heap_write().identity_hashcode(obj))))
}

fn object_clone(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    let copy = vm.clone_with_gc(thread, obj)?;
    Ok(Some(Value::Ref(copy)))
}

fn object_notify(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    vm.object_notify(thread, obj, false)?;
    Ok(None)
}

fn object_notify_all(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    vm.object_notify(thread, obj, true)?;
    Ok(None)
}

fn object_wait(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    let millis = args[1].as_long()?;
    if millis < 0 {
        return throw_exception!(IllegalArgumentException, "timeout value is negative");
    }
    let timeout = if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    };
    vm.object_wait(thread, obj, timeout)?;
    Ok(None)
}

fn system_arraycopy(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let src = args[0].as_obj_ref()?;
    let src_pos = args[1].as_int()?;
    let dest = args[2].as_obj_ref()?;
    let dest_pos = args[3].as_int()?;
    let length = args[4].as_int()?;
    vm.heap_write()
        .copy_array_region(src, src_pos, dest, dest_pos, length)?;
    Ok(None)
}

fn system_current_time_millis(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Some(Value::Long(now.as_millis() as i64)))
}

fn system_nano_time(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Long(vm.uptime().as_nanos() as i64)))
}

fn system_identity_hash_code(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    match args[0] {
        Value::Null => Ok(Some(Value::Integer(0))),
        Value::Ref(obj) => Ok(Some(Value::Integer(vm.heap_write().identity_hashcode(obj)))),
        _ => Err(JvmError::UnexpectedType("identityHashCode on a primitive".to_string())),
    }
}

fn system_exit(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let status = args[0].as_int()?;
    vm.exit(thread, status);
}

fn runtime_max_memory(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Long(vm.heap_read().max_size() as i64)))
}

fn runtime_total_memory(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Long(vm.heap_read().usable_size() as i64)))
}

fn runtime_free_memory(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Long(vm.heap_read().free_bytes() as i64)))
}

fn runtime_gc(vm: &VirtualMachine, thread: &mut JavaThreadState, _args: &[Value]) -> NativeRet {
    vm.request_gc(thread);
    Ok(None)
}

fn runtime_available_processors(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    let count = std::thread::available_parallelism().map_or(1, |n| n.get() as i32);
    Ok(Some(Value::Integer(count)))
}

fn float_to_raw_int_bits(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Integer(args[0].as_float()?.to_bits() as i32)))
}

fn int_bits_to_float(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Float(f32::from_bits(args[0].as_int()? as u32))))
}

fn double_to_raw_long_bits(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Long(args[0].as_double()?.to_bits() as i64)))
}

fn long_bits_to_double(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    Ok(Some(Value::Double(f64::from_bits(args[0].as_long()? as u64))))
}

fn string_intern(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    let contents = vm.read_java_string(obj)?;
    let sym = vm.interner().get_or_intern(&contents);
    let interned = vm.intern_string(thread, sym)?;
    Ok(Some(Value::Ref(interned)))
}

fn thread_current(
    _vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    let obj = thread
        .handle
        .thread_obj()
        .ok_or_else(|| build_exception!(InternalError, "thread has no Thread object"))?;
    Ok(Some(Value::Ref(obj)))
}

fn thread_start0(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let thread_obj = args[0].as_obj_ref()?;
    vm.spawn_java_thread(thread, thread_obj)?;
    Ok(None)
}

fn thread_sleep(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let millis = args[0].as_long()?;
    if millis < 0 {
        return throw_exception!(IllegalArgumentException, "timeout value is negative");
    }
    crate::thread::sleep_interruptibly(
        vm.threads(),
        &thread.handle,
        Duration::from_millis(millis as u64),
    )?;
    Ok(None)
}

fn thread_yield(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    std::thread::yield_now();
    Ok(None)
}

fn thread_interrupt0(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let thread_obj = args[0].as_obj_ref()?;
    if let Some(handle) = vm.handle_for_thread_obj(thread_obj) {
        crate::thread::interrupt_thread(&vm.monitors, &handle);
    }
    Ok(None)
}

fn thread_interrupted(
    _vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    _args: &[Value],
) -> NativeRet {
    let was = thread.handle.interrupted.swap(false, Ordering::AcqRel);
    Ok(Some(Value::Integer(was as i32)))
}

fn thread_is_alive(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let thread_obj = args[0].as_obj_ref()?;
    let alive = vm
        .handle_for_thread_obj(thread_obj)
        .is_some_and(|handle| handle.is_alive());
    Ok(Some(Value::Integer(alive as i32)))
}

fn thread_join(vm: &VirtualMachine, thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    let thread_obj = args[0].as_obj_ref()?;
    let millis = args[1].as_long()?;
    let timeout = if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    };
    vm.join_thread(thread, thread_obj, timeout)?;
    Ok(None)
}

fn thread_holds_lock(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let obj = args[0].as_obj_ref()?;
    let holds = vm.holds_lock(thread, obj);
    Ok(Some(Value::Integer(holds as i32)))
}

fn throwable_fill_in_stack_trace(
    _vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    // Stack trace capture is a library concern; the throwable itself is
    // returned unchanged.
    Ok(Some(args[0]))
}
