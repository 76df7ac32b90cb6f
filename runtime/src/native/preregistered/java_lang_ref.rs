use crate::native::preregistered::reg;
use crate::native::{NativeRegistry, NativeRet};
use crate::thread::JavaThreadState;
use crate::vm::Value;
use crate::VirtualMachine;
use bonsai_classfile::descriptor::AllocationType;

pub(super) fn register(registry: &mut NativeRegistry) {
    reg(
        registry,
        "java/lang/ref/Reference",
        "refersTo0",
        "(Ljava/lang/Object;)Z",
        reference_refers_to0,
    );
    reg(
        registry,
        "java/lang/ref/ReferenceQueue",
        "poll",
        "()Ljava/lang/ref/Reference;",
        reference_queue_poll,
    );
}

fn reference_refers_to0(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let reference = args[0].as_obj_ref()?;
    let referent_offset = vm.reference_referent_offset(reference)?;
    let referent = vm
        .heap_read()
        .read_field(reference, referent_offset, AllocationType::Reference)?;
    let same = match (referent, &args[1]) {
        (Value::Null, Value::Null) => true,
        (Value::Ref(a), Value::Ref(b)) => a == *b,
        _ => false,
    };
    Ok(Some(Value::Integer(same as i32)))
}

/// Pops the head of the queue object's intrusive list; the reference
/// handler thread is the producer.
fn reference_queue_poll(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    let queue = args[0].as_obj_ref()?;
    Ok(Some(vm.reference_queue_poll(queue)?))
}
