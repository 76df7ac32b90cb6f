use crate::VirtualMachine;
use crate::error::{JavaExceptionFromJvm, JavaExceptionKind, JvmError};
use crate::heap::HeapRef;
use crate::interpreter::Interpreter;
use crate::keys::{FieldKey, MethodKey};
use crate::thread::JavaThreadState;
use crate::vm::Value;
use bonsai_classfile::descriptor::AllocationType;

/// Turns a pending exception description into a heap throwable. Lazy by
/// design: nothing is allocated until the exception actually propagates.
pub(super) fn materialize_exception(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    desc: JavaExceptionFromJvm,
) -> Result<HeapRef, JvmError> {
    // OOM must be throwable without allocating.
    if desc.kind == JavaExceptionKind::OutOfMemoryError {
        if let JvmError::JavaExceptionThrown(obj) = vm_oom(vm) {
            return Ok(obj);
        }
    }

    let reference = desc.as_reference();
    let class_sym = vm.interner().get_or_intern(reference.class);
    let class_id = vm.method_area_write().get_class_id_or_load(class_sym)?;
    Interpreter::ensure_initialized(thread, Some(class_id), vm)?;

    let obj = vm.alloc_instance_auto(thread, class_id)?;
    // Root the half-built throwable across the constructor machinery.
    thread.handle.push_local_ref(obj);
    let built = build_throwable(vm, thread, obj, class_id, desc, &reference);
    thread.handle.pop_local_ref();
    built?;
    Ok(obj)
}

fn vm_oom(vm: &VirtualMachine) -> JvmError {
    // Reuses the VM's pre-allocated instance when there is one.
    vm.preallocated_oom()
        .map(JvmError::JavaExceptionThrown)
        .unwrap_or_else(|| {
            JvmError::JavaException(JavaExceptionFromJvm::new(JavaExceptionKind::OutOfMemoryError))
        })
}

fn build_throwable(
    vm: &VirtualMachine,
    thread: &mut JavaThreadState,
    obj: HeapRef,
    class_id: crate::keys::ClassId,
    desc: JavaExceptionFromJvm,
    reference: &crate::error::JavaExceptionReference,
) -> Result<(), JvmError> {
    let message = desc
        .message
        .clone()
        .map(|m| m.into_resolved(vm.interner()));

    let ctor_key = MethodKey {
        name: vm.interner().get_or_intern(reference.name),
        desc: vm.interner().get_or_intern(reference.descriptor),
    };
    let ctor = {
        let ma = vm.method_area_read();
        ma.get_instance_class(&class_id)
            .ok()
            .and_then(|c| c.lookup_method(&ctor_key))
    };

    match (ctor, &message) {
        (Some(ctor_id), Some(text)) => {
            let message_ref = vm.alloc_string(thread, text)?;
            Interpreter::invoke_instance_method(
                thread,
                ctor_id,
                vm,
                vec![Value::Ref(obj), Value::Ref(message_ref)],
            )?;
        }
        (Some(ctor_id), None) => {
            Interpreter::invoke_instance_method(thread, ctor_id, vm, vec![Value::Ref(obj)])?;
        }
        (None, message) => {
            // No constructor in the loaded library: fall back to writing
            // the message field directly.
            if let Some(text) = message {
                let detail_fk = FieldKey {
                    name: vm.interner().get_or_intern("detailMessage"),
                    desc: vm.br.string_desc,
                };
                let offset = {
                    let ma = vm.method_area_read();
                    ma.get_instance_class(&class_id)
                        .ok()
                        .and_then(|c| c.lookup_instance_field(&detail_fk))
                        .map(|f| f.offset)
                };
                if let Some(offset) = offset {
                    let message_ref = vm.alloc_string(thread, text)?;
                    vm.heap_write().write_field(
                        obj,
                        offset,
                        Value::Ref(message_ref),
                        AllocationType::Reference,
                    )?;
                }
            }
        }
    }

    // Chained cause, best effort: only when the library declares the slot.
    if let Some(cause_desc) = desc.cause {
        let cause_fk = FieldKey {
            name: vm.interner().get_or_intern("cause"),
            desc: vm.interner().get_or_intern("Ljava/lang/Throwable;"),
        };
        let offset = {
            let ma = vm.method_area_read();
            ma.get_instance_class(&class_id)
                .ok()
                .and_then(|c| c.lookup_instance_field(&cause_fk))
                .map(|f| f.offset)
        };
        if let Some(offset) = offset {
            let cause_obj = materialize_exception(vm, thread, *cause_desc)?;
            vm.heap_write().write_field(
                obj,
                offset,
                Value::Ref(cause_obj),
                AllocationType::Reference,
            )?;
        }
    }
    Ok(())
}
