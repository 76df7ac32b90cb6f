use crate::native::preregistered::reg;
use crate::native::{NativeRegistry, NativeRet};
use crate::thread::JavaThreadState;
use crate::vm::Value;
use crate::VirtualMachine;
use std::io::Write;

/// Console output arrives through two static native bridges on
/// java/lang/System rather than a full stream stack; the bundled class
/// library routes PrintStream.println here.
pub(super) fn register(registry: &mut NativeRegistry) {
    reg(registry, "java/lang/System", "print", "(Ljava/lang/String;)V", system_print);
    reg(registry, "java/lang/System", "println", "(Ljava/lang/String;)V", system_println);
    reg(registry, "java/lang/System", "printErr", "(Ljava/lang/String;)V", system_print_err);
}

fn write_string(vm: &VirtualMachine, value: &Value, newline: bool, to_err: bool) -> NativeRet {
    let text = match value {
        Value::Null => "null".to_string(),
        Value::Ref(obj) => vm.read_java_string(*obj)?,
        other => format!("{:?}", other),
    };
    if to_err {
        let mut err = std::io::stderr().lock();
        let _ = if newline {
            writeln!(err, "{}", text)
        } else {
            write!(err, "{}", text)
        };
    } else {
        let mut out = std::io::stdout().lock();
        let _ = if newline {
            writeln!(out, "{}", text)
        } else {
            write!(out, "{}", text)
        };
        let _ = out.flush();
    }
    Ok(None)
}

fn system_print(vm: &VirtualMachine, _thread: &mut JavaThreadState, args: &[Value]) -> NativeRet {
    write_string(vm, &args[0], false, false)
}

fn system_println(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    write_string(vm, &args[0], true, false)
}

fn system_print_err(
    vm: &VirtualMachine,
    _thread: &mut JavaThreadState,
    args: &[Value],
) -> NativeRet {
    write_string(vm, &args[0], true, true)
}
