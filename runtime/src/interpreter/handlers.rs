use crate::error::JvmError;
use crate::rt::JvmClass;
use crate::thread::JavaThreadState;
use crate::vm::Value;
use crate::{VirtualMachine, throw_exception};

// Loads, stores, constants.

#[inline]
pub(super) fn handle_const_int(thread: &mut JavaThreadState, value: i32) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::Integer(value))
}

#[inline]
pub(super) fn handle_const_long(thread: &mut JavaThreadState, value: i64) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::Long(value))
}

#[inline]
pub(super) fn handle_const_float(thread: &mut JavaThreadState, value: f32) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::Float(value))
}

#[inline]
pub(super) fn handle_const_double(
    thread: &mut JavaThreadState,
    value: f64,
) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::Double(value))
}

#[inline]
pub(super) fn handle_aconst_null(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::Null)
}

#[inline]
pub(super) fn handle_load(thread: &mut JavaThreadState, slot: u32) -> Result<(), JvmError> {
    let value = *thread.stack.cur_java_frame()?.get_local(slot as usize)?;
    thread.stack.push_operand(value)
}

#[inline]
pub(super) fn handle_store(thread: &mut JavaThreadState, slot: u32) -> Result<(), JvmError> {
    let value = thread.stack.pop_operand()?;
    thread.stack.set_local(slot as usize, value)
}

#[inline]
pub(super) fn handle_iinc(
    thread: &mut JavaThreadState,
    slot: u32,
    delta: i32,
) -> Result<(), JvmError> {
    let frame = thread.stack.cur_java_frame_mut()?;
    let current = frame.get_local(slot as usize)?.as_int()?;
    frame.set_local(slot as usize, Value::Integer(current.wrapping_add(delta)))
}

// Operand-stack shuffles. Category-2 values occupy a single stack entry
// here, so the JVMS slot arithmetic turns into width checks.

#[inline]
pub(super) fn handle_pop(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    thread.stack.pop_operand()?;
    Ok(())
}

#[inline]
pub(super) fn handle_pop2(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let top = thread.stack.pop_operand()?;
    if !top.is_wide() {
        thread.stack.pop_operand()?;
    }
    Ok(())
}

#[inline]
pub(super) fn handle_dup(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let top = *thread.stack.cur_java_frame()?.peek()?;
    thread.stack.push_operand(top)
}

#[inline]
pub(super) fn handle_dup_x1(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    let v2 = thread.stack.pop_operand()?;
    thread.stack.push_operand(v1)?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)
}

#[inline]
pub(super) fn handle_dup_x2(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    let v2 = thread.stack.pop_operand()?;
    if v2.is_wide() {
        thread.stack.push_operand(v1)?;
        thread.stack.push_operand(v2)?;
        return thread.stack.push_operand(v1);
    }
    let v3 = thread.stack.pop_operand()?;
    thread.stack.push_operand(v1)?;
    thread.stack.push_operand(v3)?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)
}

#[inline]
pub(super) fn handle_dup2(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    if v1.is_wide() {
        thread.stack.push_operand(v1)?;
        return thread.stack.push_operand(v1);
    }
    let v2 = thread.stack.pop_operand()?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)
}

#[inline]
pub(super) fn handle_dup2_x1(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    if v1.is_wide() {
        let v2 = thread.stack.pop_operand()?;
        thread.stack.push_operand(v1)?;
        thread.stack.push_operand(v2)?;
        return thread.stack.push_operand(v1);
    }
    let v2 = thread.stack.pop_operand()?;
    let v3 = thread.stack.pop_operand()?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)?;
    thread.stack.push_operand(v3)?;
    thread.stack.push_operand(v2)?;
    thread.stack.push_operand(v1)
}

#[inline]
pub(super) fn handle_dup2_x2(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    let v2 = thread.stack.pop_operand()?;
    match (v1.is_wide(), v2.is_wide()) {
        (true, true) => {
            thread.stack.push_operand(v1)?;
            thread.stack.push_operand(v2)?;
            thread.stack.push_operand(v1)
        }
        (true, false) => {
            let v3 = thread.stack.pop_operand()?;
            thread.stack.push_operand(v1)?;
            thread.stack.push_operand(v3)?;
            thread.stack.push_operand(v2)?;
            thread.stack.push_operand(v1)
        }
        (false, true) => {
            thread.stack.push_operand(v2)?;
            thread.stack.push_operand(v1)?;
            thread.stack.push_operand(v2)?;
            thread.stack.push_operand(v1)
        }
        (false, false) => {
            let v3 = thread.stack.pop_operand()?;
            if v3.is_wide() {
                thread.stack.push_operand(v2)?;
                thread.stack.push_operand(v1)?;
                thread.stack.push_operand(v3)?;
                thread.stack.push_operand(v2)?;
                thread.stack.push_operand(v1)
            } else {
                let v4 = thread.stack.pop_operand()?;
                thread.stack.push_operand(v2)?;
                thread.stack.push_operand(v1)?;
                thread.stack.push_operand(v4)?;
                thread.stack.push_operand(v3)?;
                thread.stack.push_operand(v2)?;
                thread.stack.push_operand(v1)
            }
        }
    }
}

#[inline]
pub(super) fn handle_swap(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v1 = thread.stack.pop_operand()?;
    let v2 = thread.stack.pop_operand()?;
    thread.stack.push_operand(v1)?;
    thread.stack.push_operand(v2)
}

// Integer and long arithmetic. Division checks; shifts mask their distance
// the way the hardware does.

macro_rules! int_binop {
    ($name:ident, $op:ident) => {
        #[inline]
        pub(super) fn $name(thread: &mut JavaThreadState) -> Result<(), JvmError> {
            let v2 = thread.stack.pop_int_val()?;
            let v1 = thread.stack.pop_int_val()?;
            thread.stack.push_operand(Value::Integer(v1.$op(v2)))
        }
    };
}

macro_rules! long_binop {
    ($name:ident, $op:ident) => {
        #[inline]
        pub(super) fn $name(thread: &mut JavaThreadState) -> Result<(), JvmError> {
            let v2 = thread.stack.pop_long_val()?;
            let v1 = thread.stack.pop_long_val()?;
            thread.stack.push_operand(Value::Long(v1.$op(v2)))
        }
    };
}

macro_rules! float_binop {
    ($name:ident, $op:tt) => {
        #[inline]
        pub(super) fn $name(thread: &mut JavaThreadState) -> Result<(), JvmError> {
            let v2 = thread.stack.pop_float_val()?;
            let v1 = thread.stack.pop_float_val()?;
            thread.stack.push_operand(Value::Float(v1 $op v2))
        }
    };
}

macro_rules! double_binop {
    ($name:ident, $op:tt) => {
        #[inline]
        pub(super) fn $name(thread: &mut JavaThreadState) -> Result<(), JvmError> {
            let v2 = thread.stack.pop_double_val()?;
            let v1 = thread.stack.pop_double_val()?;
            thread.stack.push_operand(Value::Double(v1 $op v2))
        }
    };
}

int_binop!(handle_iadd, wrapping_add);
int_binop!(handle_isub, wrapping_sub);
int_binop!(handle_imul, wrapping_mul);
long_binop!(handle_ladd, wrapping_add);
long_binop!(handle_lsub, wrapping_sub);
long_binop!(handle_lmul, wrapping_mul);
float_binop!(handle_fadd, +);
float_binop!(handle_fsub, -);
float_binop!(handle_fmul, *);
float_binop!(handle_fdiv, /);
float_binop!(handle_frem, %);
double_binop!(handle_dadd, +);
double_binop!(handle_dsub, -);
double_binop!(handle_dmul, *);
double_binop!(handle_ddiv, /);
double_binop!(handle_drem, %);

#[inline]
pub(super) fn handle_idiv(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    if v2 == 0 {
        return throw_exception!(ArithmeticException, "/ by zero");
    }
    thread.stack.push_operand(Value::Integer(v1.wrapping_div(v2)))
}

#[inline]
pub(super) fn handle_irem(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    if v2 == 0 {
        return throw_exception!(ArithmeticException, "/ by zero");
    }
    thread.stack.push_operand(Value::Integer(v1.wrapping_rem(v2)))
}

#[inline]
pub(super) fn handle_ldiv(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_long_val()?;
    let v1 = thread.stack.pop_long_val()?;
    if v2 == 0 {
        return throw_exception!(ArithmeticException, "/ by zero");
    }
    thread.stack.push_operand(Value::Long(v1.wrapping_div(v2)))
}

#[inline]
pub(super) fn handle_lrem(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_long_val()?;
    let v1 = thread.stack.pop_long_val()?;
    if v2 == 0 {
        return throw_exception!(ArithmeticException, "/ by zero");
    }
    thread.stack.push_operand(Value::Long(v1.wrapping_rem(v2)))
}

int_binop!(handle_iand, bitand_op);
int_binop!(handle_ior, bitor_op);
int_binop!(handle_ixor, bitxor_op);
long_binop!(handle_land, bitand_op);
long_binop!(handle_lor, bitor_op);
long_binop!(handle_lxor, bitxor_op);

#[inline]
pub(super) fn handle_ineg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v.wrapping_neg()))
}

#[inline]
pub(super) fn handle_lneg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Long(v.wrapping_neg()))
}

#[inline]
pub(super) fn handle_fneg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_float_val()?;
    thread.stack.push_operand(Value::Float(-v))
}

#[inline]
pub(super) fn handle_dneg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Double(-v))
}

#[inline]
pub(super) fn handle_ishl(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v1.wrapping_shl(v2 as u32 & 0x1f)))
}

#[inline]
pub(super) fn handle_ishr(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v1.wrapping_shr(v2 as u32 & 0x1f)))
}

#[inline]
pub(super) fn handle_iushr(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    thread
        .stack
        .push_operand(Value::Integer(((v1 as u32) >> (v2 as u32 & 0x1f)) as i32))
}

#[inline]
pub(super) fn handle_lshl(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Long(v1.wrapping_shl(v2 as u32 & 0x3f)))
}

#[inline]
pub(super) fn handle_lshr(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Long(v1.wrapping_shr(v2 as u32 & 0x3f)))
}

#[inline]
pub(super) fn handle_lushr(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_long_val()?;
    thread
        .stack
        .push_operand(Value::Long(((v1 as u64) >> (v2 as u32 & 0x3f)) as i64))
}

// Conversions.

#[inline]
pub(super) fn handle_i2l(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Long(v as i64))
}

#[inline]
pub(super) fn handle_i2f(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Float(v as f32))
}

#[inline]
pub(super) fn handle_i2d(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Double(v as f64))
}

#[inline]
pub(super) fn handle_l2i(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Integer(v as i32))
}

#[inline]
pub(super) fn handle_l2f(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Float(v as f32))
}

#[inline]
pub(super) fn handle_l2d(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Double(v as f64))
}

#[inline]
pub(super) fn handle_f2i(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_float_val()?;
    thread.stack.push_operand(Value::Integer(v as i32))
}

#[inline]
pub(super) fn handle_f2l(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_float_val()?;
    thread.stack.push_operand(Value::Long(v as i64))
}

#[inline]
pub(super) fn handle_f2d(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_float_val()?;
    thread.stack.push_operand(Value::Double(v as f64))
}

#[inline]
pub(super) fn handle_d2i(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Integer(v as i32))
}

#[inline]
pub(super) fn handle_d2l(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Long(v as i64))
}

#[inline]
pub(super) fn handle_d2f(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Float(v as f32))
}

#[inline]
pub(super) fn handle_i2b(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v as i8 as i32))
}

#[inline]
pub(super) fn handle_i2c(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v as u16 as i32))
}

#[inline]
pub(super) fn handle_i2s(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v = thread.stack.pop_int_val()?;
    thread.stack.push_operand(Value::Integer(v as i16 as i32))
}

// Comparisons.

#[inline]
pub(super) fn handle_lcmp(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_long_val()?;
    let v1 = thread.stack.pop_long_val()?;
    thread.stack.push_operand(Value::Integer(match v1.cmp(&v2) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

fn float_compare(v1: f64, v2: f64, nan_result: i32) -> i32 {
    if v1.is_nan() || v2.is_nan() {
        nan_result
    } else if v1 < v2 {
        -1
    } else if v1 > v2 {
        1
    } else {
        0
    }
}

#[inline]
pub(super) fn handle_fcmpl(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_float_val()?;
    let v1 = thread.stack.pop_float_val()?;
    thread
        .stack
        .push_operand(Value::Integer(float_compare(v1 as f64, v2 as f64, -1)))
}

#[inline]
pub(super) fn handle_fcmpg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_float_val()?;
    let v1 = thread.stack.pop_float_val()?;
    thread
        .stack
        .push_operand(Value::Integer(float_compare(v1 as f64, v2 as f64, 1)))
}

#[inline]
pub(super) fn handle_dcmpl(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_double_val()?;
    let v1 = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Integer(float_compare(v1, v2, -1)))
}

#[inline]
pub(super) fn handle_dcmpg(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let v2 = thread.stack.pop_double_val()?;
    let v1 = thread.stack.pop_double_val()?;
    thread.stack.push_operand(Value::Integer(float_compare(v1, v2, 1)))
}

// Branch predicates; the dispatch loop applies the target.

#[inline]
pub(super) fn branch_if_int(
    thread: &mut JavaThreadState,
    predicate: impl Fn(i32) -> bool,
) -> Result<bool, JvmError> {
    Ok(predicate(thread.stack.pop_int_val()?))
}

#[inline]
pub(super) fn branch_if_icmp(
    thread: &mut JavaThreadState,
    predicate: impl Fn(i32, i32) -> bool,
) -> Result<bool, JvmError> {
    let v2 = thread.stack.pop_int_val()?;
    let v1 = thread.stack.pop_int_val()?;
    Ok(predicate(v1, v2))
}

#[inline]
pub(super) fn branch_if_acmp(thread: &mut JavaThreadState, eq: bool) -> Result<bool, JvmError> {
    let v2 = thread.stack.pop_nullable_ref()?;
    let v1 = thread.stack.pop_nullable_ref()?;
    Ok((v1 == v2) == eq)
}

#[inline]
pub(super) fn branch_if_null(thread: &mut JavaThreadState, null: bool) -> Result<bool, JvmError> {
    let v = thread.stack.pop_nullable_ref()?;
    Ok(matches!(v, Value::Null) == null)
}

// Arrays.

#[inline]
pub(super) fn handle_array_load(
    thread: &mut JavaThreadState,
    vm: &VirtualMachine,
) -> Result<(), JvmError> {
    let index = thread.stack.pop_int_val()?;
    let array_ref = thread.stack.pop_obj_val()?;
    let value = vm.heap_read().read_array_element(array_ref, index)?;
    thread.stack.push_operand(value)
}

#[inline]
pub(super) fn handle_array_store(
    thread: &mut JavaThreadState,
    vm: &VirtualMachine,
) -> Result<(), JvmError> {
    let value = thread.stack.pop_operand()?;
    let index = thread.stack.pop_int_val()?;
    let array_ref = thread.stack.pop_obj_val()?;
    vm.heap_write().write_array_element(array_ref, index, value)
}

/// `aastore` adds the run-time store check.
#[inline]
pub(super) fn handle_aastore(
    thread: &mut JavaThreadState,
    vm: &VirtualMachine,
) -> Result<(), JvmError> {
    let value = thread.stack.pop_nullable_ref()?;
    let index = thread.stack.pop_int_val()?;
    let array_ref = thread.stack.pop_obj_val()?;
    if let Value::Ref(stored) = value {
        let array_class_id = vm.heap_read().get_class_id(array_ref)?;
        let value_class_id = vm.heap_read().get_class_id(stored)?;
        let ma = vm.method_area_read();
        if let JvmClass::InstanceArray(array_class) = ma.get_class(&array_class_id) {
            if !ma.is_subclass_of(value_class_id, array_class.element_class_id) {
                let name = ma.interner().resolve(&ma.get_class(&value_class_id).get_name());
                return throw_exception!(ArrayStoreException, "{}", name.replace('/', "."));
            }
        }
    }
    vm.heap_write().write_array_element(array_ref, index, value)
}

#[inline]
pub(super) fn handle_arraylength(
    thread: &mut JavaThreadState,
    vm: &VirtualMachine,
) -> Result<(), JvmError> {
    let array_ref = thread.stack.pop_obj_val()?;
    let length = vm.heap_read().get_array_length(array_ref)?;
    thread.stack.push_operand(Value::Integer(length))
}

// Subroutines (pre-Java-6 class files).

#[inline]
pub(super) fn handle_jsr(thread: &mut JavaThreadState, return_pc: usize) -> Result<(), JvmError> {
    thread.stack.push_operand(Value::ReturnAddress(return_pc))
}

#[inline]
pub(super) fn handle_ret(thread: &mut JavaThreadState, slot: u32) -> Result<usize, JvmError> {
    match thread.stack.cur_java_frame()?.get_local(slot as usize)? {
        Value::ReturnAddress(pc) => Ok(*pc),
        other => Err(JvmError::UnexpectedType(format!(
            "ret expects a return address, found {:?}",
            other
        ))),
    }
}

#[inline]
pub(super) fn handle_athrow(thread: &mut JavaThreadState) -> Result<(), JvmError> {
    let exception_ref = thread.stack.pop_obj_val()?;
    Err(JvmError::JavaExceptionThrown(exception_ref))
}

// Shims so the binop macros can use method-call syntax uniformly.
trait BitOps {
    fn bitand_op(self, other: Self) -> Self;
    fn bitor_op(self, other: Self) -> Self;
    fn bitxor_op(self, other: Self) -> Self;
}

macro_rules! impl_bitops {
    ($ty:ty) => {
        impl BitOps for $ty {
            fn bitand_op(self, other: Self) -> Self {
                self & other
            }
            fn bitor_op(self, other: Self) -> Self {
                self | other
            }
            fn bitxor_op(self, other: Self) -> Self {
                self ^ other
            }
        }
    };
}

impl_bitops!(i32);
impl_bitops!(i64);
