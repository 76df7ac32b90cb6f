use crate::error::{JavaExceptionKind, JvmError};
use crate::heap::HeapRef;
use crate::interpreter::handlers::*;
use crate::interpreter::prepare::PreparedCode;
use crate::interpreter::quick::{POp, PreparedInsn, pack_pair, unpack_pair};
use crate::keys::{ClassId, MethodKey};
use crate::rt::constant_pool::RuntimeConstant;
use crate::rt::{ClassLike, ClassState, JvmClass};
use crate::thread::{BlockedRegion, JavaThreadState, ThreadState};
use crate::vm::Value;
use crate::vm::stack::{FrameType, JavaFrame, NativeFrame};
use crate::{MethodId, VirtualMachine, build_exception, throw_exception};
use bonsai_classfile::descriptor::ArrayType;
use lasso::Key;
use smallvec::SmallVec;
use std::ops::ControlFlow;
use tracing_log::log::warn;

pub mod handlers;
pub mod prepare;
pub mod quick;

/// Argument buffers rarely outgrow a handful of slots.
type Args = SmallVec<[Value; 8]>;

pub struct Interpreter;

impl Interpreter {
    /// Runs one method's prepared code to completion. Returns the value
    /// produced for the caller, or `Err(JavaExceptionThrown)` once the
    /// frame has been popped during unwinding.
    fn interpret_method(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, JvmError> {
        // The prepared code is reached through a raw pointer so the method
        // area lock is not held across dispatch; prepared code is never
        // freed or moved once published.
        let prepared: *const PreparedCode = vm.prepared_code(method_id)?;
        let prepared = unsafe { &*prepared };

        loop {
            // Safepoint: every bytecode boundary is a poll site.
            if vm.threads().suspend_pending() {
                vm.threads().safepoint_poll(&thread.handle);
            }

            let pc = thread.stack.pc()?;
            let insn = prepared
                .insns
                .get(pc)
                .ok_or_else(|| build_exception!(InternalError, "pc ran off the prepared code"))?;

            match Self::execute(thread, vm, prepared, insn, pc) {
                Ok(ControlFlow::Continue(next_pc)) => {
                    *thread.stack.pc_mut()? = next_pc;
                }
                Ok(ControlFlow::Break(result)) => return Ok(result),
                Err(e) => {
                    let throwable = match e {
                        JvmError::JavaException(desc) => vm.materialize_exception(thread, desc)?,
                        JvmError::JavaExceptionThrown(obj) => obj,
                        other => return Err(other),
                    };
                    if !Self::find_exception_handler(vm, prepared, method_id, throwable, thread)? {
                        thread.stack.pop_java_frame()?;
                        return Err(JvmError::JavaExceptionThrown(throwable));
                    }
                }
            }
        }
    }

    /// One instruction. `Continue(pc)` carries the next instruction index;
    /// `Break` carries the method's return value.
    fn execute(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        prepared: &PreparedCode,
        insn: &PreparedInsn,
        pc: usize,
    ) -> Result<ControlFlow<Option<Value>, usize>, JvmError> {
        let next = pc + 1;
        let imm = insn.imm;
        match insn.op() {
            POp::Nop => {}
            POp::AconstNull => handle_aconst_null(thread)?,
            POp::IconstImm => handle_const_int(thread, insn.imm2)?,
            POp::LconstImm => handle_const_long(thread, insn.imm2 as i64)?,
            POp::FconstImm => handle_const_float(thread, insn.imm2 as f32)?,
            POp::DconstImm => handle_const_double(thread, insn.imm2 as f64)?,
            POp::Bipush | POp::Sipush => handle_const_int(thread, insn.imm2)?,
            POp::Iload | POp::Lload | POp::Fload | POp::Dload | POp::Aload => {
                handle_load(thread, imm)?
            }
            POp::Istore | POp::Lstore | POp::Fstore | POp::Dstore | POp::Astore => {
                handle_store(thread, imm)?
            }
            POp::Iinc => handle_iinc(thread, imm, insn.imm2)?,

            POp::Iaload | POp::Laload | POp::Faload | POp::Daload | POp::Aaload | POp::Baload
            | POp::Caload | POp::Saload => handle_array_load(thread, vm)?,
            POp::Iastore | POp::Lastore | POp::Fastore | POp::Dastore | POp::Bastore
            | POp::Castore | POp::Sastore => handle_array_store(thread, vm)?,
            POp::Aastore => handle_aastore(thread, vm)?,
            POp::Arraylength => handle_arraylength(thread, vm)?,

            POp::Pop => handle_pop(thread)?,
            POp::Pop2 => handle_pop2(thread)?,
            POp::Dup => handle_dup(thread)?,
            POp::DupX1 => handle_dup_x1(thread)?,
            POp::DupX2 => handle_dup_x2(thread)?,
            POp::Dup2 => handle_dup2(thread)?,
            POp::Dup2X1 => handle_dup2_x1(thread)?,
            POp::Dup2X2 => handle_dup2_x2(thread)?,
            POp::Swap => handle_swap(thread)?,

            POp::Iadd => handle_iadd(thread)?,
            POp::Ladd => handle_ladd(thread)?,
            POp::Fadd => handle_fadd(thread)?,
            POp::Dadd => handle_dadd(thread)?,
            POp::Isub => handle_isub(thread)?,
            POp::Lsub => handle_lsub(thread)?,
            POp::Fsub => handle_fsub(thread)?,
            POp::Dsub => handle_dsub(thread)?,
            POp::Imul => handle_imul(thread)?,
            POp::Lmul => handle_lmul(thread)?,
            POp::Fmul => handle_fmul(thread)?,
            POp::Dmul => handle_dmul(thread)?,
            POp::Idiv => handle_idiv(thread)?,
            POp::Ldiv => handle_ldiv(thread)?,
            POp::Fdiv => handle_fdiv(thread)?,
            POp::Ddiv => handle_ddiv(thread)?,
            POp::Irem => handle_irem(thread)?,
            POp::Lrem => handle_lrem(thread)?,
            POp::Frem => handle_frem(thread)?,
            POp::Drem => handle_drem(thread)?,
            POp::Ineg => handle_ineg(thread)?,
            POp::Lneg => handle_lneg(thread)?,
            POp::Fneg => handle_fneg(thread)?,
            POp::Dneg => handle_dneg(thread)?,
            POp::Ishl => handle_ishl(thread)?,
            POp::Lshl => handle_lshl(thread)?,
            POp::Ishr => handle_ishr(thread)?,
            POp::Lshr => handle_lshr(thread)?,
            POp::Iushr => handle_iushr(thread)?,
            POp::Lushr => handle_lushr(thread)?,
            POp::Iand => handle_iand(thread)?,
            POp::Land => handle_land(thread)?,
            POp::Ior => handle_ior(thread)?,
            POp::Lor => handle_lor(thread)?,
            POp::Ixor => handle_ixor(thread)?,
            POp::Lxor => handle_lxor(thread)?,

            POp::I2l => handle_i2l(thread)?,
            POp::I2f => handle_i2f(thread)?,
            POp::I2d => handle_i2d(thread)?,
            POp::L2i => handle_l2i(thread)?,
            POp::L2f => handle_l2f(thread)?,
            POp::L2d => handle_l2d(thread)?,
            POp::F2i => handle_f2i(thread)?,
            POp::F2l => handle_f2l(thread)?,
            POp::F2d => handle_f2d(thread)?,
            POp::D2i => handle_d2i(thread)?,
            POp::D2l => handle_d2l(thread)?,
            POp::D2f => handle_d2f(thread)?,
            POp::I2b => handle_i2b(thread)?,
            POp::I2c => handle_i2c(thread)?,
            POp::I2s => handle_i2s(thread)?,

            POp::Lcmp => handle_lcmp(thread)?,
            POp::Fcmpl => handle_fcmpl(thread)?,
            POp::Fcmpg => handle_fcmpg(thread)?,
            POp::Dcmpl => handle_dcmpl(thread)?,
            POp::Dcmpg => handle_dcmpg(thread)?,

            POp::Ifeq => return branch(branch_if_int(thread, |v| v == 0)?, imm, next),
            POp::Ifne => return branch(branch_if_int(thread, |v| v != 0)?, imm, next),
            POp::Iflt => return branch(branch_if_int(thread, |v| v < 0)?, imm, next),
            POp::Ifge => return branch(branch_if_int(thread, |v| v >= 0)?, imm, next),
            POp::Ifgt => return branch(branch_if_int(thread, |v| v > 0)?, imm, next),
            POp::Ifle => return branch(branch_if_int(thread, |v| v <= 0)?, imm, next),
            POp::IfIcmpeq => return branch(branch_if_icmp(thread, |a, b| a == b)?, imm, next),
            POp::IfIcmpne => return branch(branch_if_icmp(thread, |a, b| a != b)?, imm, next),
            POp::IfIcmplt => return branch(branch_if_icmp(thread, |a, b| a < b)?, imm, next),
            POp::IfIcmpge => return branch(branch_if_icmp(thread, |a, b| a >= b)?, imm, next),
            POp::IfIcmpgt => return branch(branch_if_icmp(thread, |a, b| a > b)?, imm, next),
            POp::IfIcmple => return branch(branch_if_icmp(thread, |a, b| a <= b)?, imm, next),
            POp::IfAcmpeq => return branch(branch_if_acmp(thread, true)?, imm, next),
            POp::IfAcmpne => return branch(branch_if_acmp(thread, false)?, imm, next),
            POp::Ifnull => return branch(branch_if_null(thread, true)?, imm, next),
            POp::Ifnonnull => return branch(branch_if_null(thread, false)?, imm, next),
            POp::Goto => return Ok(ControlFlow::Continue(imm as usize)),
            POp::Jsr => {
                handle_jsr(thread, next)?;
                return Ok(ControlFlow::Continue(imm as usize));
            }
            POp::Ret => return Ok(ControlFlow::Continue(handle_ret(thread, imm)?)),
            POp::Tableswitch | POp::Lookupswitch => {
                let key = thread.stack.pop_int_val()?;
                let target = prepared.switches[imm as usize].target_for(key);
                return Ok(ControlFlow::Continue(target as usize));
            }

            POp::Return => return Ok(ControlFlow::Break(None)),
            POp::Ireturn | POp::Freturn | POp::Areturn | POp::Lreturn | POp::Dreturn => {
                let value = thread.stack.pop_operand()?;
                return Ok(ControlFlow::Break(Some(value)));
            }

            POp::Athrow => handle_athrow(thread)?,

            POp::Monitorenter => {
                let obj = thread.stack.pop_obj_val()?;
                vm.lock_object(thread, obj);
            }
            POp::Monitorexit => {
                let obj = thread.stack.pop_obj_val()?;
                vm.unlock_object(thread, obj)?;
            }

            // Constant-pool users: resolve once, rewrite to the quick form,
            // re-dispatch through the rewritten handler.
            POp::Ldc => {
                Self::resolve_ldc(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::Ldc2 => {
                let method_id = thread.stack.cur_java_frame()?.method_id();
                let ma = vm.method_area_read();
                let cp = ma.get_cp_by_method_id(&method_id)?;
                let value = match cp.get(imm as u16)? {
                    RuntimeConstant::Long(v) => Value::Long(*v),
                    RuntimeConstant::Double(v) => Value::Double(*v),
                    other => {
                        return Err(build_exception!(
                            ClassFormatError,
                            "ldc2_w on a {} entry",
                            other.get_type()
                        ));
                    }
                };
                drop(ma);
                thread.stack.push_operand(value)?;
            }
            POp::LdcIntQuick => handle_const_int(thread, insn.operand() as i32)?,
            POp::LdcFloatQuick => {
                handle_const_float(thread, f32::from_bits(insn.operand() as u32))?
            }
            POp::LdcStringQuick => {
                let sym = crate::Symbol::try_from_usize(insn.operand() as usize)
                    .ok_or_else(|| build_exception!(InternalError, "corrupt string operand"))?;
                let interned = vm
                    .heap_read()
                    .lookup_interned(sym)
                    .ok_or_else(|| build_exception!(InternalError, "interned string vanished"))?;
                thread.stack.push_operand(Value::Ref(interned))?;
            }
            POp::LdcClassQuick => {
                let class_id = class_id_from(insn.operand())?;
                let mirror = vm.mirror_for(thread, class_id)?;
                thread.stack.push_operand(Value::Ref(mirror))?;
            }

            op @ (POp::Getstatic | POp::Putstatic) => {
                Self::resolve_static_access(thread, vm, insn, op == POp::Getstatic)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::GetstaticQuick => {
                let (class_raw, slot) = unpack_pair(insn.operand());
                let class_id = class_id_from(class_raw as u64)?;
                let value = {
                    let ma = vm.method_area_read();
                    *ma.get_class_like(&class_id)?
                        .static_field_by_slot(slot as usize)?
                        .value
                        .read()
                        .unwrap()
                };
                thread.stack.push_operand(value)?;
            }
            POp::PutstaticQuick => {
                let (class_raw, slot) = unpack_pair(insn.operand());
                let class_id = class_id_from(class_raw as u64)?;
                let value = thread.stack.pop_operand()?;
                let ma = vm.method_area_read();
                *ma.get_class_like(&class_id)?
                    .static_field_by_slot(slot as usize)?
                    .value
                    .write()
                    .unwrap() = value;
            }

            op @ (POp::Getfield | POp::Putfield) => {
                Self::resolve_field_access(thread, vm, insn, op == POp::Getfield)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::GetfieldQuick => {
                let (offset, kind) = unpack_pair(insn.operand());
                let obj = thread.stack.pop_obj_val()?;
                let value = vm.heap_read().read_field(
                    obj,
                    offset as usize,
                    alloc_kind_from(kind)?,
                )?;
                thread.stack.push_operand(value)?;
            }
            POp::PutfieldQuick => {
                let (offset, kind) = unpack_pair(insn.operand());
                let value = thread.stack.pop_operand()?;
                let obj = thread.stack.pop_obj_val()?;
                vm.heap_write()
                    .write_field(obj, offset as usize, value, alloc_kind_from(kind)?)?;
            }

            POp::Invokestatic => {
                Self::resolve_invokestatic(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::InvokestaticQuick => {
                let method_id = method_id_from(insn.operand())?;
                let args = Self::prepare_method_args(thread, method_id, vm)?;
                Self::invoke_method_internal(thread, method_id, args, vm)?;
            }
            POp::Invokespecial => {
                Self::resolve_invokespecial(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::InvokespecialQuick => {
                let method_id = method_id_from(insn.operand())?;
                let args = Self::prepare_method_args(thread, method_id, vm)?;
                args_receiver(&args)?;
                Self::invoke_method_internal(thread, method_id, args, vm)?;
            }
            POp::Invokevirtual => {
                Self::resolve_invokevirtual(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::InvokevirtualQuick => {
                let (vtable_index, arg_count) = unpack_pair(insn.operand());
                let args = Self::pop_args(thread, arg_count as usize)?;
                let receiver = args_receiver(&args)?;
                let receiver_class = vm.heap_read().get_class_id(receiver)?;
                let method_id = vm
                    .method_area_read()
                    .get_class(&receiver_class)
                    .get_vtable_method_id(vtable_index as u16)?;
                Self::invoke_method_internal(thread, method_id, args, vm)?;
            }
            POp::Invokeinterface | POp::InvokeinterfaceQuick => {
                Self::invoke_interface(thread, vm, insn)?;
            }

            POp::New => {
                Self::resolve_new(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::NewQuick => {
                let (class_raw, size) = unpack_pair(insn.operand());
                let class_id = class_id_from(class_raw as u64)?;
                let obj = vm.alloc_instance_for_class(thread, class_id, size as usize)?;
                thread.stack.push_operand(Value::Ref(obj))?;
            }
            POp::Newarray => {
                let array_type = ArrayType::try_from(imm as u8)
                    .map_err(|_| build_exception!(ClassFormatError, "bad newarray type"))?;
                let length = thread.stack.pop_int_val()?;
                let array = vm.alloc_primitive_array(thread, array_type, length)?;
                thread.stack.push_operand(Value::Ref(array))?;
            }
            POp::Anewarray => {
                Self::resolve_anewarray(thread, vm, insn)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::AnewarrayQuick => {
                let class_id = class_id_from(insn.operand())?;
                let length = thread.stack.pop_int_val()?;
                let array = vm.alloc_object_array(thread, class_id, length)?;
                thread.stack.push_operand(Value::Ref(array))?;
            }
            POp::Multianewarray => {
                Self::resolve_class_operand(thread, vm, insn, POp::MultianewarrayQuick)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::MultianewarrayQuick => {
                let class_id = class_id_from(insn.operand())?;
                let dims = insn.imm2 as usize;
                let mut counts = Vec::with_capacity(dims);
                for _ in 0..dims {
                    counts.push(thread.stack.pop_int_val()?);
                }
                counts.reverse();
                let array = Self::alloc_multi_array(thread, vm, class_id, &counts)?;
                thread.stack.push_operand(Value::Ref(array))?;
            }

            POp::Checkcast => {
                Self::resolve_class_operand(thread, vm, insn, POp::CheckcastQuick)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::CheckcastQuick => {
                let target = class_id_from(insn.operand())?;
                let value = thread.stack.pop_nullable_ref()?;
                if let Value::Ref(obj) = value {
                    let class_id = vm.heap_read().get_class_id(obj)?;
                    let ma = vm.method_area_read();
                    if !ma.is_subclass_of(class_id, target) {
                        let from = ma.interner().resolve(&ma.get_class(&class_id).get_name());
                        let to = ma.interner().resolve(&ma.get_class(&target).get_name());
                        return throw_exception!(
                            ClassCastException,
                            "class {} cannot be cast to class {}",
                            from.replace('/', "."),
                            to.replace('/', ".")
                        );
                    }
                }
                thread.stack.push_operand(value)?;
            }
            POp::Instanceof => {
                Self::resolve_class_operand(thread, vm, insn, POp::InstanceofQuick)?;
                return Ok(ControlFlow::Continue(pc));
            }
            POp::InstanceofQuick => {
                let target = class_id_from(insn.operand())?;
                let value = thread.stack.pop_nullable_ref()?;
                let result = match value {
                    Value::Ref(obj) => {
                        let class_id = vm.heap_read().get_class_id(obj)?;
                        vm.method_area_read().is_subclass_of(class_id, target)
                    }
                    _ => false,
                };
                thread.stack.push_operand(Value::Integer(result as i32))?;
            }

            POp::Locked => {
                // A concurrent quickening is mid-rewrite; redispatch.
                return Ok(ControlFlow::Continue(pc));
            }
        }
        Ok(ControlFlow::Continue(next))
    }

    // ---- resolution + quickening ----

    fn current_cp_entry(
        thread: &JavaThreadState,
        vm: &VirtualMachine,
        index: u16,
    ) -> Result<crate::rt::constant_pool::MemberRef, JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let ma = vm.method_area_read();
        let cp = ma.get_cp_by_method_id(&method_id)?;
        cp.get_field_ref(index)
    }

    fn resolve_ldc(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        enum Loadable {
            Int(i32),
            Float(f32),
            Str(crate::Symbol),
            Class(crate::Symbol),
        }
        let loadable = {
            let ma = vm.method_area_read();
            let cp = ma.get_cp_by_method_id(&method_id)?;
            match cp.get(insn.imm as u16)? {
                RuntimeConstant::Integer(v) => Loadable::Int(*v),
                RuntimeConstant::Float(v) => Loadable::Float(*v),
                RuntimeConstant::String(sym) => Loadable::Str(*sym),
                RuntimeConstant::Class(sym) => Loadable::Class(*sym),
                other => {
                    return Err(build_exception!(
                        ClassFormatError,
                        "ldc on a {} entry",
                        other.get_type()
                    ));
                }
            }
        };
        match loadable {
            Loadable::Int(v) => insn.quicken(POp::LdcIntQuick, v as u32 as u64),
            Loadable::Float(v) => insn.quicken(POp::LdcFloatQuick, v.to_bits() as u64),
            Loadable::Str(sym) => {
                // Interning allocates; do it before publishing the operand.
                vm.intern_string(thread, sym)?;
                insn.quicken(POp::LdcStringQuick, sym.into_usize() as u64);
            }
            Loadable::Class(sym) => {
                let class_id = vm.method_area_write().get_class_id_or_load(sym)?;
                insn.quicken(POp::LdcClassQuick, class_id.into_raw() as u64);
            }
        }
        Ok(())
    }

    fn resolve_static_access(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
        is_get: bool,
    ) -> Result<(), JvmError> {
        let member = Self::current_cp_entry(thread, vm, insn.imm as u16)?;
        let declared_class = vm.method_area_write().get_class_id_or_load(member.class)?;
        let holder = vm
            .method_area_read()
            .resolve_static_field_class(declared_class, &member.field_key())?;
        Self::ensure_initialized(thread, Some(holder), vm)?;
        let slot = vm
            .method_area_read()
            .get_class_like(&holder)?
            .static_field_slot(&member.field_key())
            .ok_or_else(|| build_exception!(NoSuchFieldError, class_sym: member.name))?;
        let quick = if is_get {
            POp::GetstaticQuick
        } else {
            POp::PutstaticQuick
        };
        insn.quicken(quick, pack_pair(holder.into_raw(), slot as u32));
        Ok(())
    }

    fn resolve_field_access(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
        is_get: bool,
    ) -> Result<(), JvmError> {
        let member = Self::current_cp_entry(thread, vm, insn.imm as u16)?;
        let class_id = vm.method_area_write().get_class_id_or_load(member.class)?;
        let (offset, kind) = {
            let ma = vm.method_area_read();
            let field = ma.find_instance_field(class_id, &member.field_key())?;
            let kind = ma
                .get_field_descriptor(&field.descriptor_id)
                .as_allocation_type();
            (field.offset, kind)
        };
        let quick = if is_get {
            POp::GetfieldQuick
        } else {
            POp::PutfieldQuick
        };
        insn.quicken(quick, pack_pair(offset as u32, kind as u32));
        Ok(())
    }

    fn resolve_method_ref(
        thread: &JavaThreadState,
        vm: &VirtualMachine,
        index: u16,
        interface: bool,
    ) -> Result<(ClassId, MethodId, MethodKey), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let member = {
            let ma = vm.method_area_read();
            let cp = ma.get_cp_by_method_id(&method_id)?;
            if interface {
                cp.get_interface_method_ref(index)?
            } else {
                cp.get_any_method_ref(index)?
            }
        };
        let class_id = vm.method_area_write().get_class_id_or_load(member.class)?;
        let resolved = vm
            .method_area_read()
            .find_method(class_id, &member.method_key())?;
        Ok((class_id, resolved, member.method_key()))
    }

    fn resolve_invokestatic(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let (_, method_id, _) = Self::resolve_method_ref(thread, vm, insn.imm as u16, false)?;
        let holder = vm.method_area_read().get_method(&method_id).class_id();
        Self::ensure_initialized(thread, Some(holder), vm)?;
        insn.quicken(POp::InvokestaticQuick, method_id.into_raw() as u64);
        Ok(())
    }

    fn resolve_invokespecial(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let (_, method_id, _) = Self::resolve_method_ref(thread, vm, insn.imm as u16, false)?;
        insn.quicken(POp::InvokespecialQuick, method_id.into_raw() as u64);
        Ok(())
    }

    fn resolve_invokevirtual(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let (_, method_id, _) = Self::resolve_method_ref(thread, vm, insn.imm as u16, false)?;
        let (vtable_index, arg_count) = {
            let ma = vm.method_area_read();
            let method = ma.get_method(&method_id);
            let arg_count = ma
                .get_method_descriptor(&method.descriptor_id())
                .params
                .len() as u32
                + 1;
            (method.get_vtable_index(), arg_count)
        };
        match vtable_index {
            Some(index) => {
                insn.quicken(POp::InvokevirtualQuick, pack_pair(index as u32, arg_count))
            }
            // Private or final-on-Object style methods dispatch directly.
            None => insn.quicken(POp::InvokespecialQuick, method_id.into_raw() as u64),
        }
        Ok(())
    }

    /// `invokeinterface`: consults the receiver's interface-dimension table
    /// and keeps the last successful `(receiver class, method)` pair in the
    /// quickened operand as a one-entry cache.
    fn invoke_interface(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let member = {
            let ma = vm.method_area_read();
            let cp = ma.get_cp_by_method_id(&method_id)?;
            cp.get_interface_method_ref(insn.imm as u16)?
        };
        let arg_count = {
            let mut ma = vm.method_area_write();
            let desc_id = ma.get_or_new_method_descriptor_id(&member.desc)?;
            ma.get_method_descriptor(&desc_id).params.len() + 1
        };
        let args = Self::pop_args(thread, arg_count)?;
        let receiver = args_receiver(&args)?;
        let receiver_class = vm.heap_read().get_class_id(receiver)?;

        if insn.op() == POp::InvokeinterfaceQuick {
            let (cached_class, cached_method) = unpack_pair(insn.operand());
            if cached_class == receiver_class.into_raw() {
                let target = method_id_from(cached_method as u64)?;
                return Self::invoke_method_internal(thread, target, args, vm);
            }
        }

        let target = {
            let mut ma = vm.method_area_write();
            let interface_id = ma.get_class_id_or_load(member.class)?;
            let key = member.method_key();
            match ma.get_class(&receiver_class) {
                JvmClass::Instance(instance) => {
                    let table_index = ma
                        .get_interface_class(&interface_id)
                        .ok()
                        .and_then(|i| i.method_table_index(&key));
                    match table_index {
                        Some(index) => instance
                            .itable_lookup(interface_id)
                            .and_then(|entry| entry.methods.get(index as usize).copied())
                            .ok_or_else(|| {
                                build_exception!(
                                    IncompatibleClassChangeError,
                                    class_sym: member.class
                                )
                            })?,
                        // Methods inherited from Object arrive through
                        // plain method refs.
                        None => ma.find_method(receiver_class, &key)?,
                    }
                }
                _ => ma.find_method(receiver_class, &key)?,
            }
        };
        insn.quicken(
            POp::InvokeinterfaceQuick,
            pack_pair(receiver_class.into_raw(), target.into_raw()),
        );
        Self::invoke_method_internal(thread, target, args, vm)
    }

    fn resolve_new(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let class_sym = {
            let ma = vm.method_area_read();
            ma.get_cp_by_method_id(&method_id)?.get_class_sym(insn.imm as u16)?
        };
        let class_id = vm.method_area_write().get_class_id_or_load(class_sym)?;
        let size = {
            let ma = vm.method_area_read();
            let class = ma.get_class(&class_id);
            if class.is_interface() || class.as_class_like().is_ok_and(|c| c.flags().is_abstract())
            {
                return throw_exception!(IncompatibleClassChangeError, class_sym: class_sym);
            }
            ma.get_instance_class(&class_id)?.get_instance_size()?
        };
        Self::ensure_initialized(thread, Some(class_id), vm)?;
        insn.quicken(POp::NewQuick, pack_pair(class_id.into_raw(), size as u32));
        Ok(())
    }

    fn resolve_anewarray(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
    ) -> Result<(), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let element_sym = {
            let ma = vm.method_area_read();
            ma.get_cp_by_method_id(&method_id)?.get_class_sym(insn.imm as u16)?
        };
        let array_name = {
            let interner = vm.interner();
            let element = interner.resolve(&element_sym).to_string();
            let descriptor = if element.starts_with('[') {
                format!("[{}", element)
            } else {
                format!("[L{};", element)
            };
            interner.get_or_intern(&descriptor)
        };
        let class_id = vm.method_area_write().get_class_id_or_load(array_name)?;
        insn.quicken(POp::AnewarrayQuick, class_id.into_raw() as u64);
        Ok(())
    }

    /// checkcast / instanceof / multianewarray share the shape: resolve the
    /// named class, stash its id in the operand.
    fn resolve_class_operand(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        insn: &PreparedInsn,
        quick: POp,
    ) -> Result<(), JvmError> {
        let method_id = thread.stack.cur_java_frame()?.method_id();
        let class_sym = {
            let ma = vm.method_area_read();
            ma.get_cp_by_method_id(&method_id)?.get_class_sym(insn.imm as u16)?
        };
        let class_id = vm.method_area_write().get_class_id_or_load(class_sym)?;
        insn.quicken(quick, class_id.into_raw() as u64);
        Ok(())
    }

    fn alloc_multi_array(
        thread: &mut JavaThreadState,
        vm: &VirtualMachine,
        class_id: ClassId,
        counts: &[i32],
    ) -> Result<HeapRef, JvmError> {
        let (count, rest) = counts
            .split_first()
            .ok_or_else(|| build_exception!(InternalError, "multianewarray without counts"))?;
        if *count < 0 {
            return throw_exception!(NegativeArraySizeException, "{}", count);
        }
        let (element_class, primitive_element) = {
            let ma = vm.method_area_read();
            match ma.get_class(&class_id) {
                JvmClass::InstanceArray(array) => (Some(array.element_class_id), None),
                JvmClass::PrimitiveArray(array) => (None, Some(array.element_type)),
                other => {
                    return Err(JvmError::IllegalInternalState(format!(
                        "multianewarray on {}",
                        other
                    )));
                }
            }
        };
        let _ = primitive_element;
        let array = vm.alloc_object_array_or_primitive(thread, class_id, *count)?;
        if rest.is_empty() {
            return Ok(array);
        }
        let element_class = element_class.ok_or_else(|| {
            build_exception!(ClassFormatError, "primitive array with remaining dimensions")
        })?;
        // The outer array must survive the nested allocations.
        thread.handle.push_local_ref(array);
        let result = (|| -> Result<(), JvmError> {
            for index in 0..*count {
                let inner = Self::alloc_multi_array(thread, vm, element_class, rest)?;
                vm.heap_write()
                    .write_array_element(array, index, Value::Ref(inner))?;
            }
            Ok(())
        })();
        let array = thread.handle.pop_local_ref().unwrap_or(array);
        result?;
        Ok(array)
    }

    // ---- invoke machinery ----

    fn pop_args(thread: &mut JavaThreadState, count: usize) -> Result<Args, JvmError> {
        let mut args = Args::with_capacity(count);
        for _ in 0..count {
            args.push(thread.stack.pop_operand()?);
        }
        args.reverse();
        Ok(args)
    }

    fn prepare_method_args(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        vm: &VirtualMachine,
    ) -> Result<Args, JvmError> {
        let count = {
            let ma = vm.method_area_read();
            let method = ma.get_method(&method_id);
            ma.get_method_descriptor(&method.descriptor_id()).params.len()
                + usize::from(!method.is_static())
        };
        Self::pop_args(thread, count)
    }

    fn invoke_native_method(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        args: Args,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, JvmError> {
        let mut key = vm
            .method_area_read()
            .build_fully_qualified_native_method_key(&method_id);
        // Object.clone on an array dispatches through the class-agnostic
        // entry.
        if key.name == vm.br.clone_sym
            && key.desc == vm.br.clone_desc
            && !args.is_empty()
            && matches!(args[0], Value::Ref(obj) if vm.heap_read().is_array(obj).unwrap_or(false))
        {
            key.class = None;
        }
        // Built-in table first; a miss falls back to lazy resolution
        // through the dynamic-loader collaborator.
        let native = match vm
            .native_registry
            .get(&key)
            .or_else(|| vm.resolve_dynamic_native(&key))
        {
            Some(native) => native,
            None => {
                return throw_exception!(
                    UnsatisfiedLinkError,
                    "{}",
                    vm.pretty_method_name(&method_id)
                );
            }
        };
        thread
            .stack
            .push_frame(FrameType::NativeFrame(NativeFrame::new(method_id)))?;
        let result = native(vm, thread, args.as_slice());
        thread.stack.pop_native_frame()?;
        result
    }

    fn invoke_java_method(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        args: Args,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, JvmError> {
        let (max_stack, max_locals) = vm
            .method_area_read()
            .get_method(&method_id)
            .get_frame_attributes()?;
        let frame = JavaFrame::new(method_id, max_stack, max_locals, args.into_vec());
        thread.stack.push_frame(FrameType::JavaFrame(frame))?;
        let result = Self::interpret_method(thread, method_id, vm);
        match &result {
            // The unwinder already popped the frame for thrown exceptions.
            Err(JvmError::JavaExceptionThrown(_)) => {}
            _ => thread.stack.pop_java_frame()?,
        }
        result
    }

    /// Central invoke: dispatches on body kind and honors ACC_SYNCHRONIZED
    /// by bracketing the call with the receiver's (or class mirror's)
    /// monitor.
    pub fn invoke_method_core(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        args: Args,
        vm: &VirtualMachine,
    ) -> Result<Option<Value>, JvmError> {
        let (is_native, is_abstract, is_sync, is_static, class_id) = {
            let ma = vm.method_area_read();
            let method = ma.get_method(&method_id);
            (
                method.is_native(),
                method.is_abstract(),
                method.is_synchronized(),
                method.is_static(),
                method.class_id(),
            )
        };
        if is_abstract {
            return throw_exception!(
                AbstractMethodError,
                "{}",
                vm.pretty_method_name(&method_id)
            );
        }

        let lock_target = if is_sync {
            Some(if is_static {
                vm.mirror_for(thread, class_id)?
            } else {
                args_receiver(&args)?
            })
        } else {
            None
        };
        if let Some(obj) = lock_target {
            vm.lock_object(thread, obj);
        }

        let result = if is_native {
            Self::invoke_native_method(thread, method_id, args, vm)
        } else {
            Self::invoke_java_method(thread, method_id, args, vm)
        };

        if let Some(obj) = lock_target {
            // Forwarded if a collection moved it while we ran.
            let unlocked = vm.unlock_object(thread, obj);
            if result.is_ok() {
                unlocked?;
            }
        }
        result
    }

    fn invoke_method_internal(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        args: Args,
        vm: &VirtualMachine,
    ) -> Result<(), JvmError> {
        if let Some(result) = Self::invoke_method_core(thread, method_id, args, vm)? {
            thread.stack.push_operand(result)?;
        }
        Ok(())
    }

    /// Entry point used by the VM bootstrap and natives.
    pub fn invoke_static_method(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        vm: &VirtualMachine,
        args: Vec<Value>,
    ) -> Result<Option<Value>, JvmError> {
        let class_id = vm.method_area_read().get_method(&method_id).class_id();
        Self::ensure_initialized(thread, Some(class_id), vm)?;
        Self::invoke_method_core(thread, method_id, Args::from_vec(args), vm)
    }

    pub fn invoke_instance_method(
        thread: &mut JavaThreadState,
        method_id: MethodId,
        vm: &VirtualMachine,
        args: Vec<Value>,
    ) -> Result<Option<Value>, JvmError> {
        Self::invoke_method_core(thread, method_id, Args::from_vec(args), vm)
    }

    /// Virtual dispatch from native code: resolve on the receiver's class.
    pub fn invoke_virtual_by_key(
        thread: &mut JavaThreadState,
        key: &MethodKey,
        vm: &VirtualMachine,
        args: Vec<Value>,
    ) -> Result<Option<Value>, JvmError> {
        let receiver = args
            .first()
            .ok_or_else(|| build_exception!(InternalError, "virtual call without receiver"))?
            .as_obj_ref()?;
        let receiver_class = vm.heap_read().get_class_id(receiver)?;
        let method_id = {
            let ma = vm.method_area_read();
            ma.find_method(receiver_class, key)?
        };
        Self::invoke_method_core(thread, method_id, Args::from_vec(args), vm)
    }

    // ---- exception unwinding ----

    fn find_exception_handler(
        vm: &VirtualMachine,
        prepared: &PreparedCode,
        method_id: MethodId,
        throwable: HeapRef,
        thread: &mut JavaThreadState,
    ) -> Result<bool, JvmError> {
        // The throwable is a root while handler search may load classes.
        thread.handle.set_pending_exception(throwable);
        let pc = thread.stack.pc()? as u32;

        for entry in &prepared.exception_table {
            if pc < entry.start || pc >= entry.end {
                continue;
            }
            let matched = if entry.catch_type == 0 {
                true
            } else {
                let catch_sym = {
                    let ma = vm.method_area_read();
                    ma.get_cp_by_method_id(&method_id)?
                        .get_class_sym(entry.catch_type)?
                };
                // Resolving the catch class may load it.
                let catch_class = vm.method_area_write().get_class_id_or_load(catch_sym)?;
                let throwable_class = vm
                    .heap_read()
                    .get_class_id(thread.handle.pending_exception().unwrap_or(throwable))?;
                vm.method_area_read()
                    .is_subclass_of(throwable_class, catch_class)
            };
            if matched {
                // Handler found: the red zone, if armed, is retired.
                let throwable = thread.handle.pending_exception().unwrap_or(throwable);
                thread.handle.clear_pending_exception();
                thread.stack.disarm_red_zone();
                let frame = thread.stack.cur_java_frame_mut()?;
                frame.reset_for_handler(throwable);
                frame.pc = entry.handler as usize;
                return Ok(true);
            }
        }
        thread.handle.clear_pending_exception();
        Ok(false)
    }

    // ---- class initialization ----

    /// The §5.5-shaped protocol: one initializer per class, recursive
    /// re-entry returns immediately, other threads wait for the outcome,
    /// and a failed class stays failed.
    pub fn ensure_initialized(
        thread: &mut JavaThreadState,
        class_id: Option<ClassId>,
        vm: &VirtualMachine,
    ) -> Result<(), JvmError> {
        let Some(class_id) = class_id else {
            return Ok(());
        };

        loop {
            let snapshot = {
                let ma = vm.method_area_read();
                ma.get_class_like(&class_id)
                    .ok()
                    .map(|c| (c.state(), c.initializing_thread()))
            };
            // Arrays and primitives have nothing to initialize.
            let Some((state, init_thread)) = snapshot else {
                return Ok(());
            };

            match state {
                ClassState::Initialized => return Ok(()),
                ClassState::Failed => {
                    let name = vm.method_area_read().get_class(&class_id).get_name();
                    return throw_exception!(NoClassDefFoundError, class_sym: name);
                }
                ClassState::Initializing => {
                    if init_thread == Some(thread.id) {
                        // Recursive entry from our own <clinit>.
                        return Ok(());
                    }
                    let guard = vm.class_init_lock().lock().unwrap();
                    let still_initializing = {
                        let ma = vm.method_area_read();
                        ma.get_class_like(&class_id)
                            .is_ok_and(|c| c.state() == ClassState::Initializing)
                    };
                    if still_initializing {
                        let _region = BlockedRegion::enter_as(
                            vm.threads(),
                            &thread.handle,
                            ThreadState::Waiting,
                        );
                        let _ = vm
                            .class_init_cond()
                            .wait_timeout(guard, std::time::Duration::from_millis(50))
                            .unwrap();
                    }
                }
                ClassState::Loaded | ClassState::Linked => {
                    let _guard = vm.class_init_lock().lock().unwrap();
                    let ma = vm.method_area_read();
                    let class = ma.get_class_like(&class_id)?;
                    if matches!(class.state(), ClassState::Loaded | ClassState::Linked) {
                        class.begin_initializing(thread.id);
                        drop(ma);
                        break;
                    }
                }
            }
        }

        let result = Self::run_initialization(thread, class_id, vm);
        {
            let _guard = vm.class_init_lock().lock().unwrap();
            let ma = vm.method_area_read();
            let class = ma.get_class_like(&class_id)?;
            match &result {
                Ok(()) => class.set_initialized(),
                Err(_) => class.set_failed(),
            }
        }
        vm.class_init_cond().notify_all();

        result.map_err(|e| Self::wrap_initializer_failure(vm, class_id, e))
    }

    fn run_initialization(
        thread: &mut JavaThreadState,
        class_id: ClassId,
        vm: &VirtualMachine,
    ) -> Result<(), JvmError> {
        let (is_interface, super_id, interfaces) = {
            let ma = vm.method_area_read();
            let class = ma.get_class(&class_id);
            (
                class.is_interface(),
                class.get_super_id(),
                class
                    .get_interfaces_opt()
                    .map(|set| set.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default(),
            )
        };

        // Superclass first; interfaces do not initialize their supers.
        if !is_interface {
            if let Some(super_id) = super_id {
                Self::ensure_initialized(thread, Some(super_id), vm)?;
            }
            for interface_id in interfaces {
                let needs_init = vm
                    .method_area_read()
                    .get_interface_class(&interface_id)
                    .is_ok_and(|i| i.has_clinit());
                if needs_init {
                    Self::ensure_initialized(thread, Some(interface_id), vm)?;
                }
            }
        }

        Self::apply_constant_statics(thread, class_id, vm)?;

        let clinit = {
            let ma = vm.method_area_read();
            ma.get_class_like(&class_id)?.get_clinit_method_id().copied()
        };
        if let Some(clinit_id) = clinit {
            Self::invoke_method_core(thread, clinit_id, Args::new(), vm)?;
        }
        Ok(())
    }

    /// Constant-final statics receive their class-file literals before
    /// `<clinit>` runs.
    fn apply_constant_statics(
        thread: &mut JavaThreadState,
        class_id: ClassId,
        vm: &VirtualMachine,
    ) -> Result<(), JvmError> {
        let constants: Vec<(usize, u16)> = {
            let ma = vm.method_area_read();
            match ma.get_class(&class_id) {
                JvmClass::Instance(instance) => instance.constant_statics().to_vec(),
                _ => Vec::new(),
            }
        };
        for (slot, cp_index) in constants {
            enum Literal {
                Plain(Value),
                Str(crate::Symbol),
            }
            let literal = {
                let ma = vm.method_area_read();
                let cp = ma.get_cp(&class_id)?;
                match cp.get(cp_index)? {
                    RuntimeConstant::Integer(v) => Literal::Plain(Value::Integer(*v)),
                    RuntimeConstant::Float(v) => Literal::Plain(Value::Float(*v)),
                    RuntimeConstant::Long(v) => Literal::Plain(Value::Long(*v)),
                    RuntimeConstant::Double(v) => Literal::Plain(Value::Double(*v)),
                    RuntimeConstant::String(sym) => Literal::Str(*sym),
                    other => {
                        return Err(build_exception!(
                            ClassFormatError,
                            "ConstantValue of type {}",
                            other.get_type()
                        ));
                    }
                }
            };
            let value = match literal {
                Literal::Plain(v) => v,
                Literal::Str(sym) => Value::Ref(vm.intern_string(thread, sym)?),
            };
            let ma = vm.method_area_read();
            *ma.get_class_like(&class_id)?
                .static_field_by_slot(slot)?
                .value
                .write()
                .unwrap() = value;
        }
        Ok(())
    }

    fn wrap_initializer_failure(
        vm: &VirtualMachine,
        class_id: ClassId,
        error: JvmError,
    ) -> JvmError {
        match error {
            JvmError::JavaException(desc) if !desc.kind.is_error() => {
                let name = vm.method_area_read().get_class(&class_id).get_name();
                JvmError::JavaException(
                    crate::error::JavaExceptionFromJvm::with_class_name(
                        JavaExceptionKind::ExceptionInInitializerError,
                        name,
                    )
                    .caused_by(desc),
                )
            }
            JvmError::JavaExceptionThrown(obj) => {
                let is_error = (|| -> Result<bool, JvmError> {
                    let class = vm.heap_read().get_class_id(obj)?;
                    Ok(vm
                        .method_area_read()
                        .instance_of(class, vm.br.java_lang_error_sym))
                })()
                .unwrap_or(false);
                if is_error {
                    JvmError::JavaExceptionThrown(obj)
                } else {
                    let name = vm.method_area_read().get_class(&class_id).get_name();
                    warn!("<clinit> escaped with a non-Error throwable");
                    JvmError::JavaException(crate::error::JavaExceptionFromJvm::with_class_name(
                        JavaExceptionKind::ExceptionInInitializerError,
                        name,
                    ))
                }
            }
            other => other,
        }
    }
}

#[inline]
fn branch(
    taken: bool,
    target: u32,
    next: usize,
) -> Result<ControlFlow<Option<Value>, usize>, JvmError> {
    Ok(ControlFlow::Continue(if taken { target as usize } else { next }))
}

fn class_id_from(operand: u64) -> Result<ClassId, JvmError> {
    ClassId::from_raw(operand as u32)
        .ok_or_else(|| build_exception!(InternalError, "corrupt class operand"))
}

fn method_id_from(operand: u64) -> Result<MethodId, JvmError> {
    MethodId::from_raw(operand as u32)
        .ok_or_else(|| build_exception!(InternalError, "corrupt method operand"))
}

fn args_receiver(args: &[Value]) -> Result<HeapRef, JvmError> {
    args.first()
        .ok_or_else(|| build_exception!(InternalError, "instance call without receiver"))?
        .as_obj_ref()
}

fn alloc_kind_from(raw: u32) -> Result<bonsai_classfile::descriptor::AllocationType, JvmError> {
    bonsai_classfile::descriptor::AllocationType::try_from(raw as u8)
        .map_err(|_| build_exception!(InternalError, "corrupt field kind operand"))
}
