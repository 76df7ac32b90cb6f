use num_enum::TryFromPrimitive;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Prepared-instruction operations. The first section mirrors the class
/// file opcodes one-to-one (collapsed where the operands already encode the
/// difference, e.g. `iload_0` is `Iload` with `imm = 0`); the `*Quick`
/// section holds the rewritten forms installed after resolution. None of
/// the quick forms is observable outside the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum POp {
    Nop = 0,
    AconstNull,
    IconstImm,
    LconstImm,
    FconstImm,
    DconstImm,
    Bipush,
    Sipush,
    Ldc,
    Ldc2,
    Iload,
    Lload,
    Fload,
    Dload,
    Aload,
    Iaload,
    Laload,
    Faload,
    Daload,
    Aaload,
    Baload,
    Caload,
    Saload,
    Istore,
    Lstore,
    Fstore,
    Dstore,
    Astore,
    Iastore,
    Lastore,
    Fastore,
    Dastore,
    Aastore,
    Bastore,
    Castore,
    Sastore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Iadd,
    Ladd,
    Fadd,
    Dadd,
    Isub,
    Lsub,
    Fsub,
    Dsub,
    Imul,
    Lmul,
    Fmul,
    Dmul,
    Idiv,
    Ldiv,
    Fdiv,
    Ddiv,
    Irem,
    Lrem,
    Frem,
    Drem,
    Ineg,
    Lneg,
    Fneg,
    Dneg,
    Ishl,
    Lshl,
    Ishr,
    Lshr,
    Iushr,
    Lushr,
    Iand,
    Land,
    Ior,
    Lor,
    Ixor,
    Lxor,
    Iinc,
    I2l,
    I2f,
    I2d,
    L2i,
    L2f,
    L2d,
    F2i,
    F2l,
    F2d,
    D2i,
    D2l,
    D2f,
    I2b,
    I2c,
    I2s,
    Lcmp,
    Fcmpl,
    Fcmpg,
    Dcmpl,
    Dcmpg,
    Ifeq,
    Ifne,
    Iflt,
    Ifge,
    Ifgt,
    Ifle,
    IfIcmpeq,
    IfIcmpne,
    IfIcmplt,
    IfIcmpge,
    IfIcmpgt,
    IfIcmple,
    IfAcmpeq,
    IfAcmpne,
    Goto,
    Jsr,
    Ret,
    Tableswitch,
    Lookupswitch,
    Ireturn,
    Lreturn,
    Freturn,
    Dreturn,
    Areturn,
    Return,
    Getstatic,
    Putstatic,
    Getfield,
    Putfield,
    Invokevirtual,
    Invokespecial,
    Invokestatic,
    Invokeinterface,
    New,
    Newarray,
    Anewarray,
    Arraylength,
    Athrow,
    Checkcast,
    Instanceof,
    Monitorenter,
    Monitorexit,
    Multianewarray,
    Ifnull,
    Ifnonnull,

    // Quickened forms.
    GetstaticQuick,
    PutstaticQuick,
    GetfieldQuick,
    PutfieldQuick,
    InvokevirtualQuick,
    InvokespecialQuick,
    InvokestaticQuick,
    InvokeinterfaceQuick,
    LdcIntQuick,
    LdcFloatQuick,
    LdcStringQuick,
    LdcClassQuick,
    NewQuick,
    AnewarrayQuick,
    CheckcastQuick,
    InstanceofQuick,
    MultianewarrayQuick,

    /// Rewrite sentinel: a concurrent executor that observes it must
    /// redispatch.
    Locked = 255,
}

/// One fixed-size instruction record. `imm`/`imm2`/`bci` are immutable
/// after preparation; `op` and `operand` change exactly once, when the
/// instruction quickens.
pub struct PreparedInsn {
    op: AtomicU8,
    /// Constant pool index, local slot, branch target (instruction index),
    /// switch-table index or immediate value.
    pub imm: u32,
    /// Secondary immediate: `iinc` delta, `multianewarray` dimension count.
    pub imm2: i32,
    /// Offset of the instruction in the original bytecode, for line-number
    /// mapping.
    pub bci: u32,
    operand: AtomicU64,
}

impl PreparedInsn {
    pub fn new(op: POp, imm: u32, imm2: i32, bci: u32) -> Self {
        Self {
            op: AtomicU8::new(op as u8),
            imm,
            imm2,
            bci,
            operand: AtomicU64::new(0),
        }
    }

    /// Current operation; spins through the `Locked` window of a
    /// concurrent rewrite.
    #[inline]
    pub fn op(&self) -> POp {
        loop {
            let raw = self.op.load(Ordering::Acquire);
            if raw != POp::Locked as u8 {
                // The set is closed: every value ever stored is a POp.
                return POp::try_from(raw).expect("corrupt prepared instruction");
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn operand(&self) -> u64 {
        self.operand.load(Ordering::Acquire)
    }

    /// The rewrite discipline: park the handler on the `Locked` sentinel,
    /// publish the operand, then install the quick handler. The paired
    /// acquire loads in [`PreparedInsn::op`] and [`PreparedInsn::operand`]
    /// ensure an executor that sees the quick handler sees its operand.
    pub fn quicken(&self, op: POp, operand: u64) {
        self.op.store(POp::Locked as u8, Ordering::Release);
        self.operand.store(operand, Ordering::Release);
        self.op.store(op as u8, Ordering::Release);
    }

    /// Racy one-entry cache update for `invokeinterface`; last writer wins.
    pub fn update_cache(&self, operand: u64) {
        self.operand.store(operand, Ordering::Release);
    }
}

pub fn pack_pair(high: u32, low: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

pub fn unpack_pair(operand: u64) -> (u32, u32) {
    ((operand >> 32) as u32, operand as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quickening_installs_op_and_operand() {
        let insn = PreparedInsn::new(POp::Getfield, 7, 0, 0);
        assert_eq!(insn.op(), POp::Getfield);
        insn.quicken(POp::GetfieldQuick, pack_pair(24, 8));
        assert_eq!(insn.op(), POp::GetfieldQuick);
        assert_eq!(unpack_pair(insn.operand()), (24, 8));
        // The original immediate is untouched.
        assert_eq!(insn.imm, 7);
    }
}
