use crate::build_exception;
use crate::error::JvmError;
use crate::interpreter::quick::{POp, PreparedInsn};
use crate::rt::method::CodeBody;
use bonsai_classfile::opcode::Opcode;

/// Variable-length switch payloads live out of line; the instruction's
/// `imm` indexes into the prepared code's switch table.
pub enum SwitchData {
    Table {
        low: i32,
        default: u32,
        targets: Vec<u32>,
    },
    Lookup {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

impl SwitchData {
    pub fn target_for(&self, key: i32) -> u32 {
        match self {
            SwitchData::Table { low, default, targets } => {
                let index = key as i64 - *low as i64;
                if index < 0 || index >= targets.len() as i64 {
                    *default
                } else {
                    targets[index as usize]
                }
            }
            SwitchData::Lookup { default, pairs } => pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map_or(*default, |(_, target)| *target),
        }
    }
}

/// Exception ranges remapped from byte offsets to instruction indexes.
pub struct PreparedCatch {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub catch_type: u16,
}

pub struct PreparedCode {
    pub insns: Vec<PreparedInsn>,
    pub switches: Vec<SwitchData>,
    pub exception_table: Vec<PreparedCatch>,
}

struct Decoded {
    op: POp,
    imm: u32,
    imm2: i32,
    bci: u32,
    /// Branch targets decode as byte offsets first; the fixup pass turns
    /// them into instruction indexes.
    needs_target_fixup: bool,
}

struct ByteReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn u8(&mut self) -> Result<u8, JvmError> {
        let b = *self
            .code
            .get(self.pos)
            .ok_or_else(|| build_exception!(ClassFormatError, "truncated bytecode"))?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, JvmError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, JvmError> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn i16(&mut self) -> Result<i16, JvmError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, JvmError> {
        Ok(((self.u16()? as u32) << 16 | self.u16()? as u32) as i32)
    }

    fn align4(&mut self) {
        while self.pos % 4 != 0 {
            self.pos += 1;
        }
    }
}

/// Translates bytecode into the fixed-size instruction records the
/// dispatch loop runs. One pass decodes; a second pass resolves branch
/// targets from byte offsets to instruction indexes. Idempotent per
/// method: callers go through the prepare lock.
pub fn prepare(body: &CodeBody) -> Result<PreparedCode, JvmError> {
    let code = &body.code;
    let mut reader = ByteReader { code, pos: 0 };
    let mut decoded: Vec<Decoded> = Vec::with_capacity(code.len() / 2);
    let mut switches: Vec<SwitchData> = Vec::new();
    // Maps byte offset to instruction index; u32::MAX marks operand bytes.
    let mut index_of_bci = vec![u32::MAX; code.len() + 1];

    while reader.pos < code.len() {
        let bci = reader.pos as u32;
        index_of_bci[reader.pos] = decoded.len() as u32;
        let raw = reader.u8()?;
        let opcode = Opcode::try_from(raw)
            .map_err(|_| build_exception!(ClassFormatError, "unknown opcode 0x{:02x}", raw))?;

        let mut push = |op: POp, imm: u32, imm2: i32, fixup: bool| {
            decoded.push(Decoded {
                op,
                imm,
                imm2,
                bci,
                needs_target_fixup: fixup,
            })
        };

        use Opcode::*;
        match opcode {
            Nop => push(POp::Nop, 0, 0, false),
            AconstNull => push(POp::AconstNull, 0, 0, false),
            IconstM1 => push(POp::IconstImm, 0, -1, false),
            Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
                push(POp::IconstImm, 0, raw as i32 - Iconst0 as i32, false)
            }
            Lconst0 | Lconst1 => push(POp::LconstImm, 0, raw as i32 - Lconst0 as i32, false),
            Fconst0 | Fconst1 | Fconst2 => {
                push(POp::FconstImm, 0, raw as i32 - Fconst0 as i32, false)
            }
            Dconst0 | Dconst1 => push(POp::DconstImm, 0, raw as i32 - Dconst0 as i32, false),
            Bipush => {
                let value = reader.i8()? as i32;
                push(POp::Bipush, 0, value, false);
            }
            Sipush => {
                let value = reader.i16()? as i32;
                push(POp::Sipush, 0, value, false);
            }
            Ldc => {
                let index = reader.u8()? as u32;
                push(POp::Ldc, index, 0, false);
            }
            LdcW => {
                let index = reader.u16()? as u32;
                push(POp::Ldc, index, 0, false);
            }
            Ldc2W => {
                let index = reader.u16()? as u32;
                push(POp::Ldc2, index, 0, false);
            }
            Iload => {
                let slot = reader.u8()? as u32;
                push(POp::Iload, slot, 0, false);
            }
            Lload => {
                let slot = reader.u8()? as u32;
                push(POp::Lload, slot, 0, false);
            }
            Fload => {
                let slot = reader.u8()? as u32;
                push(POp::Fload, slot, 0, false);
            }
            Dload => {
                let slot = reader.u8()? as u32;
                push(POp::Dload, slot, 0, false);
            }
            Aload => {
                let slot = reader.u8()? as u32;
                push(POp::Aload, slot, 0, false);
            }
            Iload0 | Iload1 | Iload2 | Iload3 => {
                push(POp::Iload, raw as u32 - Iload0 as u32, 0, false)
            }
            Lload0 | Lload1 | Lload2 | Lload3 => {
                push(POp::Lload, raw as u32 - Lload0 as u32, 0, false)
            }
            Fload0 | Fload1 | Fload2 | Fload3 => {
                push(POp::Fload, raw as u32 - Fload0 as u32, 0, false)
            }
            Dload0 | Dload1 | Dload2 | Dload3 => {
                push(POp::Dload, raw as u32 - Dload0 as u32, 0, false)
            }
            Aload0 | Aload1 | Aload2 | Aload3 => {
                push(POp::Aload, raw as u32 - Aload0 as u32, 0, false)
            }
            Iaload => push(POp::Iaload, 0, 0, false),
            Laload => push(POp::Laload, 0, 0, false),
            Faload => push(POp::Faload, 0, 0, false),
            Daload => push(POp::Daload, 0, 0, false),
            Aaload => push(POp::Aaload, 0, 0, false),
            Baload => push(POp::Baload, 0, 0, false),
            Caload => push(POp::Caload, 0, 0, false),
            Saload => push(POp::Saload, 0, 0, false),
            Istore => {
                let slot = reader.u8()? as u32;
                push(POp::Istore, slot, 0, false);
            }
            Lstore => {
                let slot = reader.u8()? as u32;
                push(POp::Lstore, slot, 0, false);
            }
            Fstore => {
                let slot = reader.u8()? as u32;
                push(POp::Fstore, slot, 0, false);
            }
            Dstore => {
                let slot = reader.u8()? as u32;
                push(POp::Dstore, slot, 0, false);
            }
            Astore => {
                let slot = reader.u8()? as u32;
                push(POp::Astore, slot, 0, false);
            }
            Istore0 | Istore1 | Istore2 | Istore3 => {
                push(POp::Istore, raw as u32 - Istore0 as u32, 0, false)
            }
            Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
                push(POp::Lstore, raw as u32 - Lstore0 as u32, 0, false)
            }
            Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
                push(POp::Fstore, raw as u32 - Fstore0 as u32, 0, false)
            }
            Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
                push(POp::Dstore, raw as u32 - Dstore0 as u32, 0, false)
            }
            Astore0 | Astore1 | Astore2 | Astore3 => {
                push(POp::Astore, raw as u32 - Astore0 as u32, 0, false)
            }
            Iastore => push(POp::Iastore, 0, 0, false),
            Lastore => push(POp::Lastore, 0, 0, false),
            Fastore => push(POp::Fastore, 0, 0, false),
            Dastore => push(POp::Dastore, 0, 0, false),
            Aastore => push(POp::Aastore, 0, 0, false),
            Bastore => push(POp::Bastore, 0, 0, false),
            Castore => push(POp::Castore, 0, 0, false),
            Sastore => push(POp::Sastore, 0, 0, false),
            Pop => push(POp::Pop, 0, 0, false),
            Pop2 => push(POp::Pop2, 0, 0, false),
            Dup => push(POp::Dup, 0, 0, false),
            DupX1 => push(POp::DupX1, 0, 0, false),
            DupX2 => push(POp::DupX2, 0, 0, false),
            Dup2 => push(POp::Dup2, 0, 0, false),
            Dup2X1 => push(POp::Dup2X1, 0, 0, false),
            Dup2X2 => push(POp::Dup2X2, 0, 0, false),
            Swap => push(POp::Swap, 0, 0, false),
            Iadd => push(POp::Iadd, 0, 0, false),
            Ladd => push(POp::Ladd, 0, 0, false),
            Fadd => push(POp::Fadd, 0, 0, false),
            Dadd => push(POp::Dadd, 0, 0, false),
            Isub => push(POp::Isub, 0, 0, false),
            Lsub => push(POp::Lsub, 0, 0, false),
            Fsub => push(POp::Fsub, 0, 0, false),
            Dsub => push(POp::Dsub, 0, 0, false),
            Imul => push(POp::Imul, 0, 0, false),
            Lmul => push(POp::Lmul, 0, 0, false),
            Fmul => push(POp::Fmul, 0, 0, false),
            Dmul => push(POp::Dmul, 0, 0, false),
            Idiv => push(POp::Idiv, 0, 0, false),
            Ldiv => push(POp::Ldiv, 0, 0, false),
            Fdiv => push(POp::Fdiv, 0, 0, false),
            Ddiv => push(POp::Ddiv, 0, 0, false),
            Irem => push(POp::Irem, 0, 0, false),
            Lrem => push(POp::Lrem, 0, 0, false),
            Frem => push(POp::Frem, 0, 0, false),
            Drem => push(POp::Drem, 0, 0, false),
            Ineg => push(POp::Ineg, 0, 0, false),
            Lneg => push(POp::Lneg, 0, 0, false),
            Fneg => push(POp::Fneg, 0, 0, false),
            Dneg => push(POp::Dneg, 0, 0, false),
            Ishl => push(POp::Ishl, 0, 0, false),
            Lshl => push(POp::Lshl, 0, 0, false),
            Ishr => push(POp::Ishr, 0, 0, false),
            Lshr => push(POp::Lshr, 0, 0, false),
            Iushr => push(POp::Iushr, 0, 0, false),
            Lushr => push(POp::Lushr, 0, 0, false),
            Iand => push(POp::Iand, 0, 0, false),
            Land => push(POp::Land, 0, 0, false),
            Ior => push(POp::Ior, 0, 0, false),
            Lor => push(POp::Lor, 0, 0, false),
            Ixor => push(POp::Ixor, 0, 0, false),
            Lxor => push(POp::Lxor, 0, 0, false),
            Iinc => {
                let slot = reader.u8()? as u32;
                let delta = reader.i8()? as i32;
                push(POp::Iinc, slot, delta, false);
            }
            I2l => push(POp::I2l, 0, 0, false),
            I2f => push(POp::I2f, 0, 0, false),
            I2d => push(POp::I2d, 0, 0, false),
            L2i => push(POp::L2i, 0, 0, false),
            L2f => push(POp::L2f, 0, 0, false),
            L2d => push(POp::L2d, 0, 0, false),
            F2i => push(POp::F2i, 0, 0, false),
            F2l => push(POp::F2l, 0, 0, false),
            F2d => push(POp::F2d, 0, 0, false),
            D2i => push(POp::D2i, 0, 0, false),
            D2l => push(POp::D2l, 0, 0, false),
            D2f => push(POp::D2f, 0, 0, false),
            I2b => push(POp::I2b, 0, 0, false),
            I2c => push(POp::I2c, 0, 0, false),
            I2s => push(POp::I2s, 0, 0, false),
            Lcmp => push(POp::Lcmp, 0, 0, false),
            Fcmpl => push(POp::Fcmpl, 0, 0, false),
            Fcmpg => push(POp::Fcmpg, 0, 0, false),
            Dcmpl => push(POp::Dcmpl, 0, 0, false),
            Dcmpg => push(POp::Dcmpg, 0, 0, false),
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle | IfIcmpeq | IfIcmpne | IfIcmplt
            | IfIcmpge | IfIcmpgt | IfIcmple | IfAcmpeq | IfAcmpne | Ifnull | Ifnonnull => {
                let offset = reader.i16()? as i32;
                let target = (bci as i64 + offset as i64) as u32;
                let op = match opcode {
                    Ifeq => POp::Ifeq,
                    Ifne => POp::Ifne,
                    Iflt => POp::Iflt,
                    Ifge => POp::Ifge,
                    Ifgt => POp::Ifgt,
                    Ifle => POp::Ifle,
                    IfIcmpeq => POp::IfIcmpeq,
                    IfIcmpne => POp::IfIcmpne,
                    IfIcmplt => POp::IfIcmplt,
                    IfIcmpge => POp::IfIcmpge,
                    IfIcmpgt => POp::IfIcmpgt,
                    IfIcmple => POp::IfIcmple,
                    IfAcmpeq => POp::IfAcmpeq,
                    IfAcmpne => POp::IfAcmpne,
                    Ifnull => POp::Ifnull,
                    _ => POp::Ifnonnull,
                };
                push(op, target, 0, true);
            }
            Goto => {
                let offset = reader.i16()? as i32;
                push(POp::Goto, (bci as i64 + offset as i64) as u32, 0, true);
            }
            GotoW => {
                let offset = reader.i32()?;
                push(POp::Goto, (bci as i64 + offset as i64) as u32, 0, true);
            }
            Jsr => {
                let offset = reader.i16()? as i32;
                push(POp::Jsr, (bci as i64 + offset as i64) as u32, 0, true);
            }
            JsrW => {
                let offset = reader.i32()?;
                push(POp::Jsr, (bci as i64 + offset as i64) as u32, 0, true);
            }
            Ret => {
                let slot = reader.u8()? as u32;
                push(POp::Ret, slot, 0, false);
            }
            Tableswitch => {
                reader.align4();
                let default = (bci as i64 + reader.i32()? as i64) as u32;
                let low = reader.i32()?;
                let high = reader.i32()?;
                if high < low {
                    return Err(build_exception!(ClassFormatError, "tableswitch high < low"));
                }
                let mut targets = Vec::with_capacity((high - low + 1) as usize);
                for _ in low..=high {
                    targets.push((bci as i64 + reader.i32()? as i64) as u32);
                }
                push(POp::Tableswitch, switches.len() as u32, 0, false);
                switches.push(SwitchData::Table { low, default, targets });
            }
            Lookupswitch => {
                reader.align4();
                let default = (bci as i64 + reader.i32()? as i64) as u32;
                let npairs = reader.i32()?;
                if npairs < 0 {
                    return Err(build_exception!(ClassFormatError, "negative npairs"));
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = reader.i32()?;
                    let target = (bci as i64 + reader.i32()? as i64) as u32;
                    pairs.push((key, target));
                }
                push(POp::Lookupswitch, switches.len() as u32, 0, false);
                switches.push(SwitchData::Lookup { default, pairs });
            }
            Ireturn => push(POp::Ireturn, 0, 0, false),
            Lreturn => push(POp::Lreturn, 0, 0, false),
            Freturn => push(POp::Freturn, 0, 0, false),
            Dreturn => push(POp::Dreturn, 0, 0, false),
            Areturn => push(POp::Areturn, 0, 0, false),
            Return => push(POp::Return, 0, 0, false),
            Getstatic => {
                let index = reader.u16()? as u32;
                push(POp::Getstatic, index, 0, false);
            }
            Putstatic => {
                let index = reader.u16()? as u32;
                push(POp::Putstatic, index, 0, false);
            }
            Getfield => {
                let index = reader.u16()? as u32;
                push(POp::Getfield, index, 0, false);
            }
            Putfield => {
                let index = reader.u16()? as u32;
                push(POp::Putfield, index, 0, false);
            }
            Invokevirtual => {
                let index = reader.u16()? as u32;
                push(POp::Invokevirtual, index, 0, false);
            }
            Invokespecial => {
                let index = reader.u16()? as u32;
                push(POp::Invokespecial, index, 0, false);
            }
            Invokestatic => {
                let index = reader.u16()? as u32;
                push(POp::Invokestatic, index, 0, false);
            }
            Invokeinterface => {
                let index = reader.u16()? as u32;
                let count = reader.u8()? as i32;
                let zero = reader.u8()?;
                if zero != 0 {
                    return Err(build_exception!(
                        ClassFormatError,
                        "invokeinterface fourth byte must be zero"
                    ));
                }
                push(POp::Invokeinterface, index, count, false);
            }
            Invokedynamic => {
                return Err(build_exception!(
                    InternalError,
                    "invokedynamic is not supported"
                ));
            }
            New => {
                let index = reader.u16()? as u32;
                push(POp::New, index, 0, false);
            }
            Newarray => {
                let atype = reader.u8()? as u32;
                push(POp::Newarray, atype, 0, false);
            }
            Anewarray => {
                let index = reader.u16()? as u32;
                push(POp::Anewarray, index, 0, false);
            }
            Arraylength => push(POp::Arraylength, 0, 0, false),
            Athrow => push(POp::Athrow, 0, 0, false),
            Checkcast => {
                let index = reader.u16()? as u32;
                push(POp::Checkcast, index, 0, false);
            }
            Instanceof => {
                let index = reader.u16()? as u32;
                push(POp::Instanceof, index, 0, false);
            }
            Monitorenter => push(POp::Monitorenter, 0, 0, false),
            Monitorexit => push(POp::Monitorexit, 0, 0, false),
            Multianewarray => {
                let index = reader.u16()? as u32;
                let dims = reader.u8()? as i32;
                if dims < 1 {
                    return Err(build_exception!(ClassFormatError, "multianewarray dims < 1"));
                }
                push(POp::Multianewarray, index, dims, false);
            }
            Wide => {
                let raw_wide = reader.u8()?;
                let wide_opcode = Opcode::try_from(raw_wide).map_err(|_| {
                    build_exception!(ClassFormatError, "unknown wide opcode 0x{:02x}", raw_wide)
                })?;
                let slot = reader.u16()? as u32;
                match wide_opcode {
                    Iload => push(POp::Iload, slot, 0, false),
                    Lload => push(POp::Lload, slot, 0, false),
                    Fload => push(POp::Fload, slot, 0, false),
                    Dload => push(POp::Dload, slot, 0, false),
                    Aload => push(POp::Aload, slot, 0, false),
                    Istore => push(POp::Istore, slot, 0, false),
                    Lstore => push(POp::Lstore, slot, 0, false),
                    Fstore => push(POp::Fstore, slot, 0, false),
                    Dstore => push(POp::Dstore, slot, 0, false),
                    Astore => push(POp::Astore, slot, 0, false),
                    Ret => push(POp::Ret, slot, 0, false),
                    Iinc => {
                        let delta = reader.i16()? as i32;
                        push(POp::Iinc, slot, delta, false);
                    }
                    _ => {
                        return Err(build_exception!(
                            ClassFormatError,
                            "opcode 0x{:02x} cannot be widened",
                            raw_wide
                        ));
                    }
                }
            }
        }
    }
    index_of_bci[code.len()] = decoded.len() as u32;

    // Forward references resolve here: every recorded target byte offset
    // becomes an instruction index.
    let fix = |target_bci: u32| -> Result<u32, JvmError> {
        index_of_bci
            .get(target_bci as usize)
            .copied()
            .filter(|idx| *idx != u32::MAX)
            .ok_or_else(|| {
                build_exception!(ClassFormatError, "branch into the middle of an instruction")
            })
    };

    let mut insns = Vec::with_capacity(decoded.len());
    for d in &decoded {
        let imm = if d.needs_target_fixup { fix(d.imm)? } else { d.imm };
        insns.push(PreparedInsn::new(d.op, imm, d.imm2, d.bci));
    }
    for switch in &mut switches {
        match switch {
            SwitchData::Table { default, targets, .. } => {
                *default = fix(*default)?;
                for t in targets.iter_mut() {
                    *t = fix(*t)?;
                }
            }
            SwitchData::Lookup { default, pairs } => {
                *default = fix(*default)?;
                for (_, t) in pairs.iter_mut() {
                    *t = fix(*t)?;
                }
            }
        }
    }

    let mut exception_table = Vec::with_capacity(body.exception_table.len());
    for entry in &body.exception_table {
        exception_table.push(PreparedCatch {
            start: fix(entry.start_pc as u32)?,
            end: fix(entry.end_pc as u32)?,
            handler: fix(entry.handler_pc as u32)?,
            catch_type: entry.catch_type,
        });
    }

    Ok(PreparedCode {
        insns,
        switches,
        exception_table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bonsai_classfile::attribute::CodeAttribute;

    fn body_of(code: Vec<u8>) -> CodeBody {
        CodeBody::from(CodeAttribute {
            max_stack: 8,
            max_locals: 8,
            code,
            exception_table: vec![],
            line_numbers: None,
        })
    }

    #[test]
    fn branch_targets_become_instruction_indexes() {
        use Opcode::*;
        // 0: iconst_0, 1: ifeq +4 (-> bci 5), 4: nop(at 4? no) ...
        // layout: [iconst_0][ifeq hi lo][iconst_1][return]
        //   bci:     0        1  2  3      4        5
        let code = vec![
            Iconst0 as u8,
            Ifeq as u8,
            0,
            4, // -> bci 5
            Iconst1 as u8,
            Return as u8,
        ];
        let prepared = prepare(&body_of(code)).unwrap();
        assert_eq!(prepared.insns.len(), 4);
        // The ifeq at index 1 targets the return at index 3.
        assert_eq!(prepared.insns[1].imm, 3);
    }

    #[test]
    fn wide_iinc_decodes_16_bit_operands() {
        use Opcode::*;
        let code = vec![Wide as u8, Iinc as u8, 0x01, 0x00, 0xff, 0x38, Return as u8];
        let prepared = prepare(&body_of(code)).unwrap();
        assert_eq!(prepared.insns[0].imm, 0x100);
        assert_eq!(prepared.insns[0].imm2, -200);
    }

    #[test]
    fn tableswitch_padding_and_targets() {
        use Opcode::*;
        // bci 0: iconst_2; bci 1: tableswitch, padded to bci 4.
        let mut code = vec![Iconst2 as u8, Tableswitch as u8, 0, 0];
        let default_off = 27i32; // -> bci 28
        let low = 1i32;
        let high = 2i32;
        code.extend_from_slice(&default_off.to_be_bytes());
        code.extend_from_slice(&low.to_be_bytes());
        code.extend_from_slice(&high.to_be_bytes());
        code.extend_from_slice(&26i32.to_be_bytes()); // case 1 -> bci 27
        code.extend_from_slice(&27i32.to_be_bytes()); // case 2 -> bci 28
        assert_eq!(code.len(), 24);
        code.resize(27, Opcode::Nop as u8);
        code.push(Return as u8); // bci 27
        code.push(Return as u8); // bci 28
        let prepared = prepare(&body_of(code)).unwrap();
        let switch = &prepared.switches[prepared.insns[1].imm as usize];
        assert_eq!(switch.target_for(1), prepared.insns.len() as u32 - 2);
        assert_eq!(switch.target_for(2), prepared.insns.len() as u32 - 1);
        assert_eq!(switch.target_for(99), prepared.insns.len() as u32 - 1);
    }

    #[test]
    fn truncated_code_is_rejected() {
        let code = vec![Opcode::Goto as u8, 0];
        assert!(prepare(&body_of(code)).is_err());
    }
}
