use crate::error::JvmError;
use crate::heap::HeapRef;
use crate::keys::MethodId;
use crate::throw_exception;
use crate::vm::Value;

/// Extra frames available to the unwinder once an overflow has been
/// signalled, so handler search and throwable construction can run.
const RED_ZONE_FRAMES: usize = 16;

pub struct JavaFrame {
    method_id: MethodId,
    pub pc: usize,
    locals: Vec<Value>,
    operands: Vec<Value>,
}

impl JavaFrame {
    pub fn new(method_id: MethodId, max_stack: u16, max_locals: u16, args: Vec<Value>) -> Self {
        let mut locals = Vec::with_capacity(max_locals as usize);
        for arg in args {
            let wide = arg.is_wide();
            locals.push(arg);
            if wide {
                // Second slot of a long/double; dead by construction.
                locals.push(Value::Integer(0));
            }
        }
        locals.resize(max_locals as usize, Value::Null);
        Self {
            method_id,
            pc: 0,
            locals,
            operands: Vec::with_capacity(max_stack as usize),
        }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn get_local(&self, index: usize) -> Result<&Value, JvmError> {
        self.locals
            .get(index)
            .ok_or(JvmError::LocalVariableNotFound(index as u16))
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<(), JvmError> {
        if index >= self.locals.len() {
            return Err(JvmError::LocalVariableNotFound(index as u16));
        }
        self.locals[index] = value;
        Ok(())
    }

    pub fn push(&mut self, value: Value) {
        self.operands.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, JvmError> {
        self.operands.pop().ok_or(JvmError::OperandStackIsEmpty)
    }

    pub fn peek(&self) -> Result<&Value, JvmError> {
        self.operands.last().ok_or(JvmError::OperandStackIsEmpty)
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Clears the operand stack down to the single slot holding the
    /// throwable, the state a handler resumes with.
    pub fn reset_for_handler(&mut self, throwable: HeapRef) {
        self.operands.clear();
        self.operands.push(Value::Ref(throwable));
    }

    pub fn iter_ref_slots(&self) -> impl Iterator<Item = HeapRef> + '_ {
        self.locals
            .iter()
            .chain(self.operands.iter())
            .filter_map(|v| match v {
                Value::Ref(r) => Some(*r),
                _ => None,
            })
    }

    pub fn forward_ref_slots(&mut self, forward: &dyn Fn(HeapRef) -> HeapRef) {
        for slot in self.locals.iter_mut().chain(self.operands.iter_mut()) {
            if let Value::Ref(r) = slot {
                *r = forward(*r);
            }
        }
    }
}

pub struct NativeFrame {
    method_id: MethodId,
}

impl NativeFrame {
    pub fn new(method_id: MethodId) -> Self {
        Self { method_id }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }
}

pub enum FrameType {
    JavaFrame(JavaFrame),
    NativeFrame(NativeFrame),
}

impl FrameType {
    pub fn method_id(&self) -> MethodId {
        match self {
            FrameType::JavaFrame(f) => f.method_id(),
            FrameType::NativeFrame(f) => f.method_id(),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, FrameType::NativeFrame(_))
    }
}

/// The per-thread Java stack. Frames are boxed into a growable vector; the
/// configured depth plays the role of `stack_end`, with a red zone armed
/// while a StackOverflowError unwinds.
pub struct FrameStack {
    frames: Vec<FrameType>,
    max_depth: usize,
    red_zone_armed: bool,
}

impl FrameStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
            red_zone_armed: false,
        }
    }

    fn depth_limit(&self) -> usize {
        if self.red_zone_armed {
            self.max_depth + RED_ZONE_FRAMES
        } else {
            self.max_depth
        }
    }

    pub fn push_frame(&mut self, frame: FrameType) -> Result<(), JvmError> {
        if self.frames.len() >= self.depth_limit() {
            if self.red_zone_armed {
                // Overflowed while unwinding an overflow; nothing left to do.
                return Err(JvmError::StackOverflow);
            }
            self.red_zone_armed = true;
            return throw_exception!(StackOverflowError);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Called when a handler catches; restores the original depth limit.
    pub fn disarm_red_zone(&mut self) {
        self.red_zone_armed = false;
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn cur_frame(&self) -> Result<&FrameType, JvmError> {
        self.frames.last().ok_or(JvmError::FrameStackIsEmpty)
    }

    pub fn cur_java_frame(&self) -> Result<&JavaFrame, JvmError> {
        match self.cur_frame()? {
            FrameType::JavaFrame(f) => Ok(f),
            FrameType::NativeFrame(_) => Err(JvmError::IllegalInternalState(
                "current frame is native".to_string(),
            )),
        }
    }

    pub fn cur_java_frame_mut(&mut self) -> Result<&mut JavaFrame, JvmError> {
        match self.frames.last_mut().ok_or(JvmError::FrameStackIsEmpty)? {
            FrameType::JavaFrame(f) => Ok(f),
            FrameType::NativeFrame(_) => Err(JvmError::IllegalInternalState(
                "current frame is native".to_string(),
            )),
        }
    }

    pub fn pop_java_frame(&mut self) -> Result<(), JvmError> {
        match self.frames.pop() {
            Some(FrameType::JavaFrame(_)) => Ok(()),
            Some(frame @ FrameType::NativeFrame(_)) => {
                self.frames.push(frame);
                Err(JvmError::IllegalInternalState(
                    "expected a java frame on top".to_string(),
                ))
            }
            None => Err(JvmError::FrameStackIsEmpty),
        }
    }

    pub fn pop_native_frame(&mut self) -> Result<(), JvmError> {
        match self.frames.pop() {
            Some(FrameType::NativeFrame(_)) => Ok(()),
            Some(frame @ FrameType::JavaFrame(_)) => {
                self.frames.push(frame);
                Err(JvmError::IllegalInternalState(
                    "expected a native frame on top".to_string(),
                ))
            }
            None => Err(JvmError::FrameStackIsEmpty),
        }
    }

    pub fn pc(&self) -> Result<usize, JvmError> {
        Ok(self.cur_java_frame()?.pc)
    }

    pub fn pc_mut(&mut self) -> Result<&mut usize, JvmError> {
        Ok(&mut self.cur_java_frame_mut()?.pc)
    }

    pub fn push_operand(&mut self, value: Value) -> Result<(), JvmError> {
        self.cur_java_frame_mut()?.push(value);
        Ok(())
    }

    pub fn pop_operand(&mut self) -> Result<Value, JvmError> {
        self.cur_java_frame_mut()?.pop()
    }

    pub fn pop_int_val(&mut self) -> Result<i32, JvmError> {
        self.pop_operand()?.as_int()
    }

    pub fn pop_long_val(&mut self) -> Result<i64, JvmError> {
        self.pop_operand()?.as_long()
    }

    pub fn pop_float_val(&mut self) -> Result<f32, JvmError> {
        self.pop_operand()?.as_float()
    }

    pub fn pop_double_val(&mut self) -> Result<f64, JvmError> {
        self.pop_operand()?.as_double()
    }

    /// Pops a reference, raising NullPointerException on null.
    pub fn pop_obj_val(&mut self) -> Result<HeapRef, JvmError> {
        self.pop_operand()?.as_obj_ref()
    }

    pub fn pop_nullable_ref(&mut self) -> Result<Value, JvmError> {
        let value = self.pop_operand()?;
        match value {
            Value::Ref(_) | Value::Null => Ok(value),
            other => Err(JvmError::UnexpectedType(format!(
                "expected reference, got {:?}",
                other
            ))),
        }
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<(), JvmError> {
        self.cur_java_frame_mut()?.set_local(index, value)
    }

    pub fn frames(&self) -> &[FrameType] {
        &self.frames
    }

    pub fn java_frames(&self) -> impl Iterator<Item = &JavaFrame> {
        self.frames.iter().filter_map(|f| match f {
            FrameType::JavaFrame(jf) => Some(jf),
            FrameType::NativeFrame(_) => None,
        })
    }

    pub fn java_frames_mut(&mut self) -> impl Iterator<Item = &mut JavaFrame> {
        self.frames.iter_mut().filter_map(|f| match f {
            FrameType::JavaFrame(jf) => Some(jf),
            FrameType::NativeFrame(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{JavaExceptionKind, JvmError};

    fn frame() -> FrameType {
        FrameType::JavaFrame(JavaFrame::new(MethodId::from_usize(1), 4, 4, vec![]))
    }

    #[test]
    fn overflow_arms_red_zone_once() {
        let mut stack = FrameStack::new(2);
        stack.push_frame(frame()).unwrap();
        stack.push_frame(frame()).unwrap();
        match stack.push_frame(frame()) {
            Err(JvmError::JavaException(ex)) => {
                assert_eq!(ex.kind, JavaExceptionKind::StackOverflowError);
            }
            other => panic!("expected StackOverflowError, got {:?}", other.err()),
        }
        // The red zone admits further frames for the unwinder.
        stack.push_frame(frame()).unwrap();
        stack.pop_java_frame().unwrap();
        stack.disarm_red_zone();
        // Restored limit applies again.
        assert!(stack.push_frame(frame()).is_err());
    }

    #[test]
    fn wide_args_take_two_local_slots() {
        let f = JavaFrame::new(
            MethodId::from_usize(1),
            2,
            4,
            vec![Value::Long(7), Value::Integer(1)],
        );
        assert_eq!(f.get_local(0).unwrap().as_long().unwrap(), 7);
        assert_eq!(f.get_local(2).unwrap().as_int().unwrap(), 1);
    }
}
