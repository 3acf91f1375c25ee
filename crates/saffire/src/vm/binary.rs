//! Arithmetic and bitwise operators.

use super::{Vm, call::CallResult};
use crate::{
    ast::BinaryOp,
    exception_private::{ExcType, RunResult},
    heap::HeapId,
    io::PrintWriter,
    object::{Object, ObjectKind},
    resource::ResourceTracker,
    tracer::VmTracer,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `OPERATOR` and `INPLACE_OPR`: pops right, then left.
    pub(super) fn binary_op(&mut self, op: BinaryOp) -> RunResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = self.binary_values(op, left, right);
        self.release(left);
        self.release(right);
        if let CallResult::Push(value) = result? {
            self.push(value);
        }
        Ok(())
    }

    fn binary_values(&mut self, op: BinaryOp, left: HeapId, right: HeapId) -> RunResult<CallResult> {
        if self.heap.get(left).is_instance()
            && let Some(method) = self.find_attribute(left, op.method_name())
        {
            return self.call_method(left, method, &[right]);
        }

        let object = match (&self.heap.get(left).kind, &self.heap.get(right).kind) {
            (ObjectKind::Numerical(a), ObjectKind::Numerical(b)) => {
                Object::new("numerical", ObjectKind::Numerical(arithmetic(op, *a, *b)?))
            }
            (ObjectKind::String(a), ObjectKind::String(b)) if op == BinaryOp::Add => {
                Object::new("string", ObjectKind::String(format!("{a}{b}")))
            }
            _ => {
                return Err(ExcType::type_error(format!(
                    "unsupported operand types for {op}: '{}' and '{}'",
                    self.heap.get(left).type_name(),
                    self.heap.get(right).type_name()
                )));
            }
        };
        self.alloc(object).map(CallResult::Push)
    }
}

/// Integer arithmetic with overflow, division by zero and shift range checked.
pub(crate) fn arithmetic(op: BinaryOp, a: i64, b: i64) -> RunResult<i64> {
    let overflow = || ExcType::arithmetic_error(format!("integer overflow in {op}"));
    match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow),
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow),
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow),
        BinaryOp::Div | BinaryOp::Mod if b == 0 => Err(ExcType::arithmetic_error(if op == BinaryOp::Div {
            "division by zero"
        } else {
            "modulo by zero"
        })),
        BinaryOp::Div => a.checked_div(b).ok_or_else(overflow),
        BinaryOp::Mod => a.checked_rem(b).ok_or_else(overflow),
        BinaryOp::And => Ok(a & b),
        BinaryOp::Or => Ok(a | b),
        BinaryOp::Xor => Ok(a ^ b),
        BinaryOp::Shl | BinaryOp::Shr => {
            let shift = u32::try_from(b)
                .ok()
                .filter(|&shift| shift < 64)
                .ok_or_else(|| ExcType::arithmetic_error(format!("shift count {b} out of range")))?;
            Ok(if op == BinaryOp::Shl { a << shift } else { a >> shift })
        }
    }
}
