//! Comparisons, containment, instance-of tests and truthiness.

use std::cmp::Ordering;

use super::{Vm, collections::hash_key};
use crate::{
    ast::CompareOp,
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapId},
    io::PrintWriter,
    object::ObjectKind,
    resource::ResourceTracker,
    tracer::VmTracer,
};

/// Value equality: the same object, or equal scalars.
pub(crate) fn values_equal<T: ResourceTracker>(heap: &Heap<T>, a: HeapId, b: HeapId) -> bool {
    if a == b {
        return true;
    }
    match (&heap.get(a).kind, &heap.get(b).kind) {
        (ObjectKind::Null, ObjectKind::Null) => true,
        (ObjectKind::Boolean(x), ObjectKind::Boolean(y)) => x == y,
        (ObjectKind::Numerical(x), ObjectKind::Numerical(y)) => x == y,
        (ObjectKind::String(x), ObjectKind::String(y)) => x == y,
        _ => false,
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `COMPARE_OP`: the left operand is on top, the right one below it.
    pub(super) fn compare_op(&mut self, op: CompareOp) -> RunResult<()> {
        let left = self.pop()?;
        let right = self.pop()?;
        let result = self.compare_values(op, left, right);
        self.release(left);
        self.release(right);
        let value = self.boolean(result?);
        self.push(value);
        Ok(())
    }

    fn compare_values(&self, op: CompareOp, left: HeapId, right: HeapId) -> RunResult<bool> {
        match op {
            CompareOp::Eq => Ok(values_equal(&self.heap, left, right)),
            CompareOp::Ne => Ok(!values_equal(&self.heap, left, right)),
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let ordering = self.order(left, right)?;
                Ok(match op {
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
            CompareOp::In => self.contains(right, left),
            CompareOp::NotIn => self.contains(right, left).map(|found| !found),
            CompareOp::Ex => {
                let class = self.heap.get(right);
                if !class.is_class() && !class.is_interface() {
                    return Err(ExcType::type_error(format!(
                        "right operand of instanceof must be a class, not '{}'",
                        class.type_name()
                    )));
                }
                Ok(self.is_instance_of(left, right))
            }
        }
    }

    fn order(&self, left: HeapId, right: HeapId) -> RunResult<Ordering> {
        match (&self.heap.get(left).kind, &self.heap.get(right).kind) {
            (ObjectKind::Numerical(a), ObjectKind::Numerical(b)) => Ok(a.cmp(b)),
            (ObjectKind::String(a), ObjectKind::String(b)) => Ok(a.cmp(b)),
            _ => Err(ExcType::type_error(format!(
                "cannot order '{}' and '{}'",
                self.heap.get(left).type_name(),
                self.heap.get(right).type_name()
            ))),
        }
    }

    /// Whether `item` is in `container`: an element of a list or tuple, a key
    /// of a hash, or a substring of a string.
    pub(crate) fn contains(&self, container: HeapId, item: HeapId) -> RunResult<bool> {
        match &self.heap.get(container).kind {
            ObjectKind::List(items) | ObjectKind::Tuple(items) => {
                Ok(items.iter().any(|&element| values_equal(&self.heap, element, item)))
            }
            ObjectKind::Hash(entries) => {
                Ok(hash_key(self.heap.get(item)).is_some_and(|key| entries.contains_key(&key)))
            }
            ObjectKind::String(haystack) => match &self.heap.get(item).kind {
                ObjectKind::String(needle) => Ok(haystack.contains(needle.as_str())),
                _ => Err(ExcType::type_error(format!(
                    "'in <string>' requires a string, not '{}'",
                    self.heap.get(item).type_name()
                ))),
            },
            _ => Err(ExcType::type_error(format!(
                "'{}' is not a container",
                self.heap.get(container).type_name()
            ))),
        }
    }

    /// Whether `object` is `class`, an instance of it, or of a subclass or
    /// implementor of it.
    pub(crate) fn is_instance_of(&self, object: HeapId, class: HeapId) -> bool {
        let value = self.heap.get(object);
        let mut cursor = if value.is_class() || value.is_interface() {
            Some(object)
        } else {
            value.parent
        };
        while let Some(current) = cursor {
            if current == class {
                return true;
            }
            let current_object = self.heap.get(current);
            if current_object
                .interfaces
                .iter()
                .any(|&iface| self.interface_extends(iface, class))
            {
                return true;
            }
            cursor = current_object.parent;
        }
        false
    }

    fn interface_extends(&self, iface: HeapId, target: HeapId) -> bool {
        let mut cursor = Some(iface);
        while let Some(current) = cursor {
            if current == target {
                return true;
            }
            cursor = self.heap.get(current).parent;
        }
        false
    }

    /// `null`, `false`, `0` and empty strings and containers are false.
    pub(crate) fn is_truthy(&self, id: HeapId) -> bool {
        match &self.heap.get(id).kind {
            ObjectKind::Null => false,
            ObjectKind::Boolean(b) => *b,
            ObjectKind::Numerical(n) => *n != 0,
            ObjectKind::String(s) => !s.is_empty(),
            ObjectKind::List(items) | ObjectKind::Tuple(items) => !items.is_empty(),
            ObjectKind::Hash(entries) => !entries.is_empty(),
            _ => true,
        }
    }
}
