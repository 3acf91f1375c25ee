//! Tuples, datastructures, iteration and imports.

use indexmap::IndexMap;

use super::Vm;
use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapId,
    io::PrintWriter,
    object::{HashKey, Object, ObjectKind},
    resource::ResourceTracker,
    tracer::VmTracer,
};

/// The key a value takes in a hash. Only scalars can be keys.
pub(crate) fn hash_key(object: &Object) -> Option<HashKey> {
    match &object.kind {
        ObjectKind::Null => Some(HashKey::Null),
        ObjectKind::Boolean(b) => Some(HashKey::Boolean(*b)),
        ObjectKind::Numerical(n) => Some(HashKey::Number(*n)),
        ObjectKind::String(s) => Some(HashKey::String(s.clone())),
        _ => None,
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Allocates a list, tuple or hash linked to its builtin class.
    pub(crate) fn alloc_datastructure(&mut self, kind: ObjectKind) -> RunResult<HeapId> {
        let (name, class) = match kind {
            ObjectKind::List(_) => ("list", self.builtins.list),
            ObjectKind::Tuple(_) => ("tuple", self.builtins.tuple),
            ObjectKind::Hash(_) => ("hash", self.builtins.hash),
            _ => return Err(RunError::internal("not a datastructure")),
        };
        self.alloc(Object::new(name, kind).with_parent(Some(class)))
    }

    /// `BUILD_TUPLE n`: the top `n` values become a tuple, in push order.
    pub(super) fn build_tuple(&mut self, n: usize) -> RunResult<()> {
        let items = self.pop_n(n)?;
        let tuple = self.alloc_datastructure(ObjectKind::Tuple(items))?;
        self.push(tuple);
        Ok(())
    }

    /// `BUILD_DATASTRUCT n`: the class, then `n` element tuples.
    pub(super) fn build_datastruct(&mut self, n: usize) -> RunResult<()> {
        let elements = self.pop_n(n)?;
        let class = match self.pop() {
            Ok(class) => class,
            Err(err) => {
                self.release_all(elements);
                return Err(err);
            }
        };
        let result = self.datastructure_from(class, &elements);
        self.release(class);
        self.release_all(elements);
        let value = result?;
        self.push(value);
        Ok(())
    }

    fn datastructure_from(&mut self, class: HeapId, elements: &[HeapId]) -> RunResult<HeapId> {
        let class_name = self.heap.get(class).type_name().to_owned();
        let mut parts = Vec::with_capacity(elements.len());
        for &element in elements {
            match &self.heap.get(element).kind {
                ObjectKind::Tuple(items) => parts.push(items.clone()),
                _ => return Err(RunError::internal("datastructure element is not a tuple")),
            }
        }

        if class == self.builtins.list || class == self.builtins.tuple {
            let mut items = Vec::with_capacity(parts.len());
            for part in parts {
                let [item] = part[..] else {
                    return Err(ExcType::type_error(format!("{class_name} elements cannot have keys")));
                };
                items.push(item);
            }
            for &item in &items {
                self.heap.inc_ref(item);
            }
            let kind = if class == self.builtins.list {
                ObjectKind::List(items)
            } else {
                ObjectKind::Tuple(items)
            };
            return self.alloc_datastructure(kind);
        }

        if class == self.builtins.hash {
            let mut pairs = Vec::with_capacity(parts.len());
            for part in parts {
                let [key, value] = part[..] else {
                    return Err(ExcType::type_error("hash elements need a key and a value"));
                };
                let hashed = hash_key(self.heap.get(key)).ok_or_else(|| {
                    ExcType::type_error(format!(
                        "'{}' cannot be used as a hash key",
                        self.heap.get(key).type_name()
                    ))
                })?;
                pairs.push((hashed, key, value));
            }
            let mut entries = IndexMap::with_capacity(pairs.len());
            for (hashed, key, value) in pairs {
                self.heap.inc_ref(key);
                self.heap.inc_ref(value);
                if let Some((old_key, old_value)) = entries.insert(hashed, (key, value)) {
                    self.release(old_key);
                    self.release(old_value);
                }
            }
            return self.alloc_datastructure(ObjectKind::Hash(entries));
        }

        Err(ExcType::type_error(format!("'{class_name}' is not a datastructure")))
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// `ITER_RESET`: replaces the iterable on top with an iterator over it.
    pub(super) fn iter_reset(&mut self) -> RunResult<()> {
        let source = self.pop()?;
        let object = self.heap.get(source);
        if !matches!(
            object.kind,
            ObjectKind::List(_) | ObjectKind::Tuple(_) | ObjectKind::Hash(_)
        ) {
            let type_name = object.type_name().to_owned();
            self.release(source);
            return Err(ExcType::type_error(format!("'{type_name}' is not iterable")));
        }
        let iterator = self.alloc(Object::new("iterator", ObjectKind::Iterator { source, position: 0 }))?;
        self.push(iterator);
        Ok(())
    }

    /// `ITER_FETCH`: pushes key, value and whether they are valid. The
    /// iterator stays on the stack.
    pub(super) fn iter_fetch(&mut self) -> RunResult<()> {
        let iterator = self.peek()?;
        let ObjectKind::Iterator { source, position } = self.heap.get(iterator).kind else {
            return Err(RunError::internal("ITER_FETCH without an iterator"));
        };
        let next = match &self.heap.get(source).kind {
            ObjectKind::List(items) | ObjectKind::Tuple(items) => items.get(position).map(|&value| (None, value)),
            ObjectKind::Hash(entries) => entries.get_index(position).map(|(_, &(key, value))| (Some(key), value)),
            _ => None,
        };

        let Some((key, value)) = next else {
            let (key, value, has) = (self.null(), self.null(), self.boolean(false));
            self.push(key);
            self.push(value);
            self.push(has);
            return Ok(());
        };
        let key = match key {
            Some(key) => {
                self.heap.inc_ref(key);
                key
            }
            None => self.number(i64::try_from(position).unwrap_or(i64::MAX))?,
        };
        self.heap.inc_ref(value);
        if let ObjectKind::Iterator { position, .. } = &mut self.heap.get_mut(iterator).kind {
            *position += 1;
        }
        let has = self.boolean(true);
        self.push(key);
        self.push(value);
        self.push(has);
        Ok(())
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// `IMPORT`: the module name is on top, the class name below it.
    pub(super) fn import(&mut self) -> RunResult<()> {
        let module = self.pop_string("module name")?;
        let class = self.pop_string("class name")?;
        let module = if module.starts_with("::") {
            module
        } else {
            format!("::{module}")
        };
        let path = format!("{module}::{class}");
        let id = self.builtins.get(&path).ok_or_else(|| {
            SimpleException::new_msg(
                ExcType::ImportException,
                format!("cannot import '{class}' from '{module}'"),
            )
        })?;
        tracing::trace!(%path, "import");
        self.heap.inc_ref(id);
        self.push(id);
        Ok(())
    }
}
