//! The builtin scope: singletons, `print`, the base and exception classes and
//! the datastructure classes with their native methods.
//!
//! Every builtin object is allocated once, flagged static and shared by all
//! frames. Builtin classes resolve under their short name and under
//! `::saffire::<Name>`.

use std::{fmt::Write as _, io};

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;
use strum::{Display, IntoEnumIterator};

use crate::{
    ast::{Access, AttribKind, Visibility},
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{Heap, HeapId},
    io::PrintWriter,
    object::{Attribute, Callable, Object, ObjectFlags, ObjectKind},
    resource::{ResourceError, ResourceTracker},
    tracer::VmTracer,
    vm::{Vm, hash_key},
};

/// Module prefix builtin classes can be imported from.
const MODULE_PREFIX: &str = "::saffire::";

/// Nesting depth past which `print` abbreviates containers.
const MAX_FORMAT_DEPTH: usize = 16;

/// Functions implemented by the VM itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Native {
    Print,
    Length,
    Get,
    Set,
    Splice,
    Push,
    Has,
    Keys,
}

const LIST_METHODS: &[Native] = &[
    Native::Length,
    Native::Get,
    Native::Set,
    Native::Splice,
    Native::Push,
    Native::Has,
    Native::Keys,
];
const TUPLE_METHODS: &[Native] = &[Native::Length, Native::Get, Native::Splice, Native::Has, Native::Keys];
const HASH_METHODS: &[Native] = &[Native::Length, Native::Get, Native::Set, Native::Has, Native::Keys];

/// Handles to the builtin objects.
#[derive(Debug)]
pub(crate) struct Builtins {
    /// Holds the one reference every builtin is created with.
    names: IndexMap<String, HeapId>,
    pub null: HeapId,
    pub true_: HeapId,
    pub false_: HeapId,
    pub object: HeapId,
    pub exception: HeapId,
    pub list: HeapId,
    pub hash: HeapId,
    pub tuple: HeapId,
    exceptions: AHashMap<ExcType, HeapId>,
}

impl Builtins {
    pub fn new<T: ResourceTracker>(heap: &mut Heap<T>) -> Result<Self, ResourceError> {
        let mut names = IndexMap::new();
        let mut register = |heap: &mut Heap<T>, name: &str, object: Object| -> Result<HeapId, ResourceError> {
            let id = heap.allocate(object.with_flags(ObjectFlags::STATIC))?;
            names.insert(name.to_owned(), id);
            Ok(id)
        };

        let null = register(heap, "null", Object::new("null", ObjectKind::Null))?;
        let true_ = register(heap, "true", Object::new("true", ObjectKind::Boolean(true)))?;
        let false_ = register(heap, "false", Object::new("false", ObjectKind::Boolean(false)))?;
        register(
            heap,
            "print",
            Object::new("print", ObjectKind::Callable(Callable::Native(Native::Print))),
        )?;

        let object = register(heap, "Object", class("Object", None))?;

        let exception = register(heap, "Exception", class("Exception", Some(object)))?;
        heap.inc_ref(null);
        let message = Attribute {
            kind: AttribKind::Property,
            visibility: Visibility::Public,
            access: Access::ReadWrite,
            method_flags: 0,
            params: SmallVec::new(),
            value: null,
            owner: Some(exception),
            declared_in: Some(exception),
        };
        add_attribute(heap, exception, "message", message)?;

        let mut exceptions = AHashMap::new();
        exceptions.insert(ExcType::Exception, exception);
        for exc_type in ExcType::iter().filter(|&t| t != ExcType::Exception) {
            let name: &'static str = exc_type.into();
            let id = register(heap, name, class(name, Some(exception)))?;
            exceptions.insert(exc_type, id);
        }

        let list = register(heap, "list", class("list", Some(object)))?;
        let hash = register(heap, "hash", class("hash", Some(object)))?;
        let tuple = register(heap, "tuple", class("tuple", Some(object)))?;
        for (class_id, methods) in [(list, LIST_METHODS), (tuple, TUPLE_METHODS), (hash, HASH_METHODS)] {
            for &native in methods {
                add_native_method(heap, class_id, native)?;
            }
        }

        Ok(Self {
            names,
            null,
            true_,
            false_,
            object,
            exception,
            list,
            hash,
            tuple,
            exceptions,
        })
    }

    /// Resolves a builtin by short name or by `::saffire::<Name>`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<HeapId> {
        let name = name.strip_prefix(MODULE_PREFIX).unwrap_or(name);
        self.names.get(name).copied()
    }

    /// The builtin class raised for `exc_type`.
    #[must_use]
    pub fn exception_class(&self, exc_type: ExcType) -> HeapId {
        self.exceptions.get(&exc_type).copied().unwrap_or(self.exception)
    }
}

fn class(name: &str, parent: Option<HeapId>) -> Object {
    Object::new(name, ObjectKind::User)
        .with_flags(ObjectFlags::CLASS)
        .with_parent(parent)
}

fn add_attribute<T: ResourceTracker>(
    heap: &mut Heap<T>,
    class: HeapId,
    name: &str,
    attr: Attribute,
) -> Result<(), ResourceError> {
    let attrib = heap.allocate(Object::new(name, ObjectKind::Attrib(attr)).with_flags(ObjectFlags::STATIC))?;
    heap.get_mut(class).attributes.insert(name.to_owned(), attrib);
    Ok(())
}

fn add_native_method<T: ResourceTracker>(heap: &mut Heap<T>, class: HeapId, native: Native) -> Result<(), ResourceError> {
    let name = native.to_string();
    let value = heap.allocate(
        Object::new(name.as_str(), ObjectKind::Callable(Callable::Native(native))).with_flags(ObjectFlags::STATIC),
    )?;
    let attr = Attribute {
        kind: AttribKind::Method,
        visibility: Visibility::Public,
        access: Access::ReadOnly,
        method_flags: 0,
        params: SmallVec::new(),
        value,
        owner: Some(class),
        declared_in: Some(class),
    };
    add_attribute(heap, class, &name, attr)
}

// ============================================================================
// Native functions
// ============================================================================

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Runs a native function. Returns a new reference.
    pub(crate) fn call_native(&mut self, native: Native, receiver: Option<HeapId>, args: &[HeapId]) -> RunResult<HeapId> {
        let receiver = match (native, receiver) {
            (Native::Print, _) => {
                self.print_values(args)?;
                return Ok(self.null());
            }
            (_, Some(receiver)) => receiver,
            (_, None) => return Err(ExcType::call_error(format!("'{native}' needs a receiver"))),
        };
        match native {
            Native::Print => Ok(self.null()),
            Native::Length => {
                expect_args(native, args, 0, 0)?;
                let length = match &self.heap.get(receiver).kind {
                    ObjectKind::List(items) | ObjectKind::Tuple(items) => items.len(),
                    ObjectKind::Hash(entries) => entries.len(),
                    ObjectKind::String(s) => s.chars().count(),
                    _ => return Err(self.receiver_error(native, receiver)),
                };
                self.number(i64::try_from(length).unwrap_or(i64::MAX))
            }
            Native::Get => {
                expect_args(native, args, 1, 1)?;
                self.native_get(receiver, args[0])
            }
            Native::Set => {
                expect_args(native, args, 2, 2)?;
                self.native_set(receiver, args[0], args[1])?;
                self.heap.inc_ref(receiver);
                Ok(receiver)
            }
            Native::Splice => {
                expect_args(native, args, 0, 2)?;
                self.native_splice(receiver, args)
            }
            Native::Push => {
                expect_args(native, args, 1, 1)?;
                if !matches!(self.heap.get(receiver).kind, ObjectKind::List(_)) {
                    return Err(self.receiver_error(native, receiver));
                }
                self.heap.inc_ref(args[0]);
                if let ObjectKind::List(items) = &mut self.heap.get_mut(receiver).kind {
                    items.push(args[0]);
                }
                self.heap.inc_ref(receiver);
                Ok(receiver)
            }
            Native::Has => {
                expect_args(native, args, 1, 1)?;
                let found = self.contains(receiver, args[0])?;
                Ok(self.boolean(found))
            }
            Native::Keys => {
                expect_args(native, args, 0, 0)?;
                let keys = match &self.heap.get(receiver).kind {
                    ObjectKind::List(items) | ObjectKind::Tuple(items) => Err(items.len()),
                    ObjectKind::Hash(entries) => Ok(entries.values().map(|&(key, _)| key).collect::<Vec<_>>()),
                    _ => return Err(self.receiver_error(native, receiver)),
                };
                let keys = match keys {
                    Ok(keys) => {
                        for &key in &keys {
                            self.heap.inc_ref(key);
                        }
                        keys
                    }
                    Err(len) => {
                        let mut keys = Vec::with_capacity(len);
                        for index in 0..len {
                            match self.number(i64::try_from(index).unwrap_or(i64::MAX)) {
                                Ok(key) => keys.push(key),
                                Err(err) => {
                                    self.release_all(keys);
                                    return Err(err);
                                }
                            }
                        }
                        keys
                    }
                };
                self.alloc_datastructure(ObjectKind::List(keys))
            }
        }
    }

    fn receiver_error(&self, native: Native, receiver: HeapId) -> RunError {
        ExcType::type_error(format!(
            "'{native}' is not supported by '{}'",
            self.heap.get(receiver).type_name()
        ))
    }

    fn index_arg(&self, native: Native, arg: HeapId) -> RunResult<i64> {
        match self.heap.get(arg).kind {
            ObjectKind::Numerical(n) => Ok(n),
            _ => Err(ExcType::type_error(format!(
                "'{native}' needs a numerical index, not '{}'",
                self.heap.get(arg).type_name()
            ))),
        }
    }

    fn native_get(&mut self, receiver: HeapId, key: HeapId) -> RunResult<HeapId> {
        let found = match &self.heap.get(receiver).kind {
            ObjectKind::List(items) | ObjectKind::Tuple(items) => {
                let index = self.index_arg(Native::Get, key)?;
                usize::try_from(index).ok().and_then(|index| items.get(index)).copied()
            }
            ObjectKind::Hash(entries) => hash_key(self.heap.get(key))
                .and_then(|hashed| entries.get(&hashed))
                .map(|&(_, value)| value),
            _ => return Err(self.receiver_error(Native::Get, receiver)),
        };
        match found {
            Some(value) => {
                self.heap.inc_ref(value);
                Ok(value)
            }
            None => Ok(self.null()),
        }
    }

    fn native_set(&mut self, receiver: HeapId, key: HeapId, value: HeapId) -> RunResult<()> {
        let list_len = match &self.heap.get(receiver).kind {
            ObjectKind::List(items) => Some(items.len()),
            ObjectKind::Hash(_) => None,
            ObjectKind::Tuple(_) => return Err(ExcType::type_error("tuples are immutable")),
            _ => return Err(self.receiver_error(Native::Set, receiver)),
        };

        if let Some(len) = list_len {
            let index = self.index_arg(Native::Set, key)?;
            let index = usize::try_from(index)
                .ok()
                .filter(|&index| index < len)
                .ok_or_else(|| {
                    SimpleException::new_msg(ExcType::ArgumentException, format!("list index {index} out of range"))
                })?;
            self.heap.inc_ref(value);
            if let ObjectKind::List(items) = &mut self.heap.get_mut(receiver).kind {
                let old = std::mem::replace(&mut items[index], value);
                self.release(old);
            }
            return Ok(());
        }

        let hashed = hash_key(self.heap.get(key)).ok_or_else(|| {
            ExcType::type_error(format!(
                "'{}' cannot be used as a hash key",
                self.heap.get(key).type_name()
            ))
        })?;
        self.heap.inc_ref(key);
        self.heap.inc_ref(value);
        let old = match &mut self.heap.get_mut(receiver).kind {
            ObjectKind::Hash(entries) => entries.insert(hashed, (key, value)),
            _ => None,
        };
        if let Some((old_key, old_value)) = old {
            self.release(old_key);
            self.release(old_value);
        }
        Ok(())
    }

    /// `splice(start, end)`: a copy of the elements in `start..end`, bounds
    /// clamped. `null` or a missing bound means open.
    fn native_splice(&mut self, receiver: HeapId, args: &[HeapId]) -> RunResult<HeapId> {
        let (items, is_list) = match &self.heap.get(receiver).kind {
            ObjectKind::List(items) => (items.clone(), true),
            ObjectKind::Tuple(items) => (items.clone(), false),
            _ => return Err(self.receiver_error(Native::Splice, receiver)),
        };
        let bound = |vm: &Self, slot: usize, default: usize| -> RunResult<usize> {
            match args.get(slot) {
                Some(&arg) if !vm.is_null(arg) => {
                    let value = vm.index_arg(Native::Splice, arg)?;
                    Ok(usize::try_from(value.max(0)).unwrap_or(usize::MAX).min(items.len()))
                }
                _ => Ok(default),
            }
        };
        let start = bound(self, 0, 0)?;
        let end = bound(self, 1, items.len())?.max(start);
        let slice = items[start..end].to_vec();
        for &item in &slice {
            self.heap.inc_ref(item);
        }
        let kind = if is_list {
            ObjectKind::List(slice)
        } else {
            ObjectKind::Tuple(slice)
        };
        self.alloc_datastructure(kind)
    }

    // ========================================================================
    // print
    // ========================================================================

    fn print_values(&mut self, args: &[HeapId]) -> RunResult<()> {
        for (index, &arg) in args.iter().enumerate() {
            let mut text = String::new();
            self.format_value(arg, &mut text, 0);
            if index > 0 {
                self.print.write_separator().map_err(print_error)?;
            }
            self.print.write_text(&text).map_err(print_error)?;
        }
        self.print.end_line().map_err(print_error)
    }

    /// Renders a value the way `print` shows it. Strings are quoted inside containers.
    pub(crate) fn format_value(&self, id: HeapId, out: &mut String, depth: usize) {
        let object = self.heap.get(id);
        let nested = depth + 1;
        match &object.kind {
            ObjectKind::Null => out.push_str("null"),
            ObjectKind::Boolean(b) => {
                let _ = write!(out, "{b}");
            }
            ObjectKind::Numerical(n) => {
                let _ = write!(out, "{n}");
            }
            ObjectKind::String(s) if depth == 0 => out.push_str(s),
            ObjectKind::String(s) => {
                let _ = write!(out, "\"{s}\"");
            }
            ObjectKind::Regex(re) => {
                let _ = write!(out, "/{}/", re.as_str());
            }
            ObjectKind::List(_) | ObjectKind::Tuple(_) | ObjectKind::Hash(_) if depth >= MAX_FORMAT_DEPTH => {
                out.push_str("...");
            }
            ObjectKind::List(items) => {
                out.push('[');
                self.format_items(items, out, nested);
                out.push(']');
            }
            ObjectKind::Tuple(items) => {
                out.push('(');
                self.format_items(items, out, nested);
                out.push(')');
            }
            ObjectKind::Hash(entries) => {
                out.push('{');
                for (index, &(key, value)) in entries.values().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    self.format_value(key, out, nested);
                    out.push_str(": ");
                    self.format_value(value, out, nested);
                }
                out.push('}');
            }
            ObjectKind::Callable(_) | ObjectKind::BoundMethod { .. } => out.push_str("<callable>"),
            ObjectKind::Iterator { .. } => out.push_str("<iterator>"),
            ObjectKind::ParentScope { .. } => out.push_str("<parent>"),
            ObjectKind::Attrib(_) => {
                let _ = write!(out, "<attribute {}>", object.name);
            }
            ObjectKind::User if object.is_interface() => {
                let _ = write!(out, "<interface {}>", object.name);
            }
            ObjectKind::User if object.is_class() => {
                let _ = write!(out, "<class {}>", object.name);
            }
            ObjectKind::User => {
                let _ = write!(out, "<{} instance>", object.name);
            }
        }
    }

    fn format_items(&self, items: &[HeapId], out: &mut String, depth: usize) {
        for (index, &item) in items.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            self.format_value(item, out, depth);
        }
    }
}

fn print_error(err: io::Error) -> RunError {
    RunError::internal(format!("print failed: {err}"))
}

/// Checks a native's argument count against `min..=max`.
fn expect_args(native: Native, args: &[HeapId], min: usize, max: usize) -> RunResult<()> {
    if (min..=max).contains(&args.len()) {
        Ok(())
    } else {
        Err(ExcType::argument_error(&native.to_string(), max, args.len()))
    }
}
