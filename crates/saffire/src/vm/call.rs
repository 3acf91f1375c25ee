//! Calls, instantiation and method invocation.

use indexmap::IndexMap;

use super::{
    Vm,
    frame::{Frame, OnReturn},
};
use crate::{
    ast::AttribKind,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapId,
    io::PrintWriter,
    object::{Callable, Object, ObjectFlags, ObjectKind},
    resource::ResourceTracker,
    tracer::VmTracer,
};

/// What a call produced.
#[derive(Debug)]
pub(crate) enum CallResult {
    /// The call finished; push this value (one reference).
    Push(HeapId),
    /// A frame was pushed; its return value arrives when it returns.
    FramePushed,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `CALL argc`: the callee is on top, its arguments below in order.
    pub(super) fn call(&mut self, argc: usize) -> RunResult<()> {
        let callee = self.pop()?;
        let args = match self.pop_n(argc) {
            Ok(args) => args,
            Err(err) => {
                self.release(callee);
                return Err(err);
            }
        };
        let result = self.call_value(callee, &args);
        self.release(callee);
        self.release_all(args);
        if let CallResult::Push(value) = result? {
            self.push(value);
        }
        Ok(())
    }

    /// Calls `callee` with borrowed arguments.
    pub(super) fn call_value(&mut self, callee: HeapId, args: &[HeapId]) -> RunResult<CallResult> {
        let object = self.heap.get(callee);
        match &object.kind {
            ObjectKind::BoundMethod { receiver, attrib } => {
                let (receiver, attrib) = (*receiver, *attrib);
                self.call_method(receiver, attrib, args)
            }
            ObjectKind::Callable(Callable::Native(native)) => {
                let native = *native;
                self.call_native(native, None, args).map(CallResult::Push)
            }
            ObjectKind::User if object.is_class() || object.is_interface() => self.instantiate(callee, args),
            _ => Err(ExcType::call_error(format!(
                "'{}' is not callable",
                object.type_name()
            ))),
        }
    }

    fn instantiate(&mut self, class: HeapId, args: &[HeapId]) -> RunResult<CallResult> {
        let object = self.heap.get(class);
        let name = object.name.clone();
        if object.is_interface() {
            return Err(ExcType::call_error(format!("cannot instantiate interface '{name}'")));
        }
        if object.flags.contains(ObjectFlags::ABSTRACT) {
            return Err(ExcType::call_error(format!("cannot instantiate abstract class '{name}'")));
        }

        if class == self.builtins.list || class == self.builtins.tuple {
            for &arg in args {
                self.heap.inc_ref(arg);
            }
            let items = args.to_vec();
            let kind = if class == self.builtins.list {
                ObjectKind::List(items)
            } else {
                ObjectKind::Tuple(items)
            };
            return self.alloc_datastructure(kind).map(CallResult::Push);
        }
        if class == self.builtins.hash {
            if !args.is_empty() {
                return Err(ExcType::argument_error("hash", 0, args.len()));
            }
            return self
                .alloc_datastructure(ObjectKind::Hash(IndexMap::new()))
                .map(CallResult::Push);
        }

        let instance = self.new_instance(class)?;
        if let Some(ctor) = self.find_attribute(instance, "__ctor") {
            return match self.invoke(instance, ctor, args, OnReturn::Construct(instance)) {
                Ok(result) => Ok(result),
                Err(err) => {
                    self.release(instance);
                    Err(err)
                }
            };
        }

        let exception = self.builtins.exception;
        if self.is_instance_of(instance, exception) {
            match args {
                [] => {}
                [message] => {
                    self.heap.inc_ref(*message);
                    if let Err(err) = self.set_message(instance, *message) {
                        self.release(instance);
                        return Err(err);
                    }
                }
                _ => {
                    self.release(instance);
                    return Err(ExcType::argument_error(&name, 1, args.len()));
                }
            }
        } else if !args.is_empty() {
            self.release(instance);
            return Err(ExcType::argument_error(&name, 0, args.len()));
        }
        Ok(CallResult::Push(instance))
    }

    /// Creates an instance of `class`, duplicating every attribute along the
    /// class chain and binding the copies to the new instance.
    pub(super) fn new_instance(&mut self, class: HeapId) -> RunResult<HeapId> {
        let class_object = self.heap.get(class);
        let name = class_object.name.clone();
        let interfaces = class_object.interfaces.clone();

        // Most-derived first; a name already seen is shadowed.
        let mut inherited: IndexMap<String, HeapId> = IndexMap::new();
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let object = self.heap.get(id);
            for (attr_name, &attrib) in &object.attributes {
                inherited.entry(attr_name.clone()).or_insert(attrib);
            }
            cursor = object.parent;
        }

        for &iface in &interfaces {
            self.heap.inc_ref(iface);
        }
        let mut object = Object::new(name, ObjectKind::User)
            .with_flags(ObjectFlags::INSTANCE)
            .with_parent(Some(class));
        object.interfaces = interfaces;
        let instance = self.alloc(object)?;

        for (attr_name, attrib) in inherited {
            let ObjectKind::Attrib(attr) = &self.heap.get(attrib).kind else {
                self.release(instance);
                return Err(RunError::internal(format!("'{attr_name}' is not an attribute object")));
            };
            let mut copy = attr.clone();
            self.heap.inc_ref(copy.value);
            for default in copy.params.iter().filter_map(|param| param.default) {
                self.heap.inc_ref(default);
            }
            copy.owner = Some(instance);
            let copy = match self.alloc(Object::new(attr_name.clone(), ObjectKind::Attrib(copy))) {
                Ok(copy) => copy,
                Err(err) => {
                    self.release(instance);
                    return Err(err);
                }
            };
            self.heap.get_mut(instance).attributes.insert(attr_name, copy);
        }
        Ok(instance)
    }

    /// Calls a method attribute loaded from `receiver`.
    pub(super) fn call_method(&mut self, receiver: HeapId, attrib: HeapId, args: &[HeapId]) -> RunResult<CallResult> {
        let attrib_object = self.heap.get(attrib);
        let ObjectKind::Attrib(attr) = &attrib_object.kind else {
            return Err(RunError::internal("bound method does not hold an attribute"));
        };
        let name = attrib_object.name.as_str();
        let receiver_object = self.heap.get(receiver);

        if attr.kind != AttribKind::Method {
            return Err(ExcType::call_error(format!("'{name}' is not a method")));
        }
        if name == "__ctor" || name == "__dtor" {
            return Err(ExcType::call_error(format!("'{name}' cannot be called directly")));
        }
        if attr.is_abstract() {
            return Err(ExcType::call_error(format!("cannot call abstract method '{name}'")));
        }
        if receiver_object.is_class() && !attr.is_static() {
            return Err(ExcType::call_error(format!(
                "cannot call non-static method '{name}' on class '{}'",
                receiver_object.name
            )));
        }
        if receiver_object.is_instance() && attr.is_static() {
            return Err(ExcType::call_error(format!(
                "cannot call static method '{name}' on an instance"
            )));
        }
        self.invoke(receiver, attrib, args, OnReturn::Push)
    }

    /// Runs a method attribute with `receiver` as `self`.
    ///
    /// Nothing is consumed when an error is returned.
    fn invoke(&mut self, receiver: HeapId, attrib: HeapId, args: &[HeapId], on_return: OnReturn) -> RunResult<CallResult> {
        let attrib_object = self.heap.get(attrib);
        let ObjectKind::Attrib(attr) = &attrib_object.kind else {
            return Err(RunError::internal("method is not an attribute object"));
        };
        let method_name = attrib_object.name.clone();
        let declared_in = attr.declared_in;
        let ObjectKind::Callable(callable) = self.heap.get(attr.value).kind else {
            return Err(ExcType::call_error(format!("'{method_name}' has no body")));
        };

        let codeframe = match callable {
            Callable::Native(native) => {
                let value = self.call_native(native, Some(receiver), args)?;
                return Ok(CallResult::Push(match on_return {
                    OnReturn::Push => value,
                    OnReturn::Construct(instance) => {
                        self.release(value);
                        instance
                    }
                }));
            }
            Callable::Code(codeframe) => codeframe,
        };

        let class_name = declared_in.map_or("?", |class| self.heap.get(class).name.as_str());
        let qualified = format!("{class_name}::{method_name}");
        if args.len() > attr.params.len() {
            return Err(ExcType::argument_error(&qualified, attr.params.len(), args.len()));
        }
        let mut bound = Vec::with_capacity(attr.params.len());
        for (index, param) in attr.params.iter().enumerate() {
            match args.get(index).copied().or(param.default) {
                Some(value) => bound.push((param.name.clone(), value)),
                None => {
                    return Err(SimpleException::new_msg(
                        ExcType::ArgumentException,
                        format!("{qualified}() missing required argument '{}'", param.name),
                    )
                    .into());
                }
            }
        }
        self.heap.tracker().check_recursion_depth(self.frames.len())?;

        let parent_scope = match declared_in.and_then(|class| self.heap.get(class).parent) {
            Some(class) => {
                self.heap.inc_ref(receiver);
                self.alloc(Object::new(
                    "parent",
                    ObjectKind::ParentScope {
                        instance: receiver,
                        class,
                    },
                ))?
            }
            None => self.null(),
        };

        let mut locals = IndexMap::with_capacity(bound.len() + 2);
        self.heap.inc_ref(receiver);
        locals.insert("self".to_owned(), receiver);
        locals.insert("parent".to_owned(), parent_scope);
        for (name, value) in bound {
            self.heap.inc_ref(value);
            if let Some(old) = locals.insert(name, value) {
                self.release(old);
            }
        }

        let code = std::sync::Arc::clone(&self.codeframes.get(codeframe).bytecode);
        self.frames.push(Frame::method(
            codeframe,
            code,
            qualified,
            locals,
            declared_in,
            on_return,
        ));
        let depth = self.frames.len();
        if let Some(frame) = self.frames.last() {
            self.tracer.on_call(&frame.name, depth);
        }
        Ok(CallResult::FramePushed)
    }
}
