//! Attribute access, and construction of attributes, classes and interfaces.

use smallvec::SmallVec;

use super::Vm;
use crate::{
    ast::{Access, AttribKind, Visibility},
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapId,
    io::PrintWriter,
    object::{Attribute, Object, ObjectFlags, ObjectKind, ParamInfo},
    resource::ResourceTracker,
    tracer::VmTracer,
};

/// Operands of `BUILD_CLASS` and `BUILD_INTERFACE`, popped off the stack.
struct ClassParts {
    name: String,
    modifiers: u16,
    interfaces: Vec<HeapId>,
    parent: HeapId,
    /// `(name, attribute)` in declaration order.
    attributes: Vec<(String, HeapId)>,
    interface: bool,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    // ========================================================================
    // Lookup
    // ========================================================================

    /// Finds an attribute on `object` or along its parent chain.
    pub(crate) fn find_attribute(&self, object: HeapId, name: &str) -> Option<HeapId> {
        let mut cursor = Some(object);
        while let Some(id) = cursor {
            let object = self.heap.get(id);
            if let Some(&attrib) = object.attributes.get(name) {
                return Some(attrib);
            }
            cursor = object.parent;
        }
        None
    }

    /// Whether `ancestor` is `class` or one of its superclasses.
    fn class_chain_contains(&self, class: HeapId, ancestor: HeapId) -> bool {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.heap.get(id).parent;
        }
        false
    }

    fn attribute(&self, attrib: HeapId) -> RunResult<&Attribute> {
        match &self.heap.get(attrib).kind {
            ObjectKind::Attrib(attr) => Ok(attr),
            _ => Err(RunError::internal("expected an attribute object")),
        }
    }

    fn check_visibility(&self, attr: &Attribute, name: &str) -> RunResult<()> {
        let context = self.frame().class_context;
        let allowed = match attr.visibility {
            Visibility::Public => true,
            Visibility::Private => context.is_some() && context == attr.declared_in,
            Visibility::Protected => match (context, attr.declared_in) {
                (Some(context), Some(declared_in)) => self.class_chain_contains(context, declared_in),
                _ => false,
            },
        };
        if allowed {
            return Ok(());
        }
        let class = attr.declared_in.map_or("?", |class| self.heap.get(class).name.as_str());
        Err(ExcType::visibility_error(attr.visibility, class, name))
    }

    // ========================================================================
    // LOAD_ATTRIB / STORE_ATTRIB
    // ========================================================================

    pub(super) fn load_attrib(&mut self, name: &str) -> RunResult<()> {
        let object = self.pop()?;
        let result = self.resolve_attrib(object, name);
        self.release(object);
        let value = result?;
        self.push(value);
        Ok(())
    }

    /// Resolves `object.name` to a new reference: a bound method for methods,
    /// the stored value otherwise.
    fn resolve_attrib(&mut self, object: HeapId, name: &str) -> RunResult<HeapId> {
        let (lookup, receiver) = match self.heap.get(object).kind {
            ObjectKind::ParentScope { instance, class } => (class, instance),
            _ => (object, object),
        };
        let attrib = self
            .find_attribute(lookup, name)
            .ok_or_else(|| ExcType::attribute_error(self.heap.get(object).type_name(), name))?;
        let attr = self.attribute(attrib)?;
        self.check_visibility(attr, name)?;

        if attr.kind == AttribKind::Method {
            self.heap.inc_ref(receiver);
            self.heap.inc_ref(attrib);
            return self.alloc(Object::new(name, ObjectKind::BoundMethod { receiver, attrib }));
        }

        let mut value = attr.value;
        if lookup != receiver
            && let Some(own) = self.heap.get(receiver).attributes.get(name)
        {
            value = self.attribute(*own)?.value;
        }
        self.heap.inc_ref(value);
        Ok(value)
    }

    /// `STORE_ATTRIB`: the object is on top, the value below it.
    pub(super) fn store_attrib(&mut self, name: &str) -> RunResult<()> {
        let object = self.pop()?;
        let value = match self.pop() {
            Ok(value) => value,
            Err(err) => {
                self.release(object);
                return Err(err);
            }
        };
        let result = self.assign_attrib(object, name, value);
        self.release(object);
        result
    }

    /// Stores `value` (one reference) into `object.name`. The value is
    /// released when the store is refused.
    fn assign_attrib(&mut self, object: HeapId, name: &str, value: HeapId) -> RunResult<()> {
        match self.check_assignable(object, name) {
            Ok(attrib) => self.replace_attrib_value(attrib, value),
            Err(err) => {
                self.release(value);
                Err(err)
            }
        }
    }

    fn check_assignable(&self, object: HeapId, name: &str) -> RunResult<HeapId> {
        let target = self.heap.get(object);
        if matches!(target.kind, ObjectKind::ParentScope { .. }) {
            return Err(SimpleException::new_msg(
                ExcType::AttributeException,
                format!("cannot assign '{name}' through parent"),
            )
            .into());
        }
        let attrib = if target.is_class() || target.is_interface() {
            self.find_attribute(object, name)
        } else {
            target.attributes.get(name).copied()
        }
        .ok_or_else(|| ExcType::attribute_error(target.type_name(), name))?;

        let attr = self.attribute(attrib)?;
        self.check_visibility(attr, name)?;
        let refused = match attr.kind {
            AttribKind::Constant => Some("constant"),
            AttribKind::Method => Some("method"),
            AttribKind::Property if attr.access == Access::ReadOnly && self.frame().class_context != attr.declared_in => {
                Some("read-only property")
            }
            AttribKind::Property => None,
        };
        match refused {
            Some(what) => Err(SimpleException::new_msg(
                ExcType::AttributeException,
                format!("cannot assign to {what} '{name}'"),
            )
            .into()),
            None => Ok(attrib),
        }
    }

    /// Swaps the value bound to an attribute object, releasing the old one.
    pub(super) fn replace_attrib_value(&mut self, attrib: HeapId, value: HeapId) -> RunResult<()> {
        let ObjectKind::Attrib(attr) = &mut self.heap.get_mut(attrib).kind else {
            self.release(value);
            return Err(RunError::internal("expected an attribute object"));
        };
        let old = std::mem::replace(&mut attr.value, value);
        self.release(old);
        Ok(())
    }

    // ========================================================================
    // Stack operand helpers
    // ========================================================================

    pub(super) fn pop_u16(&mut self, what: &str) -> RunResult<u16> {
        let id = self.pop()?;
        let value = match self.heap.get(id).kind {
            ObjectKind::Numerical(n) => u16::try_from(n).ok(),
            _ => None,
        };
        self.release(id);
        value.ok_or_else(|| RunError::internal(format!("expected {what} on the stack")))
    }

    pub(super) fn pop_string(&mut self, what: &str) -> RunResult<String> {
        self.pop_opt_string(what)?
            .ok_or_else(|| RunError::internal(format!("expected {what} on the stack")))
    }

    /// Pops a string, or `null` as `None`.
    fn pop_opt_string(&mut self, what: &str) -> RunResult<Option<String>> {
        let id = self.pop()?;
        let value = match &self.heap.get(id).kind {
            ObjectKind::String(s) => Ok(Some(s.clone())),
            ObjectKind::Null => Ok(None),
            _ => Err(RunError::internal(format!("expected {what} on the stack"))),
        };
        self.release(id);
        value
    }

    // ========================================================================
    // BUILD_ATTRIB
    // ========================================================================

    pub(super) fn build_attrib(&mut self, kind: u16, argc: usize) -> RunResult<()> {
        let kind = u8::try_from(kind)
            .ok()
            .and_then(AttribKind::from_repr)
            .ok_or_else(|| RunError::internal(format!("unknown attribute kind {kind}")))?;
        let access = self.pop_u16("attribute access")?;
        let access = u8::try_from(access)
            .ok()
            .and_then(Access::from_repr)
            .ok_or_else(|| RunError::internal("unknown attribute access"))?;
        let visibility = self.pop_u16("attribute visibility")?;
        let visibility = u8::try_from(visibility)
            .ok()
            .and_then(Visibility::from_repr)
            .ok_or_else(|| RunError::internal("unknown attribute visibility"))?;

        let mut method_flags = 0;
        let mut params = SmallVec::new();
        let value = match kind {
            AttribKind::Method => {
                let code = self.pop()?;
                match self.pop_method_signature(argc) {
                    Ok((flags, signature)) => {
                        method_flags = flags;
                        params = signature;
                    }
                    Err(err) => {
                        self.release(code);
                        return Err(err);
                    }
                }
                code
            }
            AttribKind::Property | AttribKind::Constant => self.pop()?,
        };

        let attr = Attribute {
            kind,
            visibility,
            access,
            method_flags,
            params,
            value,
            owner: None,
            declared_in: None,
        };
        let attrib = self.alloc(Object::new("", ObjectKind::Attrib(attr)))?;
        self.push(attrib);
        Ok(())
    }

    /// Pops the method flags and `argc` parameter triples.
    fn pop_method_signature(&mut self, argc: usize) -> RunResult<(u16, SmallVec<[ParamInfo; 4]>)> {
        let flags = self.pop_u16("method flags")?;
        let mut params: SmallVec<[ParamInfo; 4]> = SmallVec::with_capacity(argc);
        for _ in 0..argc {
            let result = self.pop_parameter();
            match result {
                Ok(param) => params.push(param),
                Err(err) => {
                    let defaults: Vec<HeapId> = params.iter().filter_map(|p| p.default).collect();
                    self.release_all(defaults);
                    return Err(err);
                }
            }
        }
        Ok((flags, params))
    }

    fn pop_parameter(&mut self) -> RunResult<ParamInfo> {
        let default = self.pop()?;
        let default = if self.is_null(default) {
            self.release(default);
            None
        } else {
            Some(default)
        };
        let names = self
            .pop_string("parameter name")
            .and_then(|name| Ok((name, self.pop_opt_string("parameter type hint")?)));
        match names {
            Ok((name, typehint)) => Ok(ParamInfo { name, typehint, default }),
            Err(err) => {
                if let Some(default) = default {
                    self.release(default);
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // BUILD_CLASS / BUILD_INTERFACE
    // ========================================================================

    pub(super) fn build_class(&mut self, n_attrs: usize, n_ifaces: usize, interface: bool) -> RunResult<()> {
        let name = self.pop_string("class name")?;
        let modifiers = self.pop_u16("class modifiers")?;
        let interfaces = self.pop_n(n_ifaces)?;
        let parent = self.pop()?;
        let mut attributes = Vec::with_capacity(n_attrs);
        for _ in 0..n_attrs {
            let attr_name = self.pop_string("attribute name")?;
            let attrib = self.pop()?;
            attributes.push((attr_name, attrib));
        }
        attributes.reverse();

        let class = self.create_class(ClassParts {
            name,
            modifiers,
            interfaces,
            parent,
            attributes,
            interface,
        })?;
        self.heap.inc_ref(class);
        self.user_objects.push(class);
        self.push(class);
        Ok(())
    }

    fn create_class(&mut self, parts: ClassParts) -> RunResult<HeapId> {
        let ClassParts {
            name,
            modifiers,
            interfaces,
            parent,
            attributes,
            interface,
        } = parts;

        // The parent link is not owned; classes stay alive through `user_objects`.
        let check = self.check_class_links(&name, parent, &interfaces, interface);
        self.release(parent);
        let parent = match check {
            Ok(parent) => parent,
            Err(err) => {
                self.release_all(interfaces);
                self.release_all(attributes.into_iter().map(|(_, attrib)| attrib));
                return Err(err);
            }
        };

        let kind_flag = if interface {
            ObjectFlags::INTERFACE
        } else {
            ObjectFlags::CLASS
        };
        let mut object = Object::new(name.as_str(), ObjectKind::User)
            .with_flags(kind_flag.with(ObjectFlags::from_modifiers(modifiers)))
            .with_parent(parent);
        object.interfaces = interfaces;
        object.attributes = attributes.into_iter().collect();
        let class = self.alloc(object)?;

        let bound: Vec<(String, HeapId)> = self
            .heap
            .get(class)
            .attributes
            .iter()
            .map(|(attr_name, &attrib)| (attr_name.clone(), attrib))
            .collect();
        for (attr_name, attrib) in bound {
            let object = self.heap.get_mut(attrib);
            object.name = attr_name;
            if let ObjectKind::Attrib(attr) = &mut object.kind {
                attr.owner = Some(class);
                attr.declared_in = Some(class);
            }
        }

        let abstract_class = self.heap.get(class).flags.contains(ObjectFlags::ABSTRACT);
        if !interface
            && !abstract_class
            && let Err(err) = self.check_conformance(class)
        {
            self.release(class);
            return Err(err);
        }
        tracing::trace!(class = %name, interface, "built class");
        Ok(class)
    }

    /// Validates the parent and interfaces of a new class. Returns the parent link.
    fn check_class_links(
        &self,
        name: &str,
        parent: HeapId,
        interfaces: &[HeapId],
        interface: bool,
    ) -> RunResult<Option<HeapId>> {
        let parent = if self.is_null(parent) {
            (!interface).then_some(self.builtins.object)
        } else {
            let parent_object = self.heap.get(parent);
            if interface && !parent_object.is_interface() {
                return Err(ExcType::type_error(format!(
                    "interface '{name}' can only extend interfaces, not '{}'",
                    parent_object.type_name()
                )));
            }
            if !interface && !parent_object.is_class() {
                return Err(ExcType::type_error(format!(
                    "class '{name}' cannot extend '{}'",
                    parent_object.type_name()
                )));
            }
            if parent_object.flags.contains(ObjectFlags::FINAL) {
                return Err(ExcType::type_error(format!(
                    "class '{name}' cannot extend final class '{}'",
                    parent_object.name
                )));
            }
            Some(parent)
        };
        for &iface in interfaces {
            let iface_object = self.heap.get(iface);
            if !iface_object.is_interface() {
                return Err(ExcType::type_error(format!(
                    "'{name}' cannot implement '{}': not an interface",
                    iface_object.type_name()
                )));
            }
        }
        Ok(parent)
    }

    /// Checks that `class` provides every attribute its interfaces declare.
    fn check_conformance(&self, class: HeapId) -> RunResult<()> {
        let class_object = self.heap.get(class);
        for &iface in &class_object.interfaces {
            let mut cursor = Some(iface);
            while let Some(current) = cursor {
                let iface_object = self.heap.get(current);
                for (attr_name, &required) in &iface_object.attributes {
                    let failure = match self.find_attribute(class, attr_name) {
                        None => Some("is missing"),
                        Some(provided) => conformance_failure(self.attribute(required)?, self.attribute(provided)?),
                    };
                    if let Some(failure) = failure {
                        return Err(SimpleException::new_msg(
                            ExcType::InterfaceException,
                            format!(
                                "class '{}' does not implement '{}::{attr_name}': attribute {failure}",
                                class_object.name, iface_object.name
                            ),
                        )
                        .into());
                    }
                }
                cursor = iface_object.parent;
            }
        }
        Ok(())
    }
}

/// Describes why `provided` does not satisfy `required`.
fn conformance_failure(required: &Attribute, provided: &Attribute) -> Option<&'static str> {
    if required.kind != provided.kind {
        Some("has the wrong kind")
    } else if required.visibility != provided.visibility {
        Some("has the wrong visibility")
    } else if required.access != provided.access {
        Some("has the wrong access")
    } else if required.kind == AttribKind::Method && required.signature() != provided.signature() {
        Some("has a different signature")
    } else if required.kind == AttribKind::Method && provided.is_abstract() {
        Some("is abstract")
    } else {
        None
    }
}
