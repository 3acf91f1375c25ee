//! The runtime object model.
//!
//! Every runtime value is an [`Object`] living in the [`Heap`](crate::heap::Heap).
//! Objects share one layout: a name, flag bits, a non-owning link to the parent
//! (superclass for classes, class for instances), the interfaces they
//! implement, an attribute dictionary and a kind-specific payload.
//!
//! Attributes are objects of their own ([`ObjectKind::Attrib`]) so each binding
//! carries an independent reference count. Instantiation duplicates every
//! attribute of the class chain and re-binds the copy to the new instance.

use std::fmt;

use indexmap::IndexMap;
use smallvec::SmallVec;
use strum::IntoStaticStr;

use crate::{
    ast::{Access, AttribKind, Modifiers, Visibility},
    builtins::Native,
    heap::HeapId,
    vm::CodeframeId,
};

/// Object flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct ObjectFlags(u16);

impl ObjectFlags {
    pub const CLASS: Self = Self(0x0001);
    pub const INTERFACE: Self = Self(0x0002);
    pub const ABSTRACT: Self = Self(0x0004);
    pub const INSTANCE: Self = Self(0x0008);
    pub const IMMUTABLE: Self = Self(0x0010);
    /// Never released, whatever the reference count says.
    pub const STATIC: Self = Self(0x0020);
    pub const FINAL: Self = Self(0x0040);
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Class flags from the modifier word pushed by `BUILD_CLASS`.
    #[must_use]
    pub fn from_modifiers(bits: u16) -> Self {
        let mut flags = Self::NONE;
        if bits & Modifiers::ABSTRACT != 0 {
            flags = flags.with(Self::ABSTRACT);
        }
        if bits & Modifiers::FINAL != 0 {
            flags = flags.with(Self::FINAL);
        }
        flags
    }
}

/// A method parameter as carried by a method attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParamInfo {
    pub name: String,
    pub typehint: Option<String>,
    /// Default value; owns one reference.
    pub default: Option<HeapId>,
}

/// A class member. Lives in the heap as [`ObjectKind::Attrib`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attribute {
    pub kind: AttribKind,
    pub visibility: Visibility,
    pub access: Access,
    /// `Modifiers` bits: static, abstract, final.
    pub method_flags: u16,
    pub params: SmallVec<[ParamInfo; 4]>,
    /// Bound value; owns one reference. `null` for abstract methods.
    pub value: HeapId,
    /// The class or instance this attribute is bound to. Not owned.
    pub owner: Option<HeapId>,
    /// The class that declared the attribute; used for visibility checks. Not owned.
    pub declared_in: Option<HeapId>,
}

impl Attribute {
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.method_flags & Modifiers::STATIC != 0
    }

    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.method_flags & Modifiers::ABSTRACT != 0
    }

    /// Type hints of the parameters, used for interface conformance.
    #[must_use]
    pub fn signature(&self) -> Vec<Option<&str>> {
        self.params.iter().map(|p| p.typehint.as_deref()).collect()
    }
}

/// What a callable runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callable {
    /// A compiled method body.
    Code(CodeframeId),
    /// A function implemented by the VM.
    Native(Native),
}

/// Key of a hash entry. Only scalar values can be keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HashKey {
    Null,
    Boolean(bool),
    Number(i64),
    String(String),
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Kind-specific payload of an object.
#[derive(Debug, IntoStaticStr)]
pub(crate) enum ObjectKind {
    Null,
    Boolean(bool),
    Numerical(i64),
    String(String),
    Regex(regex::Regex),
    Callable(Callable),
    Tuple(Vec<HeapId>),
    List(Vec<HeapId>),
    /// Insertion-ordered; each entry owns its key object and value.
    Hash(IndexMap<HashKey, (HeapId, HeapId)>),
    /// Walks a list, tuple or hash. Owns its source.
    Iterator { source: HeapId, position: usize },
    /// A method attribute together with the receiver it was loaded from. Owns both.
    BoundMethod { receiver: HeapId, attrib: HeapId },
    /// The value of `parent` inside a method: resolves attributes on `class`
    /// while binding them to `instance`. Owns the instance.
    ParentScope { instance: HeapId, class: HeapId },
    Attrib(Attribute),
    /// A class, interface or instance; everything lives in the attribute dictionary.
    User,
}

/// A heap object.
#[derive(Debug)]
pub(crate) struct Object {
    pub name: String,
    pub flags: ObjectFlags,
    /// Superclass of a class, class of an instance or datastructure. Not owned.
    pub parent: Option<HeapId>,
    /// Implemented interfaces; each owns one reference.
    pub interfaces: Vec<HeapId>,
    /// Attribute objects by name; each owns one reference.
    pub attributes: IndexMap<String, HeapId>,
    pub kind: ObjectKind,
}

impl Object {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            flags: ObjectFlags::NONE,
            parent: None,
            interfaces: Vec::new(),
            attributes: IndexMap::new(),
            kind,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: Option<HeapId>) -> Self {
        self.parent = parent;
        self
    }

    #[must_use]
    pub fn is_class(&self) -> bool {
        self.flags.contains(ObjectFlags::CLASS)
    }

    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(ObjectFlags::INTERFACE)
    }

    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.flags.contains(ObjectFlags::INSTANCE)
    }

    /// Variant name used in heap statistics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        (&self.kind).into()
    }

    /// Type name shown in error messages.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match &self.kind {
            ObjectKind::Null => "null",
            ObjectKind::Boolean(_) => "boolean",
            ObjectKind::Numerical(_) => "numerical",
            ObjectKind::String(_) => "string",
            ObjectKind::Regex(_) => "regex",
            ObjectKind::Callable(_) | ObjectKind::BoundMethod { .. } => "callable",
            ObjectKind::Tuple(_) => "tuple",
            ObjectKind::List(_) => "list",
            ObjectKind::Hash(_) => "hash",
            ObjectKind::Iterator { .. } => "iterator",
            ObjectKind::ParentScope { .. } => "parent",
            ObjectKind::Attrib(_) => "attribute",
            ObjectKind::User => &self.name,
        }
    }

    /// Every heap reference this object owns, in teardown order: attributes,
    /// then interfaces, then the payload's children.
    pub fn owned_refs(&self, out: &mut Vec<HeapId>) {
        out.extend(self.attributes.values().copied());
        out.extend(self.interfaces.iter().copied());
        match &self.kind {
            ObjectKind::Tuple(items) | ObjectKind::List(items) => out.extend(items.iter().copied()),
            ObjectKind::Hash(entries) => {
                for (key, value) in entries.values() {
                    out.push(*key);
                    out.push(*value);
                }
            }
            ObjectKind::Iterator { source, .. } => out.push(*source),
            ObjectKind::BoundMethod { receiver, attrib } => {
                out.push(*receiver);
                out.push(*attrib);
            }
            ObjectKind::ParentScope { instance, .. } => out.push(*instance),
            ObjectKind::Attrib(attr) => {
                out.push(attr.value);
                out.extend(attr.params.iter().filter_map(|p| p.default));
            }
            ObjectKind::Null
            | ObjectKind::Boolean(_)
            | ObjectKind::Numerical(_)
            | ObjectKind::String(_)
            | ObjectKind::Regex(_)
            | ObjectKind::Callable(_)
            | ObjectKind::User => {}
        }
    }

    /// Rough size used by memory limits.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let payload = match &self.kind {
            ObjectKind::String(s) => s.len(),
            ObjectKind::Regex(r) => r.as_str().len() * 8,
            ObjectKind::Tuple(items) | ObjectKind::List(items) => items.len() * size_of::<HeapId>(),
            ObjectKind::Hash(entries) => entries.len() * (size_of::<HashKey>() + 2 * size_of::<HeapId>()),
            _ => 0,
        };
        size_of::<Self>() + self.name.len() + self.attributes.len() * 32 + payload
    }
}
