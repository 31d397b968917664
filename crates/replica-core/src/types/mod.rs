//! Runtime type information for host objects and managed values
//!
//! The bridge reasons about fields through this explicit metadata instead of
//! a language reflection facility. Every type the host can hand us (host
//! objects, managed classes, structs, collections, primitives) is described
//! by a [`TypeDescriptor`] registered once at start-up in a
//! [`TypeRegistry`].

mod registry;
mod resolver;

pub use registry::{
    Ancestors, FieldSpec, RegistryError, TypeDefBuilder, TypeRegistry, TypeRegistryBuilder,
};
pub use resolver::TypeResolver;

use crate::lifecycle::LifecycleHooks;
use crate::value::Instance;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a registered type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(pub(crate) u32);

impl TypeKey {
    /// Raw index into the registry
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Primitive scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// Boolean
    Bool,
    /// 64-bit signed integer
    Int,
    /// 64-bit float
    Float,
    /// UTF-8 string (nullable, like a reference)
    Str,
}

/// Shape of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Scalar value
    Primitive(PrimitiveKind),
    /// Enumeration stored as its integer discriminant
    Enum,
    /// Value type copied on assignment
    Struct,
    /// Managed reference type with identity
    Class,
    /// Growable list of elements
    List(TypeKey),
    /// Fixed-length array of elements
    Array(TypeKey),
    /// Dictionary; keys may be arbitrary values
    Map(TypeKey, TypeKey),
    /// Host-native object (entity, member, asset and their subclasses)
    HostObject,
}

impl TypeKind {
    /// Check if values of this kind are held by reference
    pub fn is_reference(self) -> bool {
        !matches!(
            self,
            TypeKind::Primitive(PrimitiveKind::Bool)
                | TypeKind::Primitive(PrimitiveKind::Int)
                | TypeKind::Primitive(PrimitiveKind::Float)
                | TypeKind::Enum
                | TypeKind::Struct
        )
    }
}

/// Where a type comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeOrigin {
    /// Shipped with the host runtime; ancestry walks stop here
    Framework,
    /// Declared by user code
    User,
}

/// Field visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Publicly visible
    Public,
    /// Private or internal
    Private,
}

/// Serialization markers attached to a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldAttributes {
    /// Opt a non-public field into serialization
    pub serialize_field: bool,
    /// Serialize by identity; overrides native serializability
    pub serialize_reference: bool,
    /// Never serialize
    pub non_serialized: bool,
    /// Identity tokens keep pointing at the original objects after a clone
    pub passive: bool,
}

/// Identity of a declared field: owner type plus declaration index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    /// Declaring type
    pub owner: TypeKey,
    /// Position in the owner's declared field list
    pub index: u32,
}

/// Metadata for one declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Declaring type
    pub owner: TypeKey,
    /// Position in the owner's declared field list
    pub index: u32,
    /// Field name
    pub name: String,
    /// Declared (static) type
    pub ty: TypeKey,
    /// Visibility
    pub visibility: Visibility,
    /// Static fields have no instance slot
    pub is_static: bool,
    /// Serialization markers
    pub attributes: FieldAttributes,
    /// Slot in an instance of the owner (or any subclass); `None` for statics
    pub slot: Option<usize>,
}

impl FieldDescriptor {
    /// Identity of this field
    pub fn key(&self) -> FieldKey {
        FieldKey {
            owner: self.owner,
            index: self.index,
        }
    }

    /// Check if the field is public
    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Check if the field is marked for by-reference serialization
    pub fn by_reference(&self) -> bool {
        self.attributes.serialize_reference
    }
}

/// Initializer run after slot defaults when constructing an instance
pub type Initializer = Arc<dyn Fn(&mut Instance) + Send + Sync>;

/// Same-type copy constructor
pub type CopyFn = Arc<dyn Fn(&Instance) -> Instance + Send + Sync>;

/// Full description of one type
#[derive(Clone)]
pub struct TypeDescriptor {
    /// Registry key
    pub key: TypeKey,
    /// Qualified, stable name
    pub name: String,
    /// Shape
    pub kind: TypeKind,
    /// Framework or user type
    pub origin: TypeOrigin,
    /// Base type, if any
    pub base: Option<TypeKey>,
    /// Abstract types cannot be constructed directly
    pub is_abstract: bool,
    /// Marked serializable (required for bridging structs and classes)
    pub serializable: bool,
    /// Fields declared directly on this type
    pub fields: Vec<FieldDescriptor>,
    /// Number of instance slots, ancestors included
    pub slot_count: usize,
    /// Lifecycle callbacks declared on this type
    pub hooks: LifecycleHooks,
    /// Field initializers
    pub initializer: Option<Initializer>,
    /// Constructor taking one argument of this same type
    pub copy_constructor: Option<CopyFn>,
}

impl TypeDescriptor {
    /// Short name (last path segment)
    pub fn short_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }

    /// Check if this type ships with the host
    pub fn is_framework(&self) -> bool {
        self.origin == TypeOrigin::Framework
    }

    /// Check if this is a host-native object type
    pub fn is_host_object(&self) -> bool {
        self.kind == TypeKind::HostObject
    }

    /// Find a field declared on this type by name
    pub fn declared_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("base", &self.base)
            .field("is_abstract", &self.is_abstract)
            .field("fields", &self.fields.len())
            .field("slot_count", &self.slot_count)
            .field("hooks", &self.hooks)
            .field("has_initializer", &self.initializer.is_some())
            .field("has_copy_constructor", &self.copy_constructor.is_some())
            .finish()
    }
}
