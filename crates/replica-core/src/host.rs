//! Host runtime interface
//!
//! The bridge never owns the object tree. It talks to whatever runtime holds
//! it through the [`Host`] trait: tree enumeration, object identity, field
//! storage and the opaque native clone primitive.

use crate::types::{RegistryError, TypeKey};
use crate::value::Instance;
use std::fmt;
use thiserror::Error;

/// Stable, process-unique identity of a host object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Build an identity from its integer token
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Integer token of this identity
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Category of a host object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Tree node owning members and children
    Entity,
    /// Component attached to an entity
    Member,
    /// Free-standing object outside any tree
    Asset,
}

/// Errors raised by a host
#[derive(Debug, Error)]
pub enum HostError {
    /// No such object
    #[error("Unknown object {0}")]
    UnknownObject(ObjectId),

    /// The object has been destroyed
    #[error("Object {0} has been destroyed")]
    Destroyed(ObjectId),

    /// The object is not of the expected kind
    #[error("Object {id} is not an {expected:?}")]
    WrongKind {
        /// Offending object
        id: ObjectId,
        /// Kind the operation needs
        expected: ObjectKind,
    },

    /// No field with that name on the object's type
    #[error("Object {id} has no field '{field}'")]
    UnknownField {
        /// Object
        id: ObjectId,
        /// Requested field
        field: String,
    },

    /// Type metadata problem
    #[error(transparent)]
    Type(#[from] RegistryError),

    /// The native clone failed
    #[error("Native clone failed: {0}")]
    Clone(String),
}

/// Destroyed-handle check, the only host capability the correlation map needs
pub trait Liveness {
    /// Check if an object still exists
    fn is_alive(&self, id: ObjectId) -> bool;
}

/// A host runtime holding a tree of entities and their members
pub trait Host: Liveness {
    /// Category of an object
    fn object_kind(&self, id: ObjectId) -> Option<ObjectKind>;

    /// Concrete type of an object
    fn type_of(&self, id: ObjectId) -> Option<TypeKey>;

    /// The entity itself, or the entity owning a member; `None` for assets
    fn entity_of(&self, id: ObjectId) -> Option<ObjectId>;

    /// Direct children of an entity, in order
    fn children(&self, entity: ObjectId) -> Vec<ObjectId>;

    /// Members attached to an entity, in order
    fn members(&self, entity: ObjectId) -> Vec<ObjectId>;

    /// Check if an entity (or a member's entity) is active in its tree
    fn is_active_in_tree(&self, id: ObjectId) -> bool;

    /// Check if a member is enabled
    fn is_enabled(&self, member: ObjectId) -> bool;

    /// Field storage of a member or asset
    fn instance(&self, id: ObjectId) -> Option<&Instance>;

    /// Mutable field storage of a member or asset
    fn instance_mut(&mut self, id: ObjectId) -> Option<&mut Instance>;

    /// Register a new free-standing asset
    fn spawn_asset(&mut self, instance: Instance) -> Result<ObjectId, HostError>;

    /// Native clone primitive: duplicate the tree rooted at the entity of `source`
    ///
    /// The result is isomorphic in shape but only natively serializable
    /// fields are copied.
    fn clone_native(&mut self, source: ObjectId) -> Result<ObjectId, HostError>;
}

/// Subscriber to host destruction events
pub trait DestructionListener: Send + Sync {
    /// An object was explicitly destroyed
    fn on_destroyed(&self, id: ObjectId, liveness: &dyn Liveness);

    /// A whole tree was torn down; dead handles should be swept
    fn on_teardown(&self, liveness: &dyn Liveness);
}
