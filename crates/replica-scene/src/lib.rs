//! Replica Scene: in-memory reference host
//!
//! A tree of entities carrying members, plus free-standing assets, behind the
//! [`replica_core::Host`] trait. Its native clone behaves like a typical
//! engine serializer: it copies only public (or opted-in) fields of
//! natively serializable types, rewires references inside the cloned
//! subtree, and fires lifecycle callbacks in its own order unless the
//! bridge has suspended them.
//!
//! # Example
//!
//! ```
//! use replica_core::{BlockedCalls, BridgeConfig, CloneBridge, FieldSpec, Host, TypeKind, TypeRegistry};
//! use replica_scene::Scene;
//! use std::sync::Arc;
//!
//! let mut builder = TypeRegistry::builder();
//! let int = builder.int();
//! let behaviour = builder.behaviour();
//! let counter = builder
//!     .declare("game::Counter", TypeKind::HostObject)
//!     .base(behaviour)
//!     .field(FieldSpec::public("count", int))
//!     .finish();
//! let registry = Arc::new(builder.build().unwrap());
//!
//! let gate = Arc::new(BlockedCalls::new());
//! let bridge = CloneBridge::new(Arc::clone(&registry), Arc::clone(&gate), &BridgeConfig::default());
//! let mut scene = Scene::new(registry, gate);
//!
//! let root = scene.spawn_entity("Root");
//! let member = scene.add_member(root, counter).unwrap();
//! scene.set_field(member, "count", 3i64.into()).unwrap();
//!
//! let outcome = bridge.instantiate(&mut scene, root).unwrap();
//! let copy = scene.members(outcome.clone)[0];
//! assert_eq!(scene.field(copy, "count").unwrap().as_int(), Some(3));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod native;
pub mod scene;

pub use scene::{CloneQuirks, Scene};

use replica_core::HostError;
use thiserror::Error;

/// Errors raised by the scene's own API
#[derive(Debug, Error)]
pub enum SceneError {
    /// Host-level failure
    #[error(transparent)]
    Host(#[from] HostError),

    /// A value does not fit the declared field type
    #[error("Field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        /// Field name
        field: String,
        /// Declared type name
        expected: String,
        /// Kind of the offered value
        found: &'static str,
    },

    /// The type cannot be attached to an entity
    #[error("Type '{0}' is not a member type")]
    NotAMemberType(String),

    /// The type cannot be registered as an asset
    #[error("Type '{0}' is not an asset type")]
    NotAnAssetType(String),
}

/// Scene API result
pub type SceneResult<T> = Result<T, SceneError>;
