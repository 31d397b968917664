//! Replica Core: object graph clone bridge
//!
//! A host runtime's native clone only copies what its own serializer
//! understands. This crate wraps that clone so the copy keeps everything
//! else:
//! - Private and polymorphic fields (captured and restored through a graph codec)
//! - Shared and circular managed objects
//! - Host-object references, rewired to the corresponding clones
//! - Lifecycle callbacks, deferred until the fields they read are restored
//!
//! The host is reached only through the [`Host`] trait. See the
//! `replica-scene` crate for an in-memory implementation.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod accessor;
pub mod bridge;
pub mod cache;
pub mod capture;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod host;
pub mod lifecycle;
pub mod types;
pub mod value;
pub mod worthiness;

pub use accessor::{AccessError, AccessorCompiler, FieldAccessor};
pub use bridge::{
    BridgeReport, CloneBridge, CloneContext, CloneHooks, CloneOutcome, OperationStatus, SkipReason,
};
pub use cache::{LruCache, SharedLru};
pub use capture::{CaptureEntry, CaptureRecord, RecordPool};
pub use codec::{
    CodecError, Encoded, FieldMeta, GraphCodec, IdentityResolver, PassiveResolver, TokenPolicy,
};
pub use config::{BridgeConfig, CacheSizes, ConfigError};
pub use correlation::CorrelationMap;
pub use host::{DestructionListener, Host, HostError, Liveness, ObjectId, ObjectKind};
pub use lifecycle::{BlockedCalls, HookError, HookFn, HookKind, HookResolver, LifecycleHooks};
pub use types::{
    FieldDescriptor, FieldKey, FieldSpec, RegistryError, TypeDescriptor, TypeKey, TypeKind,
    TypeRegistry, TypeRegistryBuilder, TypeResolver,
};
pub use value::{Instance, ListRef, MapRef, ObjectRef, Value};
pub use worthiness::{BridgeTarget, WorthinessRegistry};

/// Operation-level bridge errors
///
/// Field-level problems never surface here; they are logged and counted in
/// the [`BridgeReport`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The host failed (native clone, lookups)
    #[error(transparent)]
    Host(#[from] HostError),

    /// The clone result is not part of an entity tree
    #[error("Clone result {0} is not part of a tree")]
    NotATree(ObjectId),

    /// The clone's shape differs from the captured source tree
    #[error("Clone {clone} does not match its source: {matched} nodes matched, {mismatched} missing")]
    StructureMismatch {
        /// Clone root
        clone: ObjectId,
        /// Snapshot nodes found in the clone
        matched: usize,
        /// Snapshot nodes missing from the clone
        mismatched: usize,
    },
}

/// Bridge operation result
pub type BridgeResult<T> = Result<T, BridgeError>;
