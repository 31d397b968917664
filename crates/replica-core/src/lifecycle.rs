//! Lifecycle callbacks and the blocked-calls gate
//!
//! A host type may declare up to four callbacks. The native clone primitive
//! would run them before the bridge restores the fields they read, so the
//! bridge suspends them per concrete type through [`BlockedCalls`] and
//! replays them itself once restoration is done.
//!
//! Hosts consult [`BlockedCalls::is_blocked`] before invoking any callback;
//! that check is the whole interception contract.

use crate::cache::SharedLru;
use crate::host::ObjectId;
use crate::types::{TypeKey, TypeRegistry};
use crate::value::Instance;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// The fixed set of callbacks a type may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Runs on the source before its fields are captured
    BeforeSerialize,
    /// Runs on the clone after its fields are restored
    AfterDeserialize,
    /// One-time initialization (only for nodes active in their tree)
    Initialize,
    /// Enable notification (only for enabled members of active nodes)
    Enable,
}

impl HookKind {
    /// All kinds, in replay order after the pre-clone callback
    pub const ALL: [HookKind; 4] = [
        HookKind::BeforeSerialize,
        HookKind::AfterDeserialize,
        HookKind::Initialize,
        HookKind::Enable,
    ];

    fn slot(self) -> usize {
        match self {
            HookKind::BeforeSerialize => 0,
            HookKind::AfterDeserialize => 1,
            HookKind::Initialize => 2,
            HookKind::Enable => 3,
        }
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            HookKind::BeforeSerialize => "before_serialize",
            HookKind::AfterDeserialize => "after_deserialize",
            HookKind::Initialize => "initialize",
            HookKind::Enable => "enable",
        }
    }
}

/// Failure reported by a user callback
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Create a hook error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A lifecycle callback: receives the member's identity and its fields
pub type HookFn = Arc<dyn Fn(ObjectId, &mut Instance) -> Result<(), HookError> + Send + Sync>;

/// Callbacks declared directly on one type
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    slots: [Option<HookFn>; 4],
}

impl LifecycleHooks {
    /// Get the callback of a kind
    pub fn get(&self, kind: HookKind) -> Option<&HookFn> {
        self.slots[kind.slot()].as_ref()
    }

    /// Set the callback of a kind
    pub fn set(&mut self, kind: HookKind, hook: HookFn) {
        self.slots[kind.slot()] = Some(hook);
    }

    /// Check if no callback is declared
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let declared: Vec<&str> = HookKind::ALL
            .iter()
            .filter(|k| self.get(**k).is_some())
            .map(|k| k.name())
            .collect();
        f.debug_tuple("LifecycleHooks").field(&declared).finish()
    }
}

/// Invoke a callback, turning panics into [`HookError`]
pub fn call_hook(hook: &HookFn, id: ObjectId, instance: &mut Instance) -> Result<(), HookError> {
    match catch_unwind(AssertUnwindSafe(|| hook(id, instance))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback panicked".to_string());
            Err(HookError::new(message))
        }
    }
}

/// Reference-counted registry of types whose native callbacks are suspended
///
/// Overlapping clone operations may block the same type; each `block` must
/// be paired with one `unblock`, and the type stays blocked until the count
/// drops to zero.
#[derive(Debug, Default)]
pub struct BlockedCalls {
    counts: DashMap<TypeKey, usize>,
}

impl BlockedCalls {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend native callbacks for a type (nestable)
    pub fn block(&self, ty: TypeKey) {
        *self.counts.entry(ty).or_insert(0) += 1;
    }

    /// Release one block on a type
    pub fn unblock(&self, ty: TypeKey) {
        if let Entry::Occupied(mut entry) = self.counts.entry(ty) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// Check if native callbacks for a concrete type must be skipped
    pub fn is_blocked(&self, ty: TypeKey) -> bool {
        self.counts.contains_key(&ty)
    }

    /// Current block count of a type
    pub fn count(&self, ty: TypeKey) -> usize {
        self.counts.get(&ty).map(|c| *c).unwrap_or(0)
    }

    /// Number of blocked types
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Check if nothing is blocked
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Resolves callbacks with virtual dispatch through the user ancestry
///
/// The nearest declaring type wins; framework types end the walk. Results,
/// including "no callback", are cached per kind.
pub struct HookResolver {
    registry: Arc<TypeRegistry>,
    caches: [SharedLru<TypeKey, Option<HookFn>>; 4],
}

impl HookResolver {
    /// Create a resolver whose per-kind caches hold `capacity` types
    pub fn new(registry: Arc<TypeRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            caches: [
                SharedLru::new(capacity),
                SharedLru::new(capacity),
                SharedLru::new(capacity),
                SharedLru::new(capacity),
            ],
        }
    }

    /// Resolve the callback of a kind for a concrete type
    pub fn resolve(&self, ty: TypeKey, kind: HookKind) -> Option<HookFn> {
        self.caches[kind.slot()].get_or_compute(ty, || {
            let desc = self.registry.get(ty)?;
            if desc.is_framework() {
                return None;
            }
            if let Some(hook) = desc.hooks.get(kind) {
                return Some(hook.clone());
            }
            desc.base.and_then(|base| self.resolve(base, kind))
        })
    }

    /// Check if a type resolves any callback
    pub fn implements_any(&self, ty: TypeKey) -> bool {
        HookKind::ALL.iter().any(|k| self.resolve(ty, *k).is_some())
    }
}

impl fmt::Debug for HookResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookResolver").finish_non_exhaustive()
    }
}
