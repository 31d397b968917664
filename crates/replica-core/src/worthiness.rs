//! Type worthiness registry
//!
//! Decides which member types carry fields the native clone would lose, and
//! records those fields as [`BridgeTarget`]s. A type is worth bridging when
//! it or any user ancestor declares a target; framework types end the walk.

use crate::cache::SharedLru;
use crate::config::CacheSizes;
use crate::types::{FieldDescriptor, FieldKey, TypeDescriptor, TypeKey, TypeKind, TypeRegistry};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;

/// A field that must be captured before and restored after a clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTarget {
    /// Type that declares the field
    pub owner: TypeKey,
    /// The field
    pub field: FieldDescriptor,
}

#[derive(Default)]
struct TargetTable {
    all: Vec<BridgeTarget>,
    seen: FxHashSet<FieldKey>,
    by_owner: FxHashMap<TypeKey, Vec<usize>>,
}

impl TargetTable {
    fn insert(&mut self, target: BridgeTarget) -> bool {
        if !self.seen.insert(target.field.key()) {
            return false;
        }
        self.by_owner
            .entry(target.owner)
            .or_default()
            .push(self.all.len());
        self.all.push(target);
        true
    }
}

/// Append-only registry of bridge targets plus the memoized verdicts
pub struct WorthinessRegistry {
    registry: Arc<TypeRegistry>,
    targets: RwLock<TargetTable>,
    worth: SharedLru<TypeKey, bool>,
    native: SharedLru<TypeKey, bool>,
    debug_logs: bool,
}

impl WorthinessRegistry {
    /// Create an empty registry
    pub fn new(registry: Arc<TypeRegistry>, sizes: &CacheSizes, debug_logs: bool) -> Self {
        Self {
            registry,
            targets: RwLock::new(TargetTable::default()),
            worth: SharedLru::new(sizes.types),
            native: SharedLru::new(sizes.types),
            debug_logs,
        }
    }

    /// Scan a type and its user ancestry; returns whether it is worth bridging
    pub fn register(&self, ty: TypeKey) -> bool {
        if let Some(worth) = self.worth.try_get(&ty) {
            return worth;
        }

        // Unknown metadata counts as "nothing to bridge"
        let Some(desc) = self.registry.get(ty) else {
            return false;
        };
        if desc.is_framework() {
            self.worth.put(ty, false);
            return false;
        }

        if self.debug_logs {
            debug!(ty = %desc.name, "scanning type");
        }
        let own = self.scan_own(desc);
        let inherited = desc.base.map(|base| self.register(base)).unwrap_or(false);
        let worth = own || inherited;

        if self.debug_logs {
            debug!(ty = %desc.name, own, inherited, "worthiness resolved");
        }
        self.worth.put(ty, worth);
        worth
    }

    fn scan_own(&self, desc: &TypeDescriptor) -> bool {
        let mut found = false;
        for field in &desc.fields {
            if !self.is_candidate(field) {
                if self.debug_logs {
                    debug!(ty = %desc.name, field = %field.name, "field skipped");
                }
                continue;
            }
            found = true;
            let added = self.targets.write().insert(BridgeTarget {
                owner: desc.key,
                field: field.clone(),
            });
            if added && self.debug_logs {
                debug!(
                    ty = %desc.name,
                    field = %field.name,
                    field_type = %self.registry.name_of(field.ty),
                    "registered bridge target"
                );
            }
        }
        found
    }

    /// Check if a field must be bridged
    pub fn is_candidate(&self, field: &FieldDescriptor) -> bool {
        let attrs = field.attributes;
        if field.is_static || attrs.non_serialized {
            return false;
        }
        if self.is_natively_serializable(field.ty) && !attrs.serialize_reference {
            return false;
        }
        if !(field.is_public() || attrs.serialize_field || attrs.serialize_reference) {
            return false;
        }
        self.is_marked_serializable(field.ty)
    }

    /// Managed classes and structs must carry the serializable marker
    fn is_marked_serializable(&self, ty: TypeKey) -> bool {
        let Some(desc) = self.registry.get(ty) else {
            return false;
        };
        match desc.kind {
            TypeKind::Class | TypeKind::Struct => desc.serializable,
            TypeKind::List(elem) | TypeKind::Array(elem) => self.is_marked_serializable(elem),
            TypeKind::Map(key, value) => self.is_marked_serializable(key) && self.is_marked_serializable(value),
            _ => true,
        }
    }

    /// Check if the host's own clone already copies values of this type
    pub fn is_natively_serializable(&self, ty: TypeKey) -> bool {
        if let Some(hit) = self.native.try_get(&ty) {
            return hit;
        }
        let native = match self.registry.get(ty) {
            None => false,
            Some(desc) => match desc.kind {
                TypeKind::Primitive(_) | TypeKind::Enum | TypeKind::HostObject => true,
                TypeKind::Map(_, _) => false,
                TypeKind::List(elem) | TypeKind::Array(elem) => self.is_natively_serializable(elem),
                TypeKind::Struct | TypeKind::Class => desc.is_framework(),
            },
        };
        self.native.put(ty, native);
        native
    }

    /// Check if a type has been registered and found worthy, without scanning
    pub fn is_known_worthy(&self, ty: TypeKey) -> Option<bool> {
        self.worth.try_get(&ty)
    }

    /// Targets declared on exactly this type
    pub fn targets_for(&self, ty: TypeKey) -> Vec<BridgeTarget> {
        let table = self.targets.read();
        table
            .by_owner
            .get(&ty)
            .map(|indices| indices.iter().map(|i| table.all[*i].clone()).collect())
            .unwrap_or_default()
    }

    /// Targets along the ancestry of a concrete type, ancestors first
    pub fn targets_along(&self, ty: TypeKey) -> Vec<BridgeTarget> {
        let mut chain: Vec<TypeKey> = self
            .registry
            .ancestors(ty)
            .take_while(|d| !d.is_framework())
            .map(|d| d.key)
            .collect();
        chain.reverse();
        chain.into_iter().flat_map(|t| self.targets_for(t)).collect()
    }

    /// Every target recorded so far
    pub fn all_targets(&self) -> Vec<BridgeTarget> {
        self.targets.read().all.clone()
    }

    /// Number of recorded targets
    pub fn target_count(&self) -> usize {
        self.targets.read().all.len()
    }
}

impl std::fmt::Debug for WorthinessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorthinessRegistry")
            .field("targets", &self.target_count())
            .field("cached_verdicts", &self.worth.len())
            .finish()
    }
}
