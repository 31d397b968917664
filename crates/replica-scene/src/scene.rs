//! Entity tree, members and assets
//!
//! Objects live in one identity-keyed table. Destroyed objects are removed
//! from it, which is all [`Liveness`] needs to know.

use crate::{SceneError, SceneResult};
use replica_core::host::{DestructionListener, Host, HostError, Liveness, ObjectId, ObjectKind};
use replica_core::lifecycle::{BlockedCalls, HookResolver};
use replica_core::types::{TypeKey, TypeRegistry};
use replica_core::value::{Instance, Value};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Capacity of the scene's own callback cache
const HOOK_CACHE: usize = 256;

/// Deviations of the native clone from a clean isomorphic copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneQuirks {
    /// Append an empty helper child to every cloned entity
    pub helper_child: bool,
    /// Clone only the root entity, dropping its children
    pub drop_children: bool,
}

#[derive(Debug)]
pub(crate) struct EntityData {
    pub(crate) name: String,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) children: Vec<ObjectId>,
    pub(crate) members: Vec<ObjectId>,
    pub(crate) active_self: bool,
}

#[derive(Debug)]
pub(crate) struct MemberData {
    pub(crate) entity: ObjectId,
    pub(crate) enabled: bool,
    pub(crate) instance: Instance,
}

#[derive(Debug)]
pub(crate) enum SceneObject {
    Entity(EntityData),
    Member(MemberData),
    Asset(Instance),
}

/// In-memory host
pub struct Scene {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) gate: Arc<BlockedCalls>,
    pub(crate) hooks: HookResolver,
    pub(crate) objects: FxHashMap<ObjectId, SceneObject>,
    pub(crate) quirks: CloneQuirks,
    next_id: u64,
    listeners: Vec<Arc<dyn DestructionListener>>,
}

impl Scene {
    /// Create an empty scene; native callbacks consult `gate`
    pub fn new(registry: Arc<TypeRegistry>, gate: Arc<BlockedCalls>) -> Self {
        Self {
            hooks: HookResolver::new(Arc::clone(&registry), HOOK_CACHE),
            registry,
            gate,
            objects: FxHashMap::default(),
            quirks: CloneQuirks::default(),
            next_id: 1,
            listeners: Vec::new(),
        }
    }

    /// Type registry shared with the bridge
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Set the native clone quirks
    pub fn set_quirks(&mut self, quirks: CloneQuirks) {
        self.quirks = quirks;
    }

    /// Subscribe to destruction and teardown events
    pub fn subscribe(&mut self, listener: Arc<dyn DestructionListener>) {
        self.listeners.push(listener);
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn allocate(&mut self) -> ObjectId {
        let id = ObjectId::from_u64(self.next_id);
        self.next_id += 1;
        id
    }

    // ========================================================================
    // Tree construction
    // ========================================================================

    /// Create a root entity
    pub fn spawn_entity(&mut self, name: impl Into<String>) -> ObjectId {
        let id = self.allocate();
        self.objects.insert(
            id,
            SceneObject::Entity(EntityData {
                name: name.into(),
                parent: None,
                children: Vec::new(),
                members: Vec::new(),
                active_self: true,
            }),
        );
        id
    }

    /// Create an entity as the last child of `parent`
    pub fn spawn_child(&mut self, parent: ObjectId, name: impl Into<String>) -> Result<ObjectId, HostError> {
        self.entity(parent)?;
        let id = self.spawn_entity(name);
        if let Some(SceneObject::Entity(child)) = self.objects.get_mut(&id) {
            child.parent = Some(parent);
        }
        self.entity_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Attach a new member of type `ty` to an entity
    ///
    /// The member starts enabled. Its `initialize` and `enable` callbacks run
    /// natively when the entity is active.
    pub fn add_member(&mut self, entity: ObjectId, ty: TypeKey) -> SceneResult<ObjectId> {
        self.entity(entity)?;
        if !self.registry.is_subtype(ty, self.registry.member()) {
            return Err(SceneError::NotAMemberType(self.registry.name_of(ty)));
        }
        let instance = self.registry.instantiate(ty).map_err(HostError::from)?;

        let id = self.allocate();
        self.objects.insert(
            id,
            SceneObject::Member(MemberData {
                entity,
                enabled: true,
                instance,
            }),
        );
        self.entity_mut(entity)?.members.push(id);
        self.awaken(&[id]);
        Ok(id)
    }

    /// Register a fresh asset of type `ty`
    pub fn add_asset(&mut self, ty: TypeKey) -> SceneResult<ObjectId> {
        if !self.registry.is_subtype(ty, self.registry.asset()) {
            return Err(SceneError::NotAnAssetType(self.registry.name_of(ty)));
        }
        let instance = self.registry.instantiate(ty).map_err(HostError::from)?;
        Ok(self.spawn_asset(instance)?)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Name of an entity
    pub fn name(&self, entity: ObjectId) -> Option<&str> {
        self.entity(entity).ok().map(|e| e.name.as_str())
    }

    /// Parent of an entity
    pub fn parent(&self, entity: ObjectId) -> Option<ObjectId> {
        self.entity(entity).ok().and_then(|e| e.parent)
    }

    /// First direct child with a given name
    pub fn find_child(&self, entity: ObjectId, name: &str) -> Option<ObjectId> {
        self.children(entity)
            .into_iter()
            .find(|child| self.name(*child) == Some(name))
    }

    /// Set the entity's own active flag
    pub fn set_active(&mut self, entity: ObjectId, active: bool) -> Result<(), HostError> {
        self.entity_mut(entity)?.active_self = active;
        Ok(())
    }

    /// Set a member's enabled flag
    pub fn set_enabled(&mut self, member: ObjectId, enabled: bool) -> Result<(), HostError> {
        match self.objects.get_mut(&member) {
            Some(SceneObject::Member(data)) => {
                data.enabled = enabled;
                Ok(())
            }
            Some(_) => Err(HostError::WrongKind {
                id: member,
                expected: ObjectKind::Member,
            }),
            None => Err(HostError::UnknownObject(member)),
        }
    }

    // ========================================================================
    // Fields
    // ========================================================================

    /// Read a field of a member or asset by name
    pub fn field(&self, id: ObjectId, name: &str) -> SceneResult<Value> {
        let instance = self.instance(id).ok_or(HostError::UnknownObject(id))?;
        let slot = self.slot_of(id, instance.ty(), name)?;
        Ok(instance.slot(slot).cloned().unwrap_or(Value::Null))
    }

    /// Write a field of a member or asset by name
    pub fn set_field(&mut self, id: ObjectId, name: &str, value: Value) -> SceneResult<()> {
        let ty = self.type_of(id).ok_or(HostError::UnknownObject(id))?;
        let slot = self.slot_of(id, ty, name)?;
        let declared = self
            .registry
            .find_field(ty, name)
            .map(|f| f.ty)
            .ok_or_else(|| unknown_field(id, name))?;
        if !self.registry.value_conforms(&value, declared) {
            return Err(SceneError::TypeMismatch {
                field: name.to_string(),
                expected: self.registry.name_of(declared),
                found: value.kind_name(),
            });
        }
        let instance = self.instance_mut(id).ok_or(HostError::UnknownObject(id))?;
        instance.set_slot(slot, value);
        Ok(())
    }

    fn slot_of(&self, id: ObjectId, ty: TypeKey, name: &str) -> SceneResult<usize> {
        self.registry
            .find_field(ty, name)
            .and_then(|f| f.slot)
            .ok_or_else(|| unknown_field(id, name).into())
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroy an object; entities take their whole subtree with them
    ///
    /// Listeners are notified once per destroyed object.
    pub fn destroy(&mut self, id: ObjectId) -> Result<(), HostError> {
        let removed = self.detach_and_remove(id)?;
        let scene: &Scene = self;
        for dead in &removed {
            for listener in &scene.listeners {
                listener.on_destroyed(*dead, scene);
            }
        }
        Ok(())
    }

    /// Tear down a whole tree with a single teardown notification
    pub fn unload(&mut self, root: ObjectId) -> Result<(), HostError> {
        let removed = self.detach_and_remove(root)?;
        debug!(%root, objects = removed.len(), "tree unloaded");
        let scene: &Scene = self;
        for listener in &scene.listeners {
            listener.on_teardown(scene);
        }
        Ok(())
    }

    fn detach_and_remove(&mut self, id: ObjectId) -> Result<Vec<ObjectId>, HostError> {
        let owner = match self.objects.get(&id) {
            None => return Err(HostError::UnknownObject(id)),
            Some(SceneObject::Entity(data)) => data.parent,
            Some(SceneObject::Member(data)) => Some(data.entity),
            Some(SceneObject::Asset(_)) => None,
        };
        if let Some(owner) = owner.and_then(|o| self.entity_mut(o).ok()) {
            owner.children.retain(|c| *c != id);
            owner.members.retain(|m| *m != id);
        }

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(SceneObject::Entity(data)) = self.objects.remove(&next) {
                removed.extend(data.members.iter().copied());
                for member in &data.members {
                    self.objects.remove(member);
                }
                stack.extend(data.children);
            }
            removed.push(next);
        }
        Ok(removed)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub(crate) fn entity(&self, id: ObjectId) -> Result<&EntityData, HostError> {
        match self.objects.get(&id) {
            Some(SceneObject::Entity(data)) => Ok(data),
            Some(_) => Err(HostError::WrongKind {
                id,
                expected: ObjectKind::Entity,
            }),
            None => Err(HostError::UnknownObject(id)),
        }
    }

    pub(crate) fn entity_mut(&mut self, id: ObjectId) -> Result<&mut EntityData, HostError> {
        match self.objects.get_mut(&id) {
            Some(SceneObject::Entity(data)) => Ok(data),
            Some(_) => Err(HostError::WrongKind {
                id,
                expected: ObjectKind::Entity,
            }),
            None => Err(HostError::UnknownObject(id)),
        }
    }

    /// Entities of the subtree rooted at `root`, in preorder
    pub fn subtree(&self, root: ObjectId) -> Vec<ObjectId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(entity) = stack.pop() {
            let Ok(data) = self.entity(entity) else { continue };
            order.push(entity);
            stack.extend(data.children.iter().rev().copied());
        }
        order
    }
}

fn unknown_field(id: ObjectId, name: &str) -> HostError {
    HostError::UnknownField {
        id,
        field: name.to_string(),
    }
}

impl Liveness for Scene {
    fn is_alive(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }
}

impl Host for Scene {
    fn object_kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.objects.get(&id).map(|object| match object {
            SceneObject::Entity(_) => ObjectKind::Entity,
            SceneObject::Member(_) => ObjectKind::Member,
            SceneObject::Asset(_) => ObjectKind::Asset,
        })
    }

    fn type_of(&self, id: ObjectId) -> Option<TypeKey> {
        match self.objects.get(&id)? {
            SceneObject::Entity(_) => Some(self.registry.entity()),
            SceneObject::Member(data) => Some(data.instance.ty()),
            SceneObject::Asset(instance) => Some(instance.ty()),
        }
    }

    fn entity_of(&self, id: ObjectId) -> Option<ObjectId> {
        match self.objects.get(&id)? {
            SceneObject::Entity(_) => Some(id),
            SceneObject::Member(data) => Some(data.entity),
            SceneObject::Asset(_) => None,
        }
    }

    fn children(&self, entity: ObjectId) -> Vec<ObjectId> {
        self.entity(entity)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    fn members(&self, entity: ObjectId) -> Vec<ObjectId> {
        self.entity(entity)
            .map(|e| e.members.clone())
            .unwrap_or_default()
    }

    fn is_active_in_tree(&self, id: ObjectId) -> bool {
        let mut current = self.entity_of(id);
        while let Some(entity) = current {
            match self.entity(entity) {
                Ok(data) if data.active_self => current = data.parent,
                _ => return false,
            }
        }
        true
    }

    fn is_enabled(&self, member: ObjectId) -> bool {
        matches!(self.objects.get(&member), Some(SceneObject::Member(data)) if data.enabled)
    }

    fn instance(&self, id: ObjectId) -> Option<&Instance> {
        match self.objects.get(&id)? {
            SceneObject::Member(data) => Some(&data.instance),
            SceneObject::Asset(instance) => Some(instance),
            SceneObject::Entity(_) => None,
        }
    }

    fn instance_mut(&mut self, id: ObjectId) -> Option<&mut Instance> {
        match self.objects.get_mut(&id)? {
            SceneObject::Member(data) => Some(&mut data.instance),
            SceneObject::Asset(instance) => Some(instance),
            SceneObject::Entity(_) => None,
        }
    }

    fn spawn_asset(&mut self, instance: Instance) -> Result<ObjectId, HostError> {
        let id = self.allocate();
        self.objects.insert(id, SceneObject::Asset(instance));
        Ok(id)
    }

    fn clone_native(&mut self, source: ObjectId) -> Result<ObjectId, HostError> {
        self.clone_object(source)
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("objects", &self.objects.len())
            .field("quirks", &self.quirks)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::types::{FieldSpec, TypeKind};

    fn scene() -> (Scene, TypeKey) {
        let mut builder = TypeRegistry::builder();
        let int = builder.int();
        let behaviour = builder.behaviour();
        let health = builder
            .declare("game::Health", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("hp", int))
            .finish();
        let registry = Arc::new(builder.build().unwrap());
        (Scene::new(registry, Arc::new(BlockedCalls::new())), health)
    }

    #[test]
    fn test_tree_construction() {
        let (mut scene, health) = scene();
        let root = scene.spawn_entity("Root");
        let a = scene.spawn_child(root, "A").unwrap();
        let b = scene.spawn_child(root, "B").unwrap();
        let a1 = scene.spawn_child(a, "A1").unwrap();
        let member = scene.add_member(a1, health).unwrap();

        assert_eq!(scene.children(root), vec![a, b]);
        assert_eq!(scene.subtree(root), vec![root, a, a1, b]);
        assert_eq!(scene.entity_of(member), Some(a1));
        assert_eq!(scene.parent(a1), Some(a));
        assert_eq!(scene.find_child(root, "B"), Some(b));
        assert_eq!(scene.object_kind(member), Some(ObjectKind::Member));
    }

    #[test]
    fn test_active_in_tree_follows_ancestors() {
        let (mut scene, health) = scene();
        let root = scene.spawn_entity("Root");
        let child = scene.spawn_child(root, "Child").unwrap();
        let member = scene.add_member(child, health).unwrap();

        assert!(scene.is_active_in_tree(member));
        scene.set_active(root, false).unwrap();
        assert!(!scene.is_active_in_tree(member));
        assert!(scene.is_enabled(member));
    }

    #[test]
    fn test_field_access_checks_types() {
        let (mut scene, health) = scene();
        let root = scene.spawn_entity("Root");
        let member = scene.add_member(root, health).unwrap();

        scene.set_field(member, "hp", Value::Int(7)).unwrap();
        assert_eq!(scene.field(member, "hp").unwrap().as_int(), Some(7));

        let err = scene.set_field(member, "hp", Value::str("seven")).unwrap_err();
        assert!(matches!(err, SceneError::TypeMismatch { .. }));
        assert!(scene.field(member, "mana").is_err());
    }

    #[test]
    fn test_destroy_removes_subtree() {
        let (mut scene, health) = scene();
        let root = scene.spawn_entity("Root");
        let child = scene.spawn_child(root, "Child").unwrap();
        let member = scene.add_member(child, health).unwrap();

        scene.destroy(child).unwrap();
        assert!(!scene.is_alive(child));
        assert!(!scene.is_alive(member));
        assert!(scene.children(root).is_empty());
        assert!(scene.destroy(child).is_err());
    }

    #[test]
    fn test_non_member_type_rejected() {
        let (mut scene, _) = scene();
        let root = scene.spawn_entity("Root");
        let int = scene.registry().int();
        assert!(matches!(
            scene.add_member(root, int),
            Err(SceneError::NotAMemberType(_))
        ));
    }
}
