//! Native clone primitive and native callback dispatch
//!
//! Copy rules of the native serializer: a field is copied when it is an
//! instance field, not excluded, not a by-reference field, public or opted
//! in, and its declared type is one the serializer understands (primitives,
//! enums, host objects, lists and arrays of those, framework structs and
//! classes). Host references into the cloned subtree are rewired; all other
//! fields keep the values the type's constructor gave them.

use crate::scene::{EntityData, MemberData, Scene, SceneObject};
use replica_core::host::{Host, HostError, ObjectId, ObjectKind};
use replica_core::lifecycle::{call_hook, HookKind};
use replica_core::types::{FieldDescriptor, TypeKey, TypeKind};
use replica_core::value::{Instance, ListRef, ObjectRef, Value};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

impl Scene {
    pub(crate) fn clone_object(&mut self, source: ObjectId) -> Result<ObjectId, HostError> {
        match self.object_kind(source) {
            None => Err(HostError::UnknownObject(source)),
            Some(ObjectKind::Asset) => self.clone_asset(source),
            Some(_) => {
                let root = self.entity_of(source).ok_or(HostError::UnknownObject(source))?;
                let remap = self.clone_tree(root)?;
                remap
                    .get(&source)
                    .copied()
                    .ok_or_else(|| HostError::Clone(format!("{source} was not cloned")))
            }
        }
    }

    fn clone_asset(&mut self, source: ObjectId) -> Result<ObjectId, HostError> {
        let original = self.instance(source).ok_or(HostError::UnknownObject(source))?;
        let copy = self.copy_instance(original, &FxHashMap::default())?;
        self.spawn_asset(copy)
    }

    /// Duplicate the subtree rooted at `root`; returns source → clone ids
    fn clone_tree(&mut self, root: ObjectId) -> Result<FxHashMap<ObjectId, ObjectId>, HostError> {
        let entities = if self.quirks.drop_children {
            vec![root]
        } else {
            self.subtree(root)
        };
        let source_members: Vec<ObjectId> = entities.iter().flat_map(|e| self.members(*e)).collect();

        for member in &source_members {
            self.fire(*member, HookKind::BeforeSerialize);
        }

        let mut remap = FxHashMap::default();
        for id in entities.iter().chain(&source_members) {
            let fresh = self.allocate();
            remap.insert(*id, fresh);
        }

        let mut clone_members = Vec::with_capacity(source_members.len());
        for entity in &entities {
            let data = self.entity(*entity)?;
            let cloned = EntityData {
                name: if *entity == root {
                    format!("{} (Clone)", data.name)
                } else {
                    data.name.clone()
                },
                parent: data.parent.filter(|_| *entity != root).and_then(|p| remap.get(&p).copied()),
                children: data.children.iter().filter_map(|c| remap.get(c).copied()).collect(),
                members: data.members.iter().filter_map(|m| remap.get(m).copied()).collect(),
                active_self: data.active_self,
            };

            let mut members = Vec::with_capacity(data.members.len());
            for member in &data.members {
                let Some(SceneObject::Member(source)) = self.objects.get(member) else {
                    continue;
                };
                let instance = self.copy_instance(&source.instance, &remap)?;
                members.push((remap[member], source.enabled, instance));
            }

            let clone_entity = remap[entity];
            for (id, enabled, instance) in members {
                self.objects.insert(
                    id,
                    SceneObject::Member(MemberData {
                        entity: clone_entity,
                        enabled,
                        instance,
                    }),
                );
                clone_members.push(id);
            }
            self.objects.insert(clone_entity, SceneObject::Entity(cloned));
        }

        if self.quirks.helper_child {
            for entity in &entities {
                let clone_entity = remap[entity];
                self.spawn_child(clone_entity, "Helper")?;
            }
        }

        for member in &clone_members {
            self.fire(*member, HookKind::AfterDeserialize);
        }
        self.awaken(&clone_members);

        debug!(
            %root,
            entities = entities.len(),
            members = clone_members.len(),
            "native clone"
        );
        Ok(remap)
    }

    /// A fresh instance of the same type with natively copied fields
    fn copy_instance(
        &self,
        source: &Instance,
        remap: &FxHashMap<ObjectId, ObjectId>,
    ) -> Result<Instance, HostError> {
        let mut copy = self.registry.instantiate(source.ty())?;
        for field in self.registry.all_fields(source.ty()) {
            let Some(slot) = field.slot else { continue };
            if !self.copies_natively(field) {
                continue;
            }
            if let Some(value) = source.slot(slot) {
                copy.set_slot(slot, self.copy_value(value, remap));
            }
        }
        Ok(copy)
    }

    fn copies_natively(&self, field: &FieldDescriptor) -> bool {
        let attrs = field.attributes;
        !field.is_static
            && !attrs.non_serialized
            && !attrs.serialize_reference
            && (field.is_public() || attrs.serialize_field)
            && self.is_native_type(field.ty)
    }

    fn is_native_type(&self, ty: TypeKey) -> bool {
        let Some(desc) = self.registry.get(ty) else {
            return false;
        };
        match desc.kind {
            TypeKind::Primitive(_) | TypeKind::Enum | TypeKind::HostObject => true,
            TypeKind::List(elem) | TypeKind::Array(elem) => self.is_native_type(elem),
            TypeKind::Map(_, _) => false,
            TypeKind::Struct | TypeKind::Class => desc.is_framework(),
        }
    }

    /// By-value copy with host references rewired into the clone
    fn copy_value(&self, value: &Value, remap: &FxHashMap<ObjectId, ObjectId>) -> Value {
        match value {
            Value::Host(id) => Value::Host(remap.get(id).copied().unwrap_or(*id)),
            Value::List(list) | Value::Array(list) => {
                let data = list.read();
                let items = data.items.iter().map(|v| self.copy_value(v, remap)).collect();
                let copy = ListRef::new(data.elem, items);
                if matches!(value, Value::List(_)) {
                    Value::List(copy)
                } else {
                    Value::Array(copy)
                }
            }
            Value::Struct(inner) => Value::Struct(Box::new(self.copy_slots(inner, remap))),
            Value::Object(object) => Value::Object(ObjectRef::new(self.copy_slots(&object.read(), remap))),
            // Never natively serialized
            Value::Map(_) => Value::Null,
            other => other.clone(),
        }
    }

    fn copy_slots(&self, source: &Instance, remap: &FxHashMap<ObjectId, ObjectId>) -> Instance {
        let slots = source.slots().iter().map(|v| self.copy_value(v, remap)).collect();
        Instance::new(source.ty(), slots)
    }

    /// Run `initialize` and `enable` on freshly created members
    pub(crate) fn awaken(&mut self, members: &[ObjectId]) {
        for member in members {
            if !self.is_active_in_tree(*member) {
                continue;
            }
            self.fire(*member, HookKind::Initialize);
            if self.is_enabled(*member) {
                self.fire(*member, HookKind::Enable);
            }
        }
    }

    /// Invoke a native callback unless its concrete type is suspended
    fn fire(&mut self, id: ObjectId, kind: HookKind) {
        let Some(ty) = self.type_of(id) else { return };
        if self.gate.is_blocked(ty) {
            return;
        }
        let Some(hook) = self.hooks.resolve(ty, kind) else {
            return;
        };
        let Some(instance) = self.instance_mut(id) else {
            return;
        };
        if let Err(err) = call_hook(&hook, id, instance) {
            warn!(member = %id, hook = kind.name(), error = %err, "native callback failed");
        }
    }
}
