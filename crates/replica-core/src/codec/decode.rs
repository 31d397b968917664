//! Decoding half of the graph codec

use super::{
    CodecError, FieldMeta, GraphCodec, IdentityResolver, PassiveResolver, TokenPolicy, ENTRY_KEY,
    ENTRY_VALUE, ID_KEY, OID_KEY, PAYLOAD_KEY, REF_KEY, TYPE_KEY,
};
use crate::host::{Liveness, ObjectId};
use crate::types::{FieldDescriptor, PrimitiveKind, TypeKey, TypeKind};
use crate::value::{Instance, ObjectRef, Value};
use rustc_hash::FxHashMap;
use serde_json::Map;
use tracing::{debug, warn};

type Json = serde_json::Value;

/// Per-document state: managed objects already materialized, by `$oid`
#[derive(Default)]
struct DecodeContext {
    objects: FxHashMap<u64, ObjectRef>,
}

impl GraphCodec {
    /// Decode one field value
    pub fn decode(
        &self,
        json: &Json,
        meta: &FieldMeta,
        resolver: &mut dyn IdentityResolver,
    ) -> Result<Value, CodecError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let policy = if meta.passive {
            TokenPolicy::Passive
        } else {
            TokenPolicy::Follow
        };
        let mut ctx = DecodeContext::default();
        self.decode_value(json, meta.declared, policy, &mut ctx, resolver)
    }

    /// Decode with every identity token pointing at the object it names
    pub fn decode_passive(
        &self,
        json: &Json,
        meta: &FieldMeta,
        liveness: &dyn Liveness,
    ) -> Result<Value, CodecError> {
        let meta = FieldMeta {
            passive: true,
            ..*meta
        };
        self.decode(json, &meta, &mut PassiveResolver::new(liveness))
    }

    /// Write the members of an encoded object into an instance
    ///
    /// Returns how many members were restored; failing members are logged
    /// and skipped.
    pub fn populate(
        &self,
        instance: &mut Instance,
        json: &Json,
        resolver: &mut dyn IdentityResolver,
    ) -> Result<usize, CodecError> {
        let body = json
            .as_object()
            .ok_or_else(|| CodecError::shape("object", self.registry.name_of(instance.ty()), json))?;
        let mut ctx = DecodeContext::default();
        let decoded = self.decode_members(body, instance.ty(), TokenPolicy::Follow, &mut ctx, resolver);
        Ok(self.assign_members(instance, decoded))
    }

    fn decode_value(
        &self,
        json: &Json,
        declared: TypeKey,
        policy: TokenPolicy,
        ctx: &mut DecodeContext,
        resolver: &mut dyn IdentityResolver,
    ) -> Result<Value, CodecError> {
        let desc = self.registry.descriptor(declared)?;
        if json.is_null() {
            return Ok(if desc.kind.is_reference() {
                Value::Null
            } else {
                self.registry.default_value(declared)
            });
        }
        let name = || desc.name.clone();

        match desc.kind {
            TypeKind::Primitive(PrimitiveKind::Bool) => json
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| CodecError::shape("bool", name(), json)),
            TypeKind::Primitive(PrimitiveKind::Int) => json
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| CodecError::shape("integer", name(), json)),
            TypeKind::Primitive(PrimitiveKind::Float) => {
                decode_float(json).ok_or_else(|| CodecError::shape("float", name(), json))
            }
            TypeKind::Primitive(PrimitiveKind::Str) => json
                .as_str()
                .map(Value::str)
                .ok_or_else(|| CodecError::shape("string", name(), json)),
            TypeKind::Enum => json
                .as_i64()
                .map(Value::Enum)
                .ok_or_else(|| CodecError::shape("integer", name(), json)),
            TypeKind::HostObject => {
                let id = json
                    .get(ID_KEY)
                    .and_then(Json::as_u64)
                    .ok_or_else(|| CodecError::shape("identity token", name(), json))?;
                Ok(resolver.resolve(ObjectId::from_u64(id), policy, declared))
            }
            TypeKind::Struct => {
                let body = json
                    .as_object()
                    .ok_or_else(|| CodecError::shape("object", name(), json))?;
                let mut instance = self.registry.instantiate(declared)?;
                let decoded = self.decode_members(body, declared, policy, ctx, resolver);
                self.assign_members(&mut instance, decoded);
                Ok(Value::Struct(Box::new(instance)))
            }
            TypeKind::Class => self.decode_object(json, declared, policy, ctx, resolver),
            TypeKind::List(elem) => {
                let items = json
                    .as_array()
                    .ok_or_else(|| CodecError::shape("array", name(), json))?;
                let list = self.accessors.construct_container(declared, items.len())?;
                if let Some(handle) = list.as_list() {
                    for item in items {
                        let value = self.decode_value(item, elem, policy, ctx, resolver)?;
                        handle.write().items.push(value);
                    }
                }
                Ok(list)
            }
            TypeKind::Array(elem) => {
                let items = json
                    .as_array()
                    .ok_or_else(|| CodecError::shape("array", name(), json))?;
                let values = items
                    .iter()
                    .map(|item| self.decode_value(item, elem, policy, ctx, resolver))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::array(elem, values))
            }
            TypeKind::Map(key_ty, value_ty) => {
                let entries = json
                    .as_array()
                    .ok_or_else(|| CodecError::shape("entry array", name(), json))?;
                let map = self.accessors.construct_container(declared, entries.len())?;
                if let Some(handle) = map.as_map() {
                    for entry in entries {
                        let key_json = entry.get(ENTRY_KEY).unwrap_or(&Json::Null);
                        let key = self.decode_value(key_json, key_ty, policy, ctx, resolver)?;
                        if key.is_null() {
                            continue;
                        }
                        let value_json = entry.get(ENTRY_VALUE).unwrap_or(&Json::Null);
                        let value = self.decode_value(value_json, value_ty, policy, ctx, resolver)?;
                        handle.write().insert(key, value);
                    }
                }
                Ok(map)
            }
        }
    }

    fn decode_object(
        &self,
        json: &Json,
        declared: TypeKey,
        policy: TokenPolicy,
        ctx: &mut DecodeContext,
        resolver: &mut dyn IdentityResolver,
    ) -> Result<Value, CodecError> {
        let declared_name = || self.registry.name_of(declared);
        let outer = json
            .as_object()
            .ok_or_else(|| CodecError::shape("object", declared_name(), json))?;

        if let Some(oid) = outer.get(REF_KEY).and_then(Json::as_u64) {
            return ctx
                .objects
                .get(&oid)
                .cloned()
                .map(Value::Object)
                .ok_or(CodecError::DanglingRef(oid));
        }

        let (concrete, body) = match outer.get(TYPE_KEY).and_then(Json::as_str) {
            Some(type_name) => {
                let concrete = self
                    .types
                    .resolve(type_name)
                    .ok_or_else(|| CodecError::UnknownTypeName(type_name.to_string()))?;
                if !self.registry.is_subtype(concrete, declared) {
                    return Err(CodecError::NotAssignable {
                        concrete: type_name.to_string(),
                        declared: declared_name(),
                    });
                }
                let payload = outer.get(PAYLOAD_KEY).unwrap_or(&Json::Null);
                let body = payload
                    .as_object()
                    .ok_or_else(|| CodecError::shape("object", type_name.to_string(), payload))?;
                (concrete, body)
            }
            None => (declared, outer),
        };

        if self.registry.get(concrete).map(|d| d.is_abstract).unwrap_or(true) {
            return Err(CodecError::Abstract(self.registry.name_of(concrete)));
        }
        let value = self.accessors.construct_default(concrete)?;
        let Value::Object(object) = value else {
            return Err(CodecError::Abstract(self.registry.name_of(concrete)));
        };

        // Registered before populating so back-references resolve to it
        if let Some(oid) = body.get(OID_KEY).and_then(Json::as_u64) {
            ctx.objects.insert(oid, object.clone());
        }

        let decoded = self.decode_members(body, concrete, policy, ctx, resolver);
        self.assign_members(&mut object.write(), decoded);
        Ok(Value::Object(object))
    }

    fn decode_members(
        &self,
        body: &Map<String, Json>,
        ty: TypeKey,
        policy: TokenPolicy,
        ctx: &mut DecodeContext,
        resolver: &mut dyn IdentityResolver,
    ) -> Vec<(FieldDescriptor, Value)> {
        let plan = self.member_plan(ty);
        let mut decoded = Vec::with_capacity(plan.len());
        for member in plan.iter() {
            let Some(json) = body.get(&member.key) else {
                continue;
            };
            let field = &member.field;
            let field_policy = if field.attributes.passive {
                TokenPolicy::Passive
            } else {
                policy
            };
            match self.decode_value(json, field.ty, field_policy, ctx, resolver) {
                Ok(value) => decoded.push((field.clone(), value)),
                Err(err) => {
                    warn!(field = %field.name, error = %err, "failed to decode member");
                }
            }
        }
        decoded
    }

    fn assign_members(&self, instance: &mut Instance, decoded: Vec<(FieldDescriptor, Value)>) -> usize {
        let mut restored = 0;
        for (field, value) in decoded {
            match self.accessors.set(instance, &field, value) {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(field = %field.name, error = %err, "failed to assign member");
                }
            }
        }
        if self.debug_logs {
            debug!(
                ty = %self.registry.name_of(instance.ty()),
                restored,
                "decoded instance"
            );
        }
        restored
    }
}

fn decode_float(json: &Json) -> Option<Value> {
    match json {
        Json::Number(n) => n.as_f64().map(Value::Float),
        Json::String(s) => match s.as_str() {
            "NaN" => Some(Value::Float(f64::NAN)),
            "Infinity" => Some(Value::Float(f64::INFINITY)),
            "-Infinity" => Some(Value::Float(f64::NEG_INFINITY)),
            _ => None,
        },
        _ => None,
    }
}
