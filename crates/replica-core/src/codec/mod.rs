//! Graph codec
//!
//! Encodes field values into `serde_json::Value` documents that survive a
//! clone of their owner, and decodes them back. The encoding keeps what the
//! host's own clone loses:
//!
//! - host objects become identity tokens `{"$id": n}`
//! - polymorphic managed objects are wrapped as `{"$type": name, "$payload": body}`
//! - managed objects carry `"$oid"` on first occurrence and become
//!   `{"$ref": oid}` afterwards, so sharing and cycles survive
//! - maps become `[{"$key": k, "$value": v}, ...]` since keys may be objects
//! - non-finite floats become `"NaN"`, `"Infinity"` and `"-Infinity"`
//!
//! How identity tokens are resolved on decode is left to an
//! [`IdentityResolver`], so the same codec serves plain round-trips and
//! clone restoration.

mod decode;
mod encode;

use crate::accessor::{AccessError, AccessorCompiler};
use crate::cache::SharedLru;
use crate::host::{Liveness, ObjectId};
use crate::types::{FieldDescriptor, RegistryError, TypeKey, TypeKind, TypeRegistry, TypeResolver};
use crate::value::Value;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity token key
pub const ID_KEY: &str = "$id";
/// Envelope type key
pub const TYPE_KEY: &str = "$type";
/// Envelope payload key
pub const PAYLOAD_KEY: &str = "$payload";
/// Object identity key inside one document
pub const OID_KEY: &str = "$oid";
/// Back-reference key inside one document
pub const REF_KEY: &str = "$ref";
/// Map entry key
pub const ENTRY_KEY: &str = "$key";
/// Map entry value
pub const ENTRY_VALUE: &str = "$value";

/// Errors raised while encoding or decoding
#[derive(Debug, Error)]
pub enum CodecError {
    /// The document does not have the shape the declared type needs
    #[error("Expected {expected} for '{ty}', found {found}")]
    UnexpectedShape {
        /// What the decoder needed
        expected: &'static str,
        /// Declared type
        ty: String,
        /// What the document held
        found: String,
    },

    /// An envelope names a type the registry does not know
    #[error("Unknown type name '{0}'")]
    UnknownTypeName(String),

    /// An envelope names a type incompatible with the declared one
    #[error("Type '{concrete}' is not assignable to '{declared}'")]
    NotAssignable {
        /// Type named by the envelope
        concrete: String,
        /// Declared type
        declared: String,
    },

    /// A `$ref` points at an object not seen earlier in the document
    #[error("Dangling reference {0}")]
    DanglingRef(u64),

    /// A concrete type cannot be constructed
    #[error("Type '{0}' is abstract and the document carries no concrete type")]
    Abstract(String),

    /// Accessor failure
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Type metadata problem
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CodecError {
    pub(crate) fn shape(expected: &'static str, ty: String, found: &serde_json::Value) -> Self {
        CodecError::UnexpectedShape {
            expected,
            ty,
            found: json_kind(found).to_string(),
        }
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Field-level encoding metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    /// Declared type of the field
    pub declared: TypeKey,
    /// Serialize by identity
    pub by_reference: bool,
    /// Identity tokens resolve to originals
    pub passive: bool,
}

impl FieldMeta {
    /// Metadata of a declared field
    pub fn of(field: &FieldDescriptor) -> Self {
        Self {
            declared: field.ty,
            by_reference: field.attributes.serialize_reference,
            passive: field.attributes.passive,
        }
    }

    /// Metadata for a bare value of a declared type
    pub fn plain(declared: TypeKey) -> Self {
        Self {
            declared,
            by_reference: false,
            passive: false,
        }
    }
}

/// Encoder output for one field
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// The document
    pub json: serde_json::Value,
    /// At least one identity token appears in the document
    pub carries_identity: bool,
}

/// How an identity token should be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPolicy {
    /// Follow the reference into the newly cloned tree
    Follow,
    /// Keep pointing at the original object
    Passive,
}

/// Turns identity tokens back into values
pub trait IdentityResolver {
    /// Resolve a token found where a value of `declared` type is expected
    fn resolve(&mut self, id: ObjectId, policy: TokenPolicy, declared: TypeKey) -> Value;
}

/// Resolves every token to the object it names, if that object is alive
pub struct PassiveResolver<'a> {
    liveness: &'a dyn Liveness,
}

impl<'a> PassiveResolver<'a> {
    /// Create a resolver backed by a liveness check
    pub fn new(liveness: &'a dyn Liveness) -> Self {
        Self { liveness }
    }
}

impl IdentityResolver for PassiveResolver<'_> {
    fn resolve(&mut self, id: ObjectId, _policy: TokenPolicy, _declared: TypeKey) -> Value {
        if self.liveness.is_alive(id) {
            Value::Host(id)
        } else {
            Value::Null
        }
    }
}

/// One participating member of a type, with its document key
#[derive(Debug, Clone)]
pub struct PlannedMember {
    /// Key in the encoded object
    pub key: String,
    /// The field
    pub field: FieldDescriptor,
}

/// Participating members of a concrete type, ancestors first
pub type MemberPlan = Arc<Vec<PlannedMember>>;

/// The codec, sharing accessors and type resolution with the bridge
pub struct GraphCodec {
    registry: Arc<TypeRegistry>,
    accessors: Arc<AccessorCompiler>,
    types: Arc<TypeResolver>,
    plans: SharedLru<TypeKey, MemberPlan>,
    debug_logs: bool,
}

impl GraphCodec {
    /// Create a codec with a member-plan cache of `plan_capacity` types
    pub fn new(
        accessors: Arc<AccessorCompiler>,
        types: Arc<TypeResolver>,
        plan_capacity: usize,
        debug_logs: bool,
    ) -> Self {
        Self {
            registry: Arc::clone(accessors.registry()),
            accessors,
            types,
            plans: SharedLru::new(plan_capacity),
            debug_logs,
        }
    }

    /// Registry the codec reads
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Members of a type that take part in encoding (cached)
    pub fn member_plan(&self, ty: TypeKey) -> MemberPlan {
        self.plans.get_or_compute(ty, || Arc::new(self.compute_plan(ty)))
    }

    fn compute_plan(&self, ty: TypeKey) -> Vec<PlannedMember> {
        let owner_is_host = self.registry.is_host_object(ty);
        let mut keys = FxHashSet::default();
        let mut plan = Vec::new();

        for field in self.registry.all_fields(ty) {
            let attrs = field.attributes;
            if field.is_static || attrs.non_serialized {
                continue;
            }
            if !(field.is_public() || attrs.serialize_field || attrs.serialize_reference) {
                continue;
            }
            // The host keeps node-to-node links itself
            if owner_is_host && self.registry.is_host_object(self.element_type(field.ty)) {
                continue;
            }

            let key = if keys.contains(&field.name) {
                let owner = self
                    .registry
                    .get(field.owner)
                    .map(|d| d.short_name().to_string())
                    .unwrap_or_default();
                format!("{}::{}", owner, field.name)
            } else {
                field.name.clone()
            };
            keys.insert(key.clone());
            plan.push(PlannedMember {
                key,
                field: field.clone(),
            });
        }
        plan
    }

    /// Unwrap list and array element types
    fn element_type(&self, ty: TypeKey) -> TypeKey {
        match self.registry.get(ty).map(|d| d.kind) {
            Some(TypeKind::List(elem)) | Some(TypeKind::Array(elem)) => self.element_type(elem),
            _ => ty,
        }
    }
}

impl fmt::Debug for GraphCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphCodec")
            .field("plans", &self.plans.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::types::FieldSpec;
    use crate::value::ObjectRef;
    use serde_json::json;

    struct AllAlive;

    impl Liveness for AllAlive {
        fn is_alive(&self, _id: ObjectId) -> bool {
            true
        }
    }

    /// Records every token it resolves and maps ids by +100
    #[derive(Default)]
    struct Shifting {
        seen: Vec<(ObjectId, TokenPolicy)>,
    }

    impl IdentityResolver for Shifting {
        fn resolve(&mut self, id: ObjectId, policy: TokenPolicy, _declared: TypeKey) -> Value {
            self.seen.push((id, policy));
            match policy {
                TokenPolicy::Follow => Value::Host(ObjectId::from_u64(id.as_u64() + 100)),
                TokenPolicy::Passive => Value::Host(id),
            }
        }
    }

    struct Fixture {
        registry: Arc<TypeRegistry>,
        codec: GraphCodec,
        point: TypeKey,
        shape: TypeKey,
        circle: TypeKey,
        node: TypeKey,
        nodes: TypeKey,
        node_scores: TypeKey,
        floats: TypeKey,
        unit: TypeKey,
        anchor: TypeKey,
    }

    fn fixture() -> Fixture {
        let mut b = TypeRegistry::builder();
        let int = b.int();
        let float = b.float();
        let string = b.string();
        let entity = b.entity();
        let behaviour = b.behaviour();
        let floats = b.list_of(float);
        let color = b.declare("game::Color", TypeKind::Enum).finish();

        let point = b
            .declare("game::Point", TypeKind::Struct)
            .serializable()
            .field(FieldSpec::public("x", float))
            .field(FieldSpec::public("y", float))
            .field(FieldSpec::public("label", string))
            .field(FieldSpec::public("color", color))
            .field(FieldSpec::private("secret", int))
            .finish();
        let shape = b
            .declare("game::Shape", TypeKind::Class)
            .abstract_()
            .serializable()
            .field(FieldSpec::public("name", string))
            .finish();
        let circle = b
            .declare("game::Circle", TypeKind::Class)
            .base(shape)
            .serializable()
            .field(FieldSpec::public("radius", float))
            .field(FieldSpec::public("name", int))
            .finish();
        let node = b
            .declare("game::Node", TypeKind::Class)
            .serializable()
            .field(FieldSpec::public("value", int))
            .finish();
        b.field(node, FieldSpec::public("next", node));
        b.field(node, FieldSpec::public("owner", entity));
        b.field(node, FieldSpec::public("home", entity).passive());
        let nodes = b.list_of(node);
        let node_scores = b.map_of(node, int);

        let anchor = b
            .declare("game::Anchor", TypeKind::Class)
            .serializable()
            .field(FieldSpec::public("position", point))
            .field(FieldSpec::public("count", int))
            .finish();
        let unit = b
            .declare("game::Unit", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("hp", int))
            .field(FieldSpec::public("target", entity))
            .field(FieldSpec::public("anchor", anchor))
            .field(FieldSpec::public("total", int).static_())
            .finish();

        let registry = Arc::new(b.build().unwrap());
        let sizes = BridgeConfig::default().resolve(registry.user_type_count());
        let accessors = Arc::new(AccessorCompiler::new(Arc::clone(&registry), &sizes));
        let types = Arc::new(TypeResolver::new(Arc::clone(&registry), sizes.types));
        let codec = GraphCodec::new(accessors, types, sizes.controlled, true);

        Fixture {
            registry,
            codec,
            point,
            shape,
            circle,
            node,
            nodes,
            node_scores,
            floats,
            unit,
            anchor,
        }
    }

    fn new_node(fx: &Fixture, value: i64) -> ObjectRef {
        let mut inst = fx.registry.instantiate(fx.node).unwrap();
        inst.set_slot(0, Value::Int(value));
        ObjectRef::new(inst)
    }

    fn round_trip(fx: &Fixture, value: &Value, declared: TypeKey) -> Value {
        let encoded = fx.codec.encode(value, &FieldMeta::plain(declared)).unwrap();
        fx.codec
            .decode_passive(&encoded.json, &FieldMeta::plain(declared), &AllAlive)
            .unwrap()
    }

    #[test]
    fn test_plain_struct_round_trip() {
        let fx = fixture();
        let mut inst = fx.registry.instantiate(fx.point).unwrap();
        inst.set_slot(0, Value::Float(1.5));
        inst.set_slot(1, Value::Float(f64::NEG_INFINITY));
        inst.set_slot(2, Value::str("spawn"));
        inst.set_slot(3, Value::Enum(2));
        inst.set_slot(4, Value::Int(99));
        let value = Value::Struct(Box::new(inst));

        let encoded = fx.codec.encode(&value, &FieldMeta::plain(fx.point)).unwrap();
        assert_eq!(encoded.json["y"], json!("-Infinity"));
        assert!(encoded.json.get("secret").is_none());
        assert!(!encoded.carries_identity);

        let decoded = round_trip(&fx, &value, fx.point);
        let Value::Struct(back) = &decoded else {
            panic!("expected struct, got {:?}", decoded);
        };
        assert_eq!(back.slot(0).and_then(Value::as_float), Some(1.5));
        assert_eq!(back.slot(1).and_then(Value::as_float), Some(f64::NEG_INFINITY));
        assert_eq!(back.slot(2).and_then(Value::as_str), Some("spawn"));
        assert_eq!(back.slot(3).and_then(Value::as_int), Some(2));
        // Private members do not participate
        assert_eq!(back.slot(4).and_then(Value::as_int), Some(0));
    }

    #[test]
    fn test_nan_round_trip() {
        let fx = fixture();
        let list = Value::list(
            fx.registry.float(),
            vec![Value::Float(f64::NAN), Value::Float(f64::INFINITY), Value::Float(0.25)],
        );
        let decoded = round_trip(&fx, &list, fx.floats);
        assert!(list.structurally_eq(&decoded));
    }

    #[test]
    fn test_polymorphic_field_uses_envelope() {
        let fx = fixture();
        let mut inst = fx.registry.instantiate(fx.circle).unwrap();
        inst.set_slot(0, Value::str("ring"));
        inst.set_slot(1, Value::Float(2.0));
        inst.set_slot(2, Value::Int(7));
        let value = Value::object(inst);

        let encoded = fx.codec.encode(&value, &FieldMeta::plain(fx.shape)).unwrap();
        assert_eq!(encoded.json[TYPE_KEY], json!("game::Circle"));
        // The shadowing field gets an owner-qualified key
        assert_eq!(encoded.json[PAYLOAD_KEY]["name"], json!("ring"));
        assert_eq!(encoded.json[PAYLOAD_KEY]["Circle::name"], json!(7));

        let decoded = round_trip(&fx, &value, fx.shape);
        assert_eq!(decoded.as_object().unwrap().ty(), fx.circle);
        assert!(value.structurally_eq(&decoded));
    }

    #[test]
    fn test_exact_type_has_no_envelope() {
        let fx = fixture();
        let value = Value::Object(new_node(&fx, 1));
        let encoded = fx.codec.encode(&value, &FieldMeta::plain(fx.node)).unwrap();
        assert!(encoded.json.get(TYPE_KEY).is_none());
        assert_eq!(encoded.json[OID_KEY], json!(1));

        let by_ref = FieldMeta {
            by_reference: true,
            ..FieldMeta::plain(fx.node)
        };
        let encoded = fx.codec.encode(&value, &by_ref).unwrap();
        assert_eq!(encoded.json[TYPE_KEY], json!("game::Node"));
    }

    #[test]
    fn test_circular_structure_survives() {
        let fx = fixture();
        let a = new_node(&fx, 1);
        let b = new_node(&fx, 2);
        a.write().set_slot(1, Value::Object(b.clone()));
        b.write().set_slot(1, Value::Object(a.clone()));

        let decoded = round_trip(&fx, &Value::Object(a.clone()), fx.node);
        let a2 = decoded.as_object().unwrap().clone();
        let b2 = a2.read().slot(1).and_then(Value::as_object).cloned().unwrap();
        let back = b2.read().slot(1).and_then(Value::as_object).cloned().unwrap();

        assert!(back.ptr_eq(&a2));
        assert!(!a2.ptr_eq(&a));
        assert_eq!(b2.read().slot(0).and_then(Value::as_int), Some(2));
    }

    #[test]
    fn test_shared_elements_stay_shared() {
        let fx = fixture();
        let shared = new_node(&fx, 5);
        let list = Value::list(
            fx.node,
            vec![Value::Object(shared.clone()), Value::Object(shared), Value::Null],
        );

        let decoded = round_trip(&fx, &list, fx.nodes);
        let items = decoded.as_list().unwrap().read().items.clone();
        assert_eq!(items.len(), 3);
        assert!(items[0].as_object().unwrap().ptr_eq(items[1].as_object().unwrap()));
        assert!(items[2].is_null());
    }

    #[test]
    fn test_null_and_empty_collections_differ() {
        let fx = fixture();
        let null = round_trip(&fx, &Value::Null, fx.nodes);
        assert!(null.is_null());

        let empty = round_trip(&fx, &Value::list(fx.node, Vec::new()), fx.nodes);
        assert!(empty.as_list().unwrap().is_empty());
    }

    #[test]
    fn test_map_with_object_keys() {
        let fx = fixture();
        let k1 = new_node(&fx, 1);
        let k2 = new_node(&fx, 2);
        let map = Value::map(
            fx.node,
            fx.registry.int(),
            vec![(Value::Object(k1), Value::Int(10)), (Value::Object(k2), Value::Int(20))],
        );

        let encoded = fx.codec.encode(&map, &FieldMeta::plain(fx.node_scores)).unwrap();
        assert_eq!(encoded.json.as_array().unwrap().len(), 2);
        assert_eq!(encoded.json[1][ENTRY_VALUE], json!(20));

        let decoded = round_trip(&fx, &map, fx.node_scores);
        assert!(map.structurally_eq(&decoded));
    }

    #[test]
    fn test_null_map_keys_are_skipped() {
        let fx = fixture();
        let doc = json!([
            { ENTRY_KEY: null, ENTRY_VALUE: 1 },
            { ENTRY_KEY: { "value": 3 }, ENTRY_VALUE: 2 }
        ]);
        let decoded = fx
            .codec
            .decode_passive(&doc, &FieldMeta::plain(fx.node_scores), &AllAlive)
            .unwrap();
        assert_eq!(decoded.as_map().unwrap().len(), 1);
    }

    #[test]
    fn test_identity_tokens_follow_or_stay() {
        let fx = fixture();
        let node = new_node(&fx, 1);
        node.write().set_slot(2, Value::Host(ObjectId::from_u64(7)));
        node.write().set_slot(3, Value::Host(ObjectId::from_u64(8)));

        let encoded = fx
            .codec
            .encode(&Value::Object(node), &FieldMeta::plain(fx.node))
            .unwrap();
        assert!(encoded.carries_identity);
        assert_eq!(encoded.json["owner"], json!({ ID_KEY: 7 }));

        let mut resolver = Shifting::default();
        let decoded = fx
            .codec
            .decode(&encoded.json, &FieldMeta::plain(fx.node), &mut resolver)
            .unwrap();
        let back = decoded.as_object().unwrap().read().clone();
        assert_eq!(back.slot(2).and_then(Value::as_host), Some(ObjectId::from_u64(107)));
        assert_eq!(back.slot(3).and_then(Value::as_host), Some(ObjectId::from_u64(8)));
        assert!(resolver
            .seen
            .contains(&(ObjectId::from_u64(8), TokenPolicy::Passive)));
    }

    #[test]
    fn test_bad_member_is_skipped() {
        let fx = fixture();
        let doc = json!({ "position": "not a struct", "count": 4 });
        let mut inst = fx.registry.instantiate(fx.anchor).unwrap();
        let restored = fx
            .codec
            .populate(&mut inst, &doc, &mut PassiveResolver::new(&AllAlive))
            .unwrap();
        assert_eq!(restored, 1);
        assert_eq!(inst.slot(1).and_then(Value::as_int), Some(4));
    }

    #[test]
    fn test_unknown_envelope_type_is_an_error() {
        let fx = fixture();
        let doc = json!({ TYPE_KEY: "game::Square", PAYLOAD_KEY: {} });
        let err = fx
            .codec
            .decode_passive(&doc, &FieldMeta::plain(fx.shape), &AllAlive)
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownTypeName(_)));

        let doc = json!({ "name": "bare" });
        let err = fx
            .codec
            .decode_passive(&doc, &FieldMeta::plain(fx.shape), &AllAlive)
            .unwrap_err();
        assert!(matches!(err, CodecError::Abstract(_)));
    }

    #[test]
    fn test_member_plan_skips_host_links_on_host_owners() {
        let fx = fixture();
        let keys: Vec<String> = fx
            .codec
            .member_plan(fx.unit)
            .iter()
            .map(|m| m.key.clone())
            .collect();
        assert_eq!(keys, vec!["hp".to_string(), "anchor".to_string()]);

        let mut unit = fx.registry.instantiate(fx.unit).unwrap();
        unit.set_slot(0, Value::Int(12));
        let json = fx.codec.encode_instance(&unit).unwrap();
        assert_eq!(json["hp"], json!(12));
        assert_eq!(json["anchor"], Json::Null);
    }

    type Json = serde_json::Value;
}
