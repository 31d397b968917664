//! Encoding half of the graph codec

use super::{
    CodecError, Encoded, FieldMeta, GraphCodec, ENTRY_KEY, ENTRY_VALUE, ID_KEY, OID_KEY,
    PAYLOAD_KEY, REF_KEY, TYPE_KEY,
};
use crate::types::TypeKey;
use crate::value::{Instance, Value};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Number};
use tracing::{debug, warn};

type Json = serde_json::Value;

/// Per-document state: managed objects already written
#[derive(Default)]
struct EncodeContext {
    seen: FxHashMap<usize, u64>,
    carries_identity: bool,
}

impl EncodeContext {
    fn next_oid(&self) -> u64 {
        self.seen.len() as u64 + 1
    }
}

impl GraphCodec {
    /// Encode one field value
    pub fn encode(&self, value: &Value, meta: &FieldMeta) -> Result<Encoded, CodecError> {
        if value.is_null() {
            return Ok(Encoded {
                json: Json::Null,
                carries_identity: false,
            });
        }
        let mut ctx = EncodeContext::default();
        let json = self.encode_value(value, meta.declared, meta.by_reference, &mut ctx)?;
        Ok(Encoded {
            json,
            carries_identity: ctx.carries_identity,
        })
    }

    /// Encode every participating member of an instance as one object
    pub fn encode_instance(&self, instance: &Instance) -> Result<Json, CodecError> {
        let mut ctx = EncodeContext::default();
        Ok(Json::Object(self.encode_members(instance, &mut ctx)))
    }

    fn encode_value(
        &self,
        value: &Value,
        declared: TypeKey,
        by_reference: bool,
        ctx: &mut EncodeContext,
    ) -> Result<Json, CodecError> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) | Value::Enum(i) => json!(i),
            Value::Float(x) => encode_float(*x),
            Value::Str(s) => Json::String(s.clone()),
            Value::Host(id) => {
                ctx.carries_identity = true;
                json!({ ID_KEY: id.as_u64() })
            }
            Value::Struct(instance) => Json::Object(self.encode_members(instance, ctx)),
            Value::Object(object) => {
                if let Some(oid) = ctx.seen.get(&object.addr()) {
                    return Ok(json!({ REF_KEY: oid }));
                }
                let oid = ctx.next_oid();
                ctx.seen.insert(object.addr(), oid);

                let instance = object.read().clone();
                let mut body = Map::new();
                body.insert(OID_KEY.to_string(), json!(oid));
                body.extend(self.encode_members(&instance, ctx));

                if by_reference || self.needs_envelope(instance.ty(), declared) {
                    json!({
                        TYPE_KEY: self.registry.name_of(instance.ty()),
                        PAYLOAD_KEY: Json::Object(body),
                    })
                } else {
                    Json::Object(body)
                }
            }
            Value::List(list) | Value::Array(list) => {
                let data = list.read().clone();
                let items = data
                    .items
                    .iter()
                    .map(|item| self.encode_value(item, data.elem, by_reference, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Json::Array(items)
            }
            Value::Map(map) => {
                let data = map.read().clone();
                let entries = data
                    .entries()
                    .iter()
                    .map(|(k, v)| {
                        Ok(json!({
                            ENTRY_KEY: self.encode_value(k, data.key, by_reference, ctx)?,
                            ENTRY_VALUE: self.encode_value(v, data.value, by_reference, ctx)?,
                        }))
                    })
                    .collect::<Result<Vec<_>, CodecError>>()?;
                Json::Array(entries)
            }
        })
    }

    /// Polymorphic values carry their concrete type name
    fn needs_envelope(&self, concrete: TypeKey, declared: TypeKey) -> bool {
        concrete != declared
            || self
                .registry
                .get(declared)
                .map(|d| d.is_abstract)
                .unwrap_or(true)
    }

    fn encode_members(&self, instance: &Instance, ctx: &mut EncodeContext) -> Map<String, Json> {
        let mut out = Map::new();
        for member in self.member_plan(instance.ty()).iter() {
            let field = &member.field;
            let encoded = self
                .accessors
                .get(instance, field)
                .map_err(CodecError::from)
                .and_then(|value| {
                    if value.is_null() {
                        return Ok(Json::Null);
                    }
                    self.encode_value(&value, field.ty, field.attributes.serialize_reference, ctx)
                });
            match encoded {
                Ok(json) => {
                    out.insert(member.key.clone(), json);
                }
                Err(err) => {
                    warn!(field = %field.name, error = %err, "failed to encode member");
                }
            }
        }
        if self.debug_logs {
            debug!(
                ty = %self.registry.name_of(instance.ty()),
                members = out.len(),
                "encoded instance"
            );
        }
        out
    }
}

fn encode_float(x: f64) -> Json {
    if x.is_nan() {
        Json::String("NaN".to_string())
    } else if x.is_infinite() {
        let token = if x > 0.0 { "Infinity" } else { "-Infinity" };
        Json::String(token.to_string())
    } else {
        Number::from_f64(x).map(Json::Number).unwrap_or(Json::Null)
    }
}
