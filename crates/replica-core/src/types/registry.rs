//! Type registry and its builder
//!
//! Types are declared once through [`TypeRegistryBuilder`] and frozen into a
//! [`TypeRegistry`]. Building validates base chains and lays out instance
//! slots so that a field keeps the same slot in every subclass.

use super::{
    CopyFn, FieldAttributes, FieldDescriptor, Initializer, PrimitiveKind, TypeDescriptor, TypeKey,
    TypeKind, TypeOrigin, Visibility,
};
use crate::lifecycle::{HookFn, HookKind, LifecycleHooks};
use crate::value::{Instance, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or querying the registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two types share a qualified name
    #[error("Duplicate type name '{0}'")]
    DuplicateType(String),

    /// Reference to a key that was never declared
    #[error("Unknown type {0}")]
    UnknownType(TypeKey),

    /// Base type has an incompatible kind
    #[error("Type '{ty}' cannot derive from '{base}'")]
    InvalidBase {
        /// Derived type
        ty: String,
        /// Offending base
        base: String,
    },

    /// Two fields on one type share a name
    #[error("Duplicate field '{field}' on '{ty}'")]
    DuplicateField {
        /// Owner
        ty: String,
        /// Field name
        field: String,
    },

    /// A struct contains itself by value
    #[error("Struct '{0}' contains itself by value")]
    RecursiveStruct(String),

    /// The type has no instances (primitives, collections)
    #[error("Type '{0}' cannot be instantiated")]
    NotInstantiable(String),

    /// The type is abstract
    #[error("Type '{0}' is abstract")]
    AbstractType(String),
}

/// Keys of the types every registry starts with
#[derive(Debug, Clone, Copy)]
struct Builtins {
    bool: TypeKey,
    int: TypeKey,
    float: TypeKey,
    string: TypeKey,
    object: TypeKey,
    entity: TypeKey,
    member: TypeKey,
    behaviour: TypeKey,
    asset: TypeKey,
}

// ============================================================================
// Field declarations
// ============================================================================

/// Declaration of one field, consumed by [`TypeDefBuilder::field`]
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    ty: TypeKey,
    visibility: Visibility,
    is_static: bool,
    attributes: FieldAttributes,
}

impl FieldSpec {
    /// A public instance field
    pub fn public(name: impl Into<String>, ty: TypeKey) -> Self {
        Self {
            name: name.into(),
            ty,
            visibility: Visibility::Public,
            is_static: false,
            attributes: FieldAttributes::default(),
        }
    }

    /// A private instance field
    pub fn private(name: impl Into<String>, ty: TypeKey) -> Self {
        Self {
            visibility: Visibility::Private,
            ..Self::public(name, ty)
        }
    }

    /// Opt the field into serialization
    pub fn serialize_field(mut self) -> Self {
        self.attributes.serialize_field = true;
        self
    }

    /// Serialize the field by identity
    pub fn serialize_reference(mut self) -> Self {
        self.attributes.serialize_reference = true;
        self
    }

    /// Exclude the field from serialization
    pub fn non_serialized(mut self) -> Self {
        self.attributes.non_serialized = true;
        self
    }

    /// Keep identity tokens pointing at originals
    pub fn passive(mut self) -> Self {
        self.attributes.passive = true;
        self
    }

    /// Make the field static
    pub fn static_(mut self) -> Self {
        self.is_static = true;
        self
    }
}

// ============================================================================
// Builder
// ============================================================================

struct PendingType {
    name: String,
    kind: TypeKind,
    origin: TypeOrigin,
    base: Option<TypeKey>,
    is_abstract: bool,
    serializable: bool,
    fields: Vec<FieldSpec>,
    hooks: LifecycleHooks,
    initializer: Option<Initializer>,
    copy_constructor: Option<CopyFn>,
}

impl PendingType {
    fn new(name: String, kind: TypeKind, origin: TypeOrigin) -> Self {
        Self {
            name,
            kind,
            origin,
            base: None,
            is_abstract: false,
            serializable: false,
            fields: Vec::new(),
            hooks: LifecycleHooks::default(),
            initializer: None,
            copy_constructor: None,
        }
    }
}

/// Builder collecting type declarations
pub struct TypeRegistryBuilder {
    pending: Vec<PendingType>,
    composites: FxHashMap<TypeKind, TypeKey>,
    builtins: Builtins,
}

impl TypeRegistryBuilder {
    fn new() -> Self {
        let mut builder = Self {
            pending: Vec::new(),
            composites: FxHashMap::default(),
            builtins: Builtins {
                bool: TypeKey(0),
                int: TypeKey(0),
                float: TypeKey(0),
                string: TypeKey(0),
                object: TypeKey(0),
                entity: TypeKey(0),
                member: TypeKey(0),
                behaviour: TypeKey(0),
                asset: TypeKey(0),
            },
        };

        let prim = |b: &mut Self, name: &str, kind| {
            b.push(PendingType::new(
                name.to_string(),
                TypeKind::Primitive(kind),
                TypeOrigin::Framework,
            ))
        };
        let bool_ = prim(&mut builder, "bool", PrimitiveKind::Bool);
        let int = prim(&mut builder, "int", PrimitiveKind::Int);
        let float = prim(&mut builder, "float", PrimitiveKind::Float);
        let string = prim(&mut builder, "string", PrimitiveKind::Str);

        let host = |b: &mut Self, name: &str, base: Option<TypeKey>, is_abstract| {
            let mut def = PendingType::new(name.to_string(), TypeKind::HostObject, TypeOrigin::Framework);
            def.base = base;
            def.is_abstract = is_abstract;
            def.serializable = true;
            b.push(def)
        };
        let object = host(&mut builder, "host::Object", None, true);
        let entity = host(&mut builder, "host::Entity", Some(object), false);
        let member = host(&mut builder, "host::Member", Some(object), true);
        let behaviour = host(&mut builder, "host::Behaviour", Some(member), false);
        let asset = host(&mut builder, "host::Asset", Some(object), false);

        builder.builtins = Builtins {
            bool: bool_,
            int,
            float,
            string,
            object,
            entity,
            member,
            behaviour,
            asset,
        };
        builder
    }

    fn push(&mut self, def: PendingType) -> TypeKey {
        let key = TypeKey(self.pending.len() as u32);
        self.pending.push(def);
        key
    }

    /// Start declaring a user type
    pub fn declare(&mut self, name: impl Into<String>, kind: TypeKind) -> TypeDefBuilder<'_> {
        TypeDefBuilder {
            builder: self,
            def: PendingType::new(name.into(), kind, TypeOrigin::User),
        }
    }

    /// Add a field to an already declared type (for self-referencing types)
    pub fn field(&mut self, owner: TypeKey, spec: FieldSpec) {
        if let Some(def) = self.pending.get_mut(owner.index()) {
            def.fields.push(spec);
        }
    }

    /// Attach a callback to an already declared type
    pub fn hook(&mut self, owner: TypeKey, kind: HookKind, hook: HookFn) {
        if let Some(def) = self.pending.get_mut(owner.index()) {
            def.hooks.set(kind, hook);
        }
    }

    /// Interned `List<elem>`
    pub fn list_of(&mut self, elem: TypeKey) -> TypeKey {
        self.composite(TypeKind::List(elem))
    }

    /// Interned `elem[]`
    pub fn array_of(&mut self, elem: TypeKey) -> TypeKey {
        self.composite(TypeKind::Array(elem))
    }

    /// Interned `Map<key, value>`
    pub fn map_of(&mut self, key: TypeKey, value: TypeKey) -> TypeKey {
        self.composite(TypeKind::Map(key, value))
    }

    fn composite(&mut self, kind: TypeKind) -> TypeKey {
        if let Some(key) = self.composites.get(&kind) {
            return *key;
        }
        let name = match kind {
            TypeKind::List(e) => format!("List<{}>", self.name_of(e)),
            TypeKind::Array(e) => format!("{}[]", self.name_of(e)),
            TypeKind::Map(k, v) => format!("Map<{}, {}>", self.name_of(k), self.name_of(v)),
            _ => String::new(),
        };
        let mut def = PendingType::new(name, kind, TypeOrigin::Framework);
        def.serializable = true;
        let key = self.push(def);
        self.composites.insert(kind, key);
        key
    }

    fn name_of(&self, key: TypeKey) -> String {
        self.pending
            .get(key.index())
            .map(|d| d.name.clone())
            .unwrap_or_else(|| key.to_string())
    }

    /// `bool`
    pub fn bool(&self) -> TypeKey {
        self.builtins.bool
    }

    /// `int`
    pub fn int(&self) -> TypeKey {
        self.builtins.int
    }

    /// `float`
    pub fn float(&self) -> TypeKey {
        self.builtins.float
    }

    /// `string`
    pub fn string(&self) -> TypeKey {
        self.builtins.string
    }

    /// Root of all host objects
    pub fn object(&self) -> TypeKey {
        self.builtins.object
    }

    /// Host entity type
    pub fn entity(&self) -> TypeKey {
        self.builtins.entity
    }

    /// Abstract member base
    pub fn member(&self) -> TypeKey {
        self.builtins.member
    }

    /// Scriptable member base
    pub fn behaviour(&self) -> TypeKey {
        self.builtins.behaviour
    }

    /// Free-standing asset base
    pub fn asset(&self) -> TypeKey {
        self.builtins.asset
    }

    /// Validate declarations and freeze the registry
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        let count = self.pending.len();
        let mut by_name: FxHashMap<String, TypeKey> = FxHashMap::default();
        let mut by_short: FxHashMap<String, Vec<TypeKey>> = FxHashMap::default();
        let mut types: Vec<TypeDescriptor> = Vec::with_capacity(count);

        for (index, def) in self.pending.into_iter().enumerate() {
            let key = TypeKey(index as u32);
            if by_name.insert(def.name.clone(), key).is_some() {
                return Err(RegistryError::DuplicateType(def.name));
            }

            for referenced in kind_references(def.kind) {
                if referenced.index() >= count {
                    return Err(RegistryError::UnknownType(referenced));
                }
            }

            // Bases are declared before their subclasses, so their layout is final.
            let base_slots = match def.base {
                Some(base) => {
                    let base_desc = types.get(base.index()).ok_or(RegistryError::UnknownType(base))?;
                    if !base_compatible(def.kind, base_desc.kind) {
                        return Err(RegistryError::InvalidBase {
                            ty: def.name,
                            base: base_desc.name.clone(),
                        });
                    }
                    base_desc.slot_count
                }
                None => 0,
            };

            let mut seen = FxHashSet::default();
            let mut fields = Vec::with_capacity(def.fields.len());
            let mut next_slot = base_slots;
            for (i, spec) in def.fields.into_iter().enumerate() {
                if spec.ty.index() >= count {
                    return Err(RegistryError::UnknownType(spec.ty));
                }
                if !seen.insert(spec.name.clone()) {
                    return Err(RegistryError::DuplicateField {
                        ty: def.name,
                        field: spec.name,
                    });
                }
                let slot = if spec.is_static {
                    None
                } else {
                    next_slot += 1;
                    Some(next_slot - 1)
                };
                fields.push(FieldDescriptor {
                    owner: key,
                    index: i as u32,
                    name: spec.name,
                    ty: spec.ty,
                    visibility: spec.visibility,
                    is_static: spec.is_static,
                    attributes: spec.attributes,
                    slot,
                });
            }

            let short = def.name.rsplit("::").next().unwrap_or(&def.name).to_string();
            by_short.entry(short).or_default().push(key);

            types.push(TypeDescriptor {
                key,
                name: def.name,
                kind: def.kind,
                origin: def.origin,
                base: def.base,
                is_abstract: def.is_abstract,
                serializable: def.serializable,
                fields,
                slot_count: next_slot,
                hooks: def.hooks,
                initializer: def.initializer,
                copy_constructor: def.copy_constructor,
            });
        }

        let registry = TypeRegistry {
            types,
            by_name,
            by_short,
            builtins: self.builtins,
        };
        registry.check_struct_recursion()?;
        Ok(registry)
    }
}

fn kind_references(kind: TypeKind) -> Vec<TypeKey> {
    match kind {
        TypeKind::List(e) | TypeKind::Array(e) => vec![e],
        TypeKind::Map(k, v) => vec![k, v],
        _ => Vec::new(),
    }
}

fn base_compatible(kind: TypeKind, base: TypeKind) -> bool {
    matches!(
        (kind, base),
        (TypeKind::Class, TypeKind::Class) | (TypeKind::HostObject, TypeKind::HostObject)
    )
}

/// Fluent declaration of one user type
pub struct TypeDefBuilder<'a> {
    builder: &'a mut TypeRegistryBuilder,
    def: PendingType,
}

impl<'a> TypeDefBuilder<'a> {
    /// Set the base type
    pub fn base(mut self, base: TypeKey) -> Self {
        self.def.base = Some(base);
        self
    }

    /// Mark the type abstract
    pub fn abstract_(mut self) -> Self {
        self.def.is_abstract = true;
        self
    }

    /// Mark the type serializable
    pub fn serializable(mut self) -> Self {
        self.def.serializable = true;
        self
    }

    /// Declare the type as shipped with the host
    pub fn framework(mut self) -> Self {
        self.def.origin = TypeOrigin::Framework;
        self
    }

    /// Add a field
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.def.fields.push(spec);
        self
    }

    /// Attach a lifecycle callback
    pub fn hook(mut self, kind: HookKind, hook: HookFn) -> Self {
        self.def.hooks.set(kind, hook);
        self
    }

    /// Set the field initializer
    pub fn initializer(mut self, init: impl Fn(&mut Instance) + Send + Sync + 'static) -> Self {
        self.def.initializer = Some(Arc::new(init));
        self
    }

    /// Set the same-type copy constructor
    pub fn copy_constructor(mut self, copy: impl Fn(&Instance) -> Instance + Send + Sync + 'static) -> Self {
        self.def.copy_constructor = Some(Arc::new(copy));
        self
    }

    /// Finish the declaration
    pub fn finish(self) -> TypeKey {
        self.builder.push(self.def)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Frozen type metadata, shared as `Arc<TypeRegistry>`
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
    by_name: FxHashMap<String, TypeKey>,
    by_short: FxHashMap<String, Vec<TypeKey>>,
    builtins: Builtins,
}

impl TypeRegistry {
    /// Create a registry builder with the built-in types declared
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    /// Get a descriptor
    pub fn get(&self, key: TypeKey) -> Option<&TypeDescriptor> {
        self.types.get(key.index())
    }

    /// Get a descriptor or fail
    pub fn descriptor(&self, key: TypeKey) -> Result<&TypeDescriptor, RegistryError> {
        self.get(key).ok_or(RegistryError::UnknownType(key))
    }

    /// Name of a type, or its key when unknown
    pub fn name_of(&self, key: TypeKey) -> String {
        self.get(key)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| key.to_string())
    }

    /// Look up a type by qualified name
    pub fn by_name(&self, name: &str) -> Option<TypeKey> {
        self.by_name.get(name).copied()
    }

    /// All types whose last path segment is `short`
    pub fn find_by_short_name(&self, short: &str) -> &[TypeKey] {
        self.by_short.get(short).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Always false: the built-ins are present
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate over every descriptor
    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.iter()
    }

    /// Number of user-declared types
    pub fn user_type_count(&self) -> usize {
        self.types
            .iter()
            .filter(|t| t.origin == TypeOrigin::User)
            .count()
    }

    /// The type itself followed by its bases, nearest first
    pub fn ancestors(&self, key: TypeKey) -> Ancestors<'_> {
        Ancestors {
            registry: self,
            next: self.get(key).map(|d| d.key),
        }
    }

    /// Check if `ty` is `ancestor` or derives from it
    pub fn is_subtype(&self, ty: TypeKey, ancestor: TypeKey) -> bool {
        self.ancestors(ty).any(|d| d.key == ancestor)
    }

    /// Every field of a type and its ancestors, ancestors first
    pub fn all_fields(&self, key: TypeKey) -> Vec<&FieldDescriptor> {
        let mut chain: Vec<&TypeDescriptor> = self.ancestors(key).collect();
        chain.reverse();
        chain.into_iter().flat_map(|d| d.fields.iter()).collect()
    }

    /// Find a field by name, derived declarations shadowing ancestors
    pub fn find_field(&self, key: TypeKey, name: &str) -> Option<&FieldDescriptor> {
        self.ancestors(key).find_map(|d| d.declared_field(name))
    }

    /// Check if a type is a host object type
    pub fn is_host_object(&self, key: TypeKey) -> bool {
        self.get(key).map(|d| d.is_host_object()).unwrap_or(false)
    }

    /// Default value of a slot of this type
    pub fn default_value(&self, key: TypeKey) -> Value {
        let Some(desc) = self.get(key) else {
            return Value::Null;
        };
        match desc.kind {
            TypeKind::Primitive(PrimitiveKind::Bool) => Value::Bool(false),
            TypeKind::Primitive(PrimitiveKind::Int) => Value::Int(0),
            TypeKind::Primitive(PrimitiveKind::Float) => Value::Float(0.0),
            TypeKind::Enum => Value::Enum(0),
            TypeKind::Struct => Value::Struct(Box::new(self.zeroed(desc))),
            _ => Value::Null,
        }
    }

    fn zeroed(&self, desc: &TypeDescriptor) -> Instance {
        let mut slots = vec![Value::Null; desc.slot_count];
        for field in self.all_fields(desc.key) {
            if let Some(slot) = field.slot {
                slots[slot] = self.default_value(field.ty);
            }
        }
        Instance::new(desc.key, slots)
    }

    /// Construct an instance: slot defaults, then initializers base-first
    pub fn instantiate(&self, key: TypeKey) -> Result<Instance, RegistryError> {
        let desc = self.descriptor(key)?;
        match desc.kind {
            TypeKind::Struct | TypeKind::Class | TypeKind::HostObject => {}
            _ => return Err(RegistryError::NotInstantiable(desc.name.clone())),
        }
        if desc.is_abstract {
            return Err(RegistryError::AbstractType(desc.name.clone()));
        }

        let mut instance = self.zeroed(desc);
        let mut chain: Vec<&TypeDescriptor> = self.ancestors(key).collect();
        chain.reverse();
        for ancestor in chain {
            if let Some(init) = &ancestor.initializer {
                init(&mut instance);
            }
        }
        Ok(instance)
    }

    /// Check if a value may be stored in a slot of the declared type
    pub fn value_conforms(&self, value: &Value, declared: TypeKey) -> bool {
        let Some(desc) = self.get(declared) else {
            return false;
        };
        match (value, desc.kind) {
            (Value::Null, kind) => kind.is_reference(),
            (Value::Bool(_), TypeKind::Primitive(PrimitiveKind::Bool)) => true,
            (Value::Int(_), TypeKind::Primitive(PrimitiveKind::Int)) => true,
            (Value::Float(_), TypeKind::Primitive(PrimitiveKind::Float)) => true,
            (Value::Str(_), TypeKind::Primitive(PrimitiveKind::Str)) => true,
            (Value::Enum(_), TypeKind::Enum) => true,
            (Value::Struct(inst), TypeKind::Struct) => inst.ty() == declared,
            (Value::Object(obj), TypeKind::Class) => self.is_subtype(obj.ty(), declared),
            (Value::List(list), TypeKind::List(elem)) | (Value::Array(list), TypeKind::Array(elem)) => {
                list.read().elem == elem
            }
            (Value::Map(map), TypeKind::Map(k, v)) => {
                let data = map.read();
                data.key == k && data.value == v
            }
            (Value::Host(_), TypeKind::HostObject) => true,
            _ => false,
        }
    }

    fn check_struct_recursion(&self) -> Result<(), RegistryError> {
        for desc in self.types.iter().filter(|d| d.kind == TypeKind::Struct) {
            let mut stack: Vec<TypeKey> = desc
                .fields
                .iter()
                .filter(|f| !f.is_static)
                .map(|f| f.ty)
                .collect();
            let mut seen = FxHashSet::default();
            while let Some(ty) = stack.pop() {
                if ty == desc.key {
                    return Err(RegistryError::RecursiveStruct(desc.name.clone()));
                }
                let Some(inner) = self.get(ty) else { continue };
                if inner.kind == TypeKind::Struct && seen.insert(ty) {
                    stack.extend(inner.fields.iter().filter(|f| !f.is_static).map(|f| f.ty));
                }
            }
        }
        Ok(())
    }

    /// `bool`
    pub fn bool(&self) -> TypeKey {
        self.builtins.bool
    }

    /// `int`
    pub fn int(&self) -> TypeKey {
        self.builtins.int
    }

    /// `float`
    pub fn float(&self) -> TypeKey {
        self.builtins.float
    }

    /// `string`
    pub fn string(&self) -> TypeKey {
        self.builtins.string
    }

    /// Root of all host objects
    pub fn object(&self) -> TypeKey {
        self.builtins.object
    }

    /// Host entity type
    pub fn entity(&self) -> TypeKey {
        self.builtins.entity
    }

    /// Abstract member base
    pub fn member(&self) -> TypeKey {
        self.builtins.member
    }

    /// Scriptable member base
    pub fn behaviour(&self) -> TypeKey {
        self.builtins.behaviour
    }

    /// Free-standing asset base
    pub fn asset(&self) -> TypeKey {
        self.builtins.asset
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.len())
            .field("user_types", &self.user_type_count())
            .finish()
    }
}

/// Iterator over a type and its bases
pub struct Ancestors<'a> {
    registry: &'a TypeRegistry,
    next: Option<TypeKey>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a TypeDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let desc = self.registry.get(self.next?)?;
        self.next = desc.base;
        Some(desc)
    }
}
