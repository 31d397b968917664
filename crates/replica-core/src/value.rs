//! Managed values held in host object fields
//!
//! Scalars are stored inline. Classes, lists, arrays and maps live behind
//! shared handles so two fields can observe the same instance; the bridge
//! relies on that identity when it preserves sharing across a clone.

use crate::host::ObjectId;
use crate::types::TypeKey;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Field storage of one object: a type tag plus one value per instance slot
#[derive(Debug, Clone)]
pub struct Instance {
    ty: TypeKey,
    slots: Vec<Value>,
}

impl Instance {
    /// Create an instance from its slot values
    pub fn new(ty: TypeKey, slots: Vec<Value>) -> Self {
        Self { ty, slots }
    }

    /// Concrete type
    pub fn ty(&self) -> TypeKey {
        self.ty
    }

    /// All slots
    pub fn slots(&self) -> &[Value] {
        &self.slots
    }

    /// Get a slot
    pub fn slot(&self, index: usize) -> Option<&Value> {
        self.slots.get(index)
    }

    /// Get a slot mutably
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.slots.get_mut(index)
    }

    /// Overwrite a slot; returns false when out of range
    pub fn set_slot(&mut self, index: usize, value: Value) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// A field value
#[derive(Clone)]
pub enum Value {
    /// Absent reference
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// Enum discriminant
    Enum(i64),
    /// Value-type instance, copied on assignment
    Struct(Box<Instance>),
    /// Managed class instance
    Object(ObjectRef),
    /// Growable list
    List(ListRef),
    /// Fixed-length array
    Array(ListRef),
    /// Dictionary
    Map(MapRef),
    /// Reference to a host-native object
    Host(ObjectId),
}

impl Value {
    /// Wrap an instance in a fresh managed object
    pub fn object(instance: Instance) -> Self {
        Value::Object(ObjectRef::new(instance))
    }

    /// Build a list value
    pub fn list(elem: TypeKey, items: Vec<Value>) -> Self {
        Value::List(ListRef::new(elem, items))
    }

    /// Build an array value
    pub fn array(elem: TypeKey, items: Vec<Value>) -> Self {
        Value::Array(ListRef::new(elem, items))
    }

    /// Build a map value
    pub fn map(key: TypeKey, value: TypeKey, entries: Vec<(Value, Value)>) -> Self {
        Value::Map(MapRef::new(key, value, entries))
    }

    /// Build a string value
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Check for null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Variant name, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Enum(_) => "enum",
            Value::Struct(_) => "struct",
            Value::Object(_) => "object",
            Value::List(_) => "list",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Host(_) => "host",
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) | Value::Enum(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Float payload
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Host object payload
    pub fn as_host(&self) -> Option<ObjectId> {
        match self {
            Value::Host(id) => Some(*id),
            _ => None,
        }
    }

    /// Managed object payload
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// List or array payload
    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Value::List(l) | Value::Array(l) => Some(l),
            _ => None,
        }
    }

    /// Map payload
    pub fn as_map(&self) -> Option<&MapRef> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Check if both values are the same reference (or equal scalars)
    ///
    /// This is the key equality used by maps.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::List(a), Value::List(b)) | (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            (Value::Struct(a), Value::Struct(b)) => {
                a.ty == b.ty
                    && a.slots.len() == b.slots.len()
                    && a.slots.iter().zip(&b.slots).all(|(x, y)| x.same(y))
            }
            _ => self.scalar_eq(other),
        }
    }

    fn scalar_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            _ => false,
        }
    }

    /// Deep structural comparison; handles shared and circular graphs
    ///
    /// Two graphs are equal when they have the same shape and scalars. Object
    /// identities are not compared, only what they contain.
    pub fn structurally_eq(&self, other: &Value) -> bool {
        let mut visited = FxHashSet::default();
        self.structurally_eq_inner(other, &mut visited)
    }

    fn structurally_eq_inner(&self, other: &Value, visited: &mut FxHashSet<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Struct(a), Value::Struct(b)) => instances_eq(a, b, visited),
            (Value::Object(a), Value::Object(b)) => {
                if a.ptr_eq(b) || !visited.insert((a.addr(), b.addr())) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                instances_eq(&a, &b, visited)
            }
            (Value::List(a), Value::List(b)) | (Value::Array(a), Value::Array(b)) => {
                if a.ptr_eq(b) || !visited.insert((a.addr(), b.addr())) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.elem == b.elem
                    && a.items.len() == b.items.len()
                    && a
                        .items
                        .iter()
                        .zip(&b.items)
                        .all(|(x, y)| x.structurally_eq_inner(y, visited))
            }
            (Value::Map(a), Value::Map(b)) => {
                if a.ptr_eq(b) || !visited.insert((a.addr(), b.addr())) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.entries().iter().zip(b.entries()).all(|((ka, va), (kb, vb))| {
                        ka.structurally_eq_inner(kb, visited) && va.structurally_eq_inner(vb, visited)
                    })
            }
            _ => self.scalar_eq(other),
        }
    }
}

fn instances_eq(a: &Instance, b: &Instance, visited: &mut FxHashSet<(usize, usize)>) -> bool {
    a.ty == b.ty
        && a.slots.len() == b.slots.len()
        && a
            .slots
            .iter()
            .zip(&b.slots)
            .all(|(x, y)| x.structurally_eq_inner(y, visited))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Enum(i) => write!(f, "Enum({})", i),
            Value::Struct(inst) => write!(f, "Struct({}, {} slots)", inst.ty, inst.slots.len()),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::List(l) => write!(f, "List({:?})", l),
            Value::Array(l) => write!(f, "Array({:?})", l),
            Value::Map(m) => write!(f, "{:?}", m),
            Value::Host(id) => write!(f, "Host({})", id),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Host(id)
    }
}

// ============================================================================
// Shared handles
// ============================================================================

/// Shared handle to a managed class instance
#[derive(Clone)]
pub struct ObjectRef(Arc<RwLock<Instance>>);

impl ObjectRef {
    /// Allocate a new managed object
    pub fn new(instance: Instance) -> Self {
        Self(Arc::new(RwLock::new(instance)))
    }

    /// Lock for reading
    pub fn read(&self) -> RwLockReadGuard<'_, Instance> {
        self.0.read()
    }

    /// Lock for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, Instance> {
        self.0.write()
    }

    /// Concrete type of the referenced instance
    pub fn ty(&self) -> TypeKey {
        self.0.read().ty
    }

    /// Reference equality
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used as an identity key
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({}@{:#x})", self.ty(), self.addr())
    }
}

/// Elements of a list or array
#[derive(Debug, Clone)]
pub struct ListData {
    /// Element type
    pub elem: TypeKey,
    /// Elements
    pub items: Vec<Value>,
}

/// Shared handle to a list or array
#[derive(Clone)]
pub struct ListRef(Arc<RwLock<ListData>>);

impl ListRef {
    /// Allocate a new list
    pub fn new(elem: TypeKey, items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(ListData { elem, items })))
    }

    /// Lock for reading
    pub fn read(&self) -> RwLockReadGuard<'_, ListData> {
        self.0.read()
    }

    /// Lock for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, ListData> {
        self.0.write()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.read().items.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference equality
    pub fn ptr_eq(&self, other: &ListRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used as an identity key
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.read();
        write!(f, "{} x {}@{:#x}", data.items.len(), data.elem, self.addr())
    }
}

/// Entries of a map, in insertion order, with a hashed key index
#[derive(Debug, Clone)]
pub struct MapData {
    /// Key type
    pub key: TypeKey,
    /// Value type
    pub value: TypeKey,
    entries: Vec<(Value, Value)>,
    index: FxHashMap<MapKey, usize>,
}

impl MapData {
    /// Build a map; a repeated key keeps its first position and its last value
    pub fn new(key: TypeKey, value: TypeKey, entries: Vec<(Value, Value)>) -> Self {
        let mut map = Self {
            key,
            value,
            entries: Vec::with_capacity(entries.len()),
            index: FxHashMap::default(),
        };
        map.index.reserve(entries.len());
        for (k, v) in entries {
            map.insert(k, v);
        }
        map
    }

    /// Key/value pairs in insertion order
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key
    pub fn get(&self, key: &Value) -> Option<&Value> {
        let index = *self.index.get(&MapKey(key.clone()))?;
        self.entries.get(index).map(|(_, v)| v)
    }

    /// Insert or replace a key
    pub fn insert(&mut self, key: Value, value: Value) {
        let slot_key = MapKey(key);
        if let Some(&index) = self.index.get(&slot_key) {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.1 = value;
            }
            return;
        }
        self.index.insert(slot_key.clone(), self.entries.len());
        self.entries.push((slot_key.0, value));
    }
}

/// Map key hashed and compared the way [`Value::same`] compares
///
/// Shared handles hash by address, scalars by value (floats by their
/// normalized bits) and structs slot by slot.
#[derive(Debug, Clone)]
struct MapKey(Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.same(&other.0)
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_key(&self.0, state);
    }
}

fn hash_key<H: Hasher>(value: &Value, state: &mut H) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Null => {}
        Value::Bool(b) => b.hash(state),
        Value::Int(i) | Value::Enum(i) => i.hash(state),
        Value::Float(f) => {
            // 0.0 and -0.0 compare equal, every NaN matches every other
            let bits = if f.is_nan() {
                f64::NAN.to_bits()
            } else if *f == 0.0 {
                0
            } else {
                f.to_bits()
            };
            bits.hash(state);
        }
        Value::Str(s) => s.hash(state),
        Value::Host(id) => id.hash(state),
        Value::Struct(instance) => {
            instance.ty.hash(state);
            for slot in &instance.slots {
                hash_key(slot, state);
            }
        }
        Value::Object(object) => object.addr().hash(state),
        Value::List(list) | Value::Array(list) => list.addr().hash(state),
        Value::Map(map) => map.addr().hash(state),
    }
}

/// Shared handle to a map
#[derive(Clone)]
pub struct MapRef(Arc<RwLock<MapData>>);

impl MapRef {
    /// Allocate a new map
    pub fn new(key: TypeKey, value: TypeKey, entries: Vec<(Value, Value)>) -> Self {
        Self(Arc::new(RwLock::new(MapData::new(key, value, entries))))
    }

    /// Lock for reading
    pub fn read(&self) -> RwLockReadGuard<'_, MapData> {
        self.0.read()
    }

    /// Lock for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, MapData> {
        self.0.write()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference equality
    pub fn ptr_eq(&self, other: &MapRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used as an identity key
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map({} entries@{:#x})", self.len(), self.addr())
    }
}
