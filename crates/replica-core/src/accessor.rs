//! Compiled field accessors and constructor factories
//!
//! Getters and setters are compiled once per field into closures bound to
//! the field's slot and declared type, then cached by [`FieldKey`]. A cache
//! miss only costs a recompile; [`AccessorCompiler::read_direct`] and
//! [`AccessorCompiler::write_direct`] are the uncached path.

use crate::cache::SharedLru;
use crate::config::CacheSizes;
use crate::types::{
    CopyFn, FieldDescriptor, FieldKey, RegistryError, TypeKey, TypeKind, TypeRegistry,
};
use crate::value::{Instance, ListRef, MapRef, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by accessors and factories
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccessError {
    /// Static fields have no instance storage
    #[error("Field '{0}' is static")]
    StaticField(String),

    /// The instance is not of the field's owner type
    #[error("Field '{field}' does not belong to '{ty}'")]
    WrongOwner {
        /// Field name
        field: String,
        /// Instance type
        ty: String,
    },

    /// The instance has fewer slots than the layout requires
    #[error("Slot {slot} of field '{field}' is out of range")]
    SlotOutOfRange {
        /// Field name
        field: String,
        /// Slot index
        slot: usize,
    },

    /// The value does not fit the field's declared type
    #[error("Field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        /// Field name
        field: String,
        /// Declared type name
        expected: String,
        /// Value kind
        found: &'static str,
    },

    /// No field of that name
    #[error("Type '{ty}' has no field '{field}'")]
    UnknownField {
        /// Type name
        ty: String,
        /// Field name
        field: String,
    },

    /// The type has no factory of the requested shape
    #[error("Type '{0}' cannot be constructed this way")]
    NotConstructible(String),

    /// Type metadata problem
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Compiled getter
pub type Getter = Arc<dyn Fn(&Instance) -> Result<Value, AccessError> + Send + Sync>;

/// Compiled setter
pub type Setter = Arc<dyn Fn(&mut Instance, Value) -> Result<(), AccessError> + Send + Sync>;

/// Getter/setter pair for one field
#[derive(Clone)]
pub struct FieldAccessor {
    /// Field the pair was compiled for
    pub field: Arc<FieldDescriptor>,
    /// Read the field
    pub get: Getter,
    /// Write the field
    pub set: Setter,
}

impl fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("field", &self.field.name)
            .field("slot", &self.field.slot)
            .finish()
    }
}

/// Compiles and caches accessors and factories
pub struct AccessorCompiler {
    registry: Arc<TypeRegistry>,
    accessors: SharedLru<FieldKey, FieldAccessor>,
    by_name: SharedLru<(TypeKey, String), Option<FieldDescriptor>>,
    copy_constructors: SharedLru<TypeKey, Option<CopyFn>>,
}

impl AccessorCompiler {
    /// Create a compiler sized by the configuration
    pub fn new(registry: Arc<TypeRegistry>, sizes: &CacheSizes) -> Self {
        Self {
            registry,
            accessors: SharedLru::new(sizes.member_access),
            by_name: SharedLru::new(sizes.controlled),
            copy_constructors: SharedLru::new(sizes.types),
        }
    }

    /// Registry the compiler reads
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Cached accessor pair for a field, compiling on miss
    pub fn accessor(&self, field: &FieldDescriptor) -> Result<FieldAccessor, AccessError> {
        self.accessors
            .get_or_try_compute(field.key(), || self.compile(field))
    }

    /// Compile an accessor pair without touching the cache
    pub fn compile(&self, field: &FieldDescriptor) -> Result<FieldAccessor, AccessError> {
        let slot = field
            .slot
            .ok_or_else(|| AccessError::StaticField(field.name.clone()))?;
        let field = Arc::new(field.clone());

        let get: Getter = {
            let registry = Arc::clone(&self.registry);
            let field = Arc::clone(&field);
            Arc::new(move |instance: &Instance| {
                check_owner(&registry, &field, instance)?;
                instance
                    .slot(slot)
                    .cloned()
                    .ok_or_else(|| AccessError::SlotOutOfRange {
                        field: field.name.clone(),
                        slot,
                    })
            })
        };

        let set: Setter = {
            let registry = Arc::clone(&self.registry);
            let field = Arc::clone(&field);
            Arc::new(move |instance: &mut Instance, value: Value| {
                check_owner(&registry, &field, instance)?;
                check_value(&registry, &field, &value)?;
                if instance.set_slot(slot, value) {
                    Ok(())
                } else {
                    Err(AccessError::SlotOutOfRange {
                        field: field.name.clone(),
                        slot,
                    })
                }
            })
        };

        Ok(FieldAccessor { field, get, set })
    }

    /// Read a field through the cached accessor
    pub fn get(&self, instance: &Instance, field: &FieldDescriptor) -> Result<Value, AccessError> {
        let accessor = self.accessor(field)?;
        (accessor.get)(instance)
    }

    /// Write a field through the cached accessor
    pub fn set(
        &self,
        instance: &mut Instance,
        field: &FieldDescriptor,
        value: Value,
    ) -> Result<(), AccessError> {
        let accessor = self.accessor(field)?;
        (accessor.set)(instance, value)
    }

    /// Uncached read
    pub fn read_direct(&self, instance: &Instance, field: &FieldDescriptor) -> Result<Value, AccessError> {
        let slot = field
            .slot
            .ok_or_else(|| AccessError::StaticField(field.name.clone()))?;
        check_owner(&self.registry, field, instance)?;
        instance
            .slot(slot)
            .cloned()
            .ok_or_else(|| AccessError::SlotOutOfRange {
                field: field.name.clone(),
                slot,
            })
    }

    /// Uncached write
    pub fn write_direct(
        &self,
        instance: &mut Instance,
        field: &FieldDescriptor,
        value: Value,
    ) -> Result<(), AccessError> {
        let slot = field
            .slot
            .ok_or_else(|| AccessError::StaticField(field.name.clone()))?;
        check_owner(&self.registry, field, instance)?;
        check_value(&self.registry, field, &value)?;
        if instance.set_slot(slot, value) {
            Ok(())
        } else {
            Err(AccessError::SlotOutOfRange {
                field: field.name.clone(),
                slot,
            })
        }
    }

    /// Find a field by name on a type or its ancestors (cached, misses included)
    pub fn field_named(&self, ty: TypeKey, name: &str) -> Option<FieldDescriptor> {
        self.by_name.get_or_compute((ty, name.to_string()), || {
            self.registry.find_field(ty, name).cloned()
        })
    }

    /// Like [`AccessorCompiler::field_named`] but failing on a miss
    pub fn require_field(&self, ty: TypeKey, name: &str) -> Result<FieldDescriptor, AccessError> {
        self.field_named(ty, name)
            .ok_or_else(|| AccessError::UnknownField {
                ty: self.registry.name_of(ty),
                field: name.to_string(),
            })
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Parameterless construction: a fresh object, struct or scalar default
    pub fn construct_default(&self, ty: TypeKey) -> Result<Value, AccessError> {
        let desc = self.registry.descriptor(ty)?;
        match desc.kind {
            TypeKind::Class => Ok(Value::object(self.registry.instantiate(ty)?)),
            TypeKind::Struct => Ok(Value::Struct(Box::new(self.registry.instantiate(ty)?))),
            TypeKind::List(_) | TypeKind::Map(_, _) => self.construct_container(ty, 0),
            TypeKind::Array(_) => self.construct_array(ty, 0),
            TypeKind::Primitive(_) | TypeKind::Enum => Ok(self.registry.default_value(ty)),
            TypeKind::HostObject => Err(AccessError::NotConstructible(desc.name.clone())),
        }
    }

    /// Probe for a same-type copy constructor (cached, misses included)
    pub fn copy_constructor(&self, ty: TypeKey) -> Option<CopyFn> {
        self.copy_constructors.get_or_compute(ty, || {
            self.registry
                .get(ty)
                .and_then(|desc| desc.copy_constructor.clone())
        })
    }

    /// Duplicate an instance through its type's copy constructor
    pub fn duplicate(&self, instance: &Instance) -> Option<Instance> {
        self.copy_constructor(instance.ty()).map(|copy| copy(instance))
    }

    /// Empty list or map with room for `capacity` elements
    pub fn construct_container(&self, ty: TypeKey, capacity: usize) -> Result<Value, AccessError> {
        let desc = self.registry.descriptor(ty)?;
        match desc.kind {
            TypeKind::List(elem) => Ok(Value::List(ListRef::new(elem, Vec::with_capacity(capacity)))),
            TypeKind::Map(key, value) => Ok(Value::Map(MapRef::new(
                key,
                value,
                Vec::with_capacity(capacity),
            ))),
            _ => Err(AccessError::NotConstructible(desc.name.clone())),
        }
    }

    /// Array of `len` default elements
    pub fn construct_array(&self, ty: TypeKey, len: usize) -> Result<Value, AccessError> {
        let desc = self.registry.descriptor(ty)?;
        match desc.kind {
            TypeKind::Array(elem) => {
                let items = (0..len).map(|_| self.registry.default_value(elem)).collect();
                Ok(Value::array(elem, items))
            }
            _ => Err(AccessError::NotConstructible(desc.name.clone())),
        }
    }
}

impl fmt::Debug for AccessorCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorCompiler")
            .field("accessors", &self.accessors.len())
            .field("by_name", &self.by_name.len())
            .finish()
    }
}

fn check_owner(
    registry: &TypeRegistry,
    field: &FieldDescriptor,
    instance: &Instance,
) -> Result<(), AccessError> {
    if registry.is_subtype(instance.ty(), field.owner) {
        Ok(())
    } else {
        Err(AccessError::WrongOwner {
            field: field.name.clone(),
            ty: registry.name_of(instance.ty()),
        })
    }
}

fn check_value(registry: &TypeRegistry, field: &FieldDescriptor, value: &Value) -> Result<(), AccessError> {
    if registry.value_conforms(value, field.ty) {
        Ok(())
    } else {
        Err(AccessError::TypeMismatch {
            field: field.name.clone(),
            expected: registry.name_of(field.ty),
            found: value.kind_name(),
        })
    }
}
