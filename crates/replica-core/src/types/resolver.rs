//! Type-name resolution for polymorphic envelopes

use super::{TypeKey, TypeRegistry};
use crate::cache::SharedLru;
use std::sync::Arc;

/// Resolves type names carried in encoded payloads
///
/// Exact qualified names win; otherwise a short name resolves when exactly
/// one registered type carries it. Unknown names are cached as misses too.
#[derive(Debug)]
pub struct TypeResolver {
    registry: Arc<TypeRegistry>,
    cache: SharedLru<String, Option<TypeKey>>,
}

impl TypeResolver {
    /// Create a resolver with a cache of `capacity` names
    pub fn new(registry: Arc<TypeRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            cache: SharedLru::new(capacity),
        }
    }

    /// Resolve a name
    pub fn resolve(&self, name: &str) -> Option<TypeKey> {
        if let Some(hit) = self.cache.try_get(name) {
            return hit;
        }
        let resolved = self.registry.by_name(name).or_else(|| {
            match self.registry.find_by_short_name(name) {
                [only] => Some(*only),
                _ => None,
            }
        });
        self.cache.put(name.to_string(), resolved);
        resolved
    }

    /// Number of cached names
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    #[test]
    fn test_resolves_exact_then_unique_short_name() {
        let mut builder = TypeRegistry::builder();
        let a = builder.declare("game::items::Sword", TypeKind::Class).finish();
        builder.declare("game::items::Shield", TypeKind::Class).finish();
        builder.declare("mods::Shield", TypeKind::Class).finish();
        let registry = Arc::new(builder.build().unwrap());
        let resolver = TypeResolver::new(registry, 8);

        assert_eq!(resolver.resolve("game::items::Sword"), Some(a));
        assert_eq!(resolver.resolve("Sword"), Some(a));
        assert_eq!(resolver.resolve("Shield"), None);
        assert_eq!(resolver.resolve("Missing"), None);
        assert_eq!(resolver.cached(), 4);
    }
}
