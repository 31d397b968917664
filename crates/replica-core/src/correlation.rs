//! Identity correlation map
//!
//! Links every clone to the object it was cloned from. Chains of clones
//! (clone of a clone) resolve to the nearest live ancestor. Entries are keyed
//! by [`ObjectId`] and pruned lazily: dead hops are stitched out when a
//! lookup walks over them, or in bulk when the host tears down a tree.

use crate::host::{DestructionListener, Liveness, ObjectId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
struct Links {
    clone_to_original: FxHashMap<ObjectId, ObjectId>,
    original_to_clone: FxHashMap<ObjectId, ObjectId>,
}

impl Links {
    /// Drop a node, linking its downstream clone to its upstream original
    fn remove(&mut self, node: ObjectId) -> bool {
        let upstream = self.clone_to_original.remove(&node);
        let downstream = self.original_to_clone.remove(&node);

        if let Some(up) = upstream {
            if self.original_to_clone.get(&up) == Some(&node) {
                match downstream {
                    Some(down) => self.original_to_clone.insert(up, down),
                    None => self.original_to_clone.remove(&up),
                };
            }
        }
        if let Some(down) = downstream {
            if self.clone_to_original.get(&down) == Some(&node) {
                match upstream {
                    Some(up) => self.clone_to_original.insert(down, up),
                    None => self.clone_to_original.remove(&down),
                };
            }
        }
        upstream.is_some() || downstream.is_some()
    }
}

/// Bidirectional original ↔ clone association
#[derive(Debug, Default)]
pub struct CorrelationMap {
    links: Mutex<Links>,
}

impl CorrelationMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `clone` was produced from `original`
    ///
    /// An original keeps only its most recent clone as forward link.
    pub fn register_parent_child(&self, original: ObjectId, clone: ObjectId) {
        if original == clone {
            return;
        }
        let mut links = self.links.lock();
        links.clone_to_original.insert(clone, original);
        links.original_to_clone.insert(original, clone);
    }

    /// Nearest live original of a clone
    ///
    /// Dead hops met on the way are removed and stitched over.
    pub fn get_original_of(&self, clone: ObjectId, liveness: &dyn Liveness) -> Option<ObjectId> {
        let mut links = self.links.lock();
        let mut budget = links.clone_to_original.len() + 1;
        loop {
            let parent = *links.clone_to_original.get(&clone)?;
            if liveness.is_alive(parent) {
                return Some(parent);
            }
            if budget == 0 {
                return None;
            }
            budget -= 1;

            let grandparent = links.clone_to_original.get(&parent).copied();
            links.remove(parent);
            match grandparent {
                Some(gp) if gp != clone => {
                    links.clone_to_original.insert(clone, gp);
                }
                _ => {
                    links.clone_to_original.remove(&clone);
                    return None;
                }
            }
        }
    }

    /// Most recent clone registered for an original
    pub fn get_clone_of(&self, original: ObjectId) -> Option<ObjectId> {
        self.links.lock().original_to_clone.get(&original).copied()
    }

    /// First live ancestor of the whole chain
    pub fn root_original_of(&self, node: ObjectId, liveness: &dyn Liveness) -> Option<ObjectId> {
        let mut current = self.get_original_of(node, liveness)?;
        let mut budget = self.len();
        while let Some(next) = self.get_original_of(current, liveness) {
            if budget == 0 || next == node {
                break;
            }
            budget -= 1;
            current = next;
        }
        Some(current)
    }

    /// Newest live generation cloned (transitively) from a node
    pub fn latest_clone_of(&self, node: ObjectId, liveness: &dyn Liveness) -> Option<ObjectId> {
        let links = self.links.lock();
        let mut latest = None;
        let mut current = node;
        let mut budget = links.original_to_clone.len();
        while let Some(next) = links.original_to_clone.get(&current).copied() {
            if budget == 0 || next == node {
                break;
            }
            budget -= 1;
            if liveness.is_alive(next) {
                latest = Some(next);
            }
            current = next;
        }
        latest
    }

    /// Remove a node, re-stitching its original to its clone
    pub fn remove(&self, node: ObjectId) -> bool {
        self.links.lock().remove(node)
    }

    /// Remove every dead node; returns how many were dropped
    pub fn prune(&self, liveness: &dyn Liveness) -> usize {
        let mut links = self.links.lock();
        let mut dead: Vec<ObjectId> = links
            .clone_to_original
            .iter()
            .flat_map(|(c, o)| [*c, *o])
            .chain(links.original_to_clone.iter().flat_map(|(o, c)| [*o, *c]))
            .filter(|id| !liveness.is_alive(*id))
            .collect();
        dead.sort_unstable();
        dead.dedup();

        let mut removed = 0;
        for id in dead {
            if links.remove(id) {
                removed += 1;
            }
        }
        // Clones whose original was dropped without a downstream stitch
        let dangling: Vec<ObjectId> = links
            .clone_to_original
            .iter()
            .filter(|(_, o)| !liveness.is_alive(**o))
            .map(|(c, _)| *c)
            .collect();
        for clone in dangling {
            links.clone_to_original.remove(&clone);
        }
        removed
    }

    /// Check if a node appears on either side of the map
    pub fn is_tracked(&self, node: ObjectId) -> bool {
        let links = self.links.lock();
        links.clone_to_original.contains_key(&node) || links.original_to_clone.contains_key(&node)
    }

    /// Number of clone → original links
    pub fn len(&self) -> usize {
        self.links.lock().clone_to_original.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut links = self.links.lock();
        links.clone_to_original.clear();
        links.original_to_clone.clear();
    }
}

impl DestructionListener for CorrelationMap {
    fn on_destroyed(&self, id: ObjectId, _liveness: &dyn Liveness) {
        self.remove(id);
    }

    fn on_teardown(&self, liveness: &dyn Liveness) {
        self.prune(liveness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[derive(Default)]
    struct Graveyard(FxHashSet<ObjectId>);

    impl Liveness for Graveyard {
        fn is_alive(&self, id: ObjectId) -> bool {
            !self.0.contains(&id)
        }
    }

    fn id(n: u64) -> ObjectId {
        ObjectId::from_u64(n)
    }

    #[test]
    fn test_direct_lookup() {
        let map = CorrelationMap::new();
        let alive = Graveyard::default();
        map.register_parent_child(id(1), id(2));

        assert_eq!(map.get_original_of(id(2), &alive), Some(id(1)));
        assert_eq!(map.get_clone_of(id(1)), Some(id(2)));
        assert_eq!(map.get_original_of(id(1), &alive), None);
        assert!(map.is_tracked(id(1)) && map.is_tracked(id(2)));
    }

    #[test]
    fn test_remove_restitches_chain() {
        let map = CorrelationMap::new();
        let alive = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        map.register_parent_child(id(2), id(3));

        assert!(map.remove(id(2)));
        assert_eq!(map.get_original_of(id(3), &alive), Some(id(1)));
        assert_eq!(map.get_clone_of(id(1)), Some(id(3)));
        assert!(!map.is_tracked(id(2)));
    }

    #[test]
    fn test_lookup_skips_dead_generations() {
        let map = CorrelationMap::new();
        let mut dead = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        map.register_parent_child(id(2), id(3));
        map.register_parent_child(id(3), id(4));
        dead.0.insert(id(2));
        dead.0.insert(id(3));

        assert_eq!(map.get_original_of(id(4), &dead), Some(id(1)));
        // The dead hops were stitched out by the lookup
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_clone_of(id(1)), Some(id(4)));
    }

    #[test]
    fn test_chain_to_dead_root_resolves_to_none() {
        let map = CorrelationMap::new();
        let mut dead = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        dead.0.insert(id(1));
        assert_eq!(map.get_original_of(id(2), &dead), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_root_and_latest() {
        let map = CorrelationMap::new();
        let alive = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        map.register_parent_child(id(2), id(3));

        assert_eq!(map.root_original_of(id(3), &alive), Some(id(1)));
        assert_eq!(map.latest_clone_of(id(1), &alive), Some(id(3)));
        assert_eq!(map.latest_clone_of(id(3), &alive), None);
    }

    #[test]
    fn test_prune_and_listener() {
        let map = CorrelationMap::new();
        let mut dead = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        map.register_parent_child(id(2), id(3));
        map.register_parent_child(id(10), id(11));
        dead.0.insert(id(2));
        dead.0.insert(id(10));

        map.on_teardown(&dead);
        assert_eq!(map.get_original_of(id(3), &dead), Some(id(1)));
        assert!(!map.is_tracked(id(11)));

        map.on_destroyed(id(3), &dead);
        assert!(map.is_empty());
    }

    #[test]
    fn test_latest_registration_wins_forward_link() {
        let map = CorrelationMap::new();
        let alive = Graveyard::default();
        map.register_parent_child(id(1), id(2));
        map.register_parent_child(id(1), id(5));
        assert_eq!(map.get_clone_of(id(1)), Some(id(5)));
        assert_eq!(map.get_original_of(id(2), &alive), Some(id(1)));

        // Removing the stale clone leaves the newer forward link alone
        map.remove(id(2));
        assert_eq!(map.get_clone_of(id(1)), Some(id(5)));
    }
}
