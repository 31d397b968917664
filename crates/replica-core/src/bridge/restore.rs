//! Post-clone correlation and field restoration

use super::context::{CloneContext, NodeSnapshot};
use super::{BridgeReport, CloneBridge, SkipReason};
use crate::accessor::AccessorCompiler;
use crate::capture::CaptureEntry;
use crate::codec::{FieldMeta, IdentityResolver, TokenPolicy};
use crate::host::{Host, ObjectId, ObjectKind};
use crate::types::TypeKey;
use crate::value::Value;
use crate::{BridgeError, BridgeResult, OperationStatus};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// A source member paired with its clone
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatchedMember {
    pub(crate) position: usize,
    pub(crate) clone: ObjectId,
    pub(crate) ty: TypeKey,
    pub(crate) worth: bool,
}

/// A snapshot node found in the clone
#[derive(Debug)]
pub(crate) struct MatchedNode {
    pub(crate) snapshot: usize,
    pub(crate) clone: ObjectId,
    pub(crate) members: Vec<MatchedMember>,
}

impl MatchedNode {
    fn member_at(&self, position: usize) -> Option<&MatchedMember> {
        self.members.iter().find(|m| m.position == position)
    }
}

/// Resolves identity tokens against the pairs of the current operation
///
/// Tokens naming a source object follow into the clone. Free-standing
/// assets referenced by plain fields are duplicated once per operation when
/// their type has a copy constructor. Everything else keeps pointing at the
/// original object, or becomes null when that object is gone.
///
/// `pairs` holds exactly the correlation map links registered by this pass,
/// so a token never follows a link left by an earlier clone.
struct RestoreResolver<'a, H: Host> {
    host: &'a mut H,
    pairs: &'a FxHashMap<ObjectId, ObjectId>,
    duplicates: &'a mut FxHashMap<ObjectId, ObjectId>,
    accessors: &'a AccessorCompiler,
    duplicate_assets: bool,
}

impl<H: Host> RestoreResolver<'_, H> {
    fn duplicate_asset(&mut self, id: ObjectId) -> Option<ObjectId> {
        if let Some(copy) = self.duplicates.get(&id) {
            return Some(*copy);
        }
        let copy = self.accessors.duplicate(self.host.instance(id)?)?;
        match self.host.spawn_asset(copy) {
            Ok(spawned) => {
                self.duplicates.insert(id, spawned);
                Some(spawned)
            }
            Err(err) => {
                warn!(asset = %id, error = %err, "failed to duplicate asset");
                None
            }
        }
    }
}

impl<H: Host> IdentityResolver for RestoreResolver<'_, H> {
    fn resolve(&mut self, id: ObjectId, policy: TokenPolicy, _declared: TypeKey) -> Value {
        if policy == TokenPolicy::Follow {
            if let Some(clone) = self.pairs.get(&id) {
                return Value::Host(*clone);
            }
            if self.duplicate_assets && self.host.object_kind(id) == Some(ObjectKind::Asset) {
                if let Some(copy) = self.duplicate_asset(id) {
                    return Value::Host(copy);
                }
            }
        }
        if self.host.is_alive(id) {
            Value::Host(id)
        } else {
            Value::Null
        }
    }
}

/// Follow a sibling-index path down from the clone root
fn navigate<H: Host>(host: &H, root: ObjectId, path: &[usize]) -> Option<ObjectId> {
    path.iter()
        .try_fold(root, |entity, index| host.children(entity).get(*index).copied())
}

impl CloneBridge {
    pub(crate) fn restore<H: Host>(
        &self,
        host: &mut H,
        source: ObjectId,
        clone: ObjectId,
        mut ctx: CloneContext,
    ) -> BridgeResult<BridgeReport> {
        if let OperationStatus::Skipped(_) = ctx.status {
            return Ok(ctx.finish(&self.pool));
        }
        if !self.is_main_thread() {
            warn!(%source, %clone, "clone completed off the main thread; bridging skipped");
            ctx.skip(SkipReason::WrongThread);
            return Ok(ctx.finish(&self.pool));
        }
        let clone_root = host.entity_of(clone).ok_or(BridgeError::NotATree(clone))?;

        let mut pairs = FxHashMap::default();
        let matched = self.correlate(host, clone_root, &ctx.nodes, &mut pairs, &mut ctx.report);

        let total = ctx.nodes.len();
        let mismatched = total - matched.len();
        let root_broken = matched
            .first()
            .map(|root| root.snapshot != 0 || root.members.len() < ctx.nodes[0].members.len())
            .unwrap_or(true);
        if matched.is_empty() || root_broken || mismatched * 2 > total {
            warn!(
                %source,
                %clone,
                matched = matched.len(),
                mismatched,
                "clone does not match its source tree"
            );
            // Fields stay native, but matched members still get their callbacks
            ctx.guard.release();
            self.replay(host, &matched, &mut ctx.report);
            ctx.finish(&self.pool);
            return Err(BridgeError::StructureMismatch {
                clone,
                matched: matched.len(),
                mismatched,
            });
        }

        // Plain fields now; identity-carrying fields once every pair exists
        let mut duplicates = FxHashMap::default();
        let mut deferred = Vec::new();
        for (node_index, node) in matched.iter().enumerate() {
            let record = &ctx.nodes[node.snapshot].record;
            for (entry_index, entry) in record.iter().enumerate() {
                if entry.by_reference {
                    deferred.push((node_index, entry_index));
                    continue;
                }
                self.restore_entry(host, node, entry, &pairs, &mut duplicates, &mut ctx.report);
            }
        }
        for (node_index, entry_index) in deferred {
            let node = &matched[node_index];
            if let Some(entry) = ctx.nodes[node.snapshot].record.get(entry_index) {
                self.restore_entry(host, node, entry, &pairs, &mut duplicates, &mut ctx.report);
            }
        }

        ctx.guard.release();
        self.replay(host, &matched, &mut ctx.report);

        let report = ctx.finish(&self.pool);
        if self.debug_logs {
            debug!(%source, %clone, ?report, "clone bridged");
        }
        Ok(report)
    }

    fn correlate<H: Host>(
        &self,
        host: &H,
        clone_root: ObjectId,
        nodes: &[NodeSnapshot],
        pairs: &mut FxHashMap<ObjectId, ObjectId>,
        report: &mut BridgeReport,
    ) -> Vec<MatchedNode> {
        let mut matched = Vec::with_capacity(nodes.len());

        for (index, node) in nodes.iter().enumerate() {
            let Some(clone_entity) = navigate(host, clone_root, &node.path) else {
                report.nodes_mismatched += 1;
                warn!(entity = %node.entity, path = ?node.path, "no clone counterpart for entity");
                continue;
            };
            report.nodes_matched += 1;
            pairs.insert(node.entity, clone_entity);
            self.correlation.register_parent_child(node.entity, clone_entity);

            // Extra members appended by the host are never looked at
            let clone_members = host.members(clone_entity);
            let mut members = Vec::with_capacity(node.members.len());
            for member in &node.members {
                match clone_members.get(member.position) {
                    Some(candidate) if host.type_of(*candidate) == Some(member.ty) => {
                        pairs.insert(member.id, *candidate);
                        self.correlation.register_parent_child(member.id, *candidate);
                        members.push(MatchedMember {
                            position: member.position,
                            clone: *candidate,
                            ty: member.ty,
                            worth: member.worth,
                        });
                    }
                    _ => {
                        report.members_mismatched += 1;
                        warn!(
                            member = %member.id,
                            position = member.position,
                            "no clone counterpart for member"
                        );
                    }
                }
            }

            matched.push(MatchedNode {
                snapshot: index,
                clone: clone_entity,
                members,
            });
        }
        matched
    }

    fn restore_entry<H: Host>(
        &self,
        host: &mut H,
        node: &MatchedNode,
        entry: CaptureEntry<'_>,
        pairs: &FxHashMap<ObjectId, ObjectId>,
        duplicates: &mut FxHashMap<ObjectId, ObjectId>,
        report: &mut BridgeReport,
    ) {
        let Some(member) = node.member_at(entry.member_slot) else {
            report.fields_failed += 1;
            return;
        };
        let field = self
            .types
            .resolve(entry.owner_type)
            .and_then(|owner| self.accessors.field_named(owner, entry.field_name));
        let Some(field) = field else {
            report.fields_failed += 1;
            warn!(owner = entry.owner_type, field = entry.field_name, "captured field no longer resolves");
            return;
        };

        let meta = FieldMeta::of(&field);
        let decoded = {
            let mut resolver = RestoreResolver {
                host: &mut *host,
                pairs,
                duplicates,
                accessors: &self.accessors,
                duplicate_assets: !meta.by_reference,
            };
            self.codec.decode(entry.value, &meta, &mut resolver)
        };

        let result = match decoded {
            Ok(value) => match host.instance_mut(member.clone) {
                Some(instance) => self.accessors.set(instance, &field, value).map_err(|e| e.to_string()),
                None => Err("clone member has no field storage".to_string()),
            },
            Err(err) => Err(err.to_string()),
        };
        match result {
            Ok(()) => report.fields_restored += 1,
            Err(error) => {
                report.fields_failed += 1;
                warn!(member = %member.clone, field = %field.name, %error, "failed to restore field");
            }
        }
    }
}
