//! Pre-clone capture and the context handed to the postfix

use super::{BridgeReport, CloneBridge, OperationStatus, SkipReason};
use crate::capture::{CaptureRecord, RecordPool};
use crate::codec::{CodecError, FieldMeta};
use crate::host::{Host, ObjectId};
use crate::lifecycle::{BlockedCalls, HookKind};
use crate::types::TypeKey;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One member of a snapshot node
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemberSnapshot {
    pub(crate) position: usize,
    pub(crate) id: ObjectId,
    pub(crate) ty: TypeKey,
    pub(crate) worth: bool,
}

/// One entity of the source tree
#[derive(Debug)]
pub(crate) struct NodeSnapshot {
    pub(crate) path: Vec<usize>,
    pub(crate) entity: ObjectId,
    pub(crate) members: Vec<MemberSnapshot>,
    pub(crate) record: CaptureRecord,
}

/// Suspended callback types; released on drop
#[derive(Debug)]
pub(crate) struct BlockGuard {
    gate: Arc<BlockedCalls>,
    types: Vec<TypeKey>,
}

impl BlockGuard {
    fn new(gate: Arc<BlockedCalls>) -> Self {
        Self {
            gate,
            types: Vec::new(),
        }
    }

    /// Block a type once for this operation
    fn block(&mut self, ty: TypeKey) {
        if !self.types.contains(&ty) {
            self.gate.block(ty);
            self.types.push(ty);
        }
    }

    pub(crate) fn release(&mut self) {
        for ty in self.types.drain(..) {
            self.gate.unblock(ty);
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Snapshot of a source tree, produced by the prefix and consumed by the postfix
///
/// Dropping a context without running the postfix releases its suspended
/// callbacks.
#[derive(Debug)]
pub struct CloneContext {
    pub(crate) status: OperationStatus,
    pub(crate) source_root: Option<ObjectId>,
    pub(crate) nodes: Vec<NodeSnapshot>,
    pub(crate) guard: BlockGuard,
    pub(crate) report: BridgeReport,
}

impl CloneContext {
    fn new(gate: Arc<BlockedCalls>) -> Self {
        Self {
            status: OperationStatus::Completed,
            source_root: None,
            nodes: Vec::new(),
            guard: BlockGuard::new(gate),
            report: BridgeReport::default(),
        }
    }

    pub(crate) fn skip(&mut self, reason: SkipReason) {
        self.status = OperationStatus::Skipped(reason);
        self.guard.release();
    }

    /// Status decided by the prefix
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Entity the snapshot is rooted at
    pub fn source_root(&self) -> Option<ObjectId> {
        self.source_root
    }

    /// Number of entities in the snapshot
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Types whose callbacks this operation suspended
    pub fn blocked_types(&self) -> &[TypeKey] {
        &self.guard.types
    }

    /// Capture record of a source entity
    pub fn record(&self, entity: ObjectId) -> Option<&CaptureRecord> {
        self.nodes
            .iter()
            .find(|n| n.entity == entity)
            .map(|n| &n.record)
    }

    /// Hand the records back to the pool and produce the final report
    pub(crate) fn finish(mut self, pool: &Mutex<RecordPool>) -> BridgeReport {
        self.guard.release();
        let mut pool = pool.lock();
        for node in self.nodes.drain(..) {
            pool.release(node.record);
        }
        let mut report = std::mem::take(&mut self.report);
        report.status = self.status;
        report
    }
}

impl CloneBridge {
    pub(crate) fn capture<H: Host>(&self, host: &mut H, source: ObjectId) -> CloneContext {
        let mut ctx = CloneContext::new(Arc::clone(&self.gate));

        if !self.is_main_thread() {
            warn!(%source, "clone requested off the main thread; bridging skipped");
            ctx.skip(SkipReason::WrongThread);
            return ctx;
        }
        let Some(root) = host.entity_of(source) else {
            warn!(%source, "clone source is not part of a tree; bridging skipped");
            ctx.skip(SkipReason::NotATree);
            return ctx;
        };
        ctx.source_root = Some(root);

        self.snapshot_tree(host, root, &mut ctx);

        let worth_any = ctx
            .nodes
            .iter()
            .any(|node| node.members.iter().any(|m| m.worth));
        if !worth_any {
            if self.debug_logs {
                debug!(%root, nodes = ctx.nodes.len(), "nothing to bridge");
            }
            ctx.skip(SkipReason::NothingToBridge);
            return ctx;
        }

        for node in &ctx.nodes {
            for member in node.members.iter().filter(|m| m.worth) {
                ctx.guard.block(member.ty);
            }
        }

        let mut prepared = FxHashSet::default();
        for node in ctx.nodes.iter_mut() {
            for member in node.members.iter().filter(|m| m.worth) {
                if prepared.insert(member.id) {
                    self.invoke_hook(host, member.id, member.ty, HookKind::BeforeSerialize, &mut ctx.report);
                }
                self.capture_member(host, member, &mut node.record, &mut ctx.report);
            }
        }

        if self.debug_logs {
            debug!(
                %root,
                nodes = ctx.nodes.len(),
                blocked = ctx.guard.types.len(),
                fields = ctx.report.fields_captured,
                "source tree captured"
            );
        }
        ctx
    }

    /// Preorder walk recording sibling-index paths
    fn snapshot_tree<H: Host>(&self, host: &H, root: ObjectId, ctx: &mut CloneContext) {
        let mut pool = self.pool.lock();
        let mut stack = vec![(root, Vec::new())];

        while let Some((entity, path)) = stack.pop() {
            let members = host
                .members(entity)
                .into_iter()
                .enumerate()
                .filter_map(|(position, id)| {
                    let ty = host.type_of(id)?;
                    Some(MemberSnapshot {
                        position,
                        id,
                        ty,
                        worth: self.worthiness.register(ty),
                    })
                })
                .collect();

            for (index, child) in host.children(entity).into_iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(index);
                stack.push((child, child_path));
            }

            ctx.nodes.push(NodeSnapshot {
                path,
                entity,
                members,
                record: pool.acquire(),
            });
        }
    }

    fn capture_member<H: Host>(
        &self,
        host: &H,
        member: &MemberSnapshot,
        record: &mut CaptureRecord,
        report: &mut BridgeReport,
    ) {
        let Some(instance) = host.instance(member.id) else {
            warn!(member = %member.id, "member has no field storage");
            return;
        };

        for target in self.worthiness.targets_along(member.ty) {
            let field = &target.field;
            let encoded = self
                .accessors
                .get(instance, field)
                .map_err(CodecError::from)
                .and_then(|value| self.codec.encode(&value, &FieldMeta::of(field)));

            match encoded {
                Ok(encoded) => {
                    record.push(
                        self.registry.name_of(target.owner),
                        field.name.clone(),
                        encoded.json,
                        field.by_reference() || encoded.carries_identity,
                        member.position,
                    );
                    report.fields_captured += 1;
                }
                Err(err) => {
                    report.fields_failed += 1;
                    warn!(member = %member.id, field = %field.name, error = %err, "failed to capture field");
                }
            }
        }
    }
}
