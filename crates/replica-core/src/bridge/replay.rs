//! Lifecycle replay on the restored clone

use super::restore::MatchedNode;
use super::{BridgeReport, CloneBridge};
use crate::host::{Host, ObjectId};
use crate::lifecycle::{call_hook, HookKind};
use crate::types::TypeKey;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

impl CloneBridge {
    /// Replay suspended callbacks on every bridged clone member, in preorder
    ///
    /// Per member: `after_deserialize`, then `initialize` when its entity is
    /// active, then `enable` when it is also enabled. Each runs at most once
    /// per member; a failing callback does not stop the others.
    pub(crate) fn replay<H: Host>(&self, host: &mut H, matched: &[MatchedNode], report: &mut BridgeReport) {
        let mut deserialized = FxHashSet::default();
        let mut initialized = FxHashSet::default();
        let mut enabled = FxHashSet::default();

        for node in matched {
            for member in node.members.iter().filter(|m| m.worth) {
                let id = member.clone;
                if deserialized.insert(id) {
                    self.invoke_hook(host, id, member.ty, HookKind::AfterDeserialize, report);
                }

                let active = host.is_active_in_tree(id);
                if active && initialized.insert(id) {
                    self.invoke_hook(host, id, member.ty, HookKind::Initialize, report);
                }
                if active && host.is_enabled(id) && enabled.insert(id) {
                    self.invoke_hook(host, id, member.ty, HookKind::Enable, report);
                }
            }
            if self.debug_logs {
                debug!(entity = %node.clone, members = node.members.len(), "lifecycle replayed");
            }
        }
    }

    /// Run one resolved callback; returns whether the type implements it
    pub(crate) fn invoke_hook<H: Host>(
        &self,
        host: &mut H,
        id: ObjectId,
        ty: TypeKey,
        kind: HookKind,
        report: &mut BridgeReport,
    ) -> bool {
        let Some(hook) = self.hooks.resolve(ty, kind) else {
            return false;
        };
        let Some(instance) = host.instance_mut(id) else {
            return false;
        };

        report.hooks_invoked += 1;
        if let Err(err) = call_hook(&hook, id, instance) {
            report.hooks_failed += 1;
            warn!(member = %id, hook = kind.name(), error = %err, "lifecycle callback failed");
        }
        true
    }
}
