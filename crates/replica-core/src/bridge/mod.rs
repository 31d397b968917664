//! Clone interception
//!
//! [`CloneBridge`] wraps the host's native clone primitive:
//!
//! 1. **prefix** walks the source tree, suspends native callbacks of every
//!    bridged member type, runs `before_serialize` and captures the bridge
//!    targets of each member into a [`CaptureRecord`](crate::CaptureRecord)
//! 2. the host clones natively
//! 3. **postfix** correlates the clone with the snapshot by sibling-index
//!    path, restores plain fields per node, then identity-carrying fields
//!    once every node is correlated
//! 4. native callbacks are released and replayed on the clone in preorder:
//!    `after_deserialize`, `initialize` (active nodes), `enable` (enabled
//!    members of active nodes)
//!
//! The whole pipeline is bound to the thread that built the bridge; calls
//! from any other thread are logged and skipped.

mod context;
mod replay;
mod restore;

pub use context::CloneContext;

use crate::accessor::AccessorCompiler;
use crate::capture::RecordPool;
use crate::codec::GraphCodec;
use crate::config::{BridgeConfig, CacheSizes};
use crate::correlation::CorrelationMap;
use crate::host::{Host, Liveness, ObjectId};
use crate::lifecycle::{BlockedCalls, HookResolver};
use crate::types::{TypeRegistry, TypeResolver};
use crate::worthiness::WorthinessRegistry;
use crate::BridgeResult;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// Idle capture records kept between operations
const POOLED_RECORDS: usize = 64;

/// Why an operation did no bridging work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Called off the thread that owns the bridge
    WrongThread,
    /// The source (or result) is not part of an entity tree
    NotATree,
    /// No member in the source tree has a bridge target
    NothingToBridge,
}

/// Outcome of one interception
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperationStatus {
    /// Capture, restore and replay ran
    #[default]
    Completed,
    /// Nothing was bridged
    Skipped(SkipReason),
}

/// Counters of one clone operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    /// Final status
    pub status: OperationStatus,
    /// Snapshot nodes found in the clone
    pub nodes_matched: usize,
    /// Snapshot nodes missing from the clone
    pub nodes_mismatched: usize,
    /// Members whose clone counterpart was missing or of another type
    pub members_mismatched: usize,
    /// Fields encoded before the clone
    pub fields_captured: usize,
    /// Fields written back onto the clone
    pub fields_restored: usize,
    /// Fields that failed to encode, decode or assign
    pub fields_failed: usize,
    /// Lifecycle callbacks run by the bridge
    pub hooks_invoked: usize,
    /// Lifecycle callbacks that reported an error
    pub hooks_failed: usize,
}

impl BridgeReport {
    /// Check if the operation ran to completion
    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

/// Result of [`CloneBridge::instantiate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// The object returned by the native clone
    pub clone: ObjectId,
    /// What the bridge did
    pub report: BridgeReport,
}

/// Prefix/postfix contract around a native clone primitive
pub trait CloneHooks<H: Host> {
    /// State carried from prefix to postfix
    type Context;

    /// Runs before the native clone
    fn prefix(&self, host: &mut H, source: ObjectId) -> Self::Context;

    /// Runs after the native clone returned `result`
    fn postfix(
        &self,
        host: &mut H,
        source: ObjectId,
        result: ObjectId,
        context: Self::Context,
    ) -> BridgeResult<BridgeReport>;
}

/// The object graph clone bridge
///
/// Built once at start-up and passed to whoever intercepts the host's clone
/// primitive. All caches are scoped to this value.
pub struct CloneBridge {
    registry: Arc<TypeRegistry>,
    gate: Arc<BlockedCalls>,
    types: Arc<TypeResolver>,
    accessors: Arc<AccessorCompiler>,
    worthiness: WorthinessRegistry,
    codec: GraphCodec,
    hooks: HookResolver,
    correlation: Arc<CorrelationMap>,
    pool: Mutex<RecordPool>,
    main_thread: ThreadId,
    sizes: CacheSizes,
    debug_logs: bool,
}

impl CloneBridge {
    /// Create a bridge bound to the current thread
    pub fn new(registry: Arc<TypeRegistry>, gate: Arc<BlockedCalls>, config: &BridgeConfig) -> Self {
        let sizes = config.resolve(registry.user_type_count());
        let debug_logs = config.debug_logs();
        let types = Arc::new(TypeResolver::new(Arc::clone(&registry), sizes.types));
        let accessors = Arc::new(AccessorCompiler::new(Arc::clone(&registry), &sizes));
        let codec = GraphCodec::new(
            Arc::clone(&accessors),
            Arc::clone(&types),
            sizes.controlled,
            debug_logs,
        );

        if debug_logs {
            debug!(?sizes, types = registry.len(), "clone bridge initialized");
        }

        Self {
            worthiness: WorthinessRegistry::new(Arc::clone(&registry), &sizes, debug_logs),
            hooks: HookResolver::new(Arc::clone(&registry), sizes.types),
            registry,
            gate,
            types,
            accessors,
            codec,
            correlation: Arc::new(CorrelationMap::new()),
            pool: Mutex::new(RecordPool::new(POOLED_RECORDS)),
            main_thread: thread::current().id(),
            sizes,
            debug_logs,
        }
    }

    /// Clone `source` natively with bridging around it
    ///
    /// Native clone failures are returned after releasing every suspended
    /// callback.
    pub fn instantiate<H: Host>(&self, host: &mut H, source: ObjectId) -> BridgeResult<CloneOutcome> {
        let context = self.prefix(host, source);
        let clone = host.clone_native(source)?;
        let report = self.postfix(host, source, clone, context)?;
        Ok(CloneOutcome { clone, report })
    }

    /// Nearest live object a clone was produced from
    pub fn original_of(&self, clone: ObjectId, liveness: &dyn Liveness) -> Option<ObjectId> {
        self.correlation.get_original_of(clone, liveness)
    }

    /// Check if the caller runs on the bridge's thread
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Shared type registry
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Callback gate shared with the host
    pub fn gate(&self) -> &Arc<BlockedCalls> {
        &self.gate
    }

    /// Original ↔ clone map; subscribe it to host destruction events
    pub fn correlation(&self) -> &Arc<CorrelationMap> {
        &self.correlation
    }

    /// Worthiness registry
    pub fn worthiness(&self) -> &WorthinessRegistry {
        &self.worthiness
    }

    /// Graph codec
    pub fn codec(&self) -> &GraphCodec {
        &self.codec
    }

    /// Accessor compiler
    pub fn accessors(&self) -> &Arc<AccessorCompiler> {
        &self.accessors
    }

    /// Lifecycle callback resolver
    pub fn hooks(&self) -> &HookResolver {
        &self.hooks
    }

    /// Resolved cache capacities
    pub fn cache_sizes(&self) -> CacheSizes {
        self.sizes
    }
}

impl<H: Host> CloneHooks<H> for CloneBridge {
    type Context = CloneContext;

    fn prefix(&self, host: &mut H, source: ObjectId) -> CloneContext {
        self.capture(host, source)
    }

    fn postfix(
        &self,
        host: &mut H,
        source: ObjectId,
        result: ObjectId,
        context: CloneContext,
    ) -> BridgeResult<BridgeReport> {
        self.restore(host, source, result, context)
    }
}

impl std::fmt::Debug for CloneBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneBridge")
            .field("registry", &self.registry)
            .field("worthiness", &self.worthiness)
            .field("correlation", &self.correlation)
            .field("sizes", &self.sizes)
            .finish()
    }
}
