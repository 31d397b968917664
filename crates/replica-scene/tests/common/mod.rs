//! Shared fixture for the clone bridge integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use replica_core::{
    BlockedCalls, BridgeConfig, CloneBridge, FieldSpec, HookError, HookFn, HookKind, Instance,
    ObjectId, TypeKey, TypeKind, TypeRegistry, Value,
};
use replica_scene::Scene;
use std::sync::Arc;

/// Callback log shared by every recording hook
pub type Log = Arc<Mutex<Vec<String>>>;

/// Keys of the fixture types
#[derive(Debug, Clone, Copy)]
pub struct Types {
    pub int: TypeKey,
    pub float: TypeKey,
    pub string: TypeKey,
    pub entity: TypeKey,

    /// Serializable class: `next: Link`, `label: string`
    pub link: TypeKey,
    /// Abstract serializable class
    pub shape: TypeKey,
    /// `Shape` with `radius: float`
    pub circle: TypeKey,
    /// `Shape` with `side: float`
    pub square: TypeKey,
    /// Asset with `level: int` and a copy constructor
    pub profile: TypeKey,
    /// `Map<string, int>`
    pub scores: TypeKey,
    /// `Map<string, Profile>`
    pub loadout: TypeKey,

    /// Behaviour with plain data only (natively copied)
    pub plain: TypeKey,
    /// Behaviour with every kind of bridged field
    pub inventory: TypeKey,
    /// Base behaviour declaring recording callbacks and one bridged field
    pub tracked_base: TypeKey,
    /// Derives from `tracked_base`, adds another bridged field
    pub tracked: TypeKey,
    /// Behaviour whose callbacks fail
    pub faulty: TypeKey,
}

pub struct Fixture {
    pub types: Types,
    pub registry: Arc<TypeRegistry>,
    pub gate: Arc<BlockedCalls>,
    pub bridge: CloneBridge,
    pub scene: Scene,
    pub log: Log,
}

fn recording(log: &Log, kind: HookKind) -> HookFn {
    let log = Arc::clone(log);
    Arc::new(move |id: ObjectId, _: &mut Instance| {
        log.lock().push(format!("{}:{}", kind.name(), id.as_u64()));
        Ok(())
    })
}

fn failing(kind: HookKind) -> HookFn {
    Arc::new(move |_: ObjectId, _: &mut Instance| Err(HookError::new(format!("{} refused", kind.name()))))
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(&BridgeConfig::default())
    }

    pub fn with_config(config: &BridgeConfig) -> Self {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut b = TypeRegistry::builder();
        let int = b.int();
        let float = b.float();
        let string = b.string();
        let entity = b.entity();
        let behaviour = b.behaviour();
        let asset = b.asset();

        let link = b.declare("game::Link", TypeKind::Class).serializable().finish();
        b.field(link, FieldSpec::public("next", link));
        b.field(link, FieldSpec::public("label", string));

        let shape = b
            .declare("game::Shape", TypeKind::Class)
            .abstract_()
            .serializable()
            .finish();
        let circle = b
            .declare("game::Circle", TypeKind::Class)
            .base(shape)
            .serializable()
            .field(FieldSpec::public("radius", float))
            .finish();
        let square = b
            .declare("game::Square", TypeKind::Class)
            .base(shape)
            .serializable()
            .field(FieldSpec::public("side", float))
            .finish();

        let profile = b
            .declare("game::Profile", TypeKind::HostObject)
            .base(asset)
            .field(FieldSpec::public("level", int))
            .copy_constructor(|source| source.clone())
            .finish();

        let scores = b.map_of(string, int);
        let loadout = b.map_of(string, profile);
        let links = b.list_of(link);

        let plain = b
            .declare("game::Plain", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("speed", float))
            .field(FieldSpec::public("target", entity))
            .finish();

        let inventory = b
            .declare("game::Inventory", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("gold", int))
            .field(FieldSpec::private("secret", int).serialize_field())
            .field(FieldSpec::private("owner", entity).serialize_reference())
            .field(FieldSpec::private("also_owner", entity).serialize_reference())
            .field(FieldSpec::private("home", entity).serialize_reference().passive())
            .field(FieldSpec::public("scores", scores))
            .field(FieldSpec::public("missing", scores))
            .field(FieldSpec::public("shape", shape))
            .field(FieldSpec::private("ring", link).serialize_field())
            .field(FieldSpec::public("chain", links))
            .field(FieldSpec::public("loadout", loadout))
            .field(FieldSpec::private("cache", int).non_serialized())
            .finish();

        let tracked_base = b
            .declare("game::TrackedBase", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("base_scores", scores))
            .hook(HookKind::BeforeSerialize, recording(&log, HookKind::BeforeSerialize))
            .hook(HookKind::AfterDeserialize, recording(&log, HookKind::AfterDeserialize))
            .hook(HookKind::Initialize, recording(&log, HookKind::Initialize))
            .hook(HookKind::Enable, recording(&log, HookKind::Enable))
            .finish();
        let tracked = b
            .declare("game::Tracked", TypeKind::HostObject)
            .base(tracked_base)
            .field(FieldSpec::public("scores", scores))
            .finish();

        let faulty = b
            .declare("game::Faulty", TypeKind::HostObject)
            .base(behaviour)
            .field(FieldSpec::public("scores", scores))
            .hook(HookKind::AfterDeserialize, failing(HookKind::AfterDeserialize))
            .hook(HookKind::Initialize, recording(&log, HookKind::Initialize))
            .finish();

        let registry = Arc::new(b.build().expect("fixture registry"));
        let gate = Arc::new(BlockedCalls::new());
        let bridge = CloneBridge::new(Arc::clone(&registry), Arc::clone(&gate), config);
        let mut scene = Scene::new(Arc::clone(&registry), Arc::clone(&gate));
        scene.subscribe(bridge.correlation().clone());

        Self {
            types: Types {
                int,
                float,
                string,
                entity,
                link,
                shape,
                circle,
                square,
                profile,
                scores,
                loadout,
                plain,
                inventory,
                tracked_base,
                tracked,
                faulty,
            },
            registry,
            gate,
            bridge,
            scene,
            log,
        }
    }

    /// Take and clear the callback log
    pub fn drain_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    /// A string → int map value
    pub fn scores(&self, entries: &[(&str, i64)]) -> Value {
        Value::map(
            self.types.string,
            self.types.int,
            entries
                .iter()
                .map(|(k, v)| (Value::str(*k), Value::Int(*v)))
                .collect(),
        )
    }

    /// Instance of a class with its fields set by name
    pub fn object(&self, ty: TypeKey, fields: &[(&str, Value)]) -> Value {
        let mut instance = self.registry.instantiate(ty).expect("instantiable");
        for (name, value) in fields {
            let slot = self
                .registry
                .find_field(ty, name)
                .and_then(|f| f.slot)
                .expect("known field");
            instance.set_slot(slot, value.clone());
        }
        Value::object(instance)
    }

    pub fn field(&self, id: ObjectId, name: &str) -> Value {
        self.scene.field(id, name).expect("readable field")
    }

    pub fn set(&mut self, id: ObjectId, name: &str, value: Value) {
        self.scene.set_field(id, name, value).expect("writable field");
    }
}
