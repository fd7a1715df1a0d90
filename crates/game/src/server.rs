//! Authoritative game server running on the worker bus.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};
use voxel_bus::{Bindings, BusError, Event, EventBus, EventHandlers, HandlerTable, bind_handlers};
use voxel_kernel::{Entity, EntityError, EntityRegistry, SerializedWorld, World};
use voxel_relay::{ClientStart, ServerStarted};

use crate::entities::{Chunk, Player, entity_registry};
use crate::events::{Ping, Pong, RequestChunk, ResponseChunk, register_events};

/// Period of the server simulation tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Seed for chunk generation.
    pub seed: u64,
    /// Chunks generated around the origin at startup, per axis and direction.
    pub chunk_radius: i32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            chunk_radius: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

/// Owns the server world and answers client requests.
///
/// Its handlers are bound when it is spawned and unbound by
/// [`GameServer::dispose`].
#[derive(Debug)]
pub struct GameServer {
    config: GameConfig,
    registry: EntityRegistry,
    world: RefCell<World>,
    tick: Cell<u64>,
    bindings: RefCell<Option<Bindings>>,
}

impl GameServer {
    /// Register the game events on `bus`, generate the starting chunks, and
    /// bind the server's handlers.
    ///
    /// Must run inside a tokio `LocalSet` because the tick is a local
    /// task.
    pub fn spawn(bus: &EventBus, config: GameConfig) -> Result<Rc<Self>, GameError> {
        register_events(bus)?;

        let registry = entity_registry()?;
        let mut world = World::new();
        let (seed, r) = (config.seed, config.chunk_radius.max(0));
        world.add_entities((-r..=r).flat_map(|x| {
            (-r..=r).map(move |z| Box::new(Chunk::generate(seed, x, z)) as Box<dyn Entity>)
        }));
        info!(seed = config.seed, chunks = world.len(), "generated starting chunks");

        let server = Rc::new(Self {
            config,
            registry,
            world: RefCell::new(world),
            tick: Cell::new(0),
            bindings: RefCell::new(None),
        });
        let bindings = bind_handlers(bus, &server)?;
        *server.bindings.borrow_mut() = Some(bindings);
        Ok(server)
    }

    /// Unbind every handler and stop the tick. Idempotent.
    pub fn dispose(&self) {
        if let Some(bindings) = self.bindings.borrow_mut().take() {
            bindings.unbind();
            debug!("game server disposed");
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn tick(&self) -> u64 {
        self.tick.get()
    }

    pub fn world(&self) -> Ref<'_, World> {
        self.world.borrow()
    }

    /// Add a player at spawn height above the origin chunk. Returns its id.
    pub fn spawn_player(&self, name: &str) -> String {
        let height = self.chunk_at(0, 0).height;
        let player = Player::new(name).at(glam::Vec3::new(0.5, f32::from(height) + 1.0, 0.5));
        let id = player.id.to_string();
        self.world.borrow_mut().add_entity(player);
        info!(%id, name, "player joined");
        id
    }

    pub fn snapshot(&self) -> Result<SerializedWorld, EntityError> {
        self.world.borrow().serialize(&self.registry)
    }

    /// Stored chunk at `(x, z)`, generated and stored on first access.
    pub fn chunk_at(&self, x: i32, z: i32) -> Chunk {
        if let Some(chunk) = self.world.borrow().get::<Chunk>(&Chunk::id_for(x, z)) {
            return *chunk;
        }
        let chunk = Chunk::generate(self.config.seed, x, z);
        self.world.borrow_mut().add_entity(chunk);
        chunk
    }

    async fn on_start(self: Rc<Self>, bus: EventBus, start: Rc<Event<ClientStart>>) -> Result<(), BusError> {
        if let Some(name) = &start.payload().player {
            self.spawn_player(name);
        }
        let world = self.snapshot().map_err(BusError::handler)?;
        debug!(entities = world.len(), "sending world snapshot");
        bus.reply(&*start, Event::new(ServerStarted { world })).await?;
        Ok(())
    }

    async fn on_ping(self: Rc<Self>, bus: EventBus, ping: Rc<Event<Ping>>) -> Result<(), BusError> {
        let pong = Pong {
            sent_at: ping.payload().sent_at,
            tick: self.tick(),
        };
        bus.reply(&*ping, Event::new(pong)).await?;
        Ok(())
    }

    async fn on_request_chunk(
        self: Rc<Self>,
        bus: EventBus,
        request: Rc<Event<RequestChunk>>,
    ) -> Result<(), BusError> {
        let RequestChunk { x, z } = *request.payload();
        let chunk = self.chunk_at(x, z);
        bus.reply(&*request, Event::new(ResponseChunk { chunk })).await?;
        Ok(())
    }

    /// Advance the simulation by one tick: move every player with a velocity.
    async fn on_tick(self: Rc<Self>, _bus: EventBus) -> Result<(), BusError> {
        let tick = self.tick.get() + 1;
        self.tick.set(tick);

        let mut world = self.world.borrow_mut();
        let moving: Vec<String> = world
            .query()
            .select::<Player>()
            .filter_as::<Player>(|player| player.velocity != glam::Vec3::ZERO)
            .ids()
            .map_err(BusError::handler)?
            .into_iter()
            .map(str::to_owned)
            .collect();
        let dt = TICK_INTERVAL.as_secs_f32();
        for id in &moving {
            world.update::<Player, _>(id, |player| player.integrate(dt));
        }
        if !moving.is_empty() {
            tracing::trace!(tick, moved = moving.len(), "tick");
        }
        Ok(())
    }
}

impl EventHandlers for GameServer {
    fn handlers() -> HandlerTable<Self> {
        HandlerTable::new()
            .on::<ClientStart, _, _>(Self::on_start)
            .on::<Ping, _, _>(Self::on_ping)
            .on::<RequestChunk, _, _>(Self::on_request_chunk)
            .every(TICK_INTERVAL, Self::on_tick)
    }
}
