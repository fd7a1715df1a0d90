use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;
use voxel_bus::{Environment, Event, EventBus};
use voxel_common::now_millis;
use voxel_game::{Chunk, GameConfig, GameServer, Ping, Player, Pong, RequestChunk, ResponseChunk};
use voxel_kernel::World;
use voxel_relay::{
    ClientConfig, ClientLink, ClientStart, RelayConfig, RelayError, ServerStarted, WorkerHandle,
    message_channel, spawn_server,
};

#[derive(Parser)]
#[command(name = "voxel-cli", about = "Run the voxel server worker and talk to it over the event bus")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// World seed for chunk generation
    #[arg(long, default_value = "42", global = true)]
    seed: u64,

    /// Chunks generated around the origin at startup
    #[arg(long, default_value = "2", global = true)]
    radius: i32,

    /// Give up on a request after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and registered event types
    Info,
    /// Measure round trips to the server worker
    Ping {
        /// Number of pings to send
        #[arg(short, long, default_value = "3")]
        count: u32,
    },
    /// Start a session and summarize the world the server sends back
    Start {
        /// Player to spawn
        #[arg(short, long)]
        player: Option<String>,
    },
    /// Fetch one chunk from the server
    Chunk {
        #[arg(allow_negative_numbers = true)]
        x: i32,
        #[arg(allow_negative_numbers = true)]
        z: i32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    if let Commands::Info = cli.command {
        let bus = EventBus::new(Environment::Client);
        voxel_relay::register_lifecycle_events(&bus)?;
        voxel_game::register_events(&bus)?;
        println!("voxel-cli v{}", env!("CARGO_PKG_VERSION"));
        for event_type in [
            "Client.Start",
            "Client.Ping",
            "Client.RequestChunk",
            "Server.Ready",
            "Server.Started",
            "Server.Pong",
            "Server.ResponseChunk",
        ] {
            println!("  {event_type}: registered={}", bus.is_registered(event_type));
        }
        return Ok(());
    }

    let game = GameConfig {
        seed: cli.seed,
        chunk_radius: cli.radius,
    };
    let client = ClientConfig {
        request_timeout: cli.timeout_ms.map(Duration::from_millis),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let worker = LocalSet::new().block_on(&runtime, session(game, client, cli.command))?;
    worker.join()?;
    Ok(())
}

/// Spawn the server worker, connect a client bus to it, and run one command.
async fn session(game: GameConfig, client: ClientConfig, command: Commands) -> anyhow::Result<WorkerHandle> {
    let (client_port, server_port) = message_channel();
    let worker = spawn_server(RelayConfig::default(), server_port, move |bus| {
        GameServer::spawn(bus, game).map_err(|err| RelayError::Setup(err.to_string()))
    })?;

    let bus = EventBus::new(Environment::Client);
    voxel_game::register_events(&bus)?;
    let link = ClientLink::connect(&bus, client_port, client)?;
    link.ready().await;
    tracing::info!(worker = worker.name(), "server is ready");

    let outcome = run_command(&link, command).await;
    link.close().await;
    outcome?;
    Ok(worker)
}

async fn run_command(link: &ClientLink, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Info => {}
        Commands::Ping { count } => {
            for i in 1..=count {
                let sent_at = now_millis();
                let pong = link
                    .request::<Ping, Pong>(Event::new(Ping { sent_at }))
                    .await?;
                println!(
                    "pong {i}/{count}: server tick={}, rtt={}ms",
                    pong.payload().tick,
                    now_millis().saturating_sub(pong.payload().sent_at)
                );
            }
        }
        Commands::Start { player } => {
            let started = link
                .request::<ClientStart, ServerStarted>(Event::new(ClientStart { player }))
                .await?;
            let registry = voxel_game::entity_registry()?;
            let world = World::deserialize(&registry, started.payload().world.clone())?;
            println!(
                "Started: entities={}, chunks={}, players={}",
                world.len(),
                world.count_of::<Chunk>(),
                world.count_of::<Player>()
            );
            let players = world.query().select::<Player>();
            for entry in players.execute()? {
                if let Some(player) = entry.downcast::<Player>() {
                    println!("  player {} '{}' at {}", entry.id, player.name, player.position);
                }
            }
        }
        Commands::Chunk { x, z } => {
            let response = link
                .request::<RequestChunk, ResponseChunk>(Event::new(RequestChunk { x, z }))
                .await?;
            let chunk = response.payload().chunk;
            println!(
                "Chunk ({}, {}): height={}, size={}x{}",
                chunk.x,
                chunk.z,
                chunk.height,
                Chunk::SIZE,
                Chunk::SIZE
            );
        }
    }
    Ok(())
}
