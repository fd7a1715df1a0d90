//! Server worker: a named OS thread with its own runtime and bus.

use std::thread;
use tokio::task::LocalSet;
use tracing::{debug, info};
use voxel_bus::{Environment, Event, EventBus};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::lifecycle::{ServerReady, register_lifecycle_events};
use crate::relay::{ForwardPolicy, Port, Relay};

/// Handle to a running server worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    thread: Option<thread::JoinHandle<Result<(), RelayError>>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Block until the worker exits. It exits once the client side of the
    /// channel is closed.
    pub fn join(mut self) -> Result<(), RelayError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RelayError::ThreadPanic)?,
            None => Ok(()),
        }
    }
}

/// Start the server side on its own thread.
///
/// The worker builds a `Server` bus, registers the lifecycle events, runs
/// `setup` to register its own types and handlers, attaches the relay,
/// publishes [`ServerReady`], and then republishes inbound messages until the
/// peer closes the channel. Whatever `setup` returns is kept alive for that
/// whole time.
pub fn spawn_server<S, T>(config: RelayConfig, port: Port, setup: S) -> Result<WorkerHandle, RelayError>
where
    S: FnOnce(&EventBus) -> Result<T, RelayError> + Send + 'static,
    T: 'static,
{
    let name = config.worker_name.clone();
    let thread_name = name.clone();
    let thread = thread::Builder::new().name(name.clone()).spawn(move || -> Result<(), RelayError> {
        debug!(worker = %thread_name, "thread started");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let result = LocalSet::new().block_on(&runtime, serve(port, setup));
        debug!(worker = %thread_name, ok = result.is_ok(), "thread exiting");
        result
    })?;

    Ok(WorkerHandle {
        name,
        thread: Some(thread),
    })
}

async fn serve<S, T>(port: Port, setup: S) -> Result<(), RelayError>
where
    S: FnOnce(&EventBus) -> Result<T, RelayError>,
{
    let (outbound, inbound) = port.split();
    let bus = EventBus::new(Environment::Server);
    register_lifecycle_events(&bus)?;
    let state = setup(&bus)?;

    let relay = Relay::attach(&bus, outbound, ForwardPolicy::outbound_for(Environment::Server))?;
    bus.emit(Event::new(ServerReady)).await?;
    info!("server ready");

    relay.run(inbound).await;
    relay.detach();
    drop(state);
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message_channel;

    #[test]
    fn worker_announces_ready_and_stops_when_client_hangs_up() {
        let (client, server) = message_channel();
        let worker = spawn_server(RelayConfig::default(), server, |_bus| Ok(())).unwrap();
        assert_eq!(worker.name(), "voxel-server");

        let (outbound, mut inbound) = client.split();
        let ready = inbound.blocking_recv().unwrap();
        assert_eq!(ready.event_type, "Server.Ready");
        assert_eq!(ready.metadata.origin, Some(Environment::Server));

        drop(outbound);
        worker.join().unwrap();
        assert!(inbound.blocking_recv().is_none());
    }

    #[test]
    fn setup_failure_is_returned_from_join() {
        let (client, server) = message_channel();
        let worker = spawn_server(RelayConfig::default(), server, |_bus| {
            Err::<(), _>(RelayError::Setup("no world".into()))
        })
        .unwrap();
        let (_outbound, mut inbound) = client.split();

        let err = worker.join().unwrap_err();
        assert!(matches!(err, RelayError::Setup(msg) if msg == "no world"));
        // Ready is never sent when setup fails.
        assert!(inbound.blocking_recv().is_none());
    }
}
