//! Main-thread side of the relay.

use futures::future;
use std::cell::Cell;
use std::rc::Rc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use voxel_bus::{Environment, Event, EventBus, Payload, Subscription};

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::lifecycle::{ServerReady, register_lifecycle_events};
use crate::relay::{ForwardPolicy, Port, Relay};

/// Connection from a client bus to the server worker.
///
/// Must be created inside a [`tokio::task::LocalSet`]; the inbound pump runs
/// as a local task.
#[derive(Debug)]
pub struct ClientLink {
    bus: EventBus,
    config: ClientConfig,
    relay: Rc<Relay>,
    ready: Rc<Cell<bool>>,
    ready_signal: Rc<Notify>,
    ready_subscription: Option<Subscription>,
    pump: JoinHandle<()>,
}

impl ClientLink {
    /// Attach a relay to `bus` and start pumping messages from the server.
    ///
    /// The `Server.Ready` watcher is subscribed before the pump starts, so the
    /// signal cannot be missed.
    pub fn connect(bus: &EventBus, port: Port, config: ClientConfig) -> Result<Self, RelayError> {
        register_lifecycle_events(bus)?;
        let (outbound, inbound) = port.split();

        let ready = Rc::new(Cell::new(false));
        let ready_signal = Rc::new(Notify::new());
        let ready_subscription = bus.subscribe::<ServerReady, _, _>({
            let ready = ready.clone();
            let ready_signal = ready_signal.clone();
            move |_| {
                ready.set(true);
                ready_signal.notify_waiters();
                future::ok(())
            }
        })?;

        let relay = Rc::new(Relay::attach(
            bus,
            outbound,
            ForwardPolicy::outbound_for(Environment::Client),
        )?);
        let pump = tokio::task::spawn_local({
            let relay = relay.clone();
            async move { relay.run(inbound).await }
        });
        debug!("client link connected");

        Ok(Self {
            bus: bus.clone(),
            config,
            relay,
            ready,
            ready_signal,
            ready_subscription: Some(ready_subscription),
            pump,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Wait until the server has announced itself.
    pub async fn ready(&self) {
        while !self.ready.get() {
            self.ready_signal.notified().await;
        }
    }

    /// Send a request to the server and wait for its correlated response,
    /// bounded by [`ClientConfig::request_timeout`] when set.
    pub async fn request<Q: Payload, R: Payload>(
        &self,
        event: Event<Q>,
    ) -> Result<Rc<Event<R>>, RelayError> {
        let response = self.bus.request::<Q, R>(event);
        match self.config.request_timeout {
            None => Ok(response.await?),
            Some(timeout) => match tokio::time::timeout(timeout, response).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    warn!(request = Q::TYPE, response = R::TYPE, ?timeout, "request timed out");
                    Err(RelayError::Timeout {
                        request: Q::TYPE,
                        response: R::TYPE,
                        timeout,
                    })
                }
            },
        }
    }

    /// Detach from the bus and wait for the server to hang up.
    pub async fn close(mut self) {
        if let Some(subscription) = self.ready_subscription.take() {
            subscription.unsubscribe();
        }
        self.relay.detach();
        if let Err(err) = (&mut self.pump).await {
            warn!(%err, "client pump did not finish cleanly");
        }
        debug!("client link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::message_channel;
    use crate::worker::spawn_server;
    use serde::{Deserialize, Serialize};
    use std::future::Future;
    use std::time::Duration;
    use tokio::task::LocalSet;
    use voxel_bus::BusError;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Payload for Ping {
        const TYPE: &'static str = "Client.Ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong {
        n: u32,
    }

    impl Payload for Pong {
        const TYPE: &'static str = "Server.Pong";
    }

    fn register(bus: &EventBus) -> Result<(), BusError> {
        bus.register_event_type::<Ping>()?;
        bus.register_event_type::<Pong>()
    }

    fn client_bus() -> EventBus {
        let bus = EventBus::new(Environment::Client);
        register(&bus).unwrap();
        bus
    }

    fn run_local<F: Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        LocalSet::new().block_on(&runtime, future)
    }

    /// Worker setup answering every ping with `n + 1`.
    fn serve_pongs(bus: &EventBus) -> Result<Subscription, RelayError> {
        register(bus)?;
        let responder = bus.downgrade();
        let subscription = bus.subscribe::<Ping, _, _>(move |ping| {
            let bus = responder.upgrade();
            async move {
                if let Some(bus) = bus {
                    bus.reply(&*ping, Event::new(Pong { n: ping.payload().n + 1 }))
                        .await?;
                }
                Ok::<(), BusError>(())
            }
        })?;
        Ok(subscription)
    }

    #[test]
    fn ping_pong_across_the_worker_boundary() {
        run_local(async {
            let (client_port, server_port) = message_channel();
            let worker = spawn_server(RelayConfig::default(), server_port, serve_pongs).unwrap();

            let bus = client_bus();
            let link = ClientLink::connect(&bus, client_port, ClientConfig::default()).unwrap();
            link.ready().await;
            assert!(link.is_ready());

            for n in [1, 41] {
                let pong = link.request::<Ping, Pong>(Event::new(Ping { n })).await.unwrap();
                assert_eq!(pong.payload().n, n + 1);
                assert!(pong.meta().is_forwarded());
                assert_eq!(pong.meta().origin(), Some(Environment::Server));
            }

            link.close().await;
            worker.join().unwrap();
        });
    }

    #[test]
    fn ready_handler_can_request_from_the_server() {
        run_local(async {
            let (client_port, server_port) = message_channel();
            let worker = spawn_server(RelayConfig::default(), server_port, serve_pongs).unwrap();

            let bus = client_bus();
            register_lifecycle_events(&bus).unwrap();
            let answer = Rc::new(Cell::new(None));
            let requester = bus.downgrade();
            bus.subscribe::<ServerReady, _, _>({
                let answer = answer.clone();
                move |_| {
                    let bus = requester.upgrade();
                    let answer = answer.clone();
                    async move {
                        if let Some(bus) = bus {
                            let pong = bus.request::<Ping, Pong>(Event::new(Ping { n: 9 })).await?;
                            answer.set(Some(pong.payload().n));
                        }
                        Ok::<(), BusError>(())
                    }
                }
            })
            .unwrap();

            let link = ClientLink::connect(&bus, client_port, ClientConfig::default()).unwrap();
            tokio::time::timeout(Duration::from_secs(5), link.ready())
                .await
                .expect("ready handler stalled the inbound loop");
            assert_eq!(answer.get(), Some(10));

            link.close().await;
            worker.join().unwrap();
        });
    }

    #[test]
    fn request_times_out_without_a_responder() {
        run_local(async {
            let (client_port, server_port) = message_channel();
            let worker = spawn_server(RelayConfig::default(), server_port, |bus| {
                register(bus)?;
                Ok(())
            })
            .unwrap();

            let bus = client_bus();
            let config = ClientConfig::default().with_request_timeout(Duration::from_millis(50));
            let link = ClientLink::connect(&bus, client_port, config).unwrap();
            link.ready().await;

            let err = link
                .request::<Ping, Pong>(Event::new(Ping { n: 1 }))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                RelayError::Timeout { request: "Client.Ping", response: "Server.Pong", .. }
            ));
            // The abandoned waiter is gone.
            assert_eq!(bus.handler_count(Pong::TYPE), 0);

            link.close().await;
            worker.join().unwrap();
        });
    }

    #[test]
    fn messages_for_unregistered_types_are_dropped() {
        run_local(async {
            let (client_port, server_port) = message_channel();
            // The server never registers Ping, so requests are dropped on arrival.
            let worker = spawn_server(RelayConfig::default(), server_port, |_bus| Ok(())).unwrap();

            let bus = client_bus();
            let config = ClientConfig::default().with_request_timeout(Duration::from_millis(50));
            let link = ClientLink::connect(&bus, client_port, config).unwrap();
            link.ready().await;

            let err = link
                .request::<Ping, Pong>(Event::new(Ping { n: 1 }))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::Timeout { .. }));

            link.close().await;
            worker.join().unwrap();
        });
    }
}
