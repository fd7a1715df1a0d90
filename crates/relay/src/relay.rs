use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{Instrument, debug, debug_span, error, trace, warn};
use voxel_bus::{AnyEvent, BusError, Environment, EventBus, Subscription, WireMessage};

/// One end of the host message channel: what this side sends and receives.
#[derive(Debug)]
pub struct Port {
    outbound: UnboundedSender<WireMessage>,
    inbound: UnboundedReceiver<WireMessage>,
}

impl Port {
    pub fn split(self) -> (UnboundedSender<WireMessage>, UnboundedReceiver<WireMessage>) {
        (self.outbound, self.inbound)
    }
}

/// Create the FIFO channel pair linking the two contexts.
pub fn message_channel() -> (Port, Port) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Port {
            outbound: a_tx,
            inbound: a_rx,
        },
        Port {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

type Predicate = dyn Fn(&dyn AnyEvent) -> bool + Send + Sync;

/// Decides which local events are sent to the peer.
///
/// Events that already crossed the boundary are never sent back, whatever the
/// predicate says.
#[derive(Clone)]
pub struct ForwardPolicy(Arc<Predicate>);

impl ForwardPolicy {
    pub fn new(predicate: impl Fn(&dyn AnyEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Forward the events namespaced under `environment`: the server sends its
    /// `Server.*` responses and lifecycle events, the client its `Client.*`
    /// requests.
    pub fn outbound_for(environment: Environment) -> Self {
        Self::new(move |event| environment.owns(event.event_type()))
    }

    pub fn should_forward(&self, event: &dyn AnyEvent) -> bool {
        !event.meta().is_forwarded() && (self.0)(event)
    }
}

impl fmt::Debug for ForwardPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ForwardPolicy(..)")
    }
}

/// Bridges one local bus to the peer context.
pub struct Relay {
    bus: EventBus,
    subscription: RefCell<Option<Subscription>>,
}

impl Relay {
    /// Subscribe to the wildcard on `bus` and send every event `policy`
    /// accepts through `outbound`.
    ///
    /// The relay runs after the type-specific handlers of each publish, so a
    /// handler that cancels an event also keeps it local.
    pub fn attach(
        bus: &EventBus,
        outbound: UnboundedSender<WireMessage>,
        policy: ForwardPolicy,
    ) -> Result<Self, BusError> {
        let env = bus.environment();
        let subscription = bus.subscribe_all(move |event: Rc<dyn AnyEvent>| {
            if policy.should_forward(&*event) {
                match event.to_wire() {
                    Ok(message) => {
                        trace!(%env, event_type = event.event_type(), "forwarding");
                        if outbound.send(message).is_err() {
                            warn!(%env, event_type = event.event_type(), "peer is gone, dropping event");
                        }
                    }
                    Err(err) => {
                        error!(%env, event_type = event.event_type(), %err, "failed to encode event");
                    }
                }
            }
            future::ok(())
        })?;
        debug!(%env, "relay attached");
        Ok(Self {
            bus: bus.clone(),
            subscription: RefCell::new(Some(subscription)),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.borrow().is_some()
    }

    /// Stop forwarding. Dropping the subscription also drops the outbound
    /// sender, which lets the peer's inbound loop finish.
    pub fn detach(&self) -> bool {
        let subscription = self.subscription.borrow_mut().take();
        subscription.is_some_and(Subscription::unsubscribe)
    }

    /// Decode a message from the peer, mark it forwarded, and publish it
    /// locally.
    pub async fn receive(&self, message: WireMessage) -> Result<(), BusError> {
        let event = self.bus.decode(message)?;
        event.meta().mark_forwarded();
        self.bus.publish(event).await
    }

    /// Republish inbound messages in arrival order until the peer hangs up.
    ///
    /// Publishes start in arrival order, but the loop keeps reading while
    /// earlier ones are still awaiting their handlers, so a handler of a
    /// relayed event can wait on a response from the peer. Returns once the
    /// channel is closed and every publish has finished.
    ///
    /// Messages that fail to decode, typically because their type is not
    /// registered on this side yet, are logged and dropped.
    pub async fn run(&self, mut inbound: UnboundedReceiver<WireMessage>) {
        let env = self.bus.environment();
        let mut in_flight = FuturesUnordered::new();
        let mut open = true;
        loop {
            tokio::select! {
                biased;
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                message = inbound.recv(), if open => match message {
                    Some(message) => {
                        if let Some(publish) = self.dispatch(message) {
                            in_flight.push(publish);
                        }
                    }
                    None => {
                        open = false;
                        debug!(%env, "inbound channel closed");
                    }
                },
                else => break,
            }
        }
    }

    fn dispatch(&self, message: WireMessage) -> Option<impl Future<Output = ()> + use<>> {
        let span = debug_span!("relay", env = %self.bus.environment(), event_type = %message.event_type);
        let event = match self.bus.decode(message) {
            Ok(event) => event,
            Err(err) => {
                let _enter = span.enter();
                error!(%err, "dropping undecodable message");
                return None;
            }
        };
        event.meta().mark_forwarded();
        let bus = self.bus.clone();
        Some(async move {
            if let Err(err) = bus.publish(event).instrument(span.clone()).await {
                let _enter = span.enter();
                warn!(%err, "handler failed for relayed event");
            }
        })
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("bus", &self.bus)
            .field("attached", &self.is_attached())
            .finish()
    }
}
