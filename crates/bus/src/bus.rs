use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use tracing::{Instrument, debug, debug_span, trace};
use voxel_common::{CorrelationId, Environment};

use crate::error::BusError;
use crate::event::{AnyEvent, Event, Payload, WILDCARD};
use crate::registry::EventRegistry;
use crate::wire::WireMessage;

/// Boxed future returned by handlers and hooks.
pub type HandlerFuture = LocalBoxFuture<'static, Result<(), BusError>>;

type ErasedHandler = Rc<dyn Fn(Rc<dyn AnyEvent>) -> HandlerFuture>;

struct Inner {
    environment: Environment,
    registry: RefCell<EventRegistry>,
    handlers: RefCell<HashMap<String, Vec<(u64, ErasedHandler)>>>,
    hooks: RefCell<Vec<ErasedHandler>>,
    next_id: Cell<u64>,
}

/// Typed publish/subscribe bus for one execution context.
///
/// Cloning yields another handle to the same bus. All state lives in the
/// registries; a publish runs its hooks and handlers strictly one after
/// another, awaiting each before starting the next.
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("environment", &self.inner.environment)
            .field("event_types", &self.inner.registry.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle, for handlers that need the bus without keeping it alive.
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<Inner>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

/// Handle removing exactly one handler from its bus.
///
/// Dropping the handle leaves the handler subscribed; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Inner>,
    key: String,
    id: u64,
}

impl Subscription {
    /// Event type (or wildcard token) this handler listens to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.borrow_mut();
        let Some(list) = handlers.get_mut(&self.key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&self.key);
        }
        removed
    }
}

/// Unsubscribes when dropped; keeps one-shot waits from leaking handlers.
struct SubscriptionGuard(Option<Subscription>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

impl EventBus {
    /// Create a bus for `environment` with an empty type registry.
    pub fn new(environment: Environment) -> Self {
        Self::with_registry(environment, EventRegistry::new())
    }

    /// Create a bus around a prepared registry.
    ///
    /// Installs the built-in hook that stamps the bus environment as the origin
    /// of every event published without one.
    pub fn with_registry(environment: Environment, registry: EventRegistry) -> Self {
        let bus = Self {
            inner: Rc::new(Inner {
                environment,
                registry: RefCell::new(registry),
                handlers: RefCell::new(HashMap::new()),
                hooks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        };
        bus.before_publish(move |event| {
            if event.meta().origin().is_none() {
                event.meta().set_origin(environment);
            }
            future::ok(())
        });
        bus
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register `P` so it can be published, subscribed to, and decoded.
    pub fn register_event_type<P: Payload>(&self) -> Result<(), BusError> {
        self.inner.registry.borrow_mut().register::<P>()?;
        debug!(env = %self.inner.environment, event_type = P::TYPE, "registered event type");
        Ok(())
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.inner.registry.borrow().contains(event_type)
    }

    /// Rebuild an event received from the other side of the worker boundary.
    pub fn decode(&self, message: WireMessage) -> Result<Rc<dyn AnyEvent>, BusError> {
        self.inner.registry.borrow().decode(message)
    }

    /// Subscribe a handler to events of type `P`.
    pub fn subscribe<P, F, Fut>(&self, handler: F) -> Result<Subscription, BusError>
    where
        P: Payload,
        F: Fn(Rc<Event<P>>) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        self.subscribe_dyn(P::TYPE, move |event: Rc<dyn AnyEvent>| {
            match event.downcast::<P>() {
                Some(event) => handler(event).boxed_local(),
                None => future::ok(()).boxed_local(),
            }
        })
    }

    /// Subscribe a handler to every event type. Wildcard handlers run after the
    /// type-specific handlers of each publish.
    pub fn subscribe_all<F, Fut>(&self, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(Rc<dyn AnyEvent>) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        self.subscribe_dyn(WILDCARD, handler)
    }

    /// Subscribe by type name. Accepts any registered name or [`WILDCARD`].
    pub fn subscribe_dyn<F, Fut>(&self, key: &str, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(Rc<dyn AnyEvent>) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        self.inner.registry.borrow().ensure_subscribable(key)?;

        let id = self.next_id();
        let erased: ErasedHandler = Rc::new(move |event: Rc<dyn AnyEvent>| handler(event).boxed_local());
        self.inner
            .handlers
            .borrow_mut()
            .entry(key.to_owned())
            .or_default()
            .push((id, erased));
        trace!(env = %self.inner.environment, key, id, "subscribed");

        Ok(Subscription {
            bus: Rc::downgrade(&self.inner),
            key: key.to_owned(),
            id,
        })
    }

    /// Add a hook that runs before the handlers of every publish, in
    /// registration order. Hooks may mutate metadata.
    pub fn before_publish<F, Fut>(&self, hook: F)
    where
        F: Fn(Rc<dyn AnyEvent>) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        self.inner
            .hooks
            .borrow_mut()
            .push(Rc::new(move |event: Rc<dyn AnyEvent>| hook(event).boxed_local()));
    }

    /// Publish an event: hooks first, then type-specific handlers, then
    /// wildcard handlers, stopping as soon as the event is canceled.
    ///
    /// A failing hook or handler aborts the rest of the chain and its error is
    /// returned.
    pub async fn publish(&self, event: Rc<dyn AnyEvent>) -> Result<(), BusError> {
        let span = debug_span!(
            "publish",
            env = %self.inner.environment,
            event_type = event.event_type()
        );
        self.run_publish(event).instrument(span).await
    }

    async fn run_publish(&self, event: Rc<dyn AnyEvent>) -> Result<(), BusError> {
        let event_type = event.event_type();
        self.inner.registry.borrow().ensure_registered(event_type)?;

        let hooks: Vec<ErasedHandler> = self.inner.hooks.borrow().clone();
        for hook in hooks {
            hook(event.clone()).await?;
        }

        let chain = self.handler_chain(event_type);
        trace!(handlers = chain.len(), "running handlers");
        for handler in chain {
            if event.meta().is_canceled() {
                debug!("event canceled, stopping propagation");
                break;
            }
            handler(event.clone()).await?;
        }
        Ok(())
    }

    /// Publish after setting the correlation id.
    pub async fn publish_correlated(
        &self,
        event: Rc<dyn AnyEvent>,
        correlation_id: CorrelationId,
    ) -> Result<(), BusError> {
        event.meta().set_correlation_id(Some(correlation_id));
        self.publish(event).await
    }

    /// Publish a typed event and hand it back, e.g. to inspect cancellation.
    pub async fn emit<P: Payload>(&self, event: Event<P>) -> Result<Rc<Event<P>>, BusError> {
        let event = Rc::new(event);
        self.publish(event.clone()).await?;
        Ok(event)
    }

    /// Wait for the next event of type `P`, optionally with a matching
    /// correlation id.
    ///
    /// The handler is subscribed immediately, so publishes that happen after
    /// this call and before the returned future is polled are still caught. It
    /// is removed after the first match or when the future is dropped. There
    /// is no timeout.
    pub fn wait_for<P: Payload>(
        &self,
        correlation_id: Option<CorrelationId>,
    ) -> Result<LocalBoxFuture<'static, Result<Rc<Event<P>>, BusError>>, BusError> {
        let (tx, rx) = oneshot::channel::<Rc<Event<P>>>();
        let slot = RefCell::new(Some(tx));

        let subscription = self.subscribe::<P, _, _>(move |event| {
            let matches = correlation_id.is_none_or(|id| event.correlation_id() == Some(id));
            if matches {
                if let Some(tx) = slot.borrow_mut().take() {
                    let _ = tx.send(event);
                }
            }
            future::ok(())
        })?;

        let guard = SubscriptionGuard(Some(subscription));
        Ok(async move {
            let _guard = guard;
            rx.await.map_err(|_| BusError::Closed(P::TYPE))
        }
        .boxed_local())
    }

    /// Publish `event` and resolve with the first `R` carrying the same
    /// correlation id. A fresh id is assigned if the event has none.
    ///
    /// Pending forever if no matching response ever arrives.
    pub async fn request<Q: Payload, R: Payload>(
        &self,
        event: Event<Q>,
    ) -> Result<Rc<Event<R>>, BusError> {
        let correlation_id = match event.correlation_id() {
            Some(id) => id,
            None => {
                let id = CorrelationId::new();
                event.meta().set_correlation_id(Some(id));
                id
            }
        };
        let response = self.wait_for::<R>(Some(correlation_id))?;
        debug!(
            env = %self.inner.environment,
            request = Q::TYPE,
            response = R::TYPE,
            %correlation_id,
            "request"
        );
        self.publish(Rc::new(event)).await?;
        response.await
    }

    /// Answer `original` with `response`, copying its correlation id.
    ///
    /// Returns once the response has been observed by a waiter for its type and
    /// id during its own publish pass. If a handler cancels the response before
    /// it gets there, this fails with [`BusError::ReplyNotObserved`].
    pub async fn reply<R: Payload>(
        &self,
        original: &dyn AnyEvent,
        response: Event<R>,
    ) -> Result<Rc<Event<R>>, BusError> {
        let correlation_id = original.meta().correlation_id();
        response.meta().set_correlation_id(correlation_id);

        let observed = self.wait_for::<R>(correlation_id)?;
        self.publish(Rc::new(response)).await?;
        match observed.now_or_never() {
            Some(result) => result,
            None => Err(BusError::ReplyNotObserved(R::TYPE)),
        }
    }

    /// Number of handlers currently subscribed under `key`.
    pub fn handler_count(&self, key: &str) -> usize {
        self.inner
            .handlers
            .borrow()
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Snapshot of the handlers for one publish: type-specific, then wildcard.
    /// Handlers added during the publish do not run in it.
    fn handler_chain(&self, event_type: &str) -> Vec<ErasedHandler> {
        let handlers = self.inner.handlers.borrow();
        [event_type, WILDCARD]
            .iter()
            .filter_map(|key| handlers.get(*key))
            .flat_map(|list| list.iter().map(|(_, handler)| handler.clone()))
            .collect()
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

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

    fn bus() -> EventBus {
        let bus = EventBus::new(Environment::Client);
        bus.register_event_type::<Ping>().unwrap();
        bus.register_event_type::<Pong>().unwrap();
        bus
    }

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn record(log: &Log, name: &'static str) -> impl Fn(Rc<dyn AnyEvent>) -> future::Ready<Result<(), BusError>> + 'static {
        let log = log.clone();
        move |_| {
            log.borrow_mut().push(name);
            future::ok(())
        }
    }

    #[test]
    fn subscribe_to_unregistered_type_fails() {
        let bus = bus();
        for name in ["Client.Nope", "", "Server.pong", "**"] {
            let err = bus.subscribe_dyn(name, |_| future::ok(())).unwrap_err();
            assert!(matches!(err, BusError::Unregistered(_)), "{name}");
        }
        assert!(bus.subscribe_dyn(WILDCARD, |_| future::ok(())).is_ok());
    }

    #[tokio::test]
    async fn publish_of_unregistered_type_fails() {
        let bus = EventBus::new(Environment::Server);
        let err = bus.emit(Event::new(Ping)).await.unwrap_err();
        assert!(matches!(err, BusError::Unregistered(t) if t == "Client.Ping"));
    }

    #[tokio::test]
    async fn type_handlers_run_before_wildcard_in_order() {
        let bus = bus();
        let log: Log = Rc::default();
        bus.subscribe_all(record(&log, "wild")).unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "h1")).unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "h3")).unwrap();

        bus.emit(Event::new(Ping)).await.unwrap();
        assert_eq!(*log.borrow(), vec!["h1", "h3", "wild"]);
    }

    #[tokio::test]
    async fn cancel_stops_remaining_handlers() {
        let bus = bus();
        let log: Log = Rc::default();
        let first = log.clone();
        bus.subscribe::<Ping, _, _>(move |event| {
            first.borrow_mut().push("h1");
            event.cancel();
            future::ok(())
        })
        .unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "h2")).unwrap();
        bus.subscribe_all(record(&log, "h3")).unwrap();

        let event = bus.emit(Event::new(Ping)).await.unwrap();
        assert!(event.is_canceled());
        assert_eq!(*log.borrow(), vec!["h1"]);
    }

    #[tokio::test]
    async fn async_handlers_run_sequentially() {
        let bus = bus();
        let log: Log = Rc::default();
        let slow = log.clone();
        bus.subscribe::<Ping, _, _>(move |_| {
            let log = slow.clone();
            async move {
                log.borrow_mut().push("slow:start");
                tokio::task::yield_now().await;
                log.borrow_mut().push("slow:end");
                Ok::<(), BusError>(())
            }
        })
        .unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "fast")).unwrap();

        bus.emit(Event::new(Ping)).await.unwrap();
        assert_eq!(*log.borrow(), vec!["slow:start", "slow:end", "fast"]);
    }

    #[tokio::test]
    async fn failing_handler_aborts_the_chain() {
        let bus = bus();
        let log: Log = Rc::default();
        bus.subscribe::<Ping, _, _>(|_| future::err(BusError::handler("boom")))
            .unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "after")).unwrap();

        let err = bus.emit(Event::new(Ping)).await.unwrap_err();
        assert!(matches!(err, BusError::Handler(msg) if msg == "boom"));
        assert!(log.borrow().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_exactly_one_handler() {
        let bus = bus();
        let log: Log = Rc::default();
        let a = bus.subscribe_dyn(Ping::TYPE, record(&log, "a")).unwrap();
        bus.subscribe_dyn(Ping::TYPE, record(&log, "b")).unwrap();
        assert!(a.unsubscribe());

        bus.emit(Event::new(Ping)).await.unwrap();
        assert_eq!(*log.borrow(), vec!["b"]);
        assert_eq!(bus.handler_count(Ping::TYPE), 1);
    }

    #[tokio::test]
    async fn origin_is_stamped_when_unset() {
        let bus = bus();
        let event = bus.emit(Event::new(Ping)).await.unwrap();
        assert_eq!(event.meta().origin(), Some(Environment::Client));

        let foreign = Event::new(Ping);
        foreign.meta().set_origin(Environment::Server);
        let foreign = bus.emit(foreign).await.unwrap();
        assert_eq!(foreign.meta().origin(), Some(Environment::Server));
    }

    #[tokio::test]
    async fn hooks_run_before_handlers_and_can_cancel() {
        let bus = bus();
        let log: Log = Rc::default();
        let hook_log = log.clone();
        bus.before_publish(move |event| {
            hook_log.borrow_mut().push("hook");
            if event.event_type() == Pong::TYPE {
                event.cancel();
            }
            future::ok(())
        });
        bus.subscribe_all(record(&log, "wild")).unwrap();

        bus.emit(Event::new(Ping)).await.unwrap();
        bus.emit(Event::new(Pong { n: 1 })).await.unwrap();
        assert_eq!(*log.borrow(), vec!["hook", "wild", "hook"]);
    }

    #[tokio::test]
    async fn wait_for_filters_by_correlation_id() {
        let bus = bus();
        let wanted = CorrelationId::new();
        let waiter = bus.wait_for::<Pong>(Some(wanted)).unwrap();

        bus.emit(Event::new(Pong { n: 1 }).with_correlation(CorrelationId::new()))
            .await
            .unwrap();
        bus.emit(Event::new(Pong { n: 2 })).await.unwrap();
        bus.emit(Event::new(Pong { n: 3 }).with_correlation(wanted))
            .await
            .unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got.payload().n, 3);
        assert_eq!(bus.handler_count(Pong::TYPE), 0);
    }

    #[tokio::test]
    async fn publish_correlated_overrides_existing_id() {
        let bus = bus();
        let supplied = CorrelationId::new();
        let stale = CorrelationId::new();
        let waiter = bus.wait_for::<Pong>(Some(supplied)).unwrap();
        let stale_waiter = bus.wait_for::<Pong>(Some(stale)).unwrap();

        let event = Rc::new(Event::new(Pong { n: 5 }).with_correlation(stale));
        bus.publish_correlated(event.clone(), supplied).await.unwrap();
        assert_eq!(event.correlation_id(), Some(supplied));

        let got = waiter.await.unwrap();
        assert!(Rc::ptr_eq(&got, &event));
        // Only the supplied id was seen; the stale waiter is still armed.
        assert_eq!(bus.handler_count(Pong::TYPE), 1);
        drop(stale_waiter);
        assert_eq!(bus.handler_count(Pong::TYPE), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_unsubscribes() {
        let bus = bus();
        let waiter = bus.wait_for::<Pong>(None).unwrap();
        assert_eq!(bus.handler_count(Pong::TYPE), 1);
        drop(waiter);
        assert_eq!(bus.handler_count(Pong::TYPE), 0);
    }

    #[tokio::test]
    async fn request_resolves_with_matching_reply_only() {
        let bus = bus();
        let responder = bus.downgrade();
        bus.subscribe::<Ping, _, _>(move |ping| {
            let bus = responder.upgrade();
            async move {
                let Some(bus) = bus else { return Ok(()) };
                // A stray response with a different id must not resolve the request.
                bus.emit(Event::new(Pong { n: 0 }).with_correlation(CorrelationId::new()))
                    .await?;
                bus.reply(&*ping, Event::new(Pong { n: 7 })).await?;
                Ok::<(), BusError>(())
            }
        })
        .unwrap();

        let request = Event::new(Ping);
        let pong: Rc<Event<Pong>> = bus.request::<Ping, Pong>(request).await.unwrap();
        assert_eq!(pong.payload().n, 7);
        assert!(pong.correlation_id().is_some());
    }

    #[tokio::test]
    async fn request_keeps_caller_supplied_id() {
        let bus = bus();
        let responder = bus.downgrade();
        bus.subscribe::<Ping, _, _>(move |ping| {
            let bus = responder.upgrade();
            async move {
                if let Some(bus) = bus {
                    bus.reply(&*ping, Event::new(Pong { n: 1 })).await?;
                }
                Ok::<(), BusError>(())
            }
        })
        .unwrap();

        let id = CorrelationId::new();
        let pong = bus
            .request::<Ping, Pong>(Event::new(Ping).with_correlation(id))
            .await
            .unwrap();
        assert_eq!(pong.correlation_id(), Some(id));
    }

    #[tokio::test]
    async fn reply_copies_correlation_id() {
        let bus = bus();
        let id = CorrelationId::new();
        let original = Event::new(Ping).with_correlation(id);
        let response = bus.reply(&original, Event::new(Pong { n: 4 })).await.unwrap();
        assert_eq!(response.correlation_id(), Some(id));
    }

    #[tokio::test]
    async fn canceled_reply_is_reported() {
        let bus = bus();
        bus.subscribe::<Pong, _, _>(|pong| {
            pong.cancel();
            future::ok(())
        })
        .unwrap();
        let original = Event::new(Ping).with_correlation(CorrelationId::new());
        let err = bus.reply(&original, Event::new(Pong { n: 4 })).await.unwrap_err();
        assert!(matches!(err, BusError::ReplyNotObserved("Server.Pong")));
        assert_eq!(bus.handler_count(Pong::TYPE), 1);
    }

    #[tokio::test]
    async fn handlers_added_during_publish_wait_for_next_pass() {
        let bus = bus();
        let log: Log = Rc::default();
        let weak = bus.downgrade();
        let late_log = log.clone();
        bus.subscribe::<Ping, _, _>(move |_| {
            if let Some(bus) = weak.upgrade() {
                let _ = bus.subscribe_dyn(Ping::TYPE, record(&late_log, "late"));
            }
            future::ok(())
        })
        .unwrap();

        bus.emit(Event::new(Ping)).await.unwrap();
        assert!(log.borrow().is_empty());
        bus.emit(Event::new(Ping)).await.unwrap();
        assert_eq!(*log.borrow(), vec!["late"]);
    }
}
