//! Declarative handler binding.
//!
//! A type lists its handlers once, in an [`EventHandlers::handlers`] table
//! kept next to the methods it names. [`bind_handlers`] subscribes the table
//! for one instance and returns the [`Bindings`] that undo it.

use futures::FutureExt;
use futures::future;
use std::any::type_name;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription, WeakEventBus};
use crate::error::BusError;
use crate::event::{Event, Payload};

type BindFn<T> = Box<dyn Fn(&EventBus, Weak<T>, WeakEventBus) -> Result<Subscription, BusError>>;
type ScheduleFn<T> = Box<dyn Fn(Weak<T>, WeakEventBus) -> AbortHandle>;

struct HandlerEntry<T> {
    event_type: &'static str,
    bind: BindFn<T>,
}

struct ScheduleEntry<T> {
    period: Duration,
    spawn: ScheduleFn<T>,
}

/// Per-type list of "this method handles X" and "this runs every N" entries.
pub struct HandlerTable<T> {
    handlers: Vec<HandlerEntry<T>>,
    schedules: Vec<ScheduleEntry<T>>,
}

impl<T: 'static> HandlerTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            schedules: Vec::new(),
        }
    }

    /// Declare `method` as the handler for events of type `P`.
    ///
    /// The bound handler holds only weak references; once the instance or the
    /// bus is gone it does nothing.
    pub fn on<P, F, Fut>(mut self, method: F) -> Self
    where
        P: Payload,
        F: Fn(Rc<T>, EventBus, Rc<Event<P>>) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        let method = Rc::new(method);
        let bind = move |bus: &EventBus, target: Weak<T>, weak_bus: WeakEventBus| {
            let method = method.clone();
            bus.subscribe::<P, _, _>(move |event| {
                match (target.upgrade(), weak_bus.upgrade()) {
                    (Some(target), Some(bus)) => method(target, bus, event).boxed_local(),
                    _ => future::ok(()).boxed_local(),
                }
            })
        };
        self.handlers.push(HandlerEntry {
            event_type: P::TYPE,
            bind: Box::new(bind),
        });
        self
    }

    /// Declare `method` to run every `period`, first after one full period.
    ///
    /// Failures are logged and do not stop the schedule. The task ends on
    /// unbind or when the instance or bus is dropped.
    pub fn every<F, Fut>(mut self, period: Duration, method: F) -> Self
    where
        F: Fn(Rc<T>, EventBus) -> Fut + 'static,
        Fut: Future<Output = Result<(), BusError>> + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let method = Rc::new(method);
        let spawn = move |target: Weak<T>, weak_bus: WeakEventBus| {
            let method = method.clone();
            let task = tokio::task::spawn_local(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let (Some(target), Some(bus)) = (target.upgrade(), weak_bus.upgrade()) else {
                        break;
                    };
                    if let Err(err) = method(target, bus).await {
                        warn!(owner = type_name::<T>(), ?period, %err, "scheduled handler failed");
                    }
                }
            });
            task.abort_handle()
        };
        self.schedules.push(ScheduleEntry {
            period,
            spawn: Box::new(spawn),
        });
        self
    }

    /// Event types with a declared handler, in declaration order.
    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|entry| entry.event_type)
    }

    pub fn periods(&self) -> impl Iterator<Item = Duration> + '_ {
        self.schedules.iter().map(|entry| entry.period)
    }
}

impl<T: 'static> Default for HandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that declare their event handlers and schedules.
pub trait EventHandlers: Sized + 'static {
    fn handlers() -> HandlerTable<Self>;
}

/// Live subscriptions and scheduled tasks for one bound instance.
#[derive(Debug)]
#[must_use = "dropping Bindings leaves the handlers subscribed; call unbind on teardown"]
pub struct Bindings {
    subscriptions: Vec<Subscription>,
    tasks: Vec<AbortHandle>,
}

impl Bindings {
    /// Number of subscribed handlers.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.tasks.is_empty()
    }

    /// Unsubscribe every handler and stop every schedule.
    pub fn unbind(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Subscribe every handler `T` declares, bound to `target`.
///
/// All or nothing: if any subscription fails, the ones already made are
/// removed and the error is returned. Schedules are spawned with
/// [`tokio::task::spawn_local`].
///
/// # Panics
///
/// Panics if `T` declares schedules and this is called outside a
/// [`tokio::task::LocalSet`].
pub fn bind_handlers<T: EventHandlers>(bus: &EventBus, target: &Rc<T>) -> Result<Bindings, BusError> {
    let table = T::handlers();
    let weak_target = Rc::downgrade(target);
    let weak_bus = bus.downgrade();

    let mut subscriptions = Vec::with_capacity(table.handlers.len());
    for entry in &table.handlers {
        match (entry.bind)(bus, weak_target.clone(), weak_bus.clone()) {
            Ok(subscription) => subscriptions.push(subscription),
            Err(err) => {
                for subscription in subscriptions {
                    subscription.unsubscribe();
                }
                return Err(err);
            }
        }
    }

    let tasks: Vec<AbortHandle> = table
        .schedules
        .iter()
        .map(|entry| (entry.spawn)(weak_target.clone(), weak_bus.clone()))
        .collect();

    debug!(
        env = %bus.environment(),
        owner = type_name::<T>(),
        handlers = subscriptions.len(),
        schedules = tasks.len(),
        "bound handlers"
    );
    Ok(Bindings {
        subscriptions,
        tasks,
    })
}
