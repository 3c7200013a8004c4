//! Push-based streams.
//!
//! An [`Observable`] delivers `on_next* (on_error | on_completed)?` to each
//! [`Observer`] until the subscription's [`Lifetime`] dies. Delivery happens on
//! whichever thread drives the source; observers that care about a particular
//! execution context must marshal themselves.
//!
//! # Example
//!
//! ```
//! use perishable::{Observable, Subject};
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! let subject = Subject::<i32>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let subscription = subject.subscribe_fn(move |v: i32| sink.lock().push(v));
//!
//! subject.next(1);
//! subscription.unsubscribe();
//! subject.next(2);
//! assert_eq!(*seen.lock(), vec![1]);
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;

use crate::{Lifetime, LifetimeController, PerishableError};

/// Receiver of a push-based stream.
///
/// Methods take `&self` and implementations must be `Send + Sync`: a source may
/// deliver from any thread.
pub trait Observer<T>: Send + Sync {
    /// Called for each item.
    fn on_next(&self, item: T);

    /// Called once if the stream fails. Nothing is delivered afterwards.
    #[inline]
    fn on_error(&self, _error: PerishableError) {}

    /// Called once if the stream ends normally. Nothing is delivered afterwards.
    #[inline]
    fn on_completed(&self) {}
}

/// Shared, type-erased observer.
pub type SharedObserver<T> = Arc<dyn Observer<T>>;

/// A source of items that can be subscribed to.
pub trait Observable<T> {
    /// Delivers items to `observer` until `lifetime` dies.
    ///
    /// Nothing is delivered once `lifetime` is dead, including terminal
    /// signals.
    fn subscribe_until(&self, observer: SharedObserver<T>, lifetime: &Lifetime);

    /// Subscribes and returns a handle that can cancel the subscription.
    fn subscribe(&self, observer: SharedObserver<T>) -> Subscription {
        let controller = LifetimeController::new();
        self.subscribe_until(observer, &controller.lifetime());
        Subscription { controller }
    }

    /// Subscribes a closure receiving each item.
    fn subscribe_fn<F>(&self, on_next: F) -> Subscription
    where
        Self: Sized,
        F: Fn(T) + Send + Sync + 'static,
        T: 'static,
    {
        self.subscribe(Arc::new(FnObserver::new(on_next)))
    }
}

impl<T, O> Observable<T> for Arc<O>
where
    O: Observable<T> + ?Sized,
{
    fn subscribe_until(&self, observer: SharedObserver<T>, lifetime: &Lifetime) {
        (**self).subscribe_until(observer, lifetime);
    }
}

/// Handle to an active subscription.
///
/// Dropping the handle does not cancel the subscription; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    controller: LifetimeController,
}

impl Subscription {
    /// Stops delivery. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        self.controller.end_lifetime();
    }

    /// Returns true until [`unsubscribe`](Self::unsubscribe) is called.
    pub fn is_active(&self) -> bool {
        !self.controller.is_ended()
    }

    /// The lifetime bounding this subscription.
    pub fn lifetime(&self) -> Lifetime {
        self.controller.lifetime()
    }
}

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(PerishableError) + Send + Sync>;
type CompletedFn = Box<dyn Fn() + Send + Sync>;

/// An observer built from closures.
pub struct FnObserver<T> {
    next: NextFn<T>,
    error: Option<ErrorFn>,
    completed: Option<CompletedFn>,
}

impl<T> FnObserver<T> {
    /// Observer that only handles items.
    pub fn new(on_next: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            next: Box::new(on_next),
            error: None,
            completed: None,
        }
    }

    /// Also handle stream failure.
    pub fn with_error(mut self, on_error: impl Fn(PerishableError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(on_error));
        self
    }

    /// Also handle stream completion.
    pub fn with_completed(mut self, on_completed: impl Fn() + Send + Sync + 'static) -> Self {
        self.completed = Some(Box::new(on_completed));
        self
    }
}

impl<T> Observer<T> for FnObserver<T> {
    fn on_next(&self, item: T) {
        (self.next)(item);
    }

    fn on_error(&self, error: PerishableError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    fn on_completed(&self) {
        if let Some(f) = &self.completed {
            f();
        }
    }
}

impl<T> fmt::Debug for FnObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnObserver")
            .field("error", &self.error.is_some())
            .field("completed", &self.completed.is_some())
            .finish()
    }
}

#[derive(Clone)]
enum Terminal {
    Completed,
    Failed(PerishableError),
}

impl Terminal {
    fn deliver<T>(&self, observer: &dyn Observer<T>) {
        match self {
            Terminal::Completed => observer.on_completed(),
            Terminal::Failed(error) => observer.on_error(error.clone()),
        }
    }
}

struct SubjectState<T> {
    observers: Slab<(SharedObserver<T>, Lifetime)>,
    terminal: Option<Terminal>,
}

/// A hot, multicast source that producers push into.
///
/// Items pushed before a subscription are not replayed to it. Subscribing to
/// a terminated subject delivers the terminal signal immediately.
///
/// This is cheap to clone; clones push into the same stream.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: Slab::new(),
                terminal: None,
            })),
        }
    }
}

impl<T> Subject<T> {
    /// Create a subject with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once `complete` or `error` has been called.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    fn live_observers(&self) -> Vec<SharedObserver<T>> {
        let state = self.state.lock();
        if state.terminal.is_some() {
            return Vec::new();
        }
        state
            .observers
            .iter()
            .filter(|(_, (_, lifetime))| lifetime.is_alive())
            .map(|(_, (observer, _))| observer.clone())
            .collect()
    }

    fn terminate(&self, terminal: Terminal) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.observers)
        };
        for (_, (observer, lifetime)) in observers {
            if lifetime.is_alive() {
                terminal.deliver(&*observer);
            }
        }
    }

    /// Ends the stream normally. Ignored after a terminal signal.
    pub fn complete(&self) {
        tracing::debug!("subject completed");
        self.terminate(Terminal::Completed);
    }

    /// Fails the stream. Ignored after a terminal signal.
    pub fn error(&self, error: PerishableError) {
        tracing::debug!(%error, "subject failed");
        self.terminate(Terminal::Failed(error));
    }
}

impl<T: Clone> Subject<T> {
    /// Pushes an item to every live subscriber. Ignored after a terminal signal.
    ///
    /// Observers are called outside the subject's lock, so callers pushing
    /// from several threads must serialize themselves if order matters.
    pub fn next(&self, item: T) {
        for observer in self.live_observers() {
            observer.on_next(item.clone());
        }
    }
}

impl<T: 'static> Observable<T> for Subject<T> {
    fn subscribe_until(&self, observer: SharedObserver<T>, lifetime: &Lifetime) {
        if lifetime.is_dead() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(terminal) = state.terminal.clone() {
            drop(state);
            terminal.deliver(&*observer);
            return;
        }
        let key = state.observers.insert((observer, lifetime.clone()));
        drop(state);

        let weak: Weak<Mutex<SubjectState<T>>> = Arc::downgrade(&self.state);
        lifetime.when_dead(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock();
                if state.terminal.is_none() {
                    state.observers.try_remove(key);
                }
            }
        });
    }
}

/// A cold source replaying a fixed sequence to each subscriber, then completing.
#[derive(Debug, Clone)]
pub struct IterObservable<T> {
    items: Arc<[T]>,
}

/// Creates a cold source from a sequence of items.
pub fn from_iter<I>(items: I) -> IterObservable<I::Item>
where
    I: IntoIterator,
{
    items.into_iter().collect()
}

impl<T> FromIterator<T> for IterObservable<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Clone> Observable<T> for IterObservable<T> {
    fn subscribe_until(&self, observer: SharedObserver<T>, lifetime: &Lifetime) {
        for item in self.items.iter() {
            if lifetime.is_dead() {
                return;
            }
            observer.on_next(item.clone());
        }
        if lifetime.is_alive() {
            observer.on_completed();
        }
    }
}
