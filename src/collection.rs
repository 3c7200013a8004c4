//! Thread-safe, self-pruning collection of perishable values.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use slab::Slab;

use crate::{Lifetime, Observable, Perishable, SharedObserver};

type Subscriber<T> = (SharedObserver<Perishable<T>>, Lifetime);

struct CollectionState<T> {
    /// Keyed by insertion sequence, so iteration is insertion order.
    entries: BTreeMap<u64, Perishable<T>>,
    next_id: u64,
    observers: Slab<Subscriber<T>>,
    closed: bool,
}

impl<T> CollectionState<T> {
    fn sweep(&mut self, expired: &Mutex<Vec<u64>>) {
        let ids = std::mem::take(&mut *expired.lock());
        for id in ids {
            if self.entries.remove(&id).is_some() {
                tracing::trace!(id, "collection entry pruned");
            }
        }
        self.observers.retain(|_, (_, lifetime)| lifetime.is_alive());
    }

    fn live_observers(&self) -> Vec<Subscriber<T>> {
        self.observers
            .iter()
            .filter(|(_, (_, lifetime))| lifetime.is_alive())
            .map(|(_, subscriber)| subscriber.clone())
            .collect()
    }

    fn live_entries(&self) -> Vec<Perishable<T>>
    where
        T: Clone,
    {
        self.entries
            .values()
            .filter(|item| item.lifetime().is_alive())
            .cloned()
            .collect()
    }
}

type StateGuard<'a, T> = ReentrantMutexGuard<'a, RefCell<CollectionState<T>>>;

struct Shared<T> {
    /// Reentrant so that observers and death actions running on the
    /// delivering thread can query the collection. The `RefCell` borrow is
    /// never held across a call into user code.
    state: ReentrantMutex<RefCell<CollectionState<T>>>,
    /// Ids of entries whose lifetime died, waiting to be physically removed.
    expired: Mutex<Vec<u64>>,
}

impl<T> Shared<T> {
    /// Locks the collection and applies pending removals.
    fn lock(&self) -> StateGuard<'_, T> {
        let guard = self.state.lock();
        if let Ok(mut state) = guard.try_borrow_mut() {
            state.sweep(&self.expired);
        }
        guard
    }

    fn expire(&self, id: u64) {
        self.expired.lock().push(id);
        if let Some(guard) = self.state.try_lock() {
            if let Ok(mut state) = guard.try_borrow_mut() {
                state.sweep(&self.expired);
            };
        }
    }

    fn close(&self) {
        let (evicted, observers) = {
            let guard = self.lock();
            let mut state = guard.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            let evicted = std::mem::take(&mut state.entries).len();
            let observers = std::mem::take(&mut state.observers);
            (evicted, observers)
        };
        tracing::debug!(evicted, "collection bound lifetime ended");
        for (_, (observer, lifetime)) in observers {
            if lifetime.is_alive() {
                observer.on_completed();
            }
        }
    }

    fn is_closed(guard: &StateGuard<'_, T>) -> bool {
        guard.borrow().closed
    }
}

/// A thread-safe multiset of perishable values that drops each value when its lifetime dies.
///
/// All mutations and the fan-out to subscribers of one collection run under
/// that collection's lock, so other threads wait until every subscriber has
/// seen an add. The lock is reentrant: from `on_next` an observer may query
/// the collection, end an entry's lifetime, unsubscribe, or end the bound
/// lifetime. Adding into the same collection from `on_next` does not block,
/// but the nested item can reach later subscribers before the outer one.
///
/// This is cheap to clone; clones share the same contents.
///
/// # Example
///
/// ```
/// use perishable::{Lifetime, LifetimeController, PerishableCollection};
///
/// let collection = PerishableCollection::new();
/// let controller = LifetimeController::new();
/// collection.add("temporary", controller.lifetime());
/// collection.add("forever", Lifetime::immortal());
/// assert_eq!(collection.len(), 2);
///
/// controller.end_lifetime();
/// let values: Vec<_> = collection.current_items().into_iter().map(|p| *p.value()).collect();
/// assert_eq!(values, vec!["forever"]);
/// ```
pub struct PerishableCollection<T> {
    shared: Arc<Shared<T>>,
    bound: Lifetime,
}

impl<T> Clone for PerishableCollection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            bound: self.bound.clone(),
        }
    }
}

impl<T: Send + 'static> Default for PerishableCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PerishableCollection<T> {
    /// Create an empty collection that lives as long as it is referenced.
    pub fn new() -> Self {
        PerishableCollectionBuilder::new().build()
    }
}

impl<T> PerishableCollection<T> {
    /// The lifetime bounding this collection; immortal unless built with one.
    pub fn lifetime(&self) -> &Lifetime {
        &self.bound
    }

    /// Number of entries currently alive.
    pub fn len(&self) -> usize {
        let guard = self.shared.lock();
        let state = guard.borrow();
        let len = state
            .entries
            .values()
            .filter(|item| item.lifetime().is_alive())
            .count();
        len
    }

    /// Returns true if no entry is currently alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> PerishableCollection<T> {
    /// Adds `value`, visible until `lifetime` dies.
    pub fn add(&self, value: T, lifetime: Lifetime) {
        self.add_perishable(Perishable::new(value, lifetime));
    }

    /// Adds an item, visible until its lifetime dies.
    ///
    /// Every live subscriber receives the item, even when its lifetime is
    /// already dead; it is then pruned right away. Adding to a collection whose
    /// bound lifetime has died does nothing.
    pub fn add_perishable(&self, item: Perishable<T>) {
        let id = {
            let guard = self.shared.lock();
            let (id, observers) = {
                let mut state = guard.borrow_mut();
                if state.closed {
                    tracing::trace!("add ignored by closed collection");
                    return;
                }
                let id = state.next_id;
                state.next_id += 1;
                state.entries.insert(id, item.clone());
                tracing::trace!(id, subscribers = state.observers.len(), "collection entry added");
                (id, state.live_observers())
            };
            for (observer, lifetime) in observers {
                // an earlier observer may have ended the bound lifetime
                if Shared::is_closed(&guard) {
                    break;
                }
                if lifetime.is_alive() {
                    observer.on_next(item.clone());
                }
            }
            id
        };

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        item.lifetime().when_dead_within(
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id);
                }
            },
            &self.bound,
        );
    }

    /// Point-in-time snapshot of the live entries, in insertion order.
    pub fn current_items(&self) -> Vec<Perishable<T>> {
        let guard = self.shared.lock();
        let items = guard.borrow().live_entries();
        items
    }

    /// A stream of the live entries followed by every entry added afterwards.
    ///
    /// Removal is not signalled on the stream; register on each item's
    /// lifetime to hear about it.
    pub fn current_and_future_items(&self) -> CurrentAndFutureItems<T> {
        CurrentAndFutureItems {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Extend<Perishable<T>> for PerishableCollection<T> {
    fn extend<I: IntoIterator<Item = Perishable<T>>>(&mut self, iter: I) {
        for item in iter {
            self.add_perishable(item);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PerishableCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.lock();
        let state = guard.borrow();
        let result = f
            .debug_struct("PerishableCollection")
            .field("entries", &state.entries.values().collect::<Vec<_>>())
            .field("subscribers", &state.observers.len())
            .field("closed", &state.closed)
            .finish();
        result
    }
}

/// Live view returned by [`PerishableCollection::current_and_future_items`].
pub struct CurrentAndFutureItems<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CurrentAndFutureItems<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Observable<Perishable<T>> for CurrentAndFutureItems<T> {
    /// Replays the live entries, then forwards each later add exactly once.
    ///
    /// Replay and registration happen under the collection's lock, so a
    /// concurrent add is seen either in the replay or as a later item, never
    /// both and never neither.
    fn subscribe_until(&self, observer: SharedObserver<Perishable<T>>, lifetime: &Lifetime) {
        if lifetime.is_dead() {
            return;
        }
        let guard = self.shared.lock();
        let replay = {
            let state = guard.borrow();
            let replay = (!state.closed).then(|| state.live_entries());
            replay
        };
        if let Some(replay) = replay {
            for item in replay {
                if lifetime.is_dead() {
                    return;
                }
                if item.lifetime().is_alive() {
                    observer.on_next(item);
                }
            }
            let mut state = guard.borrow_mut();
            if !state.closed {
                state.observers.insert((observer, lifetime.clone()));
                return;
            }
        }
        drop(guard);
        observer.on_completed();
    }
}

/// Builder for [`PerishableCollection`].
///
/// # Example
///
/// ```
/// use perishable::{Lifetime, LifetimeController, PerishableCollectionBuilder};
///
/// let owner = LifetimeController::new();
/// let collection = PerishableCollectionBuilder::new()
///     .bound_to(owner.lifetime())
///     .build();
/// collection.add(1, Lifetime::immortal());
///
/// owner.end_lifetime();
/// assert!(collection.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PerishableCollectionBuilder {
    bound: Lifetime,
}

impl PerishableCollectionBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the collection to an owning lifetime.
    ///
    /// When it dies the collection evicts every entry, completes its
    /// subscribers, and ignores later adds. The entries' own lifetimes are
    /// left untouched.
    pub fn bound_to(mut self, lifetime: Lifetime) -> Self {
        self.bound = lifetime;
        self
    }

    /// Build the collection.
    pub fn build<T: Send + 'static>(self) -> PerishableCollection<T> {
        let shared = Arc::new(Shared {
            state: ReentrantMutex::new(RefCell::new(CollectionState {
                entries: BTreeMap::new(),
                next_id: 0,
                observers: Slab::new(),
                closed: false,
            })),
            expired: Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&shared);
        self.bound.when_dead(move || {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        });
        PerishableCollection {
            shared,
            bound: self.bound,
        }
    }
}
