//! Revocable liveness handles with exactly-once death notification.
//!
//! A [`Lifetime`] is a read-only view: it can be queried and it can have
//! actions registered to run when it dies. Only the owning
//! [`LifetimeController`] can end it.
//!
//! # Example
//!
//! ```
//! use perishable::LifetimeController;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let controller = LifetimeController::new();
//! let lifetime = controller.lifetime();
//! let fired = Arc::new(AtomicUsize::new(0));
//!
//! let counter = fired.clone();
//! lifetime.when_dead(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! controller.end_lifetime();
//! controller.end_lifetime();
//! assert!(lifetime.is_dead());
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;

type DeathAction = Box<dyn FnOnce() + Send + 'static>;

/// Shared state of a mortal lifetime.
///
/// The slot table is `None` once the lifetime is dead. Taking the table out
/// under the lock is the single linearization point of death.
struct LifetimeState {
    actions: Mutex<Option<Slab<DeathAction>>>,
}

impl LifetimeState {
    fn alive() -> Self {
        Self {
            actions: Mutex::new(Some(Slab::new())),
        }
    }

    fn dead() -> Self {
        Self {
            actions: Mutex::new(None),
        }
    }

    fn is_dead(&self) -> bool {
        self.actions.lock().is_none()
    }

    /// Stores `action` in the slot table, or hands it back when already dead.
    fn register(&self, action: DeathAction) -> Result<usize, DeathAction> {
        match self.actions.lock().as_mut() {
            Some(slots) => Ok(slots.insert(action)),
            None => Err(action),
        }
    }

    fn unregister(&self, key: usize) {
        if let Some(slots) = self.actions.lock().as_mut() {
            slots.try_remove(key);
        }
    }

    /// Returns `false` if another caller already ended this lifetime.
    fn end(&self) -> bool {
        let taken = self.actions.lock().take();
        let Some(slots) = taken else {
            return false;
        };
        tracing::trace!(callbacks = slots.len(), "lifetime ended");
        for (_, action) in slots {
            action();
        }
        true
    }
}

/// Link between a scoped registration on the target and its cancellation on the scope.
enum ScopeLink {
    Pending,
    Registered(usize),
    Done,
}

/// An immutable handle describing whether something is still relevant.
///
/// A mortal lifetime starts alive and dies at most once, never coming back.
/// The immortal lifetime is alive forever and silently drops every death
/// registration.
///
/// Equality is identity: two handles are equal when they view the same
/// lifetime, and all immortal handles are equal to each other.
///
/// This is cheap to clone.
#[derive(Clone, Default)]
pub struct Lifetime {
    state: Option<Arc<LifetimeState>>,
}

impl Lifetime {
    /// The lifetime that never ends.
    pub const fn immortal() -> Self {
        Self { state: None }
    }

    /// A fresh mortal lifetime that is already dead.
    pub fn dead() -> Self {
        Self {
            state: Some(Arc::new(LifetimeState::dead())),
        }
    }

    /// Returns true until the lifetime has been ended.
    pub fn is_alive(&self) -> bool {
        !self.is_dead()
    }

    /// Returns true once the lifetime has been ended. Never reverts.
    pub fn is_dead(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_dead())
    }

    /// Returns true if this lifetime can ever die.
    pub fn is_mortal(&self) -> bool {
        self.state.is_some()
    }

    /// Returns true if this is the immortal lifetime.
    pub fn is_immortal(&self) -> bool {
        self.state.is_none()
    }

    /// Runs `action` exactly once when this lifetime dies.
    ///
    /// If the lifetime is already dead, `action` runs immediately on the
    /// calling thread. Otherwise it runs on the thread that ends the lifetime.
    /// On the immortal lifetime this does nothing.
    pub fn when_dead<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.when_dead_within(action, &Lifetime::immortal());
    }

    /// Runs `action` exactly once when this lifetime dies, unless `scope` dies first.
    ///
    /// Once `scope` is dead the registration is cancelled and `action` is
    /// dropped without running. When both lifetimes die concurrently exactly
    /// one outcome happens: `action` runs once or it is dropped.
    pub fn when_dead_within<F>(&self, action: F, scope: &Lifetime)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(target) = &self.state else {
            return;
        };
        let Some(scope_state) = &scope.state else {
            if let Err(action) = target.register(Box::new(action)) {
                action();
            }
            return;
        };
        if scope_state.is_dead() {
            return;
        }

        let link = Arc::new(Mutex::new(ScopeLink::Pending));
        let target_key = {
            let link = link.clone();
            let scope_weak = Arc::downgrade(scope_state);
            let wrapped: DeathAction = Box::new(move || {
                let previous = std::mem::replace(&mut *link.lock(), ScopeLink::Done);
                if let (ScopeLink::Registered(key), Some(scope)) = (previous, scope_weak.upgrade())
                {
                    scope.unregister(key);
                }
                action();
            });
            match target.register(wrapped) {
                Ok(key) => key,
                Err(wrapped) => {
                    wrapped();
                    return;
                }
            }
        };

        let target_weak: Weak<LifetimeState> = Arc::downgrade(target);
        let cancel: DeathAction = Box::new(move || {
            if let Some(target) = target_weak.upgrade() {
                target.unregister(target_key);
            }
        });
        match scope_state.register(cancel) {
            Ok(scope_key) => {
                let already_fired = {
                    let mut link = link.lock();
                    if matches!(*link, ScopeLink::Done) {
                        true
                    } else {
                        *link = ScopeLink::Registered(scope_key);
                        false
                    }
                };
                if already_fired {
                    scope_state.unregister(scope_key);
                }
            }
            Err(cancel) => cancel(),
        }
    }
}

impl PartialEq for Lifetime {
    fn eq(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Lifetime {}

impl Hash for Lifetime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let address = self
            .state
            .as_ref()
            .map_or(0usize, |state| Arc::as_ptr(state) as usize);
        address.hash(state);
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            None => f.write_str("Lifetime(Immortal)"),
            Some(state) if state.is_dead() => f.write_str("Lifetime(Dead)"),
            Some(_) => f.write_str("Lifetime(Alive)"),
        }
    }
}

/// The owner of one mortal [`Lifetime`] and the only way to end it.
pub struct LifetimeController {
    state: Arc<LifetimeState>,
}

impl Default for LifetimeController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeController {
    /// Create a controller with a fresh, alive lifetime.
    pub fn new() -> Self {
        Self {
            state: Arc::new(LifetimeState::alive()),
        }
    }

    /// The lifetime controlled by this controller.
    pub fn lifetime(&self) -> Lifetime {
        Lifetime {
            state: Some(self.state.clone()),
        }
    }

    /// Kills the lifetime and runs every pending death action.
    ///
    /// The first call wins; later calls return immediately. Actions run on
    /// this thread, after the lifetime is observably dead and before this
    /// call returns.
    pub fn end_lifetime(&self) {
        self.state.end();
    }

    /// Returns true once [`end_lifetime`](Self::end_lifetime) has been called.
    pub fn is_ended(&self) -> bool {
        self.state.is_dead()
    }
}

impl fmt::Debug for LifetimeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeController")
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<Lifetime>();
    assert_sync::<Lifetime>();
    assert_send::<LifetimeController>();
    assert_sync::<LifetimeController>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_immortal() {
        let (count, make) = counter();
        let immortal = Lifetime::immortal();
        assert!(immortal.is_alive());
        assert!(immortal.is_immortal());
        assert!(!immortal.is_mortal());
        immortal.when_dead(make());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(immortal, Lifetime::default());
    }

    #[test]
    fn test_dead_runs_inline() {
        let (count, make) = counter();
        let dead = Lifetime::dead();
        assert!(dead.is_dead());
        assert!(dead.is_mortal());
        dead.when_dead(make());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_end_fires_pending_once() {
        let (count, make) = counter();
        let controller = LifetimeController::new();
        let lifetime = controller.lifetime();
        lifetime.when_dead(make());
        lifetime.when_dead(make());
        assert!(lifetime.is_alive());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        controller.end_lifetime();
        assert!(controller.is_ended());
        assert!(lifetime.is_dead());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        controller.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        lifetime.when_dead(make());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callbacks_observe_death() {
        let controller = LifetimeController::new();
        let lifetime = controller.lifetime();
        let observed = Arc::new(Mutex::new(None));
        let inner = lifetime.clone();
        let slot = observed.clone();
        lifetime.when_dead(move || {
            *slot.lock() = Some(inner.is_dead());
        });
        controller.end_lifetime();
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_scope_death_cancels() {
        let (count, make) = counter();
        let target = LifetimeController::new();
        let scope = LifetimeController::new();
        target.lifetime().when_dead_within(make(), &scope.lifetime());

        scope.end_lifetime();
        target.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dead_scope_is_inert() {
        let (count, make) = counter();
        let target = LifetimeController::new();
        target.lifetime().when_dead_within(make(), &Lifetime::dead());
        target.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_target_death_releases_scope_slot() {
        let (count, make) = counter();
        let target = LifetimeController::new();
        let scope = LifetimeController::new();
        target.lifetime().when_dead_within(make(), &scope.lifetime());

        target.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let remaining = scope.state.actions.lock().as_ref().map(Slab::len);
        assert_eq!(remaining, Some(0));

        scope.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_death_releases_target_slot() {
        let (count, make) = counter();
        let target = LifetimeController::new();
        let scope = LifetimeController::new();
        target.lifetime().when_dead_within(make(), &scope.lifetime());

        scope.end_lifetime();
        let remaining = target.state.actions.lock().as_ref().map(Slab::len);
        assert_eq!(remaining, Some(0));
        target.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registration_racing_scope_death_leaves_no_slot() {
        for _ in 0..200 {
            let (count, make) = counter();
            let target = LifetimeController::new();
            let scope = Arc::new(LifetimeController::new());
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let ender = {
                let (scope, barrier) = (scope.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    scope.end_lifetime();
                })
            };
            barrier.wait();
            target.lifetime().when_dead_within(make(), &scope.lifetime());
            ender.join().unwrap();

            let remaining = target.state.actions.lock().as_ref().map(Slab::len);
            assert_eq!(remaining, Some(0));
            target.end_lifetime();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_scope_on_already_dead_target() {
        let (count, make) = counter();
        let scope = LifetimeController::new();
        Lifetime::dead().when_dead_within(make(), &scope.lifetime());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let remaining = scope.state.actions.lock().as_ref().map(Slab::len);
        assert_eq!(remaining, Some(0));
    }

    #[test]
    fn test_identity_equality() {
        let a = LifetimeController::new();
        let b = LifetimeController::new();
        assert_eq!(a.lifetime(), a.lifetime());
        assert_ne!(a.lifetime(), b.lifetime());
        assert_ne!(a.lifetime(), Lifetime::immortal());
        assert_ne!(Lifetime::dead(), Lifetime::dead());

        let set: HashSet<Lifetime> = [a.lifetime(), a.lifetime(), b.lifetime()]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_action_may_register_on_same_lifetime() {
        let (count, make) = counter();
        let controller = LifetimeController::new();
        let lifetime = controller.lifetime();
        let inner = lifetime.clone();
        let nested = make();
        lifetime.when_dead(move || inner.when_dead(nested));
        controller.end_lifetime();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
