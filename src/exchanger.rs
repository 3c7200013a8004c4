//! Sequencing of mutually exclusive lifetimes.

use parking_lot::Mutex;

use crate::{Lifetime, LifetimeController};

/// Hands out a series of lifetimes where each new one starts only after the previous one ended.
///
/// Useful for "rounds": everything registered against the active lifetime
/// is torn down when the next round starts.
///
/// The previous lifetime is ended while the exchanger's lock is held, so its
/// death actions must not call back into the same exchanger.
///
/// # Example
///
/// ```
/// use perishable::LifetimeExchanger;
///
/// let rounds = LifetimeExchanger::new();
/// let first = rounds.start_next_and_end_previous_lifetime();
/// let second = rounds.start_next_and_end_previous_lifetime();
/// assert!(first.is_dead());
/// assert!(second.is_alive());
/// assert_eq!(rounds.active_lifetime(), second);
/// ```
#[derive(Debug, Default)]
pub struct LifetimeExchanger {
    active: Mutex<Option<LifetimeController>>,
}

impl LifetimeExchanger {
    /// Create an exchanger with no active lifetime yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently active lifetime, starting the first one if needed.
    pub fn active_lifetime(&self) -> Lifetime {
        self.active
            .lock()
            .get_or_insert_with(LifetimeController::new)
            .lifetime()
    }

    /// Ends the active lifetime (if any), then starts and returns a new one.
    ///
    /// Concurrent callers are serialized: each call gets its own distinct
    /// lifetime and no two lifetimes from this exchanger are alive at once.
    pub fn start_next_and_end_previous_lifetime(&self) -> Lifetime {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            previous.end_lifetime();
        }
        let next = LifetimeController::new();
        let lifetime = next.lifetime();
        *active = Some(next);
        tracing::trace!("exchanger started next lifetime");
        lifetime
    }
}
