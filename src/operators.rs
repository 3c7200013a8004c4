//! Operators over streams and sequences of perishable values.
//!
//! Every operator here preserves liveness exactly: a forwarded item carries
//! the very same [`Lifetime`] as its source item.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    FnObserver, Lifetime, LifetimeController, Observable, Observer, Perishable,
    PerishableCollection, PerishableError, SharedObserver,
};

/// When a live count stream completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountCompletion {
    /// Complete as soon as the source completes. Deaths afterwards are not reported.
    WhenSourceCompletes,
    /// Complete once the source has completed and every counted item has perished.
    #[default]
    WhenSourceCompletesAndEmpty,
}

impl CountCompletion {
    /// `true` maps to [`WhenSourceCompletes`](Self::WhenSourceCompletes).
    pub fn from_complete_when_source_completes(complete_when_source_completes: bool) -> Self {
        if complete_when_source_completes {
            CountCompletion::WhenSourceCompletes
        } else {
            CountCompletion::WhenSourceCompletesAndEmpty
        }
    }
}

/// Operators on any stream of [`Perishable`] items.
pub trait PerishableObservableExt<T>: Observable<Perishable<T>> + Sized {
    /// Projects each item's value, keeping its lifetime.
    fn lift_map<U, F>(self, projection: F) -> LiftMap<Self, F, T>
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        LiftMap {
            source: self,
            projection: Arc::new(projection),
            _marker: PhantomData,
        }
    }

    /// Drops items whose value fails `predicate`.
    ///
    /// A dropped item is never forwarded, so its death is never seen downstream.
    fn lift_filter<P>(self, predicate: P) -> LiftFilter<Self, P>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        LiftFilter {
            source: self,
            predicate: Arc::new(predicate),
        }
    }

    /// Feeds every item into a new collection.
    fn to_perishable_collection(&self) -> PerishableCollection<T>
    where
        T: Clone + Send + 'static,
    {
        self.to_perishable_collection_until(&Lifetime::immortal())
    }

    /// Feeds items into a new collection until `lifetime` dies.
    ///
    /// Items collected before that stay until their own lifetimes die.
    fn to_perishable_collection_until(&self, lifetime: &Lifetime) -> PerishableCollection<T>
    where
        T: Clone + Send + 'static,
    {
        let collection = PerishableCollection::new();
        let sink = collection.clone();
        let observer = FnObserver::new(move |item: Perishable<T>| sink.add_perishable(item))
            .with_error(|error| tracing::debug!(%error, "collected stream failed"));
        self.subscribe_until(Arc::new(observer), lifetime);
        collection
    }

    /// Tracks how many received items have not perished yet, starting at 0.
    ///
    /// If `complete_when_source_completes` is true the count completes with the
    /// source; otherwise it completes once the source has completed and the
    /// count is back to 0.
    fn observe_non_perished_count(
        self,
        complete_when_source_completes: bool,
    ) -> NonPerishedCount<Self, T> {
        self.observe_non_perished_count_with(CountCompletion::from_complete_when_source_completes(
            complete_when_source_completes,
        ))
    }

    /// Like [`observe_non_perished_count`](Self::observe_non_perished_count) with an explicit policy.
    fn observe_non_perished_count_with(self, completion: CountCompletion) -> NonPerishedCount<Self, T> {
        NonPerishedCount {
            source: self,
            completion,
            _marker: PhantomData,
        }
    }
}

impl<T, S> PerishableObservableExt<T> for S where S: Observable<Perishable<T>> {}

/// Stream returned by [`PerishableObservableExt::lift_map`].
pub struct LiftMap<S, F, T> {
    source: S,
    projection: Arc<F>,
    _marker: PhantomData<fn(T)>,
}

struct LiftMapObserver<F, U> {
    downstream: SharedObserver<Perishable<U>>,
    projection: Arc<F>,
}

impl<T, U, F> Observer<Perishable<T>> for LiftMapObserver<F, U>
where
    F: Fn(T) -> U + Send + Sync,
{
    fn on_next(&self, item: Perishable<T>) {
        self.downstream.on_next(item.map(|value| (self.projection)(value)));
    }

    fn on_error(&self, error: PerishableError) {
        self.downstream.on_error(error);
    }

    fn on_completed(&self) {
        self.downstream.on_completed();
    }
}

impl<S, F, T, U> Observable<Perishable<U>> for LiftMap<S, F, T>
where
    S: Observable<Perishable<T>>,
    F: Fn(T) -> U + Send + Sync + 'static,
    U: 'static,
{
    fn subscribe_until(&self, observer: SharedObserver<Perishable<U>>, lifetime: &Lifetime) {
        let mapped = LiftMapObserver {
            downstream: observer,
            projection: self.projection.clone(),
        };
        self.source.subscribe_until(Arc::new(mapped), lifetime);
    }
}

/// Stream returned by [`PerishableObservableExt::lift_filter`].
pub struct LiftFilter<S, P> {
    source: S,
    predicate: Arc<P>,
}

struct LiftFilterObserver<T, P> {
    downstream: SharedObserver<Perishable<T>>,
    predicate: Arc<P>,
}

impl<T, P> Observer<Perishable<T>> for LiftFilterObserver<T, P>
where
    P: Fn(&T) -> bool + Send + Sync,
{
    fn on_next(&self, item: Perishable<T>) {
        if (self.predicate)(item.value()) {
            self.downstream.on_next(item);
        }
    }

    fn on_error(&self, error: PerishableError) {
        self.downstream.on_error(error);
    }

    fn on_completed(&self) {
        self.downstream.on_completed();
    }
}

impl<S, P, T> Observable<Perishable<T>> for LiftFilter<S, P>
where
    S: Observable<Perishable<T>>,
    P: Fn(&T) -> bool + Send + Sync + 'static,
    T: 'static,
{
    fn subscribe_until(&self, observer: SharedObserver<Perishable<T>>, lifetime: &Lifetime) {
        let filtered = LiftFilterObserver {
            downstream: observer,
            predicate: self.predicate.clone(),
        };
        self.source.subscribe_until(Arc::new(filtered), lifetime);
    }
}

/// Stream returned by [`PerishableObservableExt::observe_non_perished_count`].
///
/// Each subscription counts independently: it emits 0, then the new count
/// after every arrival and after every death of an arrived item.
pub struct NonPerishedCount<S, T> {
    source: S,
    completion: CountCompletion,
    _marker: PhantomData<fn() -> T>,
}

#[derive(Default)]
struct CountState {
    count: usize,
    source_completed: bool,
    finished: bool,
}

/// Per-subscription counter. Every mutation and emission happens under `state`.
struct Counter {
    state: Mutex<CountState>,
    downstream: SharedObserver<usize>,
    completion: CountCompletion,
    /// Ends when the count finishes, fails, or the downstream unsubscribes.
    teardown: LifetimeController,
}

impl Counter {
    fn is_torn_down(&self, state: &CountState) -> bool {
        state.finished || self.teardown.is_ended()
    }

    /// Completes downstream if the policy allows; returns true if it did.
    fn try_complete(&self, state: &mut CountState) -> bool {
        let done = state.source_completed
            && match self.completion {
                CountCompletion::WhenSourceCompletes => true,
                CountCompletion::WhenSourceCompletesAndEmpty => state.count == 0,
            };
        if done {
            state.finished = true;
            tracing::debug!(count = state.count, "live count completed");
            self.downstream.on_completed();
        }
        done
    }

    fn perished(&self) {
        let completed = {
            let mut state = self.state.lock();
            // may have been torn down while this death was in flight
            if self.is_torn_down(&state) {
                return;
            }
            state.count -= 1;
            self.downstream.on_next(state.count);
            self.try_complete(&mut state)
        };
        if completed {
            self.teardown.end_lifetime();
        }
    }
}

struct CountObserver {
    counter: Arc<Counter>,
}

impl<T> Observer<Perishable<T>> for CountObserver {
    fn on_next(&self, item: Perishable<T>) {
        {
            let mut state = self.counter.state.lock();
            if self.counter.is_torn_down(&state) {
                return;
            }
            state.count += 1;
            self.counter.downstream.on_next(state.count);
        }
        let counter = self.counter.clone();
        item.lifetime()
            .when_dead_within(move || counter.perished(), &self.counter.teardown.lifetime());
    }

    fn on_error(&self, error: PerishableError) {
        {
            let mut state = self.counter.state.lock();
            if self.counter.is_torn_down(&state) {
                return;
            }
            state.finished = true;
            tracing::debug!(%error, "live count source failed");
            self.counter.downstream.on_error(error);
        }
        self.counter.teardown.end_lifetime();
    }

    fn on_completed(&self) {
        let completed = {
            let mut state = self.counter.state.lock();
            if self.counter.is_torn_down(&state) {
                return;
            }
            state.source_completed = true;
            self.counter.try_complete(&mut state)
        };
        if completed {
            self.counter.teardown.end_lifetime();
        }
    }
}

impl<S, T> Observable<usize> for NonPerishedCount<S, T>
where
    S: Observable<Perishable<T>>,
{
    fn subscribe_until(&self, observer: SharedObserver<usize>, lifetime: &Lifetime) {
        if lifetime.is_dead() {
            return;
        }
        let counter = Arc::new(Counter {
            state: Mutex::new(CountState::default()),
            downstream: observer,
            completion: self.completion,
            teardown: LifetimeController::new(),
        });
        let teardown = counter.teardown.lifetime();

        let weak = Arc::downgrade(&counter);
        lifetime.when_dead_within(
            move || {
                if let Some(counter) = weak.upgrade() {
                    counter.teardown.end_lifetime();
                }
            },
            &teardown,
        );

        {
            let state = counter.state.lock();
            if counter.is_torn_down(&state) {
                return;
            }
            counter.downstream.on_next(0);
        }
        self.source
            .subscribe_until(Arc::new(CountObserver { counter }), &teardown);
    }
}

/// Operators on any iterator of [`Perishable`] items, mirroring the stream lifts.
pub trait PerishableIteratorExt<T>: Iterator<Item = Perishable<T>> + Sized {
    /// Projects each item's value, keeping its lifetime.
    fn lift_map<U, F>(self, projection: F) -> LiftMapIter<Self, F>
    where
        F: FnMut(T) -> U,
    {
        LiftMapIter {
            iter: self,
            projection,
        }
    }

    /// Drops items whose value fails `predicate`.
    fn lift_filter<P>(self, predicate: P) -> LiftFilterIter<Self, P>
    where
        P: FnMut(&T) -> bool,
    {
        LiftFilterIter {
            iter: self,
            predicate,
        }
    }
}

impl<T, I> PerishableIteratorExt<T> for I where I: Iterator<Item = Perishable<T>> {}

/// Iterator returned by [`PerishableIteratorExt::lift_map`].
#[derive(Debug, Clone)]
pub struct LiftMapIter<I, F> {
    iter: I,
    projection: F,
}

impl<T, U, I, F> Iterator for LiftMapIter<I, F>
where
    I: Iterator<Item = Perishable<T>>,
    F: FnMut(T) -> U,
{
    type Item = Perishable<U>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.iter.next()?;
        Some(item.map(&mut self.projection))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// Iterator returned by [`PerishableIteratorExt::lift_filter`].
#[derive(Debug, Clone)]
pub struct LiftFilterIter<I, P> {
    iter: I,
    predicate: P,
}

impl<T, I, P> Iterator for LiftFilterIter<I, P>
where
    I: Iterator<Item = Perishable<T>>,
    P: FnMut(&T) -> bool,
{
    type Item = Perishable<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let predicate = &mut self.predicate;
        self.iter.find(|item| predicate(item.value()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.iter.size_hint().1)
    }
}
