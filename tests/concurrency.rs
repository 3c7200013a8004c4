//! Multi-threaded tests for lifetimes, collections, and live counts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;
use perishable::{
    Lifetime, LifetimeController, LifetimeExchanger, Observable, PerishableCollection,
    PerishableObservableExt,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Lifetimes
// ============================================================================

#[test]
fn test_concurrent_end_and_register() {
    init_tracing();
    for _ in 0..50 {
        let controller = Arc::new(LifetimeController::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(3));

        let registrars: Vec<_> = (0..2)
            .map(|_| {
                let lifetime = controller.lifetime();
                let hits = hits.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        let hits = hits.clone();
                        lifetime.when_dead(move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        barrier.wait();
        controller.end_lifetime();
        for handle in registrars {
            handle.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 200);
    }
}

#[test]
fn test_concurrent_target_and_scope_death() {
    init_tracing();
    let (mut fired, mut cancelled) = (0, 0);
    for _ in 0..200 {
        let target = Arc::new(LifetimeController::new());
        let scope = Arc::new(LifetimeController::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let control = Arc::new(AtomicUsize::new(0));
        let token = Arc::new(());

        let (counter, held) = (hits.clone(), token.clone());
        target.lifetime().when_dead_within(
            move || {
                let _held = held;
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &scope.lifetime(),
        );
        let unrelated = LifetimeController::new();
        let counter = control.clone();
        target.lifetime().when_dead_within(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &unrelated.lifetime(),
        );

        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let scope = scope.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                scope.end_lifetime();
            })
        };
        barrier.wait();
        target.end_lifetime();
        handle.join().unwrap();

        match hits.load(Ordering::SeqCst) {
            0 => cancelled += 1,
            1 => fired += 1,
            n => panic!("scoped action ran {} times", n),
        }
        // run or dropped, never left behind in either slot table
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(control.load(Ordering::SeqCst), 1);
    }
    assert_eq!(fired + cancelled, 200);
}

#[test]
fn test_concurrent_exchanges_yield_distinct_lifetimes() {
    init_tracing();
    let exchanger = Arc::new(LifetimeExchanger::new());
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let exchanger = exchanger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..100)
                    .map(|_| exchanger.start_next_and_end_previous_lifetime())
                    .collect::<Vec<Lifetime>>()
            })
        })
        .collect();

    let lifetimes: Vec<Lifetime> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    let distinct: HashSet<_> = lifetimes.iter().cloned().collect();
    assert_eq!(distinct.len(), 800);

    let alive: Vec<_> = lifetimes.iter().filter(|l| l.is_alive()).collect();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0], &exchanger.active_lifetime());
}

// ============================================================================
// Collections
// ============================================================================

#[test]
fn test_concurrent_adds_reach_late_subscriber_once() {
    init_tracing();
    let collection = PerishableCollection::<i32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(5));

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let collection = collection.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..250 {
                    collection.add(writer * 1000 + i, Lifetime::immortal());
                }
            })
        })
        .collect();

    barrier.wait();
    let sink = seen.clone();
    collection
        .current_and_future_items()
        .subscribe_fn(move |item| sink.lock().push(*item.value()));
    for handle in writers {
        handle.join().unwrap();
    }

    let seen = seen.lock().clone();
    let distinct: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 1000);
    assert_eq!(distinct.len(), 1000);
    assert_eq!(collection.len(), 1000);
}

#[test]
fn test_concurrent_deaths_empty_collection() {
    init_tracing();
    let collection = PerishableCollection::new();
    let controllers: Vec<_> = (0..400)
        .map(|i| {
            let controller = LifetimeController::new();
            collection.add(i, controller.lifetime());
            controller
        })
        .collect();
    assert_eq!(collection.len(), 400);

    let controllers = Arc::new(controllers);
    let handles: Vec<_> = (0..4)
        .map(|offset| {
            let controllers = controllers.clone();
            thread::spawn(move || {
                for controller in controllers.iter().skip(offset).step_by(4) {
                    controller.end_lifetime();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(collection.is_empty());
    assert!(collection.current_items().is_empty());
}

// ============================================================================
// Live count
// ============================================================================

#[test]
fn test_live_count_moves_by_one_under_concurrent_deaths() {
    init_tracing();
    let collection = PerishableCollection::<i32>::new();
    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = counts.clone();
    collection
        .current_and_future_items()
        .observe_non_perished_count(false)
        .subscribe_fn(move |count| sink.lock().push(count));

    let controllers: Vec<_> = (0..200)
        .map(|i| {
            let controller = LifetimeController::new();
            collection.add(i, controller.lifetime());
            controller
        })
        .collect();

    let controllers = Arc::new(controllers);
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|offset| {
            let controllers = controllers.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for controller in controllers.iter().skip(offset).step_by(4) {
                    controller.end_lifetime();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let counts = counts.lock().clone();
    assert_eq!(counts.len(), 401);
    assert_eq!(counts.first(), Some(&0));
    assert_eq!(counts.last(), Some(&0));
    assert_eq!(counts.iter().max(), Some(&200));
    for pair in counts.windows(2) {
        assert_eq!(pair[0].abs_diff(pair[1]), 1);
    }
}

#[test]
fn test_live_count_with_racing_arrivals_and_deaths() {
    init_tracing();
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    for _ in 0..10 {
        let collection = PerishableCollection::<usize>::new();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = counts.clone();
        collection
            .current_and_future_items()
            .observe_non_perished_count(false)
            .subscribe_fn(move |count| sink.lock().push(count));

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|writer| {
                let collection = collection.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        let controller = LifetimeController::new();
                        collection.add(writer * PER_THREAD + i, controller.lifetime());
                        controller.end_lifetime();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = counts.lock().clone();
        assert_eq!(counts.len(), 1 + 2 * THREADS * PER_THREAD);
        assert_eq!(counts.first(), Some(&0));
        assert_eq!(counts.last(), Some(&0));
        for pair in counts.windows(2) {
            assert_eq!(pair[0].abs_diff(pair[1]), 1);
        }
        assert!(collection.is_empty());
    }
}
