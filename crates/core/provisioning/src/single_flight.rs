//! Per-key single-flight coordination
//!
//! [`SingleFlight`] guarantees that for any key the initializer runs at most once at a time and
//! never again after it succeeded. The first caller for a key becomes the *leader* and runs the
//! initializer; callers arriving while it runs wait on the leader's outcome instead of running it
//! themselves; callers arriving after it succeeded return immediately.
//!
//! A failed initialization reverts the key to unknown, so the next caller starts from scratch.
//! Callers that were waiting on the failed attempt receive a [`PeerFailure`] rather than retrying
//! it themselves.
//!
//! An initializer may also report [`Init::Deferred`]: the work is owned by someone outside this
//! registry (another process). The key is then ready as far as this registry is concerned, and
//! the owner of the registry decides what to do if the work turns out not to be done.
//! [`SingleFlight::forget`] reverts such a key.
//!
//! Keys are fully independent: a stuck initializer only blocks callers of the same key.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Outcome published by a leader: `Err` carries the rendered initializer error.
type Outcome = Result<(), Arc<str>>;

/// What a successful initializer achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// The initialization is complete.
    Done,
    /// Somebody outside this registry owns the initialization and may still be running it.
    Deferred,
}

/// How a caller got past the initialization step of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// This caller ran the initializer, and it succeeded.
    Initialized,
    /// This caller ran the initializer, which deferred to an owner outside this registry.
    Deferred,
    /// Another caller was running the initializer; this caller waited for it to succeed.
    Joined,
    /// The key had already been initialized earlier; nothing ran and nothing was awaited.
    Known,
}

/// Failure of an initialization this caller was waiting on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerFailure {
    /// The leader's initializer returned an error.
    #[error("initialization by a concurrent caller failed: {0}")]
    Failed(Arc<str>),

    /// The leader was cancelled (its future dropped) before it finished.
    #[error("initialization by a concurrent caller was cancelled before it finished")]
    Abandoned,
}

/// Error returned by [`SingleFlight::run`].
#[derive(Debug)]
pub enum FlightError<E> {
    /// This caller was the leader and its initializer failed.
    Init(E),
    /// This caller waited on another caller's attempt, which did not succeed.
    Peer(PeerFailure),
}

enum Slot {
    InFlight(watch::Receiver<Option<Outcome>>),
    Ready,
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

/// Single-flight registry of initialized and in-flight keys.
///
/// Owned by one long-lived coordinator (a factory) and shared by every caller through it.
pub struct SingleFlight<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `init` for `key` unless it already succeeded or is running elsewhere.
    ///
    /// # Errors
    /// - [`FlightError::Init`] if this caller ran `init` and it failed. The key is unknown again.
    /// - [`FlightError::Peer`] if this caller waited on another caller whose attempt failed or
    ///   was cancelled.
    pub async fn run<F, Fut, E>(&self, key: K, init: F) -> Result<Flight, FlightError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Init, E>>,
        E: Display,
    {
        let role = match self.slots.lock().entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready => return Ok(Flight::Known),
                Slot::InFlight(rx) => Role::Waiter(rx.clone()),
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(Slot::InFlight(rx));
                Role::Leader(tx)
            }
        };

        let mut rx = match role {
            Role::Waiter(rx) => rx,
            Role::Leader(tx) => {
                let leader = Leader {
                    flights: self,
                    key: Some(key),
                    tx,
                };
                return match init().await {
                    Ok(init) => {
                        leader.finish(Ok(()));
                        Ok(match init {
                            Init::Done => Flight::Initialized,
                            Init::Deferred => Flight::Deferred,
                        })
                    }
                    Err(err) => {
                        leader.finish(Err(err.to_string().into()));
                        Err(FlightError::Init(err))
                    }
                };
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone());
        match outcome {
            Ok(Some(Ok(()))) => Ok(Flight::Joined),
            Ok(Some(Err(message))) => Err(FlightError::Peer(PeerFailure::Failed(message))),
            Ok(None) | Err(_) => Err(FlightError::Peer(PeerFailure::Abandoned)),
        }
    }

    /// Waits until no initialization is in flight for `key`.
    ///
    /// Returns immediately if the key is unknown or already initialized. The outcome of the
    /// awaited attempt is not reported.
    pub async fn settled(&self, key: &K) {
        let mut rx = match self.slots.lock().get(key) {
            Some(Slot::InFlight(rx)) => rx.clone(),
            _ => return,
        };
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// Reverts a ready `key` to unknown, so the next caller runs the initializer again.
    ///
    /// An initialization in flight is left alone.
    pub fn forget(&self, key: &K) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Ready)) {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn is_ready(&self, key: &K) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Ready))
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: &K) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::InFlight(_)))
    }
}

impl<K> Default for SingleFlight<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The caller that runs the initializer for a key.
///
/// Dropping it without [`finish`](Self::finish) (leader future cancelled) removes the in-flight
/// slot; waiters then observe the closed channel as [`PeerFailure::Abandoned`].
struct Leader<'a, K>
where
    K: Eq + Hash,
{
    flights: &'a SingleFlight<K>,
    key: Option<K>,
    tx: watch::Sender<Option<Outcome>>,
}

impl<K> Leader<'_, K>
where
    K: Eq + Hash,
{
    fn finish(mut self, outcome: Outcome) {
        let Some(key) = self.key.take() else {
            return;
        };

        {
            let mut slots = self.flights.slots.lock();
            if outcome.is_ok() {
                slots.insert(key, Slot::Ready);
            } else {
                slots.remove(&key);
            }
        }
        self.tx.send_replace(Some(outcome));
    }
}

impl<K> Drop for Leader<'_, K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.slots.lock().remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn first_caller_initializes_and_later_callers_skip() {
        //* Given
        let flights = SingleFlight::new();
        let runs = &AtomicUsize::new(0);
        let init = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Init::Done)
        };

        //* When
        let first = flights.run("k", init).await;
        let second = flights.run("k", init).await;

        //* Then
        assert!(matches!(first, Ok(Flight::Initialized)));
        assert!(matches!(second, Ok(Flight::Known)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flights.is_ready(&"k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_initialization() {
        //* Given
        let flights = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        //* When
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let flights = flights.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    flights
                        .run("schema", move || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(Init::Done)
                        })
                        .await
                })
            })
            .collect();

        let mut flights_seen = Vec::new();
        for task in tasks {
            match task.await.expect("task panicked") {
                Ok(flight) => flights_seen.push(flight),
                Err(_) => panic!("no caller should fail"),
            }
        }

        //* Then
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            flights_seen
                .iter()
                .filter(|f| **f == Flight::Initialized)
                .count(),
            1
        );
        assert_eq!(flights_seen.len(), 50);
    }

    #[tokio::test]
    async fn failure_reverts_the_key_so_the_next_caller_retries() {
        //* Given
        let flights = SingleFlight::new();

        //* When
        let failed = flights
            .run("k", || async { Err::<Init, _>("boom".to_string()) })
            .await;
        let retried = flights.run("k", || async { Ok::<_, String>(Init::Done) }).await;

        //* Then
        assert!(matches!(failed, Err(FlightError::Init(ref msg)) if msg == "boom"));
        assert!(matches!(retried, Ok(Flight::Initialized)));
    }

    #[tokio::test]
    async fn waiters_receive_the_leaders_failure_without_running_init() {
        //* Given
        let flights = Arc::new(SingleFlight::new());
        let release = Arc::new(Notify::new());
        let waiter_runs = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flights = flights.clone();
            let release = release.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        release.notified().await;
                        Err::<Init, _>("schema error".to_string())
                    })
                    .await
            })
        };
        while !flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let flights = flights.clone();
            let waiter_runs = waiter_runs.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        waiter_runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(Init::Done)
                    })
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        //* When
        release.notify_one();
        let leader = leader.await.expect("leader panicked");
        let waiter = waiter.await.expect("waiter panicked");

        //* Then
        assert!(matches!(leader, Err(FlightError::Init(_))));
        match waiter {
            Err(FlightError::Peer(PeerFailure::Failed(message))) => {
                assert_eq!(&*message, "schema error")
            }
            other => panic!("unexpected waiter result: {other:?}"),
        }
        assert_eq!(waiter_runs.load(Ordering::SeqCst), 0);
        assert!(!flights.is_ready(&"k"));
        assert!(!flights.is_in_flight(&"k"));
    }

    #[tokio::test]
    async fn cancelled_leader_releases_the_key() {
        //* Given
        let flights = Arc::new(SingleFlight::new());
        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || std::future::pending::<Result<Init, String>>())
                    .await
            })
        };
        while !flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move { flights.run("k", || async { Ok::<_, String>(Init::Done) }).await })
        };
        tokio::task::yield_now().await;

        //* When
        leader.abort();
        let _ = leader.await;
        let waiter = waiter.await.expect("waiter panicked");

        //* Then
        assert!(matches!(
            waiter,
            Err(FlightError::Peer(PeerFailure::Abandoned)) | Ok(Flight::Initialized)
        ));
        assert!(!flights.is_in_flight(&"k"));
        let next = flights.run("k", || async { Ok::<_, String>(Init::Done) }).await;
        assert!(matches!(next, Ok(Flight::Initialized | Flight::Known)));
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        //* Given
        let flights = Arc::new(SingleFlight::new());
        let stuck = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("stuck", || std::future::pending::<Result<Init, String>>())
                    .await
            })
        };
        while !flights.is_in_flight(&"stuck") {
            tokio::task::yield_now().await;
        }

        //* When
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            flights.run("other", || async { Ok::<_, String>(Init::Done) }),
        )
        .await;

        //* Then
        assert!(matches!(other, Ok(Ok(Flight::Initialized))));
        stuck.abort();
    }

    #[tokio::test]
    async fn settled_returns_for_unknown_and_ready_keys() {
        let flights = SingleFlight::new();
        flights.settled(&"unknown").await;

        flights
            .run("k", || async { Ok::<_, String>(Init::Done) })
            .await
            .map_err(|_| ())
            .expect("init succeeds");
        flights.settled(&"k").await;
    }

    #[tokio::test]
    async fn deferred_initialization_marks_the_key_ready() {
        //* Given
        let flights = SingleFlight::new();

        //* When
        let first = flights.run("k", || async { Ok::<_, String>(Init::Deferred) }).await;
        let second = flights.run("k", || async { Ok::<_, String>(Init::Done) }).await;

        //* Then
        assert!(matches!(first, Ok(Flight::Deferred)));
        assert!(matches!(second, Ok(Flight::Known)));
    }

    #[tokio::test]
    async fn forget_reverts_a_ready_key() {
        //* Given
        let flights = SingleFlight::new();
        let _ = flights.run("k", || async { Ok::<_, String>(Init::Done) }).await;

        //* When
        flights.forget(&"k");
        let next = flights.run("k", || async { Ok::<_, String>(Init::Done) }).await;

        //* Then
        assert!(matches!(next, Ok(Flight::Initialized)));
    }

    #[tokio::test]
    async fn forget_leaves_an_initialization_in_flight_alone() {
        //* Given
        let flights = Arc::new(SingleFlight::new());
        let stuck = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || std::future::pending::<Result<Init, String>>())
                    .await
            })
        };
        while !flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }

        //* When
        flights.forget(&"k");

        //* Then
        assert!(flights.is_in_flight(&"k"));
        stuck.abort();
    }
}
