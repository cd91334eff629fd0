//! Self-healing computation nodes.
//!
//! A [`Neuron`] is one externally sourced fact (a keystore, a discovery
//! document, a consent record, ...) together with the recipe to produce it:
//!
//! - a set of [`Dependencies`] resolved before evaluation,
//! - an async evaluator turning the resolved inputs into the value,
//! - an optional validator deciding whether a cached value can be reused,
//! - a cache slot that is empty, holds a value, or holds the in-flight evaluation.
//!
//! Resolution order for one attempt:
//!
//! 1. A cached value that passes the validator (or any cached value when the
//!    node has no validator) is returned without touching dependencies.
//! 2. A caller arriving while an evaluation is in flight joins it.
//! 3. Otherwise dependencies are resolved concurrently, the evaluator runs
//!    under the resolver's attempt timeout, and the result replaces the slot.
//!
//! Nodes whose evaluator performs a non-idempotent call opt out of the attempt
//! timeout with [`Neuron::without_attempt_timeout`]. Their network calls must
//! carry their own deadline, since cancelling them mid-way would make the
//! retry repeat a call the remote side already accepted.
//!
//! [`Resolver::resolve`] wraps attempts in the retry policy, so transient
//! failures heal by re-running the whole cycle.

mod dependencies;
mod resolver;

pub use dependencies::Dependencies;
pub use resolver::Resolver;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::failsafe::with_retry;
use crate::{Error, Result};

type Evaluator<I, O> = Box<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;
type Validator<O> = Box<dyn Fn(&O) -> bool + Send + Sync>;
type Flight<O> = Shared<BoxFuture<'static, std::result::Result<O, Arc<Error>>>>;

enum Slot<O> {
    Empty,
    Ready(O),
    InFlight { id: u64, flight: Flight<O> },
}

enum Lookup<O> {
    Fresh(O),
    Join(Flight<O>),
}

/// A cacheable, validatable, asynchronously produced value.
pub struct Neuron<I, O> {
    name: String,
    dependencies: Box<dyn Dependencies<Output = I>>,
    evaluator: Evaluator<I, O>,
    validator: Option<Validator<O>>,
    cacheable: bool,
    bounded: bool,
    slot: Mutex<Slot<O>>,
    evaluations: AtomicU64,
    flights: AtomicU64,
}

impl<I, O> Neuron<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Create a node from its dependencies and evaluator
    pub fn new<D, F, Fut>(name: impl Into<String>, dependencies: D, evaluator: F) -> Self
    where
        D: Dependencies<Output = I>,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Box::new(dependencies),
            evaluator: Box::new(move |input| evaluator(input).boxed()),
            validator: None,
            cacheable: true,
            bounded: true,
            slot: Mutex::new(Slot::Empty),
            evaluations: AtomicU64::new(0),
            flights: AtomicU64::new(0),
        }
    }

    /// Reuse a cached value only while `validator` accepts it
    #[must_use]
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Never store the value; concurrent callers still share one evaluation
    #[must_use]
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Run the evaluator without the resolver's attempt timeout
    #[must_use]
    pub fn without_attempt_timeout(mut self) -> Self {
        self.bounded = false;
        self
    }

    /// Node name, used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether results are kept in the cache slot
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Number of evaluator invocations so far
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// The cached value, regardless of validity
    pub fn peek(&self) -> Option<O> {
        match &*self.slot.lock() {
            Slot::Ready(value) => Some(value.clone()),
            Slot::Empty | Slot::InFlight { .. } => None,
        }
    }

    /// Drop the cached value so the next resolution recomputes it.
    ///
    /// An evaluation already in flight is left to finish.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Ready(_)) {
            debug!(node = %self.name, "Invalidated");
            *slot = Slot::Empty;
        }
    }

    /// One resolve-and-evaluate attempt
    ///
    /// # Errors
    ///
    /// Returns the evaluation or dependency error of this attempt.
    pub async fn get(self: &Arc<Self>, resolver: &Resolver) -> Result<O> {
        match self.lookup(resolver) {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Join(flight) => flight.await.map_err(Error::Shared),
        }
    }

    /// Resolve with healing: retry failed attempts under the resolver's policy
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-retryable error.
    pub async fn get_with_healing(self: &Arc<Self>, resolver: &Resolver) -> Result<O> {
        with_retry(resolver.policy(), &self.name, || self.get(resolver)).await
    }

    fn is_fresh(&self, value: &O) -> bool {
        self.validator.as_ref().is_none_or(|valid| valid(value))
    }

    fn lookup(self: &Arc<Self>, resolver: &Resolver) -> Lookup<O> {
        let mut slot = self.slot.lock();

        let joined = match &*slot {
            Slot::Ready(value) if self.is_fresh(value) => {
                debug!(node = %self.name, "Cache hit");
                return Lookup::Fresh(value.clone());
            }
            Slot::InFlight { flight, .. } => Some(flight.clone()),
            Slot::Ready(_) => {
                debug!(node = %self.name, "Cached value failed validation");
                None
            }
            Slot::Empty => None,
        };

        if let Some(flight) = joined {
            debug!(node = %self.name, "Joining in-flight evaluation");
            return Lookup::Join(flight);
        }

        let id = self.flights.fetch_add(1, Ordering::Relaxed);
        let flight = Arc::clone(self).evaluate(resolver.clone(), id).boxed().shared();
        *slot = Slot::InFlight {
            id,
            flight: flight.clone(),
        };
        Lookup::Join(flight)
    }

    async fn evaluate(
        self: Arc<Self>,
        resolver: Resolver,
        id: u64,
    ) -> std::result::Result<O, Arc<Error>> {
        let outcome = self.run(&resolver).await;
        self.settle(id, &outcome);
        outcome.map_err(Arc::new)
    }

    async fn run(&self, resolver: &Resolver) -> Result<O> {
        let input = self.dependencies.resolve(resolver).await?;

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        debug!(node = %self.name, "Evaluating");

        if !self.bounded {
            return (self.evaluator)(input).await;
        }

        let timeout = resolver.attempt_timeout();
        tokio::time::timeout(timeout, (self.evaluator)(input))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{} did not complete within {}ms",
                    self.name,
                    timeout.as_millis()
                ))
            })?
    }

    fn settle(&self, id: u64, outcome: &Result<O>) {
        let mut slot = self.slot.lock();
        // A newer flight or an invalidation owns the slot now
        if !matches!(&*slot, Slot::InFlight { id: current, .. } if *current == id) {
            return;
        }
        *slot = match outcome {
            Ok(value) if self.cacheable => Slot::Ready(value.clone()),
            _ => Slot::Empty,
        };
    }
}

impl<O> Neuron<(), O>
where
    O: Clone + Send + Sync + 'static,
{
    /// A node that always produces `value`
    pub fn constant(name: impl Into<String>, value: O) -> Self {
        Self::new(name, (), move |()| futures::future::ok(value.clone()))
    }
}

impl<I, O> std::fmt::Debug for Neuron<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neuron")
            .field("name", &self.name)
            .field("cacheable", &self.cacheable)
            .field("bounded", &self.bounded)
            .field("validated", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;
    use crate::ErrorKind;
    use crate::failsafe::RetryPolicy;

    fn resolver(max_attempts: u32) -> Resolver {
        Resolver::new(
            RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: false,
            },
            Duration::from_secs(5),
        )
    }

    fn counting(name: &str, calls: &Arc<AtomicU32>) -> Neuron<(), u32> {
        let calls = Arc::clone(calls);
        Neuron::new(name, (), move |()| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
        })
    }

    // =========================================================================
    // Cache and validator
    // =========================================================================

    #[tokio::test]
    async fn valid_cached_value_skips_evaluator() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = Arc::new(counting("n", &calls).with_validator(|_| true));
        let r = resolver(3);

        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.evaluations(), 1);
    }

    #[tokio::test]
    async fn invalid_cached_value_is_recomputed() {
        let calls = Arc::new(AtomicU32::new(0));
        // Only even values are acceptable
        let node = Arc::new(counting("n", &calls).with_validator(|v| v % 2 == 0));
        let r = resolver(3);

        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(r.resolve(&node).await.unwrap(), 2);
        assert_eq!(r.resolve(&node).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unvalidated_node_is_fresh_until_invalidated() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = Arc::new(counting("n", &calls));
        let r = resolver(3);

        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(node.peek(), Some(1));

        node.invalidate();
        assert_eq!(node.peek(), None);
        assert_eq!(r.resolve(&node).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn uncached_node_evaluates_every_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = Arc::new(counting("n", &calls).uncached());
        let r = resolver(3);

        assert_eq!(r.resolve(&node).await.unwrap(), 1);
        assert_eq!(r.resolve(&node).await.unwrap(), 2);
        assert_eq!(node.peek(), None);
        assert!(!node.is_cacheable());
    }

    #[tokio::test]
    async fn constant_node_returns_value() {
        let node = Arc::new(Neuron::constant("c", "fixed".to_string()));
        assert_eq!(resolver(1).resolve(&node).await.unwrap(), "fixed");
    }

    // =========================================================================
    // Single-flight
    // =========================================================================

    #[tokio::test]
    async fn concurrent_resolves_share_one_evaluation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let node = Arc::new(Neuron::new("slow", (), move |()| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(counter.fetch_add(1, Ordering::SeqCst) + 100)
            }
        }));
        let r = resolver(3);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = Arc::clone(&node);
                let r = r.clone();
                tokio::spawn(async move { r.resolve(&node).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 100);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncached_node_still_coalesces_in_flight_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let node = Arc::new(
            Neuron::new("code-exchange", (), move |()| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(counter.fetch_add(1, Ordering::SeqCst))
                }
            })
            .uncached(),
        );
        let r = resolver(1);

        let (a, b) = tokio::join!(r.resolve(&node), r.resolve(&node));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coalesced_callers_observe_the_same_failure() {
        let node: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("broken", (), |()| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::Protocol("bad document".into()))
        }));
        let r = resolver(1);

        let (a, b) = tokio::join!(r.resolve(&node), r.resolve(&node));
        assert_eq!(a.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(b.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(node.evaluations(), 1);
    }

    // =========================================================================
    // Healing
    // =========================================================================

    #[tokio::test]
    async fn transient_failures_heal_within_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let node = Arc::new(Neuron::new("flaky", (), move |()| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::Transient(format!("attempt {n}")))
                } else {
                    Ok(n)
                }
            }
        }));

        assert_eq!(resolver(3).resolve(&node).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(node.peek(), Some(3));
    }

    #[tokio::test]
    async fn failures_surface_after_attempts_exhausted() {
        let node: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("down", (), |()| async {
            Err(Error::Transient("503".into()))
        }));

        let err = resolver(3).resolve(&node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(node.evaluations(), 3);
        assert_eq!(node.peek(), None);
    }

    #[tokio::test]
    async fn protocol_failure_is_not_retried() {
        let node: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("bad", (), |()| async {
            Err(Error::Protocol("no id_token".into()))
        }));

        let err = resolver(5).resolve(&node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(node.evaluations(), 1);
    }

    #[tokio::test]
    async fn slow_evaluation_times_out_and_is_retried() {
        let node: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("stuck", (), |()| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }));
        let r = Resolver::new(
            RetryPolicy {
                max_attempts: 2,
                ..resolver(2).policy().clone()
            },
            Duration::from_millis(20),
        );

        let err = r.resolve(&node).await.unwrap_err();
        assert!(matches!(err, Error::Shared(ref inner) if matches!(**inner, Error::Timeout(_))));
        assert_eq!(node.evaluations(), 2);
    }

    #[tokio::test]
    async fn unbounded_evaluation_outlives_attempt_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let node: Arc<Neuron<(), u32>> = Arc::new(
            Neuron::new("submit", (), move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(7)
                }
            })
            .uncached()
            .without_attempt_timeout(),
        );
        let r = Resolver::new(resolver(3).policy().clone(), Duration::from_millis(20));

        assert_eq!(r.resolve(&node).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.evaluations(), 1);
    }

    #[tokio::test]
    async fn resolve_once_does_not_heal() {
        let node: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("down", (), |()| async {
            Err(Error::Transient("503".into()))
        }));
        assert!(resolver(3).resolve_once(&node).await.is_err());
        assert_eq!(node.evaluations(), 1);
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    #[tokio::test]
    async fn evaluator_receives_resolved_dependency_tuple() {
        let a = Arc::new(Neuron::constant("a", 2u32));
        let b = Arc::new(Neuron::constant("b", "x".to_string()));
        let node = Arc::new(Neuron::new("sum", (a, b), |(n, s): (u32, String)| async move {
            Ok(s.repeat(n as usize))
        }));

        assert_eq!(resolver(1).resolve(&node).await.unwrap(), "xx");
    }

    #[tokio::test]
    async fn independent_dependencies_resolve_concurrently() {
        // Both dependencies wait on the same two-party barrier: sequential
        // resolution would never get past it.
        let barrier = Arc::new(Barrier::new(2));
        let dep = |name: &str, value: u32| {
            let barrier = Arc::clone(&barrier);
            Arc::new(Neuron::new(name, (), move |()| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(value)
                }
            }))
        };
        let node = Arc::new(Neuron::new(
            "parent",
            (dep("left", 1), dep("right", 2)),
            |(l, r): (u32, u32)| async move { Ok(l + r) },
        ));

        let result = tokio::time::timeout(Duration::from_secs(2), resolver(1).resolve(&node))
            .await
            .expect("dependencies resolved sequentially");
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn valid_parent_does_not_touch_dependencies() {
        let calls = Arc::new(AtomicU32::new(0));
        let dep = Arc::new(counting("dep", &calls).uncached());
        let node = Arc::new(
            Neuron::new("parent", (Arc::clone(&dep),), |(v,): (u32,)| async move { Ok(v) })
                .with_validator(|_| true),
        );
        let r = resolver(1);

        r.resolve(&node).await.unwrap();
        r.resolve(&node).await.unwrap();
        assert_eq!(dep.evaluations(), 1);
    }

    #[tokio::test]
    async fn failed_dependency_is_not_retried_by_parent() {
        let dep: Arc<Neuron<(), u32>> = Arc::new(Neuron::new("dep", (), |()| async {
            Err(Error::Transient("503".into()))
        }));
        let node = Arc::new(Neuron::new("parent", Arc::clone(&dep), |v: u32| async move {
            Ok(v)
        }));

        let err = resolver(3).resolve(&node).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("dep"));
        assert_eq!(dep.evaluations(), 3);
        assert_eq!(node.evaluations(), 0);
    }
}
