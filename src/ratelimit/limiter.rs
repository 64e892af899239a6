//! Configured limiters.
//!
//! A [`Limiter`] binds one algorithm and its parameters to a shared store
//! and clock. It holds no per-caller state: everything lives in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::algorithm::{Algorithm, LimiterError};
use super::decision::Decision;
use super::key::CallerKey;
use super::{fixed_window, leaky_bucket, sliding_counter, sliding_log, token_bucket};
use crate::clock::Clock;
use crate::config::PolicyConfig;
use crate::store::{Store, StoreError, StoreResult};

/// A rate limit policy ready to answer admission checks.
///
/// Cheap to share behind an `Arc`; concurrent checks only contend inside
/// the store, per key.
pub struct Limiter {
    /// Policy name, also used to namespace store keys
    name: String,
    algorithm: Algorithm,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    /// Upper bound on a whole check, store round trips included
    deadline: Option<Duration>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Limiter {
    /// Create a limiter, rejecting invalid parameters up front.
    pub fn new(
        name: impl Into<String>,
        algorithm: Algorithm,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LimiterError> {
        algorithm.validate()?;
        let name = name.into();

        debug!(
            name = %name,
            algorithm = algorithm.tag().name(),
            limit = algorithm.limit(),
            "Creating limiter"
        );

        Ok(Self {
            name,
            algorithm,
            store,
            clock,
            deadline: None,
        })
    }

    /// Bound every check by `deadline`. An expired deadline surfaces as
    /// [`StoreError::Timeout`].
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// Decide whether a request from `identity` may proceed.
    ///
    /// Reaching the limit is a normal [`Decision`]; only store failures are
    /// errors, and the caller decides whether those fail open or closed.
    pub async fn check(&self, identity: &str) -> StoreResult<Decision> {
        let result = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.decide(identity)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(deadline)),
            },
            None => self.decide(identity).await,
        };

        match &result {
            Ok(decision) if !decision.is_admitted() => {
                debug!(
                    policy = %self.name,
                    identity = %identity,
                    limit = ?decision.limit,
                    remaining = ?decision.remaining,
                    "Rate limit exceeded"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(policy = %self.name, identity = %identity, error = %e, "Rate limit decision failed");
            }
        }
        result
    }

    async fn decide(&self, identity: &str) -> StoreResult<Decision> {
        let now = self.clock.now_nanos();
        let key = CallerKey::new(self.algorithm.tag(), identity).in_namespace(&self.name);
        let store = self.store.as_ref();

        trace!(key = %key, now, "Checking rate limit");

        match self.algorithm {
            Algorithm::FixedWindow { limit, window } => {
                fixed_window::check(store, &key, limit, window, now).await
            }
            Algorithm::TokenBucket { rate, burst } => {
                token_bucket::check(store, &key, rate, burst, now).await
            }
            Algorithm::SlidingWindowLog { limit, window } => {
                sliding_log::check(store, &key, limit, window, now).await
            }
            Algorithm::SlidingWindowCounter { limit, window } => {
                sliding_counter::check(store, &key, limit, window, now).await
            }
            Algorithm::LeakyBucket { rate, burst } => {
                leaky_bucket::check(store, &key, rate, burst, now).await
            }
        }
    }
}

/// Named limiters over one shared store.
///
/// Policies can be replaced at runtime; checks already holding a limiter
/// finish against the old policy.
pub struct LimiterRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    deadline: Option<Duration>,
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            deadline: None,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Apply `deadline` to limiters built from now on.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Create a registry holding `policies`.
    pub fn from_policies(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        deadline: Option<Duration>,
        policies: &[PolicyConfig],
    ) -> Result<Self, LimiterError> {
        let registry = Self::new(store, clock).with_deadline(deadline);
        registry.reload(policies)?;
        Ok(registry)
    }

    /// Replace every policy. Nothing changes unless all of them are valid.
    pub fn reload(&self, policies: &[PolicyConfig]) -> Result<(), LimiterError> {
        let mut limiters = HashMap::with_capacity(policies.len());

        for policy in policies {
            let mut limiter = Limiter::new(
                policy.name.clone(),
                policy.algorithm.clone().into(),
                self.store.clone(),
                self.clock.clone(),
            )?;
            if let Some(deadline) = self.deadline {
                limiter = limiter.with_deadline(deadline);
            }
            if limiters.insert(policy.name.clone(), Arc::new(limiter)).is_some() {
                return Err(LimiterError::DuplicatePolicy(policy.name.clone()));
            }
        }

        info!(policies = limiters.len(), "Loaded rate limit policies");
        *self.limiters.write() = limiters;
        Ok(())
    }

    /// Look up a limiter by policy name.
    pub fn get(&self, name: &str) -> Option<Arc<Limiter>> {
        self.limiters.read().get(name).cloned()
    }

    /// Names of all registered policies, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }
}
