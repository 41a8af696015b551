//! The processor: fans one operation out over the live rule set.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::algorithm::{self, CheckContext, Outcome};
use super::decision::{CheckResult, Decision};
use super::hooks::Interceptor;
use super::rule::{Rule, RuleSet};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Default bound on compare-and-swap retries for bucket updates.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 64;

/// What to do when the counter store fails during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return the storage error to the caller.
    #[default]
    Propagate,
    /// Admit the operation under this rule and carry on.
    FailOpen,
    /// Limit the operation.
    FailClosed,
}

/// How many matching rules a check evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Stop at the first rule that limits the operation.
    #[default]
    FirstLimited,
    /// Evaluate every matching rule and report all decisions. Rules after a
    /// limiting one still consume their own quota.
    AllMatching,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    pub failure_policy: FailurePolicy,
    pub evaluation: EvaluationMode,
    /// Deadline applied to every check; `None` waits on the store
    /// indefinitely.
    pub check_timeout: Option<Duration>,
    pub max_cas_retries: u32,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            evaluation: EvaluationMode::default(),
            check_timeout: None,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

/// Checks operations of type `T` against an ordered, hot-swappable rule set.
///
/// Checks never take a lock over the engine: each one loads the current
/// rule-set snapshot once and relies on the store's per-key atomicity.
pub struct Processor<T> {
    rules: ArcSwap<RuleSet<T>>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    options: ProcessorOptions,
    interceptors: Vec<Arc<dyn Interceptor<T>>>,
}

impl<T> std::fmt::Debug for Processor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("rules", &self.rules.load().len())
            .field("generation", &self.rules.load().generation())
            .field("store", &self.store)
            .field("options", &self.options)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Processor<T> {
    pub fn builder(store: Arc<dyn CounterStore>) -> ProcessorBuilder<T> {
        ProcessorBuilder {
            store,
            clock: Arc::new(SystemClock),
            rules: Vec::new(),
            options: ProcessorOptions::default(),
            interceptors: Vec::new(),
        }
    }

    /// Check an operation against every applicable rule.
    pub async fn check(&self, operation: &T) -> Result<CheckResult> {
        let deadline = self.options.check_timeout.map(|t| Instant::now() + t);
        self.run(operation, deadline).await
    }

    /// Like [`check`](Self::check), but store calls that do not finish
    /// within `timeout` fail with [`TollgateError::StorageUnavailable`].
    pub async fn check_with_deadline(&self, operation: &T, timeout: Duration) -> Result<CheckResult> {
        self.run(operation, Some(Instant::now() + timeout)).await
    }

    /// Validate `rules` and publish them as the next generation.
    ///
    /// Checks already running finish against the set they started with. A
    /// rejected set leaves the current generation in place, and concurrent
    /// updates publish strictly increasing generations.
    pub fn update_rules(&self, rules: Vec<Rule<T>>) -> Result<()> {
        let staged = RuleSet::new(0, rules)?;
        let previous = self
            .rules
            .rcu(|current| staged.renumbered(current.generation() + 1));

        info!(
            generation = previous.generation() + 1,
            rules = staged.len(),
            "Published rule set"
        );
        Ok(())
    }

    /// The current rule-set snapshot.
    pub fn rules(&self) -> Arc<RuleSet<T>> {
        self.rules.load_full()
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    async fn run(&self, operation: &T, deadline: Option<Instant>) -> Result<CheckResult> {
        let rules = self.rules.load_full();
        let mut result = CheckResult::admitted(rules.generation());

        for rule in rules.rules() {
            let target = match self.select(rule, operation) {
                Ok(Some(target)) => target,
                Ok(None) => continue,
                Err(err) => {
                    warn!(rule_id = rule.id(), error = %err, "Skipping rule that failed to evaluate");
                    self.notify_error(operation, &err);
                    continue;
                }
            };

            let decision = match self.evaluate(rule, &target, deadline).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(rule_id = rule.id(), target = %target, error = %err, "Counter store failed");
                    self.notify_error(operation, &err);
                    match self.options.failure_policy {
                        FailurePolicy::Propagate => return Err(err),
                        FailurePolicy::FailOpen => self.degraded(rule, target, false),
                        FailurePolicy::FailClosed => self.degraded(rule, target, true),
                    }
                }
            };

            let limited = decision.is_limited;
            if limited {
                debug!(
                    rule_id = %decision.rule_id,
                    target = %decision.target,
                    reset_after_ms = decision.reset_after.as_millis() as u64,
                    "Rate limit triggered"
                );
                for interceptor in &self.interceptors {
                    interceptor.on_triggered(operation, &decision);
                }
            }

            result.is_limited |= limited;
            result.decisions.push(decision);

            if limited && self.options.evaluation == EvaluationMode::FirstLimited {
                break;
            }
        }

        Ok(result)
    }

    /// The target a rule limits for this operation, or `None` if the rule
    /// does not apply.
    fn select(&self, rule: &Rule<T>, operation: &T) -> Result<Option<String>> {
        if !rule.matches(operation)? {
            return Ok(None);
        }
        rule.extract_target(operation)
    }

    async fn evaluate(&self, rule: &Rule<T>, target: &str, deadline: Option<Instant>) -> Result<Decision> {
        let now = self.clock.now_millis();
        let key = format!("{}:{}", rule.id(), target);
        let algorithm = rule.algorithm();

        trace!(key = %key, algorithm = algorithm.name(), "Checking rule");

        let ctx = CheckContext {
            store: self.store.as_ref(),
            key: &key,
            now,
            cost: algorithm.cost(),
            alignment: rule.start_alignment(),
            max_cas_retries: self.options.max_cas_retries,
        };

        let outcome: Outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, algorithm::evaluate(algorithm, &ctx))
                .await
                .map_err(|_| {
                    TollgateError::StorageUnavailable(format!("deadline exceeded checking '{}'", key))
                })??,
            None => algorithm::evaluate(algorithm, &ctx).await?,
        };

        Ok(Decision {
            rule_id: rule.id().to_string(),
            target: target.to_string(),
            algorithm: algorithm.name(),
            is_limited: outcome.is_limited,
            limit: algorithm.limit(),
            remaining: outcome.remaining,
            reset_after: outcome.reset_after,
            checked_at: now,
            degraded: false,
        })
    }

    fn degraded(&self, rule: &Rule<T>, target: String, is_limited: bool) -> Decision {
        let algorithm = rule.algorithm();
        Decision {
            rule_id: rule.id().to_string(),
            target,
            algorithm: algorithm.name(),
            is_limited,
            limit: algorithm.limit(),
            remaining: if is_limited { 0 } else { algorithm.limit() },
            reset_after: Duration::ZERO,
            checked_at: self.clock.now_millis(),
            degraded: true,
        }
    }

    fn notify_error(&self, operation: &T, error: &TollgateError) {
        for interceptor in &self.interceptors {
            interceptor.on_error(operation, error);
        }
    }
}

/// Builder for [`Processor`].
pub struct ProcessorBuilder<T> {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    rules: Vec<Rule<T>>,
    options: ProcessorOptions,
    interceptors: Vec<Arc<dyn Interceptor<T>>>,
}

impl<T: Send + Sync + 'static> ProcessorBuilder<T> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rule(mut self, rule: Rule<T>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule<T>>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.options.failure_policy = policy;
        self
    }

    pub fn evaluation(mut self, mode: EvaluationMode) -> Self {
        self.options.evaluation = mode;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor<T>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<Processor<T>> {
        if self.options.max_cas_retries == 0 {
            return Err(TollgateError::Configuration(
                "max_cas_retries must be greater than 0".to_string(),
            ));
        }

        let set = RuleSet::new(1, self.rules)?;
        info!(rules = set.len(), store = ?self.store, "Processor initialized");

        Ok(Processor {
            rules: ArcSwap::from_pointee(set),
            store: self.store,
            clock: self.clock,
            options: self.options,
            interceptors: self.interceptors,
        })
    }
}
