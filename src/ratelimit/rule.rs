//! Rule model: what a limit is and which operations it governs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Where window and period boundaries start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAlignment {
    /// Windows float from the first operation a counter sees.
    #[default]
    FromCurrentTime,
    /// Windows snap to multiples of their length since the UTC epoch, which
    /// puts boundaries at the top of the second, minute or hour and at UTC
    /// midnight.
    FromNaturalPeriodBegin,
}

/// Allow `limit_number` operations per `stat_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    pub limit_number: u64,
    pub stat_window: Duration,
}

impl FixedWindow {
    pub fn new(limit_number: u64, stat_window: Duration) -> Self {
        Self {
            limit_number,
            stat_window,
        }
    }
}

/// A bucket of `capacity` tokens refilled by `refill_rate` every
/// `refill_period`; each admitted operation takes `inflow_unit` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    pub capacity: u64,
    pub refill_rate: u64,
    pub refill_period: Duration,
    pub inflow_unit: u64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: u64, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_period,
            inflow_unit: 1,
        }
    }

    pub fn with_inflow_unit(mut self, inflow_unit: u64) -> Self {
        self.inflow_unit = inflow_unit;
        self
    }
}

/// A queue of depth `capacity` drained by `outflow_rate` every
/// `outflow_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucket {
    pub capacity: u64,
    pub outflow_rate: u64,
    pub outflow_period: Duration,
}

impl LeakyBucket {
    pub fn new(capacity: u64, outflow_rate: u64, outflow_period: Duration) -> Self {
        Self {
            capacity,
            outflow_rate,
            outflow_period,
        }
    }
}

/// The limiting strategy of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAlgorithm {
    FixedWindow(FixedWindow),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
}

impl LimitAlgorithm {
    /// Short name used in logs and decisions.
    pub fn name(&self) -> &'static str {
        match self {
            LimitAlgorithm::FixedWindow(_) => "fixed_window",
            LimitAlgorithm::TokenBucket(_) => "token_bucket",
            LimitAlgorithm::LeakyBucket(_) => "leaky_bucket",
        }
    }

    /// Units one admitted operation consumes.
    pub fn cost(&self) -> u64 {
        match self {
            LimitAlgorithm::TokenBucket(bucket) => bucket.inflow_unit,
            LimitAlgorithm::FixedWindow(_) | LimitAlgorithm::LeakyBucket(_) => 1,
        }
    }

    /// The advertised limit: window quota or bucket capacity.
    pub fn limit(&self) -> u64 {
        match self {
            LimitAlgorithm::FixedWindow(window) => window.limit_number,
            LimitAlgorithm::TokenBucket(bucket) => bucket.capacity,
            LimitAlgorithm::LeakyBucket(bucket) => bucket.capacity,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        fn positive(name: &str, value: u64) -> std::result::Result<(), String> {
            if value == 0 {
                return Err(format!("{} must be greater than 0", name));
            }
            Ok(())
        }

        fn period(name: &str, value: Duration) -> std::result::Result<(), String> {
            if value.as_millis() == 0 {
                return Err(format!("{} must be at least 1ms", name));
            }
            Ok(())
        }

        match self {
            LimitAlgorithm::FixedWindow(window) => {
                positive("limit_number", window.limit_number)?;
                period("stat_window", window.stat_window)
            }
            LimitAlgorithm::TokenBucket(bucket) => {
                positive("capacity", bucket.capacity)?;
                positive("refill_rate", bucket.refill_rate)?;
                positive("inflow_unit", bucket.inflow_unit)?;
                period("refill_period", bucket.refill_period)?;
                if bucket.inflow_unit > bucket.capacity {
                    return Err(format!(
                        "inflow_unit {} exceeds capacity {}",
                        bucket.inflow_unit, bucket.capacity
                    ));
                }
                Ok(())
            }
            LimitAlgorithm::LeakyBucket(bucket) => {
                positive("capacity", bucket.capacity)?;
                positive("outflow_rate", bucket.outflow_rate)?;
                period("outflow_period", bucket.outflow_period)
            }
        }
    }
}

impl From<FixedWindow> for LimitAlgorithm {
    fn from(window: FixedWindow) -> Self {
        LimitAlgorithm::FixedWindow(window)
    }
}

impl From<TokenBucket> for LimitAlgorithm {
    fn from(bucket: TokenBucket) -> Self {
        LimitAlgorithm::TokenBucket(bucket)
    }
}

impl From<LeakyBucket> for LimitAlgorithm {
    fn from(bucket: LeakyBucket) -> Self {
        LimitAlgorithm::LeakyBucket(bucket)
    }
}

/// Decides whether a rule takes part in checking an operation.
pub trait Matcher<T>: Send + Sync {
    fn matches(&self, operation: &T) -> anyhow::Result<bool>;
}

impl<T, F> Matcher<T> for F
where
    F: Fn(&T) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, operation: &T) -> anyhow::Result<bool> {
        self(operation)
    }
}

/// Computes the partition key a rule counts under, e.g. a client address.
///
/// `None` or an empty string means the operation has no target for this rule.
pub trait Extractor<T>: Send + Sync {
    fn extract(&self, operation: &T) -> anyhow::Result<Option<String>>;
}

impl<T, F> Extractor<T> for F
where
    F: Fn(&T) -> anyhow::Result<Option<String>> + Send + Sync,
{
    fn extract(&self, operation: &T) -> anyhow::Result<Option<String>> {
        self(operation)
    }
}

/// One limiting policy over operations of type `T`.
pub struct Rule<T> {
    id: String,
    name: String,
    algorithm: LimitAlgorithm,
    start_alignment: StartAlignment,
    matcher: Arc<dyn Matcher<T>>,
    extractor: Arc<dyn Extractor<T>>,
}

impl<T> Rule<T> {
    pub fn builder(id: impl Into<String>, algorithm: impl Into<LimitAlgorithm>) -> RuleBuilder<T> {
        RuleBuilder {
            id: id.into(),
            name: None,
            algorithm: algorithm.into(),
            start_alignment: StartAlignment::default(),
            matcher: None,
            extractor: None,
        }
    }

    /// Stable identity, also the namespace of the rule's counters.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> &LimitAlgorithm {
        &self.algorithm
    }

    pub fn start_alignment(&self) -> StartAlignment {
        self.start_alignment
    }

    pub fn matches(&self, operation: &T) -> Result<bool> {
        self.matcher
            .matches(operation)
            .map_err(|source| self.evaluation_error(source))
    }

    /// The non-empty target for an operation, if it has one.
    pub fn extract_target(&self, operation: &T) -> Result<Option<String>> {
        let target = self
            .extractor
            .extract(operation)
            .map_err(|source| self.evaluation_error(source))?;
        Ok(target.filter(|t| !t.is_empty()))
    }

    fn evaluation_error(&self, source: anyhow::Error) -> TollgateError {
        TollgateError::RuleEvaluation {
            rule_id: self.id.clone(),
            source,
        }
    }
}

impl<T> Clone for Rule<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            algorithm: self.algorithm,
            start_alignment: self.start_alignment,
            matcher: self.matcher.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<T> fmt::Debug for Rule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("start_alignment", &self.start_alignment)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Rule`].
pub struct RuleBuilder<T> {
    id: String,
    name: Option<String>,
    algorithm: LimitAlgorithm,
    start_alignment: StartAlignment,
    matcher: Option<Arc<dyn Matcher<T>>>,
    extractor: Option<Arc<dyn Extractor<T>>>,
}

impl<T: 'static> RuleBuilder<T> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn start_alignment(mut self, alignment: StartAlignment) -> Self {
        self.start_alignment = alignment;
        self
    }

    /// Only apply the rule to operations for which `predicate` holds.
    /// Rules without a predicate apply to every operation.
    pub fn matching<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.try_matching(move |operation: &T| Ok(predicate(operation)))
    }

    pub fn try_matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.matcher = Some(Arc::new(predicate));
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn Matcher<T>>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Partition operations by the key `extract` returns.
    pub fn target<F>(self, extract: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.try_target(move |operation: &T| Ok(extract(operation)))
    }

    pub fn try_target<F>(mut self, extract: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        self.extractor = Some(Arc::new(extract));
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor<T>>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn build(self) -> Result<Rule<T>> {
        let invalid = |reason: String| {
            TollgateError::Configuration(format!("rule '{}': {}", self.id, reason))
        };

        if self.id.trim().is_empty() {
            return Err(TollgateError::Configuration("rule id must not be empty".to_string()));
        }
        self.algorithm.validate().map_err(invalid)?;
        let extractor = self
            .extractor
            .clone()
            .ok_or_else(|| invalid("no target extractor configured".to_string()))?;

        let matcher: Arc<dyn Matcher<T>> = match self.matcher {
            Some(matcher) => matcher,
            None => Arc::new(|_: &T| -> anyhow::Result<bool> { Ok(true) }),
        };

        Ok(Rule {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            algorithm: self.algorithm,
            start_alignment: self.start_alignment,
            matcher,
            extractor,
        })
    }
}

/// An ordered, immutable generation of rules.
#[derive(Debug)]
pub struct RuleSet<T> {
    generation: u64,
    rules: Vec<Rule<T>>,
}

impl<T> RuleSet<T> {
    /// Validate that rule ids are unique and wrap them as `generation`.
    pub fn new(generation: u64, rules: Vec<Rule<T>>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(rules.len());
        for rule in &rules {
            if !seen.insert(rule.id()) {
                return Err(TollgateError::Configuration(format!(
                    "duplicate rule id '{}'",
                    rule.id()
                )));
            }
        }

        Ok(Self { generation, rules })
    }

    /// The same rules published as `generation`.
    pub(crate) fn renumbered(&self, generation: u64) -> Self {
        Self {
            generation,
            rules: self.rules.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[Rule<T>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
