//! Declarative rule files.
//!
//! Rules over [`Descriptor`] operations can be written in YAML instead of
//! code:
//!
//! ```yaml
//! rules:
//!   - id: per-client
//!     domain: edge
//!     match:
//!       - key: path
//!         value: /login
//!     target: [remote_address]
//!     start_alignment: from_natural_period_begin
//!     algorithm:
//!       type: fixed_window
//!       limit_number: 30
//!       stat_window: { amount: 1, unit: second }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::descriptor::Descriptor;
use super::rule::{FixedWindow, LeakyBucket, LimitAlgorithm, Rule, StartAlignment, TokenBucket};
use crate::error::{Result, TollgateError};

/// Time unit of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    fn millis(self) -> u64 {
        match self {
            TimeUnit::Millisecond => 1,
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }
}

/// A length of time written as `{ amount, unit }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(default = "one")]
    pub amount: u64,
    pub unit: TimeUnit,
}

impl Period {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.amount.saturating_mul(self.unit.millis()))
    }
}

fn one() -> u64 {
    1
}

/// Algorithm section of a rule definition, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmDefinition {
    FixedWindow {
        limit_number: u64,
        stat_window: Period,
    },
    TokenBucket {
        capacity: u64,
        refill_rate: u64,
        refill_period: Period,
        #[serde(default = "one")]
        inflow_unit: u64,
    },
    LeakyBucket {
        capacity: u64,
        outflow_rate: u64,
        outflow_period: Period,
    },
}

impl From<&AlgorithmDefinition> for LimitAlgorithm {
    fn from(definition: &AlgorithmDefinition) -> Self {
        match *definition {
            AlgorithmDefinition::FixedWindow {
                limit_number,
                stat_window,
            } => FixedWindow::new(limit_number, stat_window.duration()).into(),
            AlgorithmDefinition::TokenBucket {
                capacity,
                refill_rate,
                refill_period,
                inflow_unit,
            } => TokenBucket::new(capacity, refill_rate, refill_period.duration())
                .with_inflow_unit(inflow_unit)
                .into(),
            AlgorithmDefinition::LeakyBucket {
                capacity,
                outflow_rate,
                outflow_period,
            } => LeakyBucket::new(capacity, outflow_rate, outflow_period.duration()).into(),
        }
    }
}

/// A condition on one descriptor entry. Without a value, any value matches
/// as long as the key is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCondition {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl MatchCondition {
    fn holds(&self, descriptor: &Descriptor) -> bool {
        match (descriptor.get(&self.key), &self.value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// One rule as written in a rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Only descriptors of this domain match; any domain if unset.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, rename = "match")]
    pub conditions: Vec<MatchCondition>,
    /// Entry keys whose values, joined with `|`, form the target.
    pub target: Vec<String>,
    #[serde(default)]
    pub start_alignment: StartAlignment,
    pub algorithm: AlgorithmDefinition,
}

impl RuleDefinition {
    /// Compile the definition into a rule over descriptors.
    pub fn into_rule(self) -> Result<Rule<Descriptor>> {
        if self.target.is_empty() {
            return Err(TollgateError::Configuration(format!(
                "rule '{}': target must name at least one key",
                self.id
            )));
        }

        let algorithm = LimitAlgorithm::from(&self.algorithm);
        let domain = self.domain;
        let conditions = self.conditions;
        let target = self.target;

        let mut builder = Rule::builder(self.id, algorithm)
            .start_alignment(self.start_alignment)
            .matching(move |descriptor: &Descriptor| {
                domain.as_deref().map_or(true, |d| d == descriptor.domain)
                    && conditions.iter().all(|c| c.holds(descriptor))
            })
            .target(move |descriptor: &Descriptor| descriptor.target(&target));
        if let Some(name) = self.name {
            builder = builder.name(name);
        }

        builder.build()
    }
}

/// The contents of a rule file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl RuleFile {
    /// Load rule definitions from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse rule definitions from YAML. Both `rules: [...]` and a bare list
    /// are accepted.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(rules) = serde_yaml::from_str::<Vec<RuleDefinition>>(yaml) {
            return Ok(Self { rules });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Configuration(format!("Failed to parse rule file: {}", e)))
    }

    /// Compile every definition, failing on the first invalid one.
    pub fn into_rules(self) -> Result<Vec<Rule<Descriptor>>> {
        self.rules.into_iter().map(RuleDefinition::into_rule).collect()
    }
}
