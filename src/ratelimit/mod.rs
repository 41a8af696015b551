//! Rules, limiting algorithms and the processor that applies them.

mod algorithm;
mod decision;
mod descriptor;
mod fixed_window;
mod hooks;
mod leaky_bucket;
mod processor;
mod reload;
mod rule;
mod rules;
mod token_bucket;

pub use decision::{CheckResult, Decision};
pub use descriptor::{Descriptor, DescriptorEntry};
pub use hooks::Interceptor;
pub use processor::{
    EvaluationMode, FailurePolicy, Processor, ProcessorBuilder, ProcessorOptions,
    DEFAULT_MAX_CAS_RETRIES,
};
pub use reload::RuleReloader;
pub use rule::{
    Extractor, FixedWindow, LeakyBucket, LimitAlgorithm, Matcher, Rule, RuleBuilder, RuleSet,
    StartAlignment, TokenBucket,
};
pub use rules::{AlgorithmDefinition, MatchCondition, Period, RuleDefinition, RuleFile, TimeUnit};
