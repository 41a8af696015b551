//! Side-effect hooks invoked by the processor.

use super::decision::Decision;
use crate::error::TollgateError;

/// Observer of limit triggers and evaluation failures.
///
/// Hooks run inline on the checking task, so implementations must return
/// quickly; hand slow work (alerting, audit writes) to a channel or a spawned
/// task. Hooks cannot change a decision.
pub trait Interceptor<T>: Send + Sync {
    /// A rule limited `operation`.
    fn on_triggered(&self, _operation: &T, _decision: &Decision) {}

    /// A rule failed to evaluate or the store failed while checking
    /// `operation`.
    fn on_error(&self, _operation: &T, _error: &TollgateError) {}
}
