//! Polls a rule file and republishes it when it changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::descriptor::Descriptor;
use super::processor::Processor;
use super::rules::RuleFile;
use crate::error::Result;

pub struct RuleReloader {
    path: PathBuf,
    interval: Duration,
    processor: Arc<Processor<Descriptor>>,
    last_contents: Option<String>,
}

impl RuleReloader {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, processor: Arc<Processor<Descriptor>>) -> Self {
        Self {
            path: path.into(),
            interval,
            processor,
            last_contents: None,
        }
    }

    /// Re-read the rule file and publish it if its contents changed.
    ///
    /// Returns whether a new rule set was published. A file that fails to
    /// parse or validate leaves the current rules in place and is not retried
    /// until it changes again.
    pub async fn reload(&mut self) -> Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        if self.last_contents.as_deref() == Some(contents.as_str()) {
            debug!(path = %self.path.display(), "Rule file unchanged");
            return Ok(false);
        }
        let parsed = RuleFile::from_yaml(&contents).and_then(RuleFile::into_rules);
        self.last_contents = Some(contents);

        let rules = parsed?;
        let count = rules.len();
        self.processor.update_rules(rules)?;

        info!(path = %self.path.display(), rules = count, "Reloaded rule file");
        Ok(true)
    }

    /// Poll the file every interval until the task is aborted. The first poll
    /// happens immediately.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));
            while ticks.next().await.is_some() {
                if let Err(e) = self.reload().await {
                    warn!(path = %self.path.display(), error = %e, "Keeping previous rules");
                }
            }
        })
    }
}
