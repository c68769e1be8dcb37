//! Interval-driven producer.

use super::{apply, fail, snapshot, stopped, Inner, ProducerKind};
use crate::config::VariableConfig;
use crate::exec::{display_command, exec_async};
use crate::{HaloError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Maps command output (or a listener line) plus the previous value to the next value.
pub type Transform<T> = Arc<dyn Fn(&str, &T) -> T + Send + Sync>;

/// Async producer given the previous value.
pub type PollFn<T> =
    Arc<dyn Fn(&T) -> BoxFuture<'static, std::result::Result<T, String>> + Send + Sync>;

/// What a poll tick runs.
pub enum PollProducer<T> {
    /// Run argv; its trimmed stdout goes through `transform`.
    Command { argv: Vec<String>, transform: Transform<T> },
    Callback(PollFn<T>),
}

impl<T> Clone for PollProducer<T> {
    fn clone(&self) -> Self {
        match self {
            PollProducer::Command { argv, transform } => PollProducer::Command {
                argv: argv.clone(),
                transform: transform.clone(),
            },
            PollProducer::Callback(callback) => PollProducer::Callback(callback.clone()),
        }
    }
}

impl<T: Send + 'static> PollProducer<T> {
    pub fn callback<F, Fut, E>(callback: F) -> Self
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        PollProducer::Callback(Arc::new(move |current: &T| {
            callback(current)
                .map(|result| result.map_err(|e| e.to_string()))
                .boxed()
        }))
    }

    async fn produce(&self, current: &T) -> std::result::Result<T, String> {
        match self {
            PollProducer::Command { argv, transform } => {
                let stdout = exec_async(argv.as_slice()).await.map_err(|e| e.to_string())?;
                Ok(transform(&stdout, current))
            }
            PollProducer::Callback(callback) => callback(current).await,
        }
    }
}

/// Poll schedule and producer.
pub struct PollConfig<T> {
    pub interval: Duration,
    pub producer: PollProducer<T>,
}

impl<T> Clone for PollConfig<T> {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            producer: self.producer.clone(),
        }
    }
}

impl<T> PollConfig<T> {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval < VariableConfig::MIN_POLL_INTERVAL {
            return Err(HaloError::Validation {
                field: "poll_interval".to_string(),
                message: format!(
                    "poll interval {:?} is below the minimum {:?}",
                    self.interval,
                    VariableConfig::MIN_POLL_INTERVAL
                ),
            });
        }
        if let PollProducer::Command { argv, .. } = &self.producer {
            if argv.is_empty() {
                return Err(HaloError::Validation {
                    field: "poll_command".to_string(),
                    message: "poll command must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.producer {
            PollProducer::Command { argv, .. } => display_command(argv.as_slice()),
            PollProducer::Callback(_) => "<callback>".to_string(),
        }
    }
}

/// Tick immediately, then every interval, until stopped.
///
/// A failed tick is reported and the schedule carries on.
pub(super) async fn run<T: Clone + Send + Sync + 'static>(
    weak: Weak<Mutex<Inner<T>>>,
    generation: u64,
    config: PollConfig<T>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let source = config.describe();

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        let Some(current) = snapshot(&weak, ProducerKind::Poll, generation) else {
            break;
        };

        trace!("Polling {}", source);
        let produced = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            produced = config.producer.produce(&current) => produced,
        };

        let keep_going = match produced {
            Ok(value) => apply(&weak, ProducerKind::Poll, generation, value),
            Err(message) => fail(
                &weak,
                ProducerKind::Poll,
                generation,
                format!("{}: {}", source, message),
            ),
        };
        if !keep_going {
            break;
        }
    }

    trace!("Poll of {} ended", source);
}
