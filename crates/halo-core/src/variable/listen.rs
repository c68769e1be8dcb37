//! Streaming subprocess producer.

use super::poll::Transform;
use super::{apply, fail, finished, snapshot, stopped, Inner, ProducerKind};
use crate::config::VariableConfig;
use crate::exec::display_command;
use crate::platform::kill_process_group;
use crate::{HaloError, Result};
use std::sync::{Mutex, Weak};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Command to keep running and how to fold each stdout line into the value.
pub struct ListenConfig<T> {
    pub argv: Vec<String>,
    pub transform: Transform<T>,
}

impl<T> Clone for ListenConfig<T> {
    fn clone(&self) -> Self {
        Self {
            argv: self.argv.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<T> ListenConfig<T> {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(HaloError::Validation {
                field: "listen_command".to_string(),
                message: "listen command must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Kill the child's process group and wait for the child so no zombie is
/// left behind.
async fn reap(child: &mut Child, pgid: Option<u32>, command: &str) {
    if let Some(pgid) = pgid {
        kill_process_group(pgid);
    }
    if let Err(e) = child.start_kill() {
        debug!("{} already gone: {}", command, e);
    }
    match tokio::time::timeout(VariableConfig::LISTEN_REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!("{} reaped ({})", command, status),
        Ok(Err(e)) => warn!("Failed to reap {}: {}", command, e),
        Err(_) => warn!("{} did not exit after kill", command),
    }
}

/// Feed stdout lines into the variable until the child exits or the
/// producer is stopped.
pub(super) async fn run<T: Clone + Send + Sync + 'static>(
    weak: Weak<Mutex<Inner<T>>>,
    generation: u64,
    config: ListenConfig<T>,
    mut child: Child,
    mut stop: watch::Receiver<bool>,
) {
    let command = display_command(config.argv.as_slice());
    // Captured up front: `Child::id` is gone once the child has been waited on.
    let pgid = child.id();

    if let Some(stderr) = child.stderr.take() {
        let command = command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[{}] stderr: {}", command, line);
            }
        });
    }

    let Some(stdout) = child.stdout.take() else {
        reap(&mut child, pgid, &command).await;
        fail(
            &weak,
            ProducerKind::Listen,
            generation,
            format!("{}: stdout was not captured", command),
        );
        finished(&weak, ProducerKind::Listen, generation);
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    let failure = loop {
        let line = tokio::select! {
            biased;
            _ = stopped(&mut stop) => {
                reap(&mut child, pgid, &command).await;
                return;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let Some(current) = snapshot(&weak, ProducerKind::Listen, generation) else {
                    reap(&mut child, pgid, &command).await;
                    return;
                };
                let next = (config.transform)(&line, &current);
                if !apply(&weak, ProducerKind::Listen, generation, next) {
                    reap(&mut child, pgid, &command).await;
                    return;
                }
            }
            Ok(None) => {
                let status = tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => {
                        reap(&mut child, pgid, &command).await;
                        return;
                    }
                    status = child.wait() => status,
                };
                break match status {
                    Ok(status) if status.success() => {
                        debug!("{} exited", command);
                        None
                    }
                    Ok(status) => Some(format!("{} exited with {}", command, status)),
                    Err(e) => Some(format!("{}: wait failed: {}", command, e)),
                };
            }
            Err(e) => {
                reap(&mut child, pgid, &command).await;
                break Some(format!("{}: read failed: {}", command, e));
            }
        }
    };

    if let Some(message) = failure {
        fail(&weak, ProducerKind::Listen, generation, message);
    }
    finished(&weak, ProducerKind::Listen, generation);
}
