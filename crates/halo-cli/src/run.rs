//! `halo run`: host a minimal instance in the foreground.

use anyhow::Result;
use halo_core::{exec_async, ControlHandler, HaloError, Instance, SessionBus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Local implementation of the control operations for `halo run`.
pub struct RunHandler {
    name: String,
    windows: Mutex<BTreeMap<String, bool>>,
    request_cmd: Vec<String>,
    quit_tx: mpsc::UnboundedSender<()>,
}

impl RunHandler {
    pub fn new(
        name: &str,
        windows: Vec<String>,
        request_cmd: Vec<String>,
        quit_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            name: name.to_string(),
            windows: Mutex::new(windows.into_iter().map(|w| (w, false)).collect()),
            request_cmd,
            quit_tx,
        }
    }

    #[cfg(test)]
    fn is_visible(&self, window: &str) -> Option<bool> {
        self.windows.lock().ok()?.get(window).copied()
    }
}

#[async_trait::async_trait]
impl ControlHandler for RunHandler {
    async fn inspector(&self) -> halo_core::Result<()> {
        info!("Inspector requested for {}", self.name);
        Ok(())
    }

    async fn toggle_window(&self, window: &str) -> halo_core::Result<()> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| HaloError::Other("window table lock poisoned".to_string()))?;
        let visible = windows
            .get_mut(window)
            .ok_or_else(|| HaloError::handler(format!("no window named \"{}\"", window)))?;
        *visible = !*visible;
        info!(
            "Window {} is now {}",
            window,
            if *visible { "visible" } else { "hidden" }
        );
        Ok(())
    }

    async fn quit(&self) -> halo_core::Result<()> {
        info!("Quit requested for {}", self.name);
        if self.quit_tx.send(()).is_err() {
            warn!("Main loop already gone");
        }
        // The process exits before a reply goes out.
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn request(&self, argv: Vec<String>) -> halo_core::Result<String> {
        if self.request_cmd.is_empty() {
            return Ok(argv.join(" "));
        }
        let mut command = self.request_cmd.clone();
        command.extend(argv);
        exec_async(command.as_slice()).await
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

pub async fn run(
    bus: &SessionBus,
    name: &str,
    windows: Vec<String>,
    request_cmd: Vec<String>,
) -> Result<()> {
    let (quit_tx, mut quit_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(RunHandler::new(name, windows, request_cmd, quit_tx));

    let mut instance = Instance::register(bus, name, handler).await?;
    info!(
        "Serving {} (PID {}, port {})",
        instance.identity().bus_id(),
        instance.entry().pid,
        instance.port()
    );

    tokio::select! {
        _ = quit_rx.recv() => info!("Exiting on Quit"),
        result = shutdown_signal() => {
            result?;
            info!("Exiting on signal");
        }
    }

    instance.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handler(windows: &[&str], request_cmd: &[&str]) -> (RunHandler, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = RunHandler::new(
            "test",
            windows.iter().map(|w| w.to_string()).collect(),
            request_cmd.iter().map(|a| a.to_string()).collect(),
            tx,
        );
        (handler, rx)
    }

    #[tokio::test]
    async fn test_request_echoes_by_default() {
        let (handler, _rx) = handler(&[], &[]);
        let reply = handler
            .request(vec!["ping".into(), "pong".into()])
            .await
            .unwrap();
        assert_eq!(reply, "ping pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_cmd_gets_argv_appended() {
        let (handler, _rx) = handler(&[], &["echo", "got:"]);
        let reply = handler.request(vec!["ping".into()]).await.unwrap();
        assert_eq!(reply, "got: ping");
    }

    #[tokio::test]
    async fn test_toggle_flips_known_window() {
        let (handler, _rx) = handler(&["launcher"], &[]);

        handler.toggle_window("launcher").await.unwrap();
        assert_eq!(handler.is_visible("launcher"), Some(true));
        handler.toggle_window("launcher").await.unwrap();
        assert_eq!(handler.is_visible("launcher"), Some(false));
    }

    #[tokio::test]
    async fn test_toggle_unknown_window_fails() {
        let (handler, _rx) = handler(&["launcher"], &[]);
        let result = handler.toggle_window("ghost").await;
        assert!(matches!(result, Err(HaloError::Handler { .. })));
    }

    #[tokio::test]
    async fn test_quit_signals_main_loop() {
        let (handler, mut rx) = handler(&[], &[]);
        let handler = Arc::new(handler);

        let pending = tokio::spawn({
            let handler = handler.clone();
            async move { handler.quit().await }
        });

        let signalled = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(signalled.unwrap(), Some(()));
        assert!(!pending.is_finished());
        pending.abort();
    }
}
