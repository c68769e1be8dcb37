//! End-to-end tests for the control bus: register, discover, call, quit.

use halo_core::control::service::{ControlService, ShutdownTrigger};
use halo_core::control::{self, ControlHandler, ControlRequest, Proxy};
use halo_core::{discover, instance_names, HaloError, Instance, InstanceIdentity, Result, SessionBus, Variable};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

fn create_test_bus() -> (SessionBus, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let bus = SessionBus::open_at(&temp_dir.path().join("registry.db")).unwrap();
    (bus, temp_dir)
}

/// Echoes requests and tracks window visibility.
struct ShellHandler {
    windows: Mutex<HashMap<String, bool>>,
    inspected: Mutex<u32>,
}

impl ShellHandler {
    fn new(windows: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            windows: Mutex::new(windows.iter().map(|w| (w.to_string(), false)).collect()),
            inspected: Mutex::new(0),
        })
    }

    fn visible(&self, window: &str) -> Option<bool> {
        self.windows.lock().unwrap().get(window).copied()
    }
}

#[async_trait::async_trait]
impl ControlHandler for ShellHandler {
    async fn inspector(&self) -> Result<()> {
        *self.inspected.lock().unwrap() += 1;
        Ok(())
    }

    async fn toggle_window(&self, window: &str) -> Result<()> {
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(window) {
            Some(visible) => {
                *visible = !*visible;
                Ok(())
            }
            None => Err(HaloError::handler(format!("no window named {}", window))),
        }
    }

    async fn quit(&self) -> Result<()> {
        Ok(())
    }

    async fn request(&self, argv: Vec<String>) -> Result<String> {
        Ok(argv.join(" "))
    }
}

#[tokio::test]
async fn test_message_ping_round_trip() {
    let (bus, _temp_dir) = create_test_bus();
    let _instance = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();

    let reply = control::send_request(&bus, "bar", ["ping"]).await.unwrap();
    assert_eq!(reply, "ping");
}

#[tokio::test]
async fn test_missing_instance_is_not_found() {
    let (bus, _temp_dir) = create_test_bus();

    match control::send_request(&bus, "nobody", ["ping"]).await {
        Err(HaloError::InstanceNotFound { name }) => assert_eq!(name, "nobody"),
        other => panic!("Expected InstanceNotFound, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_toggle_and_inspector_reach_handler() {
    let (bus, _temp_dir) = create_test_bus();
    let handler = ShellHandler::new(&["launcher"]);
    let _instance = Instance::register(&bus, "bar", handler.clone())
        .await
        .unwrap();

    control::toggle_window(&bus, "bar", "launcher").await.unwrap();
    assert_eq!(handler.visible("launcher"), Some(true));
    control::toggle_window(&bus, "bar", "launcher").await.unwrap();
    assert_eq!(handler.visible("launcher"), Some(false));

    control::open_inspector(&bus, "bar").await.unwrap();
    assert_eq!(*handler.inspected.lock().unwrap(), 1);

    let unknown = control::toggle_window(&bus, "bar", "ghost").await;
    assert!(matches!(unknown, Err(HaloError::CallFailed { .. })));
}

#[tokio::test]
async fn test_registration_conflict_keeps_first_owner() {
    let (bus, _temp_dir) = create_test_bus();
    let first = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();

    let second = Instance::register(&bus, "bar", ShellHandler::new(&[])).await;
    assert!(matches!(second, Err(HaloError::RegistrationConflict { .. })));

    let entry = bus
        .registry()
        .lookup(first.identity())
        .unwrap()
        .unwrap();
    assert_eq!(entry.port, first.port());
}

#[tokio::test]
async fn test_discovery_tracks_instance_lifetime() {
    let (bus, _temp_dir) = create_test_bus();
    let mut bar = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();
    let _dock = Instance::register(&bus, "dock", ShellHandler::new(&[]))
        .await
        .unwrap();

    let found = discover(&bus).unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&InstanceIdentity::new("bar").unwrap()));

    bar.shutdown();

    assert_eq!(instance_names(&bus).unwrap(), vec!["dock"]);
    let gone = control::send_request(&bus, "bar", ["ping"]).await;
    assert!(matches!(gone, Err(HaloError::InstanceNotFound { .. })));
}

#[tokio::test]
async fn test_released_proxy_fails_fast() {
    let (bus, _temp_dir) = create_test_bus();
    let _instance = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();

    let mut proxy = Proxy::connect(&bus, "bar").unwrap();
    proxy.call(ControlRequest::request(["ping"])).await.unwrap();

    let again = proxy.call(ControlRequest::request(["ping"])).await;
    assert!(matches!(again, Err(HaloError::ProxyReleased { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_proxies_each_get_their_reply() {
    let (bus, _temp_dir) = create_test_bus();
    let _instance = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();

    let calls = (0..16).map(|i| {
        let bus = bus.clone();
        tokio::spawn(async move {
            let word = format!("call-{}", i);
            let reply = control::send_request(&bus, "bar", [word.clone()]).await.unwrap();
            (word, reply)
        })
    });

    for call in futures::future::join_all(calls).await {
        let (word, reply) = call.unwrap();
        assert_eq!(word, reply);
    }
}

/// Request replies with the current value of a variable the instance owns.
struct StatusHandler {
    status: Variable<String>,
}

#[async_trait::async_trait]
impl ControlHandler for StatusHandler {
    async fn inspector(&self) -> Result<()> {
        Ok(())
    }

    async fn toggle_window(&self, window: &str) -> Result<()> {
        Err(HaloError::handler(format!("no window named {}", window)))
    }

    async fn quit(&self) -> Result<()> {
        Ok(())
    }

    async fn request(&self, argv: Vec<String>) -> Result<String> {
        match argv.first().map(String::as_str) {
            Some("status") => self.status.get(),
            Some("set") => {
                self.status.set(argv[1..].join(" "))?;
                Ok(String::new())
            }
            _ => Err(HaloError::InvalidParams {
                message: format!("unknown request {:?}", argv),
            }),
        }
    }
}

#[tokio::test]
async fn test_request_reads_and_writes_instance_variable() {
    let (bus, _temp_dir) = create_test_bus();
    let status = Variable::new("idle".to_string());
    let _instance = Instance::register(
        &bus,
        "status",
        Arc::new(StatusHandler {
            status: status.clone(),
        }),
    )
    .await
    .unwrap();

    assert_eq!(
        control::send_request(&bus, "status", ["status"]).await.unwrap(),
        "idle"
    );
    control::send_request(&bus, "status", ["set", "busy", "now"])
        .await
        .unwrap();
    assert_eq!(status.get().unwrap(), "busy now");

    status.dispose();
    let after = control::send_request(&bus, "status", ["status"]).await;
    assert!(matches!(after, Err(HaloError::CallFailed { .. })));
}

/// Stands in for a process that exits while answering Quit: the registered
/// PID belongs to a child that is killed, and the connection is dropped.
#[cfg(unix)]
struct ExitingHandler {
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    trigger: OnceLock<ShutdownTrigger>,
}

#[cfg(unix)]
#[async_trait::async_trait]
impl ControlHandler for ExitingHandler {
    async fn inspector(&self) -> Result<()> {
        Ok(())
    }

    async fn toggle_window(&self, _window: &str) -> Result<()> {
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await.ok();
        }
        if let Some(trigger) = self.trigger.get() {
            trigger.fire();
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn request(&self, argv: Vec<String>) -> Result<String> {
        Ok(argv.join(" "))
    }
}

#[cfg(unix)]
async fn serve_exiting(bus: &SessionBus, name: &str) -> halo_core::control::ControlServiceHandle {
    let child = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();

    let handler = Arc::new(ExitingHandler {
        child: tokio::sync::Mutex::new(Some(child)),
        trigger: OnceLock::new(),
    });
    let handle = ControlService::start(handler.clone()).await.unwrap();
    handler.trigger.set(handle.shutdown_trigger()).ok();

    bus.registry()
        .claim(&InstanceIdentity::new(name).unwrap(), pid, handle.port())
        .unwrap();
    handle
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_quit_without_reply_is_expected_no_reply() {
    let (bus, _temp_dir) = create_test_bus();
    let _handle = serve_exiting(&bus, "bar").await;

    let mut proxy = Proxy::connect(&bus, "bar").unwrap();
    match proxy.call(ControlRequest::quit()).await {
        Err(HaloError::ExpectedNoReply { instance, method }) => {
            assert_eq!(instance, "bar");
            assert_eq!(method, "Quit");
        }
        other => panic!("Expected ExpectedNoReply, got: {:?}", other),
    }

    assert!(instance_names(&bus).unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_quit_instance_swallows_expected_no_reply() {
    let (bus, _temp_dir) = create_test_bus();
    let _handle = serve_exiting(&bus, "bar").await;

    control::quit_instance(&bus, "bar").await.unwrap();
}

#[tokio::test]
async fn test_quit_with_reply_succeeds() {
    let (bus, _temp_dir) = create_test_bus();
    let _instance = Instance::register(&bus, "bar", ShellHandler::new(&[]))
        .await
        .unwrap();

    control::quit_instance(&bus, "bar").await.unwrap();
}
