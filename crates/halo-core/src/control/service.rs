//! Control service hosted by every instance.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port), accepts connections from
//! short-lived proxies, and routes each framed JSON-RPC call to the
//! instance's [`ControlHandler`].
//!
//! # Concurrency
//!
//! The accept loop and every connection run in their own tokio tasks, so a
//! slow handler never stalls the rest of the process. Calls on one
//! connection are answered in order. Shutting the service down drops any
//! call still in flight without a reply, which is exactly what a client
//! sees when the process exits mid-call.

use super::protocol::{read_frame, write_frame, ControlOp, ControlRequest, ControlResponse, RpcRequest, RpcResponse};
use crate::config::RegistryConfig;
use crate::{HaloError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The local implementation behind the four remote operations.
///
/// `quit` is expected to end the process; it may never return.
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn inspector(&self) -> Result<()>;

    async fn toggle_window(&self, window: &str) -> Result<()>;

    async fn quit(&self) -> Result<()>;

    async fn request(&self, argv: Vec<String>) -> Result<String>;
}

/// Route one decoded request to the matching handler hook.
pub async fn dispatch<H: ControlHandler + ?Sized>(
    handler: &H,
    request: ControlRequest,
) -> Result<ControlResponse> {
    match request.op {
        ControlOp::Inspector => {
            handler.inspector().await?;
            Ok(ControlResponse::empty())
        }
        ControlOp::ToggleWindow => {
            let window = request
                .args
                .first()
                .ok_or_else(|| HaloError::InvalidParams {
                    message: "ToggleWindow requires a window name".to_string(),
                })?;
            handler.toggle_window(window).await?;
            Ok(ControlResponse::empty())
        }
        ControlOp::Quit => {
            handler.quit().await?;
            Ok(ControlResponse::empty())
        }
        ControlOp::Request => {
            let result = handler.request(request.args).await?;
            Ok(ControlResponse::text(result))
        }
    }
}

/// Cloneable trigger that stops a running service.
///
/// Handlers can hold one to tear the service down from inside a call.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}

/// Handle to a running control service. Dropping shuts it down.
pub struct ControlServiceHandle {
    addr: SocketAddr,
    shutdown: ShutdownTrigger,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ControlServiceHandle {
    /// Address the service is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Stop accepting connections and drop every open one.
    pub fn shutdown(&mut self) {
        self.shutdown.fire();
    }
}

impl Drop for ControlServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Control service that listens for proxy connections.
pub struct ControlService;

impl ControlService {
    /// Start the service on a random loopback port.
    pub async fn start<H: ControlHandler>(handler: Arc<H>) -> Result<ControlServiceHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        info!("Control service listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            shutdown_rx,
            active_connections,
        ));

        Ok(ControlServiceHandle {
            addr,
            shutdown: ShutdownTrigger(Arc::new(shutdown_tx)),
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<H: ControlHandler>(
        listener: TcpListener,
        handler: Arc<H>,
        mut shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let conn_shutdown_rx = shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("Control service shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RegistryConfig::MAX_IPC_CONNECTIONS {
                                warn!(
                                    "Rejecting control connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RegistryConfig::MAX_IPC_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let handler = handler.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Control connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*handler, &mut conn_shutdown).await {
                                    debug!("Control connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Control accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<H: ControlHandler>(
        mut stream: TcpStream,
        handler: &H,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_signalled(shutdown_rx) => {
                    return Ok(());
                }
            };

            // A shutdown while the handler runs abandons the call unanswered.
            let response = tokio::select! {
                response = Self::process_request(&frame, handler) => response,
                _ = shutdown_signalled(shutdown_rx) => {
                    debug!("Dropping in-flight control call on shutdown");
                    return Ok(());
                }
            };

            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    async fn process_request<H: ControlHandler>(frame: &[u8], handler: &H) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return RpcResponse::error(None, -32700, format!("Parse error: {}", e));
            }
        };

        if request.jsonrpc != "2.0" {
            return RpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let control_request = match ControlRequest::from_rpc(&request.method, &params) {
            Ok(req) => req,
            Err(e) => return RpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string()),
        };

        debug!("Dispatching {} call", control_request.op);

        match dispatch(handler, control_request).await {
            Ok(response) => RpcResponse::success(request.id, serde_json::json!(response.result)),
            Err(e) => {
                warn!("{} handler failed: {}", request.method, e);
                RpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string())
            }
        }
    }
}
