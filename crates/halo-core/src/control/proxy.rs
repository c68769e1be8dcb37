//! Client side of the control bus.
//!
//! A [`Proxy`] targets one named instance and performs exactly one call:
//!
//! ```text
//! Unconnected --connect--> Ready --call--> InFlight --{reply|error}--> Released
//! ```
//!
//! Connecting only builds the expected identity. Whether the instance exists
//! is found out on the first call, which resolves the registry row, opens a
//! loopback connection, sends one frame and waits for one reply.

use super::protocol::{read_frame, write_frame, ControlOp, ControlRequest, ControlResponse, RpcResponse};
use crate::bus::SessionBus;
use crate::config::{ControlConfig, RegistryConfig};
use crate::identity::InstanceIdentity;
use crate::platform::wait_for_exit;
use crate::registry::InstanceEntry;
use crate::{HaloError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Where a proxy is in its single-call lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Ready,
    InFlight,
    Released,
}

/// How the exchange with the remote ended, before Quit classification.
enum Exchange {
    Reply(RpcResponse),
    NoReply(String),
}

/// Handle for one call to one remote instance.
#[derive(Debug)]
pub struct Proxy {
    bus: SessionBus,
    identity: InstanceIdentity,
    state: ProxyState,
    timeout: Option<Duration>,
}

impl Proxy {
    /// Build a proxy for the instance called `name`.
    ///
    /// No round trip happens here; an absent instance shows up as
    /// `InstanceNotFound` on the first call.
    pub fn connect(bus: &SessionBus, name: &str) -> Result<Self> {
        let identity = InstanceIdentity::with_namespace(bus.namespace(), name)?;
        debug!("Proxy ready for {}", identity.bus_id());
        Ok(Self {
            bus: bus.clone(),
            identity,
            state: ProxyState::Ready,
            timeout: ControlConfig::DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Bound the wait for a reply. Expiry fails the call with `CallFailed`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Perform the proxy's one call.
    ///
    /// The proxy is released afterwards whatever the outcome; any later call
    /// fails with `ProxyReleased`.
    pub async fn call(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        if self.state != ProxyState::Ready {
            return Err(HaloError::ProxyReleased {
                instance: self.identity.name().to_string(),
            });
        }
        self.state = ProxyState::InFlight;

        let outcome = self.call_inner(&request).await;
        self.release();
        outcome
    }

    async fn call_inner(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let entry = self
            .bus
            .registry()
            .lookup(&self.identity)
            .map_err(|e| self.call_failed(request.op, e.to_string()))?
            .ok_or_else(|| HaloError::InstanceNotFound {
                name: self.identity.name().to_string(),
            })?;

        let exchange = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(&entry, request))
                .await
                .map_err(|_| {
                    self.call_failed(request.op, format!("no reply within {:?}", limit))
                })??,
            None => self.exchange(&entry, request).await?,
        };

        match exchange {
            Exchange::Reply(response) => self.interpret(request.op, response),
            Exchange::NoReply(cause) => self.classify_no_reply(&entry, request.op, cause).await,
        }
    }

    async fn exchange(&self, entry: &InstanceEntry, request: &ControlRequest) -> Result<Exchange> {
        let addr = entry.addr();
        let mut stream = tokio::time::timeout(RegistryConfig::IPC_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| self.call_failed(request.op, format!("connect to {} timed out", addr)))?
            .map_err(|e| self.call_failed(request.op, format!("connect to {}: {}", addr, e)))?;

        debug!("Calling {} on {} at {}", request.op, self.identity, addr);

        let request_bytes = serde_json::to_vec(&request.to_rpc(1))?;
        let (mut reader, mut writer) = stream.split();

        if let Err(e) = write_frame(&mut writer, &request_bytes).await {
            return Ok(Exchange::NoReply(format!("send failed: {}", e)));
        }

        let response_bytes = match read_frame(&mut reader).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Exchange::NoReply("connection closed without reply".to_string())),
            Err(e) => return Ok(Exchange::NoReply(format!("receive failed: {}", e))),
        };

        let response: RpcResponse = serde_json::from_slice(&response_bytes).map_err(|e| {
            self.call_failed(request.op, format!("malformed reply: {}", e))
        })?;

        Ok(Exchange::Reply(response))
    }

    fn interpret(&self, op: ControlOp, response: RpcResponse) -> Result<ControlResponse> {
        if let Some(err) = response.error {
            return Err(self.call_failed(op, err.message));
        }

        let result = match response.result {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
        };

        Ok(ControlResponse::text(result))
    }

    /// A dropped Quit is only a success if the remote process is really gone.
    async fn classify_no_reply(
        &self,
        entry: &InstanceEntry,
        op: ControlOp,
        cause: String,
    ) -> Result<ControlResponse> {
        if op == ControlOp::Quit
            && wait_for_exit(
                entry.pid,
                ControlConfig::QUIT_EXIT_GRACE,
                ControlConfig::EXIT_POLL_INTERVAL,
            )
            .await
        {
            debug!("{} exited while handling Quit", self.identity);
            return Err(HaloError::ExpectedNoReply {
                instance: self.identity.name().to_string(),
                method: op.to_string(),
            });
        }

        warn!("{} call to {} got no reply: {}", op, self.identity, cause);
        Err(self.call_failed(op, cause))
    }

    fn call_failed(&self, op: ControlOp, message: String) -> HaloError {
        HaloError::CallFailed {
            instance: self.identity.name().to_string(),
            method: op.to_string(),
            message,
        }
    }

    /// Give up the proxy. Safe to call more than once.
    pub fn release(&mut self) {
        if self.state != ProxyState::Released {
            debug!("Proxy for {} released", self.identity);
            self.state = ProxyState::Released;
        }
    }

    /// Ask the instance to exit. An exit that beats the reply counts as success.
    pub async fn quit(mut self) -> Result<()> {
        match self.call(ControlRequest::quit()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_expected_no_reply() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn inspector(mut self) -> Result<()> {
        self.call(ControlRequest::inspector()).await.map(|_| ())
    }

    pub async fn toggle_window(mut self, window: &str) -> Result<()> {
        self.call(ControlRequest::toggle_window(window))
            .await
            .map(|_| ())
    }

    pub async fn request<I, S>(mut self, argv: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.call(ControlRequest::request(argv))
            .await
            .map(|response| response.result)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.release();
    }
}

/// Connect, send `Quit`, release.
pub async fn quit_instance(bus: &SessionBus, name: &str) -> Result<()> {
    Proxy::connect(bus, name)?.quit().await
}

/// Connect, send `Inspector`, release.
pub async fn open_inspector(bus: &SessionBus, name: &str) -> Result<()> {
    Proxy::connect(bus, name)?.inspector().await
}

/// Connect, send `ToggleWindow`, release.
pub async fn toggle_window(bus: &SessionBus, name: &str, window: &str) -> Result<()> {
    Proxy::connect(bus, name)?.toggle_window(window).await
}

/// Connect, send `Request`, release, and hand back the reply text.
pub async fn send_request<I, S>(bus: &SessionBus, name: &str, argv: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Proxy::connect(bus, name)?.request(argv).await
}
