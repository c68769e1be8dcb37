//! Control protocol types and framing.
//!
//! Each control call is one JSON-RPC 2.0 request carried in a
//! length-prefixed frame: a 4-byte big-endian length, then that many bytes
//! of UTF-8 JSON.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The method is the operation name (`Inspector`, `ToggleWindow`, `Quit`,
//! `Request`) and the params are always `{"args": [...]}`.

use crate::config::RegistryConfig;
use crate::{HaloError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The four remote operations an instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlOp {
    Inspector,
    ToggleWindow,
    Quit,
    Request,
}

impl ControlOp {
    pub const ALL: [ControlOp; 4] = [
        ControlOp::Inspector,
        ControlOp::ToggleWindow,
        ControlOp::Quit,
        ControlOp::Request,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOp::Inspector => "Inspector",
            ControlOp::ToggleWindow => "ToggleWindow",
            ControlOp::Quit => "Quit",
            ControlOp::Request => "Request",
        }
    }
}

impl FromStr for ControlOp {
    type Err = HaloError;

    fn from_str(s: &str) -> Result<Self> {
        ControlOp::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| HaloError::MethodNotFound {
                method: s.to_string(),
            })
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote operation plus its ordered string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub op: ControlOp,
    pub args: Vec<String>,
}

impl ControlRequest {
    pub fn inspector() -> Self {
        Self {
            op: ControlOp::Inspector,
            args: Vec::new(),
        }
    }

    pub fn toggle_window(window: impl Into<String>) -> Self {
        Self {
            op: ControlOp::ToggleWindow,
            args: vec![window.into()],
        }
    }

    pub fn quit() -> Self {
        Self {
            op: ControlOp::Quit,
            args: Vec::new(),
        }
    }

    pub fn request<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op: ControlOp::Request,
            args: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode as a JSON-RPC request with the given id.
    pub fn to_rpc(&self, id: u64) -> RpcRequest {
        RpcRequest::new(self.op.as_str(), serde_json::json!({ "args": self.args }), id)
    }

    /// Decode from a JSON-RPC method name and params.
    ///
    /// Argument arity is checked per operation.
    pub fn from_rpc(method: &str, params: &serde_json::Value) -> Result<Self> {
        let op: ControlOp = method.parse()?;

        let args: Vec<String> = match params.get("args") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                HaloError::InvalidParams {
                    message: format!("{} args must be a list of strings: {}", op, e),
                }
            })?,
        };

        let expected = match op {
            ControlOp::Inspector | ControlOp::Quit => Some(0),
            ControlOp::ToggleWindow => Some(1),
            ControlOp::Request => None,
        };
        if let Some(expected) = expected {
            if args.len() != expected {
                return Err(HaloError::InvalidParams {
                    message: format!(
                        "{} takes {} argument(s), got {}",
                        op,
                        expected,
                        args.len()
                    ),
                });
            }
        }

        Ok(Self { op, args })
    }
}

/// Reply to a control call. Unit operations reply with an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub result: String,
}

impl ControlResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > RegistryConfig::MAX_IPC_MESSAGE_SIZE {
        return Err(HaloError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                RegistryConfig::MAX_IPC_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| HaloError::Validation {
        field: "ipc_frame".to_string(),
        message: format!("IPC message of {} bytes is too large", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
