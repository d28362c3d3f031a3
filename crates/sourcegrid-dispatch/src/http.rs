//! HTTP/1.1 JSON transport to worker agents.
//!
//! Each command is a `POST` to
//! `http://{node}/instances/{tenant}/{namespace}/{name}/{ordinal}/{verb}`
//! carrying the JSON-encoded [`Command`]. A 2xx reply carries the instance
//! status; a 4xx reply is a rejection; anything else is a transient failure.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

use sourcegrid_state::{InstanceKey, WorkerNode};

use crate::command::{Command, CommandReply};
use crate::error::TransportError;
use crate::transport::WorkerTransport;

/// Transport speaking plain HTTP/1.1 over a fresh TCP connection per call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    user_agent: String,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            user_agent: "sourcegrid-dispatch/0.1".to_string(),
        }
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request path for a command on one instance.
    pub fn command_path(target: &InstanceKey, command: &Command) -> String {
        let id = &target.definition;
        format!(
            "/instances/{}/{}/{}/{}/{}",
            id.tenant,
            id.namespace,
            id.name,
            target.ordinal,
            command.verb().as_str()
        )
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn send(
        &self,
        node: &WorkerNode,
        target: &InstanceKey,
        command: &Command,
    ) -> Result<CommandReply, TransportError> {
        let address = node.endpoint();
        let uri = format!("http://{address}{}", Self::command_path(target, command));
        let body = serde_json::to_vec(command)
            .map_err(|e| TransportError::Request(format!("encode command: {e}")))?;

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "worker connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", &address)
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_bytes();

        if status.is_success() {
            serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::Request(format!("invalid worker reply: {e}")))
        } else if status.is_client_error() {
            debug!(%status, %uri, "worker rejected command");
            Err(TransportError::Rejected(
                String::from_utf8_lossy(&bytes).trim().to_string(),
            ))
        } else {
            debug!(%status, %uri, "worker returned server error");
            Err(TransportError::Request(format!("worker returned {status}")))
        }
    }
}
