//! Single-shot gateway RPC client.
//!
//! One call = one connection: connect, handshake, send the method request,
//! await its correlated response, close. A single timer spans the whole
//! operation. Any close before the response settles, even with a "normal"
//! close code, is an error, because in a single-request model nothing legitimate
//! closes the socket early. Settling is enforced by `select!`: once the drive
//! future completes, a racing timeout or close signal is simply dropped.

use super::target::{resolve_target, ResolvedTarget};
use super::wire::Frame;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

/// Options for one gateway call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Explicit target, overriding config-based resolution.
    pub url: Option<String>,
    pub token: Option<String>,
    pub method: String,
    pub params: Value,
    /// Whole-operation budget. `None` uses the configured default.
    pub timeout_ms: Option<u64>,
}

impl CallOptions {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            url: None,
            token: None,
            method: method.into(),
            params,
            timeout_ms: None,
        }
    }
}

/// Perform one correlated request against the gateway and return its payload.
pub async fn call(config: &GatewayConfig, opts: CallOptions) -> Result<Value> {
    let target = resolve_target(config, opts.url.as_deref())?;
    let timeout_ms = opts.timeout_ms.unwrap_or(config.timeout_ms);
    let token = opts.token.clone().or_else(|| config.token.clone());

    tracing::debug!(%target, method = %opts.method, timeout_ms, "gateway call");

    tokio::select! {
        result = drive_call(&target, token.as_deref(), &opts.method, opts.params) => result,
        () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            // Dropping the drive future force-closes the connection.
            Err(GatewayError::Timeout {
                timeout_ms,
                target: target.to_string(),
            }
            .into())
        }
    }
}

/// Connect, handshake, request, settle. Runs to completion unless the caller
/// drops it at the deadline.
async fn drive_call(
    target: &ResolvedTarget,
    token: Option<&str>,
    method: &str,
    params: Value,
) -> Result<Value> {
    let (mut ws, _response) = connect_async(target.url.as_str())
        .await
        .map_err(GatewayError::Transport)
        .with_context(|| format!("connecting to gateway {target}"))?;

    let handshake_id = crate::util::new_session_id();
    send_frame(&mut ws, &Frame::connect_request(&handshake_id, token)).await?;
    let handshake = await_response(&mut ws, &handshake_id, target).await?;
    if let Frame::Res {
        ok: false, error, ..
    } = &handshake
    {
        return Err(GatewayError::Handshake {
            message: error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "connect rejected".into()),
            target: target.to_string(),
        }
        .into());
    }

    let request_id = crate::util::new_session_id();
    send_frame(&mut ws, &Frame::request(&request_id, method, params)).await?;
    let response = await_response(&mut ws, &request_id, target).await?;

    // Best-effort close; the call has already settled.
    let _ = ws.close(None).await;

    match response {
        Frame::Res {
            ok: true, payload, ..
        } => Ok(payload.unwrap_or(Value::Null)),
        Frame::Res { error, .. } => Err(GatewayError::Call {
            method: method.to_string(),
            message: error
                .map(|e| e.message)
                .unwrap_or_else(|| "request failed".into()),
            target: target.to_string(),
        }
        .into()),
        _ => unreachable!("await_response only yields res frames"),
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<()> {
    let raw = serde_json::to_string(frame).context("serializing gateway frame")?;
    ws.send(Message::Text(raw.into()))
        .await
        .map_err(GatewayError::Transport)
        .context("sending gateway frame")?;
    Ok(())
}

/// Read frames until the response correlated with `id` arrives. Events and
/// responses to other ids are ignored; a close (or stream end) before the
/// response is an error.
async fn await_response(ws: &mut WsStream, id: &str, target: &ResolvedTarget) -> Result<Frame> {
    while let Some(message) = ws.next().await {
        let message = message
            .map_err(GatewayError::Transport)
            .context("reading from gateway")?;
        match message {
            Message::Text(raw) => {
                let frame: Frame = match serde_json::from_str(raw.as_str()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::debug!(%err, "ignoring unparseable gateway frame");
                        continue;
                    }
                };
                if let Frame::Res { id: ref res_id, .. } = frame {
                    if res_id == id {
                        return Ok(frame);
                    }
                }
                // events, foreign responses, stray requests: not ours
            }
            Message::Close(close) => {
                let (code, reason) = close
                    .map(|frame| {
                        (
                            Some(u16::from(frame.code)),
                            Some(frame.reason.to_string()),
                        )
                    })
                    .unwrap_or((None, None));
                return Err(GatewayError::ClosedBeforeReply {
                    code,
                    reason,
                    target: target.to_string(),
                }
                .into());
            }
            // Pings are answered by the library on the next flush.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
        }
    }
    Err(GatewayError::ClosedBeforeReply {
        code: None,
        reason: None,
        target: target.to_string(),
    }
    .into())
}
