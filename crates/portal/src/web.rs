// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Browser clients over a WebSocket. Every frame is a JSON object tagged by `type`; a text frame
//! that is not JSON is taken as typed input.

use crate::context::PortalContext;
use crate::render::{adapt_text, close_notice, control_text};
use crate::session::{SessionEvent, SessionInput, SessionOutput};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use link_common::{
    Capabilities, CloseReason, ControlMessage, OobMessage, Payload, SessionError, SessionId,
    TransportKind,
};
use serde_derive::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::select;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub resume: Option<String>,
}

/// Frames a browser sends.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Text {
        text: String,
    },
    Oob {
        package: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Partial capabilities, laid over the browser defaults.
    Capabilities {
        capabilities: serde_json::Value,
    },
}

/// Frames the Portal sends.
#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Session {
        session_id: SessionId,
        resumed: bool,
    },
    Text {
        text: String,
    },
    Oob {
        package: String,
        data: serde_json::Value,
    },
    Notice {
        text: String,
    },
    ResumeFailed {
        reason: String,
    },
    Closed {
        reason: Option<CloseReason>,
        message: Option<String>,
    },
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

pub fn router(ctx: PortalContext) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ctx)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(ctx): State<PortalContext>,
) -> impl IntoResponse {
    let remote_address = ctx.trusted_proxies.resolve(peer.ip(), &headers);
    if remote_address != peer.ip() {
        debug!(%peer, %remote_address, "Client address taken from proxy headers");
    }
    // Room for JSON framing; the line limit itself is enforced on the decoded text.
    let max_message = ctx.adapter.max_line_length * 2 + 1024;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| serve_websocket(ctx, socket, remote_address, params.resume))
}

pub async fn serve_websocket(
    ctx: PortalContext,
    socket: WebSocket,
    remote_address: IpAddr,
    resume: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let opened = match resume {
        Some(token) => resume_session(&ctx, &mut sender, remote_address, &token).await,
        None => open_session(&ctx, &mut sender, &mut receiver, remote_address).await,
    };
    let Some((input, output, early)) = opened else {
        let _ = sender.close().await;
        return;
    };
    run_session(&ctx, sender, receiver, input, output, early).await;
}

async fn resume_session(
    ctx: &PortalContext,
    sender: &mut WsSender,
    remote_address: IpAddr,
    token: &str,
) -> Option<(SessionInput, SessionOutput, Option<Message>)> {
    let result = match SessionId::parse(token) {
        Some(session_id) => ctx.link.resume(
            session_id,
            TransportKind::Web,
            remote_address,
            ctx.adapter.max_pause,
        ),
        None => Err(SessionError::ResumeRejected {
            session_id: SessionId::nil(),
            reason: "malformed session id".to_string(),
        }),
    };
    match result {
        Ok(port) => {
            let session_id = port.session_id();
            info!(%session_id, %remote_address, "Web session resumed");
            send(
                sender,
                &ServerFrame::Session {
                    session_id,
                    resumed: true,
                },
                ctx.adapter.write_timeout,
            )
            .await
            .ok()?;
            Some((port.input, port.output, None))
        }
        Err(e) => {
            info!(%remote_address, error = %e, "Web resume rejected");
            let reason = match e {
                SessionError::ResumeRejected { reason, .. } => reason,
                other => other.to_string(),
            };
            for frame in resume_failed_frames(reason) {
                if send(sender, &frame, ctx.adapter.write_timeout).await.is_err() {
                    break;
                }
            }
            None
        }
    }
}

async fn open_session(
    ctx: &PortalContext,
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
    remote_address: IpAddr,
) -> Option<(SessionInput, SessionOutput, Option<Message>)> {
    let hostname = ctx.hostname_for(remote_address).await;
    let session_id = match ctx
        .registry
        .register(TransportKind::Web, remote_address, hostname)
    {
        Ok((session_id, _)) => session_id,
        Err(e) => {
            warn!(%remote_address, error = %e, "Refusing web connection");
            let _ = send(
                sender,
                &closed_frame(Some(CloseReason::Refused)),
                ctx.adapter.write_timeout,
            )
            .await;
            return None;
        }
    };

    // A client may lead with its capabilities; anything else is kept for after attach.
    let mut capabilities = Capabilities::web_defaults();
    let mut early = None;
    match tokio::time::timeout(ctx.adapter.negotiation_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match parse_frame(text.as_str()) {
            Some(ClientFrame::Capabilities { capabilities: overlay }) => {
                match merge_capabilities(&capabilities, overlay) {
                    Ok(merged) => capabilities = merged,
                    Err(e) => debug!(%session_id, error = %e, "Ignoring malformed capabilities"),
                }
            }
            _ => early = Some(Message::Text(text)),
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => {
            ctx.link
                .close_session(session_id, CloseReason::TransportClosed);
            return None;
        }
        Ok(Some(Ok(other))) => early = Some(other),
        Err(_) => {}
    }

    let port = match ctx
        .link
        .connect(session_id, capabilities, ctx.adapter.max_pause)
    {
        Ok(port) => port,
        Err(e) => {
            warn!(%session_id, error = %e, "Unable to attach web session");
            ctx.link.close_session(session_id, CloseReason::Refused);
            return None;
        }
    };
    info!(%session_id, %remote_address, "Web session attached");
    if send(
        sender,
        &ServerFrame::Session {
            session_id,
            resumed: false,
        },
        ctx.adapter.write_timeout,
    )
    .await
    .is_err()
    {
        port.input.transport_lost();
        return None;
    }
    Some((port.input, port.output, early))
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Continue,
    Lost,
    Close(CloseReason),
}

async fn run_session(
    ctx: &PortalContext,
    mut sender: WsSender,
    mut receiver: WsReceiver,
    mut input: SessionInput,
    mut output: SessionOutput,
    early: Option<Message>,
) {
    let session_id = input.session_id();
    let write_timeout = ctx.adapter.write_timeout;
    let mut capabilities = ctx
        .registry
        .get(session_id)
        .map(|record| record.capabilities)
        .unwrap_or_else(Capabilities::web_defaults);
    if let Some(message) = early
        && let Inbound::Close(reason) =
            handle_message(ctx, &input, &mut capabilities, message)
    {
        input.close(reason);
    }

    loop {
        let paused = input.is_paused();
        select! {
            event = output.next_event() => match event {
                SessionEvent::Output(payload) => {
                    let disconnect = matches!(payload, Payload::Control(ControlMessage::Disconnect { .. }));
                    if let Some(frame) = render(payload, &capabilities)
                        && send(&mut sender, &frame, write_timeout).await.is_err()
                    {
                        input.transport_lost();
                        break;
                    }
                    if disconnect {
                        input.close(CloseReason::GameRequested);
                    }
                }
                SessionEvent::Closed(reason) => {
                    info!(%session_id, ?reason, "Web session closed");
                    let _ = send(&mut sender, &closed_frame(reason), write_timeout).await;
                    let _ = sender.close().await;
                    break;
                }
            },
            message = receiver.next(), if !paused => {
                let outcome = match message {
                    Some(Ok(message)) => handle_message(ctx, &input, &mut capabilities, message),
                    Some(Err(e)) if is_oversized(&e) => {
                        overflow(&input, ctx.adapter.max_line_length)
                    }
                    Some(Err(e)) => {
                        debug!(%session_id, error = %e, "WebSocket read failed");
                        Inbound::Lost
                    }
                    None => Inbound::Lost,
                };
                match outcome {
                    Inbound::Continue => {}
                    Inbound::Lost => {
                        info!(%session_id, "WebSocket closed");
                        input.transport_lost();
                        break;
                    }
                    // Keep looping so the close notice reaches the client.
                    Inbound::Close(reason) => input.close(reason),
                }
            },
            resumed = input.wait_resumed(), if paused => {
                if let Err(e) = resumed {
                    warn!(%session_id, error = %e, "Closing stalled web session");
                    input.close(CloseReason::BackpressureTimeout);
                }
            }
        }
    }
}

fn handle_message(
    ctx: &PortalContext,
    input: &SessionInput,
    capabilities: &mut Capabilities,
    message: Message,
) -> Inbound {
    let text = match message {
        Message::Text(text) => text,
        Message::Close(_) => return Inbound::Lost,
        Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => return Inbound::Continue,
    };
    let limit = ctx.adapter.max_line_length;
    let result = match parse_frame(text.as_str()) {
        Some(ClientFrame::Text { text }) => return submit_lines(input, &text, limit),
        Some(ClientFrame::Oob { package, data }) => {
            input.submit_oob(OobMessage::new(package, data)).map(|_| ())
        }
        Some(ClientFrame::Capabilities { capabilities: overlay }) => {
            match merge_capabilities(capabilities, overlay) {
                Ok(merged) => {
                    *capabilities = merged.clone();
                    input.update_capabilities(merged)
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring malformed capabilities");
                    Ok(())
                }
            }
        }
        None => return submit_lines(input, text.as_str(), limit),
    };
    match result {
        Ok(()) => Inbound::Continue,
        Err(e) => {
            trace!(error = %e, "Web input for a session that is gone");
            Inbound::Continue
        }
    }
}

/// Submit each line of typed input. Any line over `limit` bytes rejects the whole message and
/// closes the session.
fn submit_lines(input: &SessionInput, text: &str, limit: usize) -> Inbound {
    let lines: Vec<&str> = text.lines().map(|line| line.trim_end_matches('\r')).collect();
    if lines.iter().any(|line| line.len() > limit) {
        return overflow(input, limit);
    }
    for line in lines {
        if let Err(e) = input.submit_line(line) {
            trace!(error = %e, "Web input for a session that is gone");
            break;
        }
    }
    Inbound::Continue
}

fn overflow(input: &SessionInput, limit: usize) -> Inbound {
    warn!(session_id = %input.session_id(), limit, "Web input too long");
    let _ = input.submit_control(ControlMessage::Overflow { limit });
    Inbound::Close(CloseReason::Overflow)
}

/// The websocket layer reports a message over its size limit as a capacity error, displayed
/// with this prefix. Any other read error means the connection dropped.
fn is_oversized(error: &axum::Error) -> bool {
    error.to_string().starts_with("Space limit exceeded")
}

pub fn parse_frame(text: &str) -> Option<ClientFrame> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Lay client-supplied fields over `base`; unknown fields are ignored.
pub fn merge_capabilities(
    base: &Capabilities,
    overlay: serde_json::Value,
) -> Result<Capabilities, serde_json::Error> {
    let mut merged = serde_json::to_value(base)?;
    if let (Some(target), serde_json::Value::Object(fields)) = (merged.as_object_mut(), overlay) {
        for (name, value) in fields {
            target.insert(name, value);
        }
    }
    serde_json::from_value(merged)
}

fn render(payload: Payload, capabilities: &Capabilities) -> Option<ServerFrame> {
    match payload {
        Payload::Text(bytes) => Some(ServerFrame::Text {
            text: adapt_text(&bytes, capabilities),
        }),
        Payload::OutOfBand(message) => capabilities.oob.then_some(ServerFrame::Oob {
            package: message.package,
            data: message.data,
        }),
        Payload::Control(control) => match control {
            ControlMessage::ResumeFailed { reason } => Some(ServerFrame::ResumeFailed { reason }),
            other => control_text(&other).map(|text| ServerFrame::Notice { text }),
        },
    }
}

/// What a client whose resume token was refused is told before the socket closes.
fn resume_failed_frames(reason: String) -> [ServerFrame; 2] {
    [
        ServerFrame::ResumeFailed { reason },
        closed_frame(Some(CloseReason::HandshakeFailed)),
    ]
}

fn closed_frame(reason: Option<CloseReason>) -> ServerFrame {
    ServerFrame::Closed {
        reason,
        message: reason.and_then(close_notice).map(str::to_string),
    }
}

async fn send(
    sender: &mut WsSender,
    frame: &ServerFrame,
    write_timeout: Duration,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    match tokio::time::timeout(write_timeout, sender.send(Message::Text(json.into()))).await {
        Ok(result) => result,
        Err(_) => Err(axum::Error::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("client took no output for {write_timeout:?}"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AdapterConfig;
    use crate::link_client::{LinkClient, LinkClientConfig};
    use crate::registry::{RegistryConfig, SessionRegistry};
    use crate::session::SessionPort;
    use crate::trusted_proxy::TrustedProxies;
    use link_common::ColorDepth;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn attached(max_line_length: usize) -> (PortalContext, SessionPort) {
        let link = LinkClient::new(
            LinkClientConfig::default(),
            Arc::new(SessionRegistry::new(RegistryConfig::default())),
        );
        let ctx = PortalContext::new(
            link.clone(),
            AdapterConfig {
                max_line_length,
                ..Default::default()
            },
            TrustedProxies::default(),
        );
        let (session_id, _) = ctx
            .registry
            .register(TransportKind::Web, IpAddr::V4(Ipv4Addr::LOCALHOST), None)
            .unwrap();
        let port = link
            .connect(session_id, Capabilities::web_defaults(), Duration::from_secs(1))
            .unwrap();
        (ctx, port)
    }

    /// Envelopes queued for the game, including the Connected announcement.
    fn queued(ctx: &PortalContext, port: &SessionPort) -> usize {
        ctx.link.session_watermarks(port.session_id()).unwrap().0
    }

    fn text_json(text: &str) -> String {
        json!({"type": "text", "text": text}).to_string()
    }

    fn text_frame(text: &str) -> Message {
        Message::Text(text_json(text).into())
    }

    #[tokio::test]
    async fn test_line_limit_applies_to_decoded_text_not_json() {
        let (ctx, port) = attached(16);
        let mut caps = Capabilities::web_defaults();
        // Sixteen quotes fit the limit but escape to a longer JSON frame.
        let quoted = "\"".repeat(16);
        assert!(text_json(&quoted).len() > 16);
        assert_eq!(
            handle_message(&ctx, &port.input, &mut caps, text_frame(&quoted)),
            Inbound::Continue
        );
        assert_eq!(queued(&ctx, &port), 2);

        assert_eq!(
            handle_message(&ctx, &port.input, &mut caps, text_frame("north\nsouth")),
            Inbound::Continue
        );
        assert_eq!(queued(&ctx, &port), 4);
    }

    #[tokio::test]
    async fn test_overlong_web_line_overflows_the_session() {
        let (ctx, port) = attached(16);
        let mut caps = Capabilities::web_defaults();
        let message = text_frame(&format!("ok\n{}", "x".repeat(17)));
        assert_eq!(
            handle_message(&ctx, &port.input, &mut caps, message),
            Inbound::Close(CloseReason::Overflow)
        );
        // Only the overflow notice went to the game, not the line that fit.
        assert_eq!(queued(&ctx, &port), 2);

        let (ctx, port) = attached(16);
        assert_eq!(
            handle_message(
                &ctx,
                &port.input,
                &mut caps,
                Message::Text("y".repeat(40).into())
            ),
            Inbound::Close(CloseReason::Overflow)
        );
        assert_eq!(queued(&ctx, &port), 2);
    }

    #[test]
    fn test_oversized_messages_are_told_apart_from_dropped_connections() {
        let oversized = axum::Error::new(io::Error::other(
            "Space limit exceeded: Message too long: 70000 > 33792",
        ));
        assert!(is_oversized(&oversized));
        let reset = axum::Error::new(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!is_oversized(&reset));
    }

    #[test]
    fn test_refused_resume_ends_with_a_closed_frame() {
        let frames = resume_failed_frames("unknown session".into());
        assert_eq!(
            frames
                .iter()
                .map(|frame| serde_json::to_value(frame).unwrap())
                .collect::<Vec<_>>(),
            vec![
                json!({"type": "resume_failed", "reason": "unknown session"}),
                json!({"type": "closed", "reason": "handshake_failed", "message": null}),
            ]
        );
    }

    #[test]
    fn test_client_frames() {
        assert_eq!(
            parse_frame(r#"{"type": "text", "text": "look"}"#),
            Some(ClientFrame::Text {
                text: "look".into()
            })
        );
        assert_eq!(
            parse_frame(r#"{"type": "oob", "package": "Core.Ping"}"#),
            Some(ClientFrame::Oob {
                package: "Core.Ping".into(),
                data: serde_json::Value::Null
            })
        );
        // Plain typing is not a frame.
        assert_eq!(parse_frame("look"), None);
    }

    #[test]
    fn test_capabilities_overlay_defaults() {
        let merged = merge_capabilities(
            &Capabilities::web_defaults(),
            json!({"color": "standard", "width": 100, "unknown": true}),
        )
        .unwrap();
        assert_eq!(merged.color, ColorDepth::Standard);
        assert_eq!(merged.width, Some(100));
        assert!(merged.utf8);
        assert!(merged.oob);
    }

    #[test]
    fn test_server_frames_serialize_tagged() {
        let frame = closed_frame(Some(CloseReason::IdleTimeout));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "closed",
                "reason": "idle_timeout",
                "message": "*** Idle too long; disconnecting. ***"
            })
        );
    }

    #[test]
    fn test_oob_only_for_capable_clients() {
        let message = Payload::OutOfBand(OobMessage::new("Char.Vitals", json!({"hp": 3})));
        let mut caps = Capabilities::web_defaults();
        assert!(render(message.clone(), &caps).is_some());
        caps.oob = false;
        assert!(render(message, &caps).is_none());
    }
}
