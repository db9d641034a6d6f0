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

//! A telnet client's session: negotiate, attach, then shuttle lines until either side closes.
//! The same loop serves plain and TLS telnet.

use super::codec::{TelnetCodec, TelnetCodecError, TelnetEvent, TelnetFrame};
use super::options::{NegotiationConfig, Negotiator};
use crate::context::PortalContext;
use crate::render::{adapt_text, close_notice, control_text, terminal_line};
use crate::session::{SessionEvent, SessionInput};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use link_common::{
    CloseReason, ControlMessage, OobMessage, Payload, SessionError, SessionId, TransportKind,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// Out of band messages are prefixed with this string, e.g. for MCP clients.
const OUT_OF_BAND_PREFIX: &str = "#$#";

/// Keepalive some clients send; never forwarded.
const IDLE_COMMAND: &str = "IDLE";

type TelnetTransport<S> = Framed<S, TelnetCodec>;

/// Client input that arrives before the session is attached, kept in arrival order.
enum EarlyInput {
    Line(String),
    OutOfBand(OobMessage),
}

enum Negotiated {
    Ready(VecDeque<EarlyInput>),
    Gone(CloseReason),
}

pub async fn serve_telnet<S>(
    ctx: PortalContext,
    stream: S,
    peer: SocketAddr,
    transport: TransportKind,
) -> Result<(), eyre::Report>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, TelnetCodec::new(ctx.adapter.max_line_length));
    let hostname = ctx.hostname_for(peer.ip()).await;
    let session_id = match ctx.registry.register(transport, peer.ip(), hostname) {
        Ok((session_id, _)) => session_id,
        Err(SessionError::TooManySessions { .. }) => {
            if let Some(notice) = close_notice(CloseReason::Refused) {
                let _ = framed
                    .send(TelnetFrame::Data(Bytes::from(terminal_line(notice))))
                    .await;
            }
            let _ = SinkExt::<TelnetFrame>::close(&mut framed).await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    debug!(%session_id, %peer, %transport, "Telnet connection registered");

    let mut negotiator = Negotiator::new(NegotiationConfig {
        enable_compression: ctx.adapter.enable_compression,
        mssp: ctx.adapter.mssp.clone(),
    });
    if transport == TransportKind::TelnetTls {
        negotiator.capabilities_mut().encryption = true;
    }

    let write_timeout = ctx.adapter.write_timeout;
    let early_input = match negotiate(&ctx, &mut framed, &mut negotiator).await {
        Negotiated::Ready(early_input) => early_input,
        Negotiated::Gone(reason) => {
            debug!(%session_id, %reason, "Telnet client left during negotiation");
            ctx.link.close_session(session_id, reason);
            return Ok(());
        }
    };
    negotiator.take_changed();

    let port = match ctx.link.connect(
        session_id,
        negotiator.capabilities().clone(),
        ctx.adapter.max_pause,
    ) {
        Ok(port) => port,
        Err(e) => {
            ctx.link.close_session(session_id, CloseReason::Refused);
            return Err(e.into());
        }
    };
    let mut input = port.input;
    let mut output = port.output;
    for early in early_input {
        match early {
            EarlyInput::Line(line) => submit_line(&input, line)?,
            EarlyInput::OutOfBand(message) => {
                input.submit_oob(message)?;
            }
        }
    }

    loop {
        let paused = input.is_paused();
        select! {
            event = output.next_event() => match event {
                SessionEvent::Output(payload) => {
                    let disconnect = matches!(payload, Payload::Control(ControlMessage::Disconnect { .. }));
                    if write_frames(&mut framed, write_timeout, render(payload, &negotiator)).await.is_err() {
                        input.transport_lost();
                        break;
                    }
                    if disconnect {
                        input.close(CloseReason::GameRequested);
                    }
                }
                SessionEvent::Closed(reason) => {
                    info!(%session_id, ?reason, "Telnet session closed");
                    if let Some(notice) = reason.and_then(close_notice) {
                        let _ = write_frames(&mut framed, write_timeout, vec![TelnetFrame::Data(Bytes::from(terminal_line(notice)))]).await;
                    }
                    let _ = SinkExt::<TelnetFrame>::close(&mut framed).await;
                    break;
                }
            },
            event = framed.next(), if !paused => match event {
                None => {
                    info!(%session_id, "Telnet connection closed");
                    input.transport_lost();
                    break;
                }
                Some(Err(TelnetCodecError::LineTooLong { limit })) => {
                    warn!(%session_id, limit, "Telnet input line too long");
                    let _ = input.submit_control(ControlMessage::Overflow { limit });
                    if let Some(notice) = close_notice(CloseReason::Overflow) {
                        let _ = write_frames(&mut framed, write_timeout, vec![TelnetFrame::Data(Bytes::from(terminal_line(notice)))]).await;
                    }
                    input.close(CloseReason::Overflow);
                    break;
                }
                Some(Err(e)) => {
                    debug!(%session_id, error = %e, "Telnet read failed");
                    input.transport_lost();
                    break;
                }
                Some(Ok(event)) => {
                    if let Err(e) = handle_event(session_id, &mut framed, write_timeout, &mut negotiator, &input, event).await {
                        debug!(%session_id, error = %e, "Telnet session ending");
                        input.transport_lost();
                        break;
                    }
                }
            },
            resumed = input.wait_resumed(), if paused => {
                if let Err(e) = resumed {
                    warn!(%session_id, error = %e, "Closing stalled telnet session");
                    if let Some(notice) = close_notice(CloseReason::BackpressureTimeout) {
                        let _ = write_frames(&mut framed, write_timeout, vec![TelnetFrame::Data(Bytes::from(terminal_line(notice)))]).await;
                    }
                    input.close(CloseReason::BackpressureTimeout);
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Offer our options and give the client until the negotiation timeout to answer. Lines and
/// GMCP messages sent in the meantime are kept for after attach.
async fn negotiate<S>(
    ctx: &PortalContext,
    framed: &mut TelnetTransport<S>,
    negotiator: &mut Negotiator,
) -> Negotiated
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let write_timeout = ctx.adapter.write_timeout;
    let mut early_input = VecDeque::new();
    if write_frames(framed, write_timeout, negotiator.start()).await.is_err() {
        return Negotiated::Gone(CloseReason::TransportClosed);
    }
    let deadline = tokio::time::Instant::now() + ctx.adapter.negotiation_timeout;
    while !negotiator.is_settled() {
        let event = select! {
            event = framed.next() => event,
            _ = tokio::time::sleep_until(deadline) => {
                trace!("Telnet negotiation timed out; attaching with what we have");
                break;
            }
        };
        let frames = match event {
            None => return Negotiated::Gone(CloseReason::TransportClosed),
            Some(Err(TelnetCodecError::LineTooLong { .. })) => {
                return Negotiated::Gone(CloseReason::Overflow);
            }
            Some(Err(_)) => return Negotiated::Gone(CloseReason::HandshakeFailed),
            Some(Ok(TelnetEvent::Line(line))) => {
                early_input.push_back(EarlyInput::Line(line));
                vec![]
            }
            Some(Ok(TelnetEvent::Negotiate { command, option })) => {
                negotiator.handle_negotiate(command, option)
            }
            Some(Ok(TelnetEvent::Subnegotiation { option, data })) => {
                let (frames, message) = negotiator.handle_subnegotiation(option, &data);
                if let Some(message) = message {
                    early_input.push_back(EarlyInput::OutOfBand(message));
                }
                frames
            }
            Some(Ok(TelnetEvent::Command(_))) => vec![],
        };
        if write_frames(framed, write_timeout, frames).await.is_err() {
            return Negotiated::Gone(CloseReason::TransportClosed);
        }
    }
    Negotiated::Ready(early_input)
}

async fn handle_event<S>(
    session_id: SessionId,
    framed: &mut TelnetTransport<S>,
    write_timeout: Duration,
    negotiator: &mut Negotiator,
    input: &SessionInput,
    event: TelnetEvent,
) -> Result<(), eyre::Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match event {
        TelnetEvent::Line(line) => submit_line(input, line)?,
        TelnetEvent::Negotiate { command, option } => {
            let frames = negotiator.handle_negotiate(command, option);
            write_frames(framed, write_timeout, frames).await?;
        }
        TelnetEvent::Subnegotiation { option, data } => {
            let (frames, message) = negotiator.handle_subnegotiation(option, &data);
            write_frames(framed, write_timeout, frames).await?;
            if let Some(message) = message {
                trace!(%session_id, package = %message.package, "GMCP from client");
                input.submit_oob(message)?;
            }
        }
        TelnetEvent::Command(command) => trace!(%session_id, command, "Ignoring telnet command"),
    }
    if negotiator.take_changed() {
        input.update_capabilities(negotiator.capabilities().clone())?;
    }
    Ok(())
}

fn submit_line(input: &SessionInput, line: String) -> Result<(), SessionError> {
    if line == IDLE_COMMAND {
        return Ok(());
    }
    if line.starts_with(OUT_OF_BAND_PREFIX) {
        input.submit_oob(OobMessage::new("mcp", serde_json::Value::String(line)))?;
    } else {
        input.submit_line(line)?;
    }
    Ok(())
}

fn render(payload: Payload, negotiator: &Negotiator) -> Vec<TelnetFrame> {
    let text = match payload {
        Payload::Text(bytes) => adapt_text(&bytes, negotiator.capabilities()),
        Payload::OutOfBand(message) => return negotiator.gmcp_frame(&message).into_iter().collect(),
        Payload::Control(control) => match control_text(&control) {
            Some(text) => text,
            None => return vec![],
        },
    };
    vec![TelnetFrame::Data(Bytes::from(terminal_line(&text)))]
}

/// Write and flush `frames`, giving up if the client has not taken them within `write_timeout`.
async fn write_frames<S>(
    framed: &mut TelnetTransport<S>,
    write_timeout: Duration,
    frames: Vec<TelnetFrame>,
) -> Result<(), TelnetCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if frames.is_empty() {
        return Ok(());
    }
    let write = async {
        for frame in frames {
            framed.feed(frame).await?;
        }
        SinkExt::<TelnetFrame>::flush(framed).await
    };
    match tokio::time::timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(TelnetCodecError::WriteStalled(write_timeout)),
    }
}
