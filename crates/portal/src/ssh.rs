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

//! SSH transport. Authentication is accepted unconditionally (login is the Game's business); a
//! single shell channel carries the session. Clients resume a detached session by sending the
//! `MUD_RESUME` environment variable with its id.

use crate::context::PortalContext;
use crate::render::{adapt_text, close_notice, control_text, terminal_line};
use crate::session::{SessionEvent, SessionInput, SessionOutput};
use eyre::WrapErr;
use link_common::{
    Capabilities, CloseReason, ColorDepth, ControlMessage, Payload, SessionId, TransportKind,
};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const RESUME_VARIABLE: &str = "MUD_RESUME";

const CTRL_C: u8 = 3;
const CTRL_D: u8 = 4;
const BACKSPACE: u8 = 8;
const DELETE: u8 = 127;

pub fn load_config(host_key: &Path) -> Result<Arc<russh::server::Config>, eyre::Report> {
    let key = russh::keys::load_secret_key(host_key, None)
        .wrap_err_with(|| format!("Unable to load SSH host key {}", host_key.display()))?;
    Ok(Arc::new(russh::server::Config {
        keys: vec![key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    }))
}

/// Run one SSH connection to completion.
pub async fn serve_ssh(
    ctx: PortalContext,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), eyre::Report> {
    let attached = Arc::new(Mutex::new(None));
    let handler = SshHandler {
        ctx: ctx.clone(),
        peer,
        attached: attached.clone(),
        channel: None,
        input: None,
        line: Vec::new(),
        last_cr: false,
        pty: false,
        terminal: None,
        width: None,
        height: None,
        resume: None,
    };
    let result = match russh::server::run_stream(config, stream, handler).await {
        Ok(running) => running.await,
        Err(e) => Err(e),
    };
    if let Some(session_id) = take_attached(&attached) {
        ctx.link.transport_lost(session_id);
    }
    if let Err(e) = result {
        debug!(%peer, error = %e, "SSH connection ended with error");
    }
    Ok(())
}

fn take_attached(slot: &Mutex<Option<SessionId>>) -> Option<SessionId> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

struct SshHandler {
    ctx: PortalContext,
    peer: SocketAddr,
    /// The live session, so the connection's owner can detach it when the stream ends.
    attached: Arc<Mutex<Option<SessionId>>>,
    channel: Option<ChannelId>,
    input: Option<SessionInput>,
    line: Vec<u8>,
    last_cr: bool,
    pty: bool,
    terminal: Option<String>,
    width: Option<u16>,
    height: Option<u16>,
    resume: Option<SessionId>,
}

impl SshHandler {
    fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::minimal();
        capabilities.naws = self.pty;
        capabilities.width = self.width;
        capabilities.height = self.height;
        capabilities.terminal_type = self.terminal.clone();
        if let Some(terminal) = &self.terminal {
            let terminal = terminal.to_lowercase();
            if terminal.ends_with("-256color") || terminal.starts_with("xterm") {
                capabilities.raise_color(ColorDepth::EightBit);
            }
            if terminal.ends_with("-direct") || terminal.ends_with("truecolor") {
                capabilities.raise_color(ColorDepth::TrueColor);
            }
        }
        capabilities
    }

    async fn open_session(&self) -> Result<(SessionInput, SessionOutput, bool), String> {
        let max_pause = self.ctx.adapter.max_pause;
        if let Some(session_id) = self.resume {
            return match self
                .ctx
                .link
                .resume(session_id, TransportKind::Ssh, self.peer.ip(), max_pause)
            {
                Ok(port) => Ok((port.input, port.output, true)),
                Err(e) => {
                    info!(%session_id, error = %e, "SSH resume rejected");
                    Err(e.to_string())
                }
            };
        }
        let hostname = self.ctx.hostname_for(self.peer.ip()).await;
        let (session_id, _) = self
            .ctx
            .registry
            .register(TransportKind::Ssh, self.peer.ip(), hostname)
            .map_err(|e| e.to_string())?;
        match self
            .ctx
            .link
            .connect(session_id, self.capabilities(), max_pause)
        {
            Ok(port) => Ok((port.input, port.output, false)),
            Err(e) => {
                self.ctx.link.close_session(session_id, CloseReason::Refused);
                Err(e.to_string())
            }
        }
    }

    fn send_text(&self, channel: ChannelId, session: &mut Session, text: &str) -> Result<(), russh::Error> {
        session.data(channel, CryptoVec::from(terminal_line(text)))
    }

    fn close(&mut self, reason: CloseReason) {
        if let Some(input) = self.input.take() {
            take_attached(&self.attached);
            input.close(reason);
        }
    }

    /// Feed keystrokes through a minimal line editor. Returns the bytes to echo.
    fn edit(&mut self, data: &[u8]) -> (Vec<u8>, Vec<String>, Option<CloseReason>) {
        let max = self.ctx.adapter.max_line_length;
        let mut echo = Vec::new();
        let mut lines = Vec::new();
        for &byte in data {
            let after_cr = std::mem::replace(&mut self.last_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    echo.extend_from_slice(b"\r\n");
                    lines.push(String::from_utf8_lossy(&self.line).into_owned());
                    self.line.clear();
                }
                CTRL_C => {
                    self.line.clear();
                    echo.extend_from_slice(b"^C\r\n");
                }
                CTRL_D if self.line.is_empty() => return (echo, lines, Some(CloseReason::Logout)),
                BACKSPACE | DELETE => {
                    // Drop a whole UTF-8 sequence.
                    while let Some(byte) = self.line.pop() {
                        if byte & 0xC0 != 0x80 {
                            echo.extend_from_slice(b"\x08 \x08");
                            break;
                        }
                    }
                }
                b'\t' | 32.. => {
                    if self.line.len() >= max {
                        return (echo, lines, Some(CloseReason::Overflow));
                    }
                    self.line.push(byte);
                    echo.push(byte);
                }
                _ => {}
            }
        }
        (echo, lines, None)
    }
}

impl russh::server::Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = true;
        self.terminal = Some(term.to_string());
        self.width = u16::try_from(col_width).ok();
        self.height = u16::try_from(row_height).ok();
        session.channel_success(channel)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == RESUME_VARIABLE {
            self.resume = SessionId::parse(variable_value);
            return session.channel_success(channel);
        }
        session.channel_failure(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.input.is_some() {
            return session.channel_failure(channel);
        }
        session.channel_success(channel)?;
        let (input, output, resumed) = match self.open_session().await {
            Ok(opened) => opened,
            Err(reason) => {
                let text = control_text(&ControlMessage::ResumeFailed { reason })
                    .unwrap_or_default();
                self.send_text(channel, session, &text)?;
                session.eof(channel)?;
                return session.close(channel);
            }
        };
        let session_id = input.session_id();
        *self.attached.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id);
        info!(%session_id, peer = %self.peer, resumed, "SSH session attached");
        if !resumed {
            self.send_text(
                channel,
                session,
                &format!("*** Session {session_id}; reconnect with {RESUME_VARIABLE}={session_id} to resume. ***"),
            )?;
        }
        let capabilities = self.capabilities();
        self.input = Some(input);
        tokio::spawn(pump_output(
            self.ctx.clone(),
            session.handle(),
            channel,
            output,
            capabilities,
        ));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.input.is_none() {
            return Ok(());
        }
        let (echo, lines, close) = self.edit(data);
        if self.pty && !echo.is_empty() {
            session.data(channel, CryptoVec::from(echo))?;
        }
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        for line in lines {
            if let Err(e) = input.submit_line(line) {
                debug!(error = %e, "SSH input for a session that is gone");
                return Ok(());
            }
        }
        if let Some(reason) = close {
            if reason == CloseReason::Overflow {
                let limit = self.ctx.adapter.max_line_length;
                let _ = input.submit_control(ControlMessage::Overflow { limit });
            }
            self.close(reason);
            return Ok(());
        }
        // Holding the handler here stops russh reading, which stalls the client's window.
        if input.is_paused()
            && let Err(e) = input.wait_resumed().await
        {
            warn!(error = %e, "Closing stalled SSH session");
            self.close(CloseReason::BackpressureTimeout);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.width = u16::try_from(col_width).ok();
        self.height = u16::try_from(row_height).ok();
        let capabilities = self.capabilities();
        if let Some(input) = &self.input
            && let Err(e) = input.update_capabilities(capabilities)
        {
            debug!(error = %e, "Window change for a session that is gone");
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_close(channel, session).await
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(input) = self.input.take()
            && take_attached(&self.attached).is_some()
        {
            input.transport_lost();
        }
        Ok(())
    }
}

async fn pump_output(
    ctx: PortalContext,
    handle: Handle,
    channel: ChannelId,
    mut output: SessionOutput,
    fallback: Capabilities,
) {
    let session_id = output.session_id();
    let write_timeout = ctx.adapter.write_timeout;
    loop {
        match output.next_event().await {
            SessionEvent::Output(payload) => {
                let disconnect = matches!(
                    payload,
                    Payload::Control(ControlMessage::Disconnect { .. })
                );
                let text = match payload {
                    Payload::Text(bytes) => Some(adapt_text(
                        &bytes,
                        &current_capabilities(&ctx, session_id, &fallback),
                    )),
                    Payload::Control(control) => control_text(&control),
                    Payload::OutOfBand(_) => None,
                };
                if let Some(text) = text
                    && !write_line(&handle, channel, &text, write_timeout).await
                {
                    debug!(%session_id, "SSH client stopped taking output");
                    ctx.link.transport_lost(session_id);
                    break;
                }
                if disconnect {
                    ctx.link.close_session(session_id, CloseReason::GameRequested);
                }
            }
            SessionEvent::Closed(reason) => {
                if let Some(notice) = reason.and_then(close_notice) {
                    let _ = write_line(&handle, channel, notice, write_timeout).await;
                }
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
                break;
            }
        }
    }
}

/// Capabilities as last negotiated; window changes update them mid-session.
fn current_capabilities(
    ctx: &PortalContext,
    session_id: SessionId,
    fallback: &Capabilities,
) -> Capabilities {
    ctx.registry
        .get(session_id)
        .map(|record| record.capabilities)
        .unwrap_or_else(|| fallback.clone())
}

/// False once the channel is gone or the client has taken nothing for `write_timeout`.
async fn write_line(
    handle: &Handle,
    channel: ChannelId,
    text: &str,
    write_timeout: Duration,
) -> bool {
    let data = CryptoVec::from(terminal_line(text));
    matches!(
        tokio::time::timeout(write_timeout, handle.data(channel, data)).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AdapterConfig;
    use crate::link_client::{LinkClient, LinkClientConfig};
    use crate::registry::{RegistryConfig, SessionRegistry};
    use crate::trusted_proxy::TrustedProxies;
    use pretty_assertions::assert_eq;

    fn handler(max_line_length: usize) -> SshHandler {
        let link = LinkClient::new(
            LinkClientConfig::default(),
            Arc::new(SessionRegistry::new(RegistryConfig::default())),
        );
        let ctx = PortalContext::new(
            link,
            AdapterConfig {
                max_line_length,
                ..Default::default()
            },
            TrustedProxies::default(),
        );
        SshHandler {
            ctx,
            peer: "127.0.0.1:2222".parse().unwrap(),
            attached: Arc::new(Mutex::new(None)),
            channel: None,
            input: None,
            line: Vec::new(),
            last_cr: false,
            pty: true,
            terminal: None,
            width: None,
            height: None,
            resume: None,
        }
    }

    #[test]
    fn test_line_editing() {
        let mut h = handler(64);
        let (echo, lines, close) = h.edit(b"lookk\x7f\r\nsay hi\r");
        assert_eq!(lines, vec!["look".to_string(), "say hi".to_string()]);
        assert_eq!(close, None);
        assert_eq!(echo, b"lookk\x08 \x08\r\nsay hi\r\n".to_vec());
    }

    #[test]
    fn test_backspace_removes_whole_character() {
        let mut h = handler(64);
        let (_, lines, _) = h.edit("caf\u{e9}\x7fe\n".as_bytes());
        assert_eq!(lines, vec!["cafe".to_string()]);
    }

    #[test]
    fn test_ctrl_d_on_empty_line_logs_out() {
        let mut h = handler(64);
        assert_eq!(h.edit(b"\x04").2, Some(CloseReason::Logout));
        assert_eq!(h.edit(b"x\x04").2, None);
    }

    #[test]
    fn test_overlong_line() {
        let mut h = handler(4);
        assert_eq!(h.edit(b"abcdef").2, Some(CloseReason::Overflow));
    }

    #[test]
    fn test_terminal_color() {
        let mut h = handler(64);
        h.terminal = Some("xterm-256color".into());
        assert_eq!(h.capabilities().color, ColorDepth::EightBit);
        h.terminal = Some("vt100".into());
        assert_eq!(h.capabilities().color, ColorDepth::Standard);
    }

    #[tokio::test]
    async fn test_output_follows_window_changes() {
        let h = handler(64);
        let fallback = Capabilities::minimal();
        let (session_id, _) = h
            .ctx
            .registry
            .register(TransportKind::Ssh, h.peer.ip(), None)
            .unwrap();
        let port = h
            .ctx
            .link
            .connect(
                session_id,
                Capabilities {
                    width: Some(80),
                    ..Capabilities::minimal()
                },
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(
            current_capabilities(&h.ctx, session_id, &fallback).width,
            Some(80)
        );

        port.input
            .update_capabilities(Capabilities {
                width: Some(132),
                height: Some(50),
                ..Capabilities::minimal()
            })
            .unwrap();
        let current = current_capabilities(&h.ctx, session_id, &fallback);
        assert_eq!((current.width, current.height), (Some(132), Some(50)));

        assert_eq!(
            current_capabilities(&h.ctx, SessionId::new(), &fallback),
            fallback
        );
    }
}
