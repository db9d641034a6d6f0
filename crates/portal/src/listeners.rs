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

//! One accept loop per configured endpoint, managed by a small actor so endpoints can be added
//! and removed at runtime.

use crate::context::PortalContext;
use crate::ssh::serve_ssh;
use crate::telnet::serve_telnet;
use crate::tls::{self, TLS_HANDSHAKE_TIMEOUT};
use crate::web;
use link_common::TransportKind;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("unable to listen for {transport} at {addr}: {source}")]
    Bind {
        transport: TransportKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{0} listener has no {1} configured")]
    NotConfigured(TransportKind, &'static str),
    #[error("listeners task has gone away")]
    Unavailable,
}

pub enum ListenersMessage {
    AddListener(
        TransportKind,
        SocketAddr,
        oneshot::Sender<Result<SocketAddr, ListenerError>>,
    ),
    RemoveListener(SocketAddr),
    GetListeners(oneshot::Sender<Vec<(TransportKind, SocketAddr)>>),
}

/// A client for the listeners actor.
#[derive(Clone)]
pub struct ListenersClient {
    listeners_channel: mpsc::Sender<ListenersMessage>,
}

impl ListenersClient {
    pub fn new(listeners_channel: mpsc::Sender<ListenersMessage>) -> Self {
        Self { listeners_channel }
    }

    /// Returns the bound address, which differs from `addr` when it asked for port 0.
    pub async fn add_listener(
        &self,
        transport: TransportKind,
        addr: SocketAddr,
    ) -> Result<SocketAddr, ListenerError> {
        let (tx, rx) = oneshot::channel();
        self.listeners_channel
            .send(ListenersMessage::AddListener(transport, addr, tx))
            .await
            .map_err(|_| ListenerError::Unavailable)?;
        rx.await.map_err(|_| ListenerError::Unavailable)?
    }

    pub async fn remove_listener(&self, addr: SocketAddr) -> Result<(), ListenerError> {
        self.listeners_channel
            .send(ListenersMessage::RemoveListener(addr))
            .await
            .map_err(|_| ListenerError::Unavailable)
    }

    pub async fn get_listeners(&self) -> Result<Vec<(TransportKind, SocketAddr)>, ListenerError> {
        let (tx, rx) = oneshot::channel();
        self.listeners_channel
            .send(ListenersMessage::GetListeners(tx))
            .await
            .map_err(|_| ListenerError::Unavailable)?;
        rx.await.map_err(|_| ListenerError::Unavailable)
    }
}

/// Transport-specific server material, loaded once at startup.
#[derive(Clone, Default)]
pub struct TransportSecrets {
    pub tls: Option<TlsAcceptor>,
    pub ssh: Option<Arc<russh::server::Config>>,
}

#[derive(Clone)]
enum Acceptor {
    Telnet,
    TelnetTls(TlsAcceptor),
    Ssh(Arc<russh::server::Config>),
}

struct Listener {
    transport: TransportKind,
    terminate: watch::Sender<bool>,
}

pub struct Listeners {
    listeners: HashMap<SocketAddr, Listener>,
    ctx: PortalContext,
    secrets: TransportSecrets,
}

impl Listeners {
    pub fn new(
        ctx: PortalContext,
        secrets: TransportSecrets,
    ) -> (Self, mpsc::Receiver<ListenersMessage>, ListenersClient) {
        let (tx, rx) = mpsc::channel(100);
        let listeners = Self {
            listeners: HashMap::new(),
            ctx,
            secrets,
        };
        (listeners, rx, ListenersClient::new(tx))
    }

    pub async fn run(
        &mut self,
        mut listeners_channel: mpsc::Receiver<ListenersMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let message = select! {
                message = listeners_channel.recv() => message,
                _ = shutdown.changed() => {
                    info!("Stopping all listeners");
                    self.stop_all();
                    return;
                }
            };
            match message {
                Some(ListenersMessage::AddListener(transport, addr, reply)) => {
                    let result = self.add_listener(transport, addr).await;
                    if let Err(e) = &result {
                        warn!(error = %e, "Unable to add listener");
                    }
                    let _ = reply.send(result);
                }
                Some(ListenersMessage::RemoveListener(addr)) => {
                    info!(%addr, "Removing listener");
                    if let Some(listener) = self.listeners.remove(&addr) {
                        let _ = listener.terminate.send(true);
                    }
                }
                Some(ListenersMessage::GetListeners(reply)) => {
                    let listeners = self
                        .listeners
                        .iter()
                        .map(|(addr, listener)| (listener.transport, *addr))
                        .collect();
                    let _ = reply.send(listeners);
                }
                None => {
                    warn!("Listeners channel closed, stopping...");
                    self.stop_all();
                    return;
                }
            }
        }
    }

    fn stop_all(&mut self) {
        for (_, listener) in self.listeners.drain() {
            let _ = listener.terminate.send(true);
        }
    }

    async fn add_listener(
        &mut self,
        transport: TransportKind,
        addr: SocketAddr,
    ) -> Result<SocketAddr, ListenerError> {
        let acceptor = match transport {
            TransportKind::Telnet | TransportKind::Web => Acceptor::Telnet,
            TransportKind::TelnetTls => Acceptor::TelnetTls(
                self.secrets
                    .tls
                    .clone()
                    .ok_or(ListenerError::NotConfigured(transport, "TLS certificate"))?,
            ),
            TransportKind::Ssh => Acceptor::Ssh(
                self.secrets
                    .ssh
                    .clone()
                    .ok_or(ListenerError::NotConfigured(transport, "host key"))?,
            ),
        };
        let bind_error = |source| ListenerError::Bind {
            transport,
            addr,
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let bound = listener.local_addr().map_err(bind_error)?;
        let (terminate_send, terminate_receive) = watch::channel(false);
        self.listeners.insert(
            bound,
            Listener {
                transport,
                terminate: terminate_send,
            },
        );
        info!(%transport, addr = %bound, "Listening");

        let ctx = self.ctx.clone();
        if transport == TransportKind::Web {
            tokio::spawn(serve_web(listener, ctx, terminate_receive));
        } else {
            tokio::spawn(accept_loop(listener, transport, acceptor, ctx, terminate_receive));
        }
        Ok(bound)
    }
}

async fn serve_web(listener: TcpListener, ctx: PortalContext, mut terminate: watch::Receiver<bool>) {
    let router = web::router(ctx);
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = terminate.changed().await;
    });
    if let Err(e) = serve.await {
        warn!(error = %e, "Web listener failed");
    }
    info!("Web listener stopped");
}

async fn accept_loop(
    listener: TcpListener,
    transport: TransportKind,
    acceptor: Acceptor,
    ctx: PortalContext,
    mut terminate: watch::Receiver<bool>,
) {
    loop {
        select! {
            _ = terminate.changed() => {
                info!(%transport, "Listener terminated, stopping...");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(%peer, %transport, "Accepted connection");
                    configure_socket(&stream);
                    tokio::spawn(handle_connection(ctx.clone(), acceptor.clone(), stream, peer));
                }
                Err(e) => {
                    // Usually descriptor exhaustion; back off rather than spin.
                    warn!(%transport, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Unable to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Unable to enable TCP keepalive");
    }
}

async fn handle_connection(
    ctx: PortalContext,
    acceptor: Acceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let result = match acceptor {
        Acceptor::Telnet => serve_telnet(ctx, stream, peer, TransportKind::Telnet).await,
        Acceptor::TelnetTls(tls_acceptor) => {
            match tls::accept(&tls_acceptor, stream, TLS_HANDSHAKE_TIMEOUT).await {
                Ok(stream) => serve_telnet(ctx, stream, peer, TransportKind::TelnetTls).await,
                Err(e) => {
                    info!(%peer, error = %e, "TLS handshake failed");
                    Ok(())
                }
            }
        }
        Acceptor::Ssh(config) => serve_ssh(ctx, config, stream, peer).await,
    };
    if let Err(e) = result {
        warn!(%peer, error = %e, "Connection ended with error");
    }
}
