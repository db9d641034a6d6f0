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

//! Telnet clients against a running portal and game.

use link_common::TransportKind;
use mudgate_game::{EchoDispatcher, LinkServer, LinkServerConfig, run_dispatcher};
use mudgate_portal::telnet::codec::{DO, IAC, OPT_GMCP, SB, SE};
use mudgate_portal::{
    AdapterConfig, LinkClient, LinkClientConfig, Listeners, ListenersClient, PortalContext, RegistryConfig,
    SessionRegistry, TransportSecrets, TrustedProxies,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    telnet: SocketAddr,
    link: LinkClient,
    _listeners: ListenersClient,
    _shutdown: watch::Sender<bool>,
}

async fn start(max_line_length: usize, max_sessions: usize) -> Harness {
    let game_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let link_address = game_listener.local_addr().unwrap().to_string();
    let (server, incoming) = LinkServer::new(LinkServerConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = server.clone();
    let game_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { serving.serve(game_listener, game_shutdown).await });
    tokio::spawn(run_dispatcher(server, incoming, EchoDispatcher::new()));

    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        max_sessions,
        ..RegistryConfig::default()
    }));
    let link = LinkClient::new(
        LinkClientConfig {
            link_address,
            ..LinkClientConfig::default()
        },
        registry,
    );
    let runner = link.clone();
    let link_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { runner.run(link_shutdown).await });

    let ctx = PortalContext::new(
        link.clone(),
        AdapterConfig {
            max_line_length,
            negotiation_timeout: Duration::from_millis(50),
            ..AdapterConfig::default()
        },
        TrustedProxies::default(),
    );
    let (mut listeners, channel, client) = Listeners::new(ctx, TransportSecrets::default());
    let listeners_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { listeners.run(channel, listeners_shutdown).await });
    let telnet = client
        .add_listener(TransportKind::Telnet, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    Harness {
        telnet,
        link,
        _listeners: client,
        _shutdown: shutdown_tx,
    }
}

/// Read until `needle` shows up in the (lossily decoded) stream, ignoring telnet negotiation.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
            .unwrap();
        assert!(n > 0, "connection closed before {needle:?} arrived");
        seen.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.contains(needle) {
            return text;
        }
    }
}

async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut seen))
        .await
        .expect("connection was not closed")
        .unwrap();
    String::from_utf8_lossy(&seen).into_owned()
}

#[tokio::test]
async fn test_telnet_round_trip_through_the_game() {
    let harness = start(1024, 16).await;
    let mut client = TcpStream::connect(harness.telnet).await.unwrap();
    read_until(&mut client, "Welcome! Type 'quit' to leave.").await;

    client.write_all(b"hello there\r\n").await.unwrap();
    read_until(&mut client, "You say, \"hello there\"\r\n").await;

    client.write_all(b"quit\r\n").await.unwrap();
    let rest = read_to_close(&mut client).await;
    assert!(rest.contains("Goodbye."), "got {rest:?}");
    assert!(harness.link.wait_drained(WAIT).await);
}

#[tokio::test]
async fn test_gmcp_sent_during_negotiation_reaches_the_game() {
    let harness = start(1024, 16).await;
    let mut client = TcpStream::connect(harness.telnet).await.unwrap();
    let mut burst = vec![IAC, DO, OPT_GMCP, IAC, SB, OPT_GMCP];
    burst.extend_from_slice(b"Core.Ping");
    burst.extend_from_slice(&[IAC, SE]);
    burst.extend_from_slice(b"look\r\n");
    client.write_all(&burst).await.unwrap();

    let seen = read_until(&mut client, "You say, \"look\"").await;
    let ping = seen.find("Core.Ping").expect("GMCP reply missing");
    let welcome = seen.find("Welcome!").unwrap();
    assert!(welcome < ping, "got {seen:?}");
    assert!(ping < seen.find("You say").unwrap(), "got {seen:?}");
}

#[tokio::test]
async fn test_overlong_line_closes_only_that_connection() {
    let harness = start(64, 16).await;
    let mut noisy = TcpStream::connect(harness.telnet).await.unwrap();
    let mut quiet = TcpStream::connect(harness.telnet).await.unwrap();
    read_until(&mut noisy, "Welcome!").await;
    read_until(&mut quiet, "Welcome!").await;

    noisy.write_all(&[b'x'; 200]).await.unwrap();
    let rest = read_to_close(&mut noisy).await;
    assert!(rest.contains("Input line too long"), "got {rest:?}");

    quiet.write_all(b"still here\r\n").await.unwrap();
    read_until(&mut quiet, "You say, \"still here\"").await;
}

#[tokio::test]
async fn test_connections_past_the_limit_are_refused() {
    let harness = start(1024, 1).await;
    let mut first = TcpStream::connect(harness.telnet).await.unwrap();
    read_until(&mut first, "Welcome!").await;

    let mut second = TcpStream::connect(harness.telnet).await.unwrap();
    let refused = read_to_close(&mut second).await;
    assert!(refused.contains("Too many connections"), "got {refused:?}");

    first.write_all(b"ping\r\n").await.unwrap();
    read_until(&mut first, "You say, \"ping\"").await;
}

#[tokio::test]
async fn test_removed_listener_stops_accepting() {
    let harness = start(1024, 16).await;
    let (mut listeners, channel, client) = Listeners::new(
        PortalContext::new(
            harness.link.clone(),
            AdapterConfig::default(),
            TrustedProxies::default(),
        ),
        TransportSecrets::default(),
    );
    let (_stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move { listeners.run(channel, stop_rx).await });

    let addr = client
        .add_listener(TransportKind::Telnet, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        client.get_listeners().await.unwrap(),
        vec![(TransportKind::Telnet, addr)]
    );
    assert!(
        client
            .add_listener(TransportKind::Ssh, "127.0.0.1:0".parse().unwrap())
            .await
            .is_err()
    );

    client.remove_listener(addr).await.unwrap();
    let mut attempts = 0;
    while TcpStream::connect(addr).await.is_ok() {
        attempts += 1;
        assert!(attempts < 50, "listener still accepting");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
