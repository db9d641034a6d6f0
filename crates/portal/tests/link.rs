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

//! Link behaviour over real sockets: a scripted game for replay and flow control, and the
//! real Link Server for the detach/resume lifecycle.

use futures_util::{SinkExt, StreamExt};
use link_common::{
    Capabilities, CloseReason, ControlMessage, Envelope, LINK_PROTOCOL_VERSION, LinkCodec,
    LinkFrame, LinkState, Payload, Sequence, SessionId, TransportKind, Welcome,
};
use mudgate_game::{EchoDispatcher, LinkServer, LinkServerConfig, run_dispatcher};
use mudgate_portal::{
    LinkClient, LinkClientConfig, RegistryConfig, SessionEvent, SessionPort, SessionRegistry,
};
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use uuid::Uuid;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(5);

type GameEnd = Framed<TcpStream, LinkCodec>;

fn client_config(link_address: String) -> LinkClientConfig {
    LinkClientConfig {
        link_address,
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..LinkClientConfig::default()
    }
}

fn start_link(config: LinkClientConfig) -> (LinkClient, watch::Sender<bool>) {
    let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
    let link = LinkClient::new(config, registry);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = link.clone();
    tokio::spawn(async move { runner.run(shutdown_rx).await });
    (link, shutdown_tx)
}

fn open_session(link: &LinkClient, transport: TransportKind) -> SessionPort {
    let (session_id, _) = link
        .registry()
        .register(transport, LOCALHOST, None)
        .expect("register");
    link.connect(session_id, Capabilities::web_defaults(), Duration::from_secs(60))
        .expect("connect")
}

/// Accept the portal's link and answer its hello the way a game would.
async fn accept_portal(
    listener: &TcpListener,
    game_id: Uuid,
    acknowledged: Vec<(SessionId, Sequence)>,
) -> GameEnd {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("portal never connected")
        .expect("accept");
    let mut framed = Framed::new(stream, LinkCodec::new(link_common::DEFAULT_MAX_FRAME_LENGTH));
    match next_frame(&mut framed).await {
        LinkFrame::Hello(hello) => assert_eq!(hello.version, LINK_PROTOCOL_VERSION),
        other => panic!("expected hello, got {other:?}"),
    }
    framed
        .send(LinkFrame::Welcome(Welcome {
            version: LINK_PROTOCOL_VERSION,
            game_id,
            acknowledged,
        }))
        .await
        .expect("welcome");
    framed
}

async fn next_frame(framed: &mut GameEnd) -> LinkFrame {
    tokio::time::timeout(WAIT, framed.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("link closed")
        .expect("bad frame")
}

async fn next_envelope(framed: &mut GameEnd) -> Envelope {
    loop {
        match next_frame(framed).await {
            LinkFrame::Envelope(envelope) => return envelope,
            LinkFrame::Ping(nonce) => {
                framed.send(LinkFrame::Pong(nonce)).await.expect("pong");
            }
            other => panic!("expected an envelope, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_reconnect_resends_exactly_the_unacknowledged_envelopes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, _shutdown) = start_link(client_config(listener.local_addr().unwrap().to_string()));
    let game_id = Uuid::new_v4();

    let mut game = accept_portal(&listener, game_id, vec![]).await;
    let port = open_session(&link, TransportKind::Telnet);
    let session_id = port.session_id();
    for line in ["one", "two", "three"] {
        port.input.submit_line(line).unwrap();
    }
    let first: Vec<u64> = [
        next_envelope(&mut game).await,
        next_envelope(&mut game).await,
        next_envelope(&mut game).await,
        next_envelope(&mut game).await,
    ]
    .iter()
    .map(|e| e.sequence.0)
    .collect();
    assert_eq!(first, vec![1, 2, 3, 4]);
    drop(game);

    // Same game instance; the dispatcher got through "one".
    let mut game = accept_portal(&listener, game_id, vec![(session_id, Sequence(2))]).await;
    let replayed = next_envelope(&mut game).await;
    assert_eq!(replayed.sequence, Sequence(3));
    assert_eq!(replayed.text().as_deref(), Some("two"));
    let replayed = next_envelope(&mut game).await;
    assert_eq!(replayed.sequence, Sequence(4));
    assert_eq!(replayed.text().as_deref(), Some("three"));

    port.input.submit_line("four").unwrap();
    let fresh = next_envelope(&mut game).await;
    assert_eq!(fresh.sequence, Sequence(5));
    assert_eq!(link.session_watermarks(session_id).map(|(depth, _)| depth), Some(3));
}

#[tokio::test]
async fn test_reconnect_with_nothing_pending_sends_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, _shutdown) = start_link(client_config(listener.local_addr().unwrap().to_string()));
    let game_id = Uuid::new_v4();

    let mut game = accept_portal(&listener, game_id, vec![]).await;
    let port = open_session(&link, TransportKind::Web);
    let session_id = port.session_id();
    port.input.submit_line("only").unwrap();
    assert_eq!(next_envelope(&mut game).await.sequence, Sequence(1));
    assert_eq!(next_envelope(&mut game).await.sequence, Sequence(2));
    game.send(LinkFrame::Ack {
        session_id,
        sequence: Sequence(2),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(game);

    for _ in 0..2 {
        let mut game = accept_portal(&listener, game_id, vec![(session_id, Sequence(2))]).await;
        let quiet = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match game.next().await {
                    Some(Ok(LinkFrame::Envelope(envelope))) => return envelope,
                    Some(Ok(_)) => continue,
                    _ => std::future::pending::<Envelope>().await,
                };
            }
        })
        .await;
        assert!(quiet.is_err(), "unexpected replay {quiet:?}");
    }
    assert_eq!(link.session_watermarks(session_id).map(|(depth, _)| depth), Some(0));
}

#[tokio::test]
async fn test_game_restart_reannounces_sessions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, _shutdown) = start_link(client_config(listener.local_addr().unwrap().to_string()));

    let mut game = accept_portal(&listener, Uuid::new_v4(), vec![]).await;
    let port = open_session(&link, TransportKind::Telnet);
    port.input.submit_line("lost").unwrap();
    assert_eq!(next_envelope(&mut game).await.sequence, Sequence(1));
    assert_eq!(next_envelope(&mut game).await.sequence, Sequence(2));
    drop(game);

    let mut game = accept_portal(&listener, Uuid::new_v4(), vec![]).await;
    let announced = next_envelope(&mut game).await;
    assert_eq!(announced.session_id, port.session_id());
    assert!(matches!(
        announced.payload,
        Payload::Control(ControlMessage::Connected {
            transport: TransportKind::Telnet,
            ..
        })
    ));
}

#[tokio::test]
async fn test_backpressure_pauses_until_acknowledged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = LinkClientConfig {
        high_watermark: 4,
        low_watermark: 2,
        ..client_config(listener.local_addr().unwrap().to_string())
    };
    let (link, _shutdown) = start_link(config);
    let mut game = accept_portal(&listener, Uuid::new_v4(), vec![]).await;

    let mut port = open_session(&link, TransportKind::Ssh);
    let session_id = port.session_id();
    for line in ["a", "b", "c"] {
        port.input.submit_line(line).unwrap();
    }
    assert!(port.input.is_paused());
    for _ in 0..4 {
        next_envelope(&mut game).await;
    }

    game.send(LinkFrame::Ack {
        session_id,
        sequence: Sequence(3),
    })
    .await
    .unwrap();
    tokio::time::timeout(WAIT, port.input.wait_resumed())
        .await
        .expect("session never resumed")
        .unwrap();
    assert!(!port.input.is_paused());
    assert_eq!(link.session_watermarks(session_id).map(|(depth, _)| depth), Some(1));
}

#[tokio::test]
async fn test_output_is_delivered_once_and_acknowledged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (link, _shutdown) = start_link(client_config(listener.local_addr().unwrap().to_string()));
    let mut game = accept_portal(&listener, Uuid::new_v4(), vec![]).await;

    let mut port = open_session(&link, TransportKind::Web);
    let session_id = port.session_id();
    next_envelope(&mut game).await;

    let line = Envelope::new(session_id, Sequence(1), Payload::text("hello"));
    game.send(LinkFrame::Envelope(line.clone())).await.unwrap();
    game.send(LinkFrame::Envelope(line)).await.unwrap();

    match tokio::time::timeout(WAIT, port.output.next_event()).await.unwrap() {
        SessionEvent::Output(Payload::Text(text)) => assert_eq!(&text[..], b"hello"),
        other => panic!("unexpected event {other:?}"),
    }
    loop {
        match next_frame(&mut game).await {
            LinkFrame::Ack { sequence, .. } => {
                assert_eq!(sequence, Sequence(1));
                break;
            }
            LinkFrame::Ping(nonce) => game.send(LinkFrame::Pong(nonce)).await.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(port.output.try_recv().is_none());
    assert_eq!(
        link.session_watermarks(session_id).map(|(_, delivered)| delivered),
        Some(Sequence(1))
    );
}

async fn start_game() -> (LinkServer, String, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (server, incoming) = LinkServer::new(LinkServerConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener, shutdown_rx).await });
    tokio::spawn(run_dispatcher(server.clone(), incoming, EchoDispatcher::new()));
    (server, address, shutdown_tx)
}

async fn expect_text(port: &mut SessionPort, expected: &str) {
    match tokio::time::timeout(WAIT, port.output.next_event()).await.unwrap() {
        SessionEvent::Output(Payload::Text(text)) => {
            assert_eq!(String::from_utf8_lossy(&text), expected)
        }
        other => panic!("expected {expected:?}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_detached_session_resumes_then_expires() {
    let (game, address, _game_shutdown) = start_game().await;
    let (link, _shutdown) = start_link(client_config(address));
    let registry = link.registry().clone();

    let mut port = open_session(&link, TransportKind::Web);
    let session_id = port.session_id();
    expect_text(&mut port, "Welcome! Type 'quit' to leave.").await;

    port.input.transport_lost();
    drop(port);
    assert_eq!(
        registry.get(session_id).map(|r| r.link_state),
        Some(LinkState::Detached)
    );

    let mut port = link
        .resume(session_id, TransportKind::Web, LOCALHOST, Duration::from_secs(60))
        .unwrap();
    expect_text(&mut port, "Welcome back.").await;
    port.input.submit_line("hi").unwrap();
    expect_text(&mut port, "You say, \"hi\"").await;

    port.input.transport_lost();
    drop(port);
    let later = Instant::now() + registry.config().grace_window + Duration::from_secs(1);
    let expired = registry.sweep(later);
    assert_eq!(expired, vec![(session_id, CloseReason::GraceExpired)]);
    for (session_id, reason) in expired {
        link.close_session(session_id, reason);
    }

    assert!(link.wait_drained(WAIT).await);
    assert!(registry.get(session_id).is_none());
    assert!(!game.sessions().contains(&session_id));
}

#[tokio::test]
async fn test_telnet_sessions_cannot_detach() {
    let (_game, address, _game_shutdown) = start_game().await;
    let (link, _shutdown) = start_link(client_config(address));
    let registry = link.registry().clone();

    let mut port = open_session(&link, TransportKind::Telnet);
    let session_id = port.session_id();
    expect_text(&mut port, "Welcome! Type 'quit' to leave.").await;
    port.input.transport_lost();

    assert!(link.wait_drained(WAIT).await);
    assert!(registry.get(session_id).is_none());
    assert!(
        link.resume(session_id, TransportKind::Telnet, LOCALHOST, Duration::from_secs(60))
            .is_err()
    );
}
