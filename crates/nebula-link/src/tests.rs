//! Loopback tests for full server/client sessions.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;
use serde::{Deserialize, Serialize};

use crate::framing::encode_frame;
use crate::messages::{ClientRegistration, Ping, Pong, encode_message};
use crate::{
    Client, ConnectionEvent, CustomMessage, Disconnect, DisconnectKind, Envelope, Leg, LinkError, Message,
    MessageKind, PeerRole, Server, SessionConfig, TlsContext, TransportFault,
};

const POS: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Pos {
    x: f32,
    y: f32,
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn ping(seq: u32) -> Message {
    Message::Ping(Ping {
        seq,
        timestamp_ms: 1_000 + u64::from(seq),
    })
}

#[derive(Debug, Clone)]
struct Received {
    message: Message,
    leg: Option<Leg>,
    role: Option<PeerRole>,
    player_id: i64,
}

/// Collects connection events and messages from a session's listeners.
#[derive(Default, Clone)]
struct Recorder {
    connected: Arc<Mutex<usize>>,
    disconnected: Arc<Mutex<Vec<Option<i64>>>>,
    messages: Arc<Mutex<Vec<Received>>>,
}

impl Recorder {
    fn attach(&self, listeners: &crate::listener::ListenerRegistry) {
        let connected = self.connected.clone();
        let disconnected = self.disconnected.clone();
        listeners.add_connection_listener(move |event: &ConnectionEvent| match event {
            ConnectionEvent::Connected(_) => *connected.lock() += 1,
            ConnectionEvent::Disconnected(peer) => disconnected.lock().push(peer.as_ref().map(|p| p.player_id())),
        });
        let messages = self.messages.clone();
        listeners.add_message_listener(move |envelope: &Envelope| {
            messages.lock().push(Received {
                message: envelope.message.clone(),
                leg: envelope.leg,
                role: envelope.source.as_ref().map(|p| p.role()),
                player_id: envelope.source.as_ref().map_or(-1, |p| p.player_id()),
            });
        });
    }

    fn connected(&self) -> usize {
        *self.connected.lock()
    }

    fn disconnected(&self) -> Vec<Option<i64>> {
        self.disconnected.lock().clone()
    }

    fn messages(&self) -> Vec<Received> {
        self.messages.lock().clone()
    }

    fn find(&self, pred: impl Fn(&Message) -> bool) -> Option<Received> {
        self.messages().into_iter().find(|r| pred(&r.message))
    }
}

fn config(label: &str) -> SessionConfig {
    SessionConfig::default().with_label(label)
}

fn start_server(config: SessionConfig, stream: i32, datagram: i32) -> (Server, Recorder) {
    let server = Server::bind_addr(config, IpAddr::V4(Ipv4Addr::LOCALHOST), stream, datagram).unwrap();
    let recorder = Recorder::default();
    recorder.attach(server.listeners());
    server.start().unwrap();
    (server, recorder)
}

fn port_of(addr: Option<std::net::SocketAddr>) -> i32 {
    addr.map_or(-1, |addr| i32::from(addr.port()))
}

fn start_client(config: SessionConfig, server: &Server) -> (Client, Recorder) {
    let client = Client::connect(
        config,
        "127.0.0.1",
        port_of(server.stream_addr()),
        port_of(server.datagram_addr()),
    )
    .unwrap();
    let recorder = Recorder::default();
    recorder.attach(client.listeners());
    client.start().unwrap();
    (client, recorder)
}

fn join(client: &Client, server: &Server) {
    wait_until("registration", || client.is_registered() && server.peers().len() == 1);
}

#[test]
fn test_bind_connect_ping_disconnect() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let (client, client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    let player = client.player_id();
    assert_eq!(player, client.correlation_id());
    assert_eq!(server.peer_by_player(player).unwrap().role(), PeerRole::Joined);
    assert_eq!(server_events.connected(), 1);
    assert_eq!(client_events.connected(), 1);

    client.send(Envelope::reliable(ping(1))).unwrap();
    let pos = Pos { x: 1.5, y: -2.0 };
    let custom = CustomMessage::encode(POS, &pos).unwrap();
    client.send(Envelope::unreliable(Message::Custom(custom))).unwrap();

    wait_until("ping and position", || server_events.messages().len() == 2);
    let received = server_events.find(|m| matches!(m, Message::Ping(_))).unwrap();
    assert_eq!(received.message, ping(1));
    assert_eq!(received.leg, Some(Leg::Stream));
    assert_eq!(received.role, Some(PeerRole::Joined));
    assert_eq!(received.player_id, player);

    let received = server_events.find(|m| matches!(m, Message::Custom(_))).unwrap();
    assert_eq!(received.leg, Some(Leg::Datagram));
    assert_eq!(received.player_id, player);
    let Message::Custom(custom) = received.message else {
        unreachable!()
    };
    assert_eq!(custom.decode::<Pos>().unwrap(), pos);

    client.disconnect().unwrap();
    wait_until("server-side removal", || server.peers().is_empty());
    wait_until("disconnect event", || server_events.disconnected().len() == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server_events.disconnected(), vec![Some(player)]);
    assert_eq!(client_events.disconnected(), vec![Some(player)]);
    assert!(!client.is_connected());
    assert!(matches!(client.send(Envelope::reliable(ping(2))), Err(LinkError::NotConnected)));

    server.stop(None).unwrap();
}

#[test]
fn test_reliable_messages_arrive_in_order() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let (client, _client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    for seq in 0..200 {
        client.send(Envelope::reliable(ping(seq))).unwrap();
    }
    wait_until("all pings", || server_events.messages().len() == 200);
    let seqs: Vec<u32> = server_events
        .messages()
        .into_iter()
        .filter_map(|r| match r.message {
            Message::Ping(p) => Some(p.seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, (0..200).collect::<Vec<_>>());

    client.disconnect().unwrap();
    server.stop(None).unwrap();
}

#[test]
fn test_broadcast_reaches_clients() {
    let (server, _server_events) = start_server(config("Server"), 0, 0);
    let (first, first_events) = start_client(config("First"), &server);
    join(&first, &server);
    let (second, second_events) = start_client(config("Second"), &server);
    wait_until("second registration", || second.is_registered() && server.peers().len() == 2);

    let pong = Message::Pong(Pong {
        seq: 9,
        timestamp_ms: 0,
    });
    server.broadcast(Envelope::reliable(pong.clone())).unwrap();
    wait_until("broadcast", || {
        first_events.find(|m| *m == pong).is_some() && second_events.find(|m| *m == pong).is_some()
    });

    let excluded = server.peer_by_player(first.player_id()).unwrap();
    server
        .broadcast_except(&excluded, Envelope::unreliable(ping(3)))
        .unwrap();
    wait_until("filtered broadcast", || second_events.find(|m| *m == ping(3)).is_some());
    thread::sleep(Duration::from_millis(50));
    assert!(first_events.find(|m| *m == ping(3)).is_none());

    server.stop(None).unwrap();
}

#[test]
fn test_server_stop_notifies_clients() {
    let (server, _server_events) = start_server(config("Server"), 0, 0);
    let (client, client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    server.stop(None).unwrap();
    assert!(!server.is_bound());

    wait_until("shutdown notice", || {
        client_events
            .find(|m| matches!(m, Message::Disconnect(_)))
            .is_some()
    });
    let notice = client_events
        .find(|m| matches!(m, Message::Disconnect(_)))
        .unwrap();
    assert_eq!(
        notice.message,
        Message::Disconnect(Disconnect::new(
            DisconnectKind::Shutdown,
            Some("Server shutdown".to_string())
        ))
    );
    wait_until("client disconnect", || client_events.disconnected().len() == 1);
    assert!(!client.is_connected());
}

#[test]
fn test_kick_sends_reason() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let (client, client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    let peer = server.peer_by_player(client.player_id()).unwrap();
    server.kick(&peer, "too slow").unwrap();

    wait_until("kick notice", || {
        client_events
            .find(|m| matches!(m, Message::Disconnect(d) if d.kind == DisconnectKind::Kick))
            .is_some()
    });
    wait_until("server removal", || server_events.disconnected().len() == 1);
    wait_until("client removal", || client_events.disconnected().len() == 1);
    assert!(server.peers().is_empty());

    server.stop(None).unwrap();
}

#[test]
fn test_version_mismatch_is_rejected() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let mut stale = config("Client");
    stale.version = 99;
    let (client, client_events) = start_client(stale, &server);

    wait_until("rejection", || {
        client_events
            .find(|m| matches!(m, Message::Disconnect(d) if d.kind == DisconnectKind::Kick))
            .is_some()
    });
    let rejection = client_events
        .find(|m| matches!(m, Message::Disconnect(_)))
        .unwrap();
    let Message::Disconnect(notice) = rejection.message else {
        unreachable!()
    };
    assert!(notice.reason.unwrap().contains("Version mismatch"));
    assert!(!client.is_registered());
    assert!(server.peers().is_empty());
    assert_eq!(server_events.connected(), 0);

    server.stop(None).unwrap();
}

#[test]
fn test_unregistered_messages_are_not_forwarded() {
    let (server, server_events) = start_server(config("Server"), 0, -1);
    let mut other = config("Client");
    other.game_name = "another-game".to_string();
    let (client, client_events) = start_client(other, &server);
    wait_until("connect", || client.is_connected() || !client_events.disconnected().is_empty());
    let _ = client.send(Envelope::reliable(ping(1)));

    thread::sleep(Duration::from_millis(100));
    assert!(server_events.messages().is_empty());
    server.stop(None).unwrap();
}

#[test]
fn test_stream_only_session_falls_back() {
    let (server, server_events) = start_server(config("Server"), 0, -1);
    let (client, _client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    client.send(Envelope::unreliable(ping(5))).unwrap();
    wait_until("fallback delivery", || !server_events.messages().is_empty());
    assert_eq!(server_events.messages()[0].leg, Some(Leg::Stream));

    client.disconnect().unwrap();
    server.stop(None).unwrap();
}

#[test]
fn test_datagram_only_session() {
    let (server, server_events) = start_server(config("Server"), -1, 0);
    let (client, _client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    client.send(Envelope::unreliable(ping(6))).unwrap();
    wait_until("datagram delivery", || !server_events.messages().is_empty());
    let received = &server_events.messages()[0];
    assert_eq!(received.leg, Some(Leg::Datagram));
    assert_eq!(received.role, Some(PeerRole::Joined));

    client.disconnect().unwrap();
    wait_until("server removal", || server.peers().is_empty());
    server.stop(None).unwrap();
}

#[test]
fn test_kind_listener_sees_only_its_kind() {
    let (server, _server_events) = start_server(config("Server"), 0, 0);
    let pings = Arc::new(Mutex::new(0));
    let p = pings.clone();
    server
        .listeners()
        .add_message_listener_for(MessageKind::Ping, move |_: &Envelope| *p.lock() += 1);
    let (client, _client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    client
        .send(Envelope::reliable(Message::Custom(CustomMessage {
            type_id: POS,
            payload: vec![1, 2, 3],
        })))
        .unwrap();
    client.send(Envelope::reliable(ping(1))).unwrap();
    wait_until("ping", || *pings.lock() == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(*pings.lock(), 1);

    client.disconnect().unwrap();
    server.stop(None).unwrap();
}

#[test]
fn test_filtered_connector_never_joins() {
    let server = Server::bind_addr(config("Server"), IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0).unwrap();
    server
        .filters()
        .add(|_: &std::net::SocketAddr| Some("maintenance".to_string()));
    server.start().unwrap();
    let (client, _client_events) = start_client(config("Client"), &server);

    thread::sleep(Duration::from_millis(200));
    assert!(!client.is_registered());
    assert!(server.peers().is_empty());
    server.stop(None).unwrap();
}

#[test]
fn test_secure_session() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

    let mut server_config = config("Server");
    server_config.tls = Some(TlsContext::server_from_der(vec![cert_der.clone()], key).unwrap());
    let (server, server_events) = start_server(server_config, 0, 0);

    let mut client_config = config("Client");
    client_config.tls = Some(TlsContext::client_trusting(vec![cert_der], "localhost").unwrap());
    let (client, client_events) = start_client(client_config, &server);
    join(&client, &server);

    client.send(Envelope::reliable(ping(11))).unwrap();
    wait_until("secure ping", || server_events.find(|m| *m == ping(11)).is_some());

    let pong = Message::Pong(Pong {
        seq: 11,
        timestamp_ms: 0,
    });
    server.broadcast(Envelope::reliable(pong.clone())).unwrap();
    wait_until("secure pong", || client_events.find(|m| *m == pong).is_some());

    client.disconnect().unwrap();
    wait_until("server removal", || server.peers().is_empty());
    server.stop(None).unwrap();
}

#[test]
fn test_connect_refused_reports_disconnect() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = match Client::connect(config("Client"), "127.0.0.1", i32::from(port), -1) {
        Ok(client) => client,
        // Some platforms refuse loopback connects synchronously.
        Err(LinkError::Io(_)) => return,
        Err(e) => panic!("unexpected error: {e}"),
    };
    let events = Recorder::default();
    events.attach(client.listeners());
    let faults = Arc::new(Mutex::new(Vec::new()));
    let f = faults.clone();
    client
        .listeners()
        .add_error_listener(move |fault: &TransportFault| f.lock().push(fault.clone()));
    client.start().unwrap();

    wait_until("refusal", || events.disconnected() == vec![None]);
    assert_eq!(events.connected(), 0);
    assert!(!client.is_connected());

    let faults = faults.lock().clone();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].leg, Leg::Stream);
    assert!(faults[0].peer.is_none());
    assert!(faults[0].reason.contains("connect"), "{}", faults[0].reason);
}

#[test]
fn test_discover_hosts_finds_server() {
    let (server, _server_events) = start_server(config("Server"), -1, 0);
    let port = server.datagram_addr().unwrap().port();

    let hosts = Client::discover_hosts(port, Duration::from_millis(500)).unwrap();
    assert!(hosts.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert!(server.peers().is_empty());
    server.stop(None).unwrap();
}

#[test]
fn test_broadcast_filtered_by_attribute() {
    let (server, _server_events) = start_server(config("Server"), 0, 0);
    let (red, red_events) = start_client(config("Red"), &server);
    join(&red, &server);
    let (blue, blue_events) = start_client(config("Blue"), &server);
    wait_until("blue registration", || blue.is_registered() && server.peers().len() == 2);

    let red_peer = server.peer_by_player(red.player_id()).unwrap();
    red_peer.set_attribute("team", "red".to_string()).unwrap();
    server
        .peer_by_player(blue.player_id())
        .unwrap()
        .set_attribute("team", "blue".to_string())
        .unwrap();
    // Attributes live on the joined instance every lookup returns.
    assert_eq!(
        server.peers().iter().filter(|p| p.attribute_names() == ["team"]).count(),
        2
    );

    let on_red = |peer: &crate::Peer| peer.attribute::<String>("team").is_some_and(|team| *team == "red");
    let pong = Message::Pong(Pong {
        seq: 4,
        timestamp_ms: 0,
    });
    server.broadcast_filtered(on_red, Envelope::reliable(pong.clone())).unwrap();
    server.broadcast_filtered(on_red, Envelope::unreliable(ping(4))).unwrap();

    wait_until("red delivery", || {
        red_events.find(|m| *m == pong).is_some() && red_events.find(|m| *m == ping(4)).is_some()
    });
    thread::sleep(Duration::from_millis(50));
    assert!(blue_events.find(|m| *m == pong || *m == ping(4)).is_none());

    server.stop(None).unwrap();
}

#[test]
fn test_unreliable_traffic_flows_while_reliable_queue_stalls() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let (client, client_events) = start_client(config("Client"), &server);
    join(&client, &server);

    // A second player that registers by hand and never reads its stream.
    let stalled_stream = TcpStream::connect(server.stream_addr().unwrap()).unwrap();
    let stalled_datagram = UdpSocket::bind("127.0.0.1:0").unwrap();
    let registration = encode_message(&Message::Registration(ClientRegistration {
        id: 42,
        game_name: "nebula".to_string(),
        version: 1,
    }))
    .unwrap();
    stalled_datagram
        .send_to(&registration, server.datagram_addr().unwrap())
        .unwrap();
    (&stalled_stream)
        .write_all(&encode_frame(&registration, 1024).unwrap())
        .unwrap();
    wait_until("manual registration", || server.peers().len() == 2);

    let stalled = server.peer_by_player(42).unwrap();
    let channel = stalled.stream_leg().unwrap().channel.clone();
    let filler = Message::Custom(CustomMessage {
        type_id: 99,
        payload: vec![0u8; 1000],
    });
    for _ in 0..16_000 {
        stalled.send(Envelope::reliable(filler.clone())).unwrap();
    }
    wait_until("stalled queue", || {
        let before = channel.queued();
        thread::sleep(Duration::from_millis(50));
        before > 0 && channel.queued() == before
    });

    let joined = server.peer_by_player(client.player_id()).unwrap();
    for seq in 0..10 {
        joined.send(Envelope::unreliable(ping(seq))).unwrap();
        client.send(Envelope::unreliable(ping(100 + seq))).unwrap();
    }
    wait_until("datagrams both ways", || {
        (0..10).all(|seq| {
            client_events.find(|m| *m == ping(seq)).is_some()
                && server_events.find(|m| *m == ping(100 + seq)).is_some()
        })
    });
    assert!(channel.queued() > 0, "reliable queue drained before the datagrams arrived");

    client.disconnect().unwrap();
    server.stop(None).unwrap();
    drop(stalled_stream);
}

#[test]
fn test_stop_from_listener_reports_departures() {
    let (server, server_events) = start_server(config("Server"), 0, 0);
    let server = Arc::new(server);
    let handle = Arc::downgrade(&server);
    server
        .listeners()
        .add_message_listener_for(MessageKind::Pong, move |_: &Envelope| {
            if let Some(server) = handle.upgrade() {
                server.stop(None).unwrap();
            }
        });

    let (client, client_events) = start_client(config("Client"), &server);
    join(&client, &server);
    let player = client.player_id();

    let pong = Message::Pong(Pong {
        seq: 1,
        timestamp_ms: 0,
    });
    client.send(Envelope::reliable(pong)).unwrap();

    wait_until("server-side departure", || server_events.disconnected() == vec![Some(player)]);
    wait_until("client-side departure", || client_events.disconnected().len() == 1);
    assert!(!server.is_bound());
    assert!(server.peers().is_empty());
}
