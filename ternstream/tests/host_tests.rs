//! End-to-end tests: two hosts talking over loopback.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ternstream::frame::Frame;
use ternstream::packet::{Body, Packet};
use ternstream::{
    ConnectionMode, ConnectionTypes, Delivery, ErrorKind, Event, Host, Interceptor, Key, Peer,
    PeerReason, PeerState, Settings, StreamSettings, TernStreamError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(settings: Settings, types: ConnectionTypes) -> Host {
    init_tracing();
    let mut host = Host::new();
    host.open(localhost(), settings, types).unwrap();
    host
}

/// Poll `host` until an event matches `pred`, discarding the others.
fn wait_for<F>(host: &mut Host, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        while let Some(event) = host.try_get_event().unwrap() {
            if pred(&event) {
                return event;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for event");
}

fn wait_for_connection(host: &mut Host) -> Peer {
    match wait_for(host, |e| matches!(e, Event::Connection(_))) {
        Event::Connection(peer) => peer,
        _ => unreachable!(),
    }
}

fn wait_for_disconnection(host: &mut Host) -> (Peer, PeerReason) {
    match wait_for(host, |e| matches!(e, Event::Disconnection { .. })) {
        Event::Disconnection { peer, reason } => (peer, reason),
        _ => unreachable!(),
    }
}

/// Collect `count` payloads from Data events.
fn receive(host: &mut Host, count: usize) -> Vec<Bytes> {
    let mut received = Vec::new();
    while received.len() < count {
        match wait_for(host, |e| matches!(e, Event::Data { .. })) {
            Event::Data { payload, .. } => received.push(payload),
            _ => unreachable!(),
        }
    }
    received
}

/// Every event raised within `period`, in order.
fn drain_events(host: &mut Host, period: Duration) -> Vec<Event> {
    let deadline = Instant::now() + period;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        while let Some(event) = host.try_get_event().unwrap() {
            events.push(event);
        }
        thread::sleep(Duration::from_millis(1));
    }
    events
}

/// Collect the next `count` events, whatever they are.
fn next_events(host: &mut Host, count: usize) -> Vec<Event> {
    let deadline = Instant::now() + TIMEOUT;
    let mut events = Vec::new();
    while events.len() < count {
        assert!(Instant::now() < deadline, "timed out after {} events", events.len());
        match host.try_get_event().unwrap() {
            Some(event) => events.push(event),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    events
}

/// Drain events for `period`, returning any extra payloads.
fn drain_data(host: &mut Host, period: Duration) -> Vec<Bytes> {
    drain_events(host, period)
        .into_iter()
        .filter_map(|event| match event {
            Event::Data { payload, .. } => Some(payload),
            _ => None,
        })
        .collect()
}

/// Poll until the host reports the failure of its I/O thread.
fn wait_for_failure(host: &mut Host) -> TernStreamError {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        match host.try_get_event() {
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(err) => return err,
        }
    }
    panic!("timed out waiting for the I/O thread to fail");
}

/// Connect a fresh client to `server`; returns (client, client-side peer,
/// server-side peer).
fn connect(server: &mut Host, client: Host, mode: ConnectionMode) -> (Host, Peer, Peer) {
    let mut client = client;
    let remote = server.local_addr().unwrap();
    let peer = client.connect(remote, mode).unwrap();
    let connected = wait_for_connection(&mut client);
    assert_eq!(connected, peer);
    let accepted = wait_for_connection(server);
    (client, peer, accepted)
}

fn messages(n: usize) -> Vec<Bytes> {
    (0..n).map(|i| Bytes::from(format!("message-{i}"))).collect()
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

fn carries_reliable_segment(data: &[u8]) -> bool {
    match Packet::decode(data) {
        Ok(Packet::Data {
            body: Body::Plain(frames),
            ..
        }) => frames.iter().any(|f| {
            matches!(
                f,
                Frame::Segment {
                    delivery: Delivery::Reliable,
                    ..
                }
            )
        }),
        _ => false,
    }
}

/// Drops the first outgoing datagram that carries a reliable segment.
struct DropFirstReliable {
    dropped: Arc<AtomicUsize>,
}

impl Interceptor for DropFirstReliable {
    fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> bool {
        true
    }

    fn on_send(&mut self, _addr: &SocketAddr, data: &mut Vec<u8>) -> bool {
        if self.dropped.load(Ordering::Relaxed) == 0 && carries_reliable_segment(data) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Drops every inbound Data packet once armed.
struct Blackhole {
    armed: Arc<AtomicBool>,
}

impl Interceptor for Blackhole {
    fn on_receive(&mut self, _addr: &SocketAddr, data: &mut [u8]) -> bool {
        !(self.armed.load(Ordering::Relaxed) && matches!(Packet::decode(data), Ok(Packet::Data { .. })))
    }

    fn on_send(&mut self, _addr: &SocketAddr, _data: &mut Vec<u8>) -> bool {
        true
    }
}

/// Panics on the first datagram sent once armed.
struct PanicOnSend {
    armed: Arc<AtomicBool>,
}

impl Interceptor for PanicOnSend {
    fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> bool {
        true
    }

    fn on_send(&mut self, _addr: &SocketAddr, _data: &mut Vec<u8>) -> bool {
        if self.armed.load(Ordering::Relaxed) {
            panic!("interceptor gave up");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[test]
fn reliable_messages_arrive_in_order() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let mut client = open(Settings::default(), ConnectionTypes::ALL);
    let peer = client
        .connect(server.local_addr().unwrap(), ConnectionMode::Insecure)
        .unwrap();
    assert_eq!(wait_for_connection(&mut client), peer);

    let sent = messages(3);
    for payload in &sent {
        peer.send(payload.clone(), Delivery::Reliable).unwrap();
    }

    let events = next_events(&mut server, 4);
    let Event::Connection(accepted) = &events[0] else {
        panic!("expected a connection first, got {:?}", events[0]);
    };
    assert_eq!(accepted.endpoint(), client.local_addr().unwrap());
    for (event, expected) in events[1..].iter().zip(&sent) {
        match event {
            Event::Data {
                peer,
                channel: 0,
                delivery: Delivery::Reliable,
                payload,
            } => {
                assert_eq!(peer, accepted);
                assert_eq!(payload, expected);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    let extra = drain_events(&mut server, Duration::from_millis(200));
    assert!(extra.is_empty(), "unexpected events {extra:?}");
    assert_eq!(peer.stats().retransmissions(), 0);
}

#[test]
fn lost_reliable_segment_is_retransmitted_once_delivered() {
    let settings = Settings::default().with_resend_timeout(Duration::from_millis(20));
    let mut server = open(settings.clone(), ConnectionTypes::ALL);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut client = Host::new().with_interceptor(Box::new(DropFirstReliable {
        dropped: Arc::clone(&dropped),
    }));
    client.open(localhost(), settings, ConnectionTypes::ALL).unwrap();
    let (_client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);

    let sent = messages(5);
    for payload in &sent {
        peer.send(payload.clone(), Delivery::Reliable).unwrap();
    }

    assert_eq!(receive(&mut server, 5), sent);
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert!(peer.stats().retransmissions() >= 1);
    assert!(drain_data(&mut server, Duration::from_millis(200)).is_empty());
}

#[test]
fn messages_on_separate_channels_are_delivered() {
    let settings = Settings::default().with_max_channels(4);
    let mut server = open(settings.clone(), ConnectionTypes::ALL);
    let client = open(settings, ConnectionTypes::ALL);
    let (_client, peer, accepted) = connect(&mut server, client, ConnectionMode::Insecure);
    assert_eq!(peer.channels(), 4);
    assert_eq!(accepted.channels(), 4);

    peer.send_on(3, Bytes::from_static(b"three"), Delivery::Semireliable)
        .unwrap();
    match wait_for(&mut server, |e| matches!(e, Event::Data { .. })) {
        Event::Data {
            channel,
            delivery,
            payload,
            ..
        } => {
            assert_eq!(channel, 3);
            assert_eq!(delivery, Delivery::Semireliable);
            assert_eq!(payload, Bytes::from_static(b"three"));
        }
        _ => unreachable!(),
    }

    let err = peer
        .send_on(4, Bytes::from_static(b"nope"), Delivery::Reliable)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::UnknownChannel { channel: 4, channels: 4 }));
}

#[test]
fn channel_count_is_the_smaller_side() {
    let mut server = open(Settings::default().with_max_channels(2), ConnectionTypes::ALL);
    let client = open(Settings::default().with_max_channels(8), ConnectionTypes::ALL);
    let (_client, peer, accepted) = connect(&mut server, client, ConnectionMode::Insecure);
    assert_eq!(peer.channels(), 2);
    assert_eq!(accepted.channels(), 2);
}

#[test]
fn oversized_payload_is_rejected() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (_client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);

    let too_big = Bytes::from(vec![0u8; peer.max_payload() + 1]);
    let err = peer.send(too_big, Delivery::Unreliable).unwrap_err();
    assert!(matches!(err, TernStreamError::PayloadTooLarge { .. }));
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn full_backlog_rejects_reliable_sends() {
    let settings = Settings::default().with_upstream(StreamSettings::new(4096, 0.1));
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let armed = Arc::new(AtomicBool::new(false));
    let mut client = Host::new().with_interceptor(Box::new(Blackhole {
        armed: Arc::clone(&armed),
    }));
    client.open(localhost(), settings, ConnectionTypes::ALL).unwrap();
    let (_client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);
    armed.store(true, Ordering::Relaxed);

    let payload = Bytes::from(vec![7u8; 1000]);
    let mut accepted_sends = 0;
    let err = loop {
        match peer.send(payload.clone(), Delivery::Reliable) {
            Ok(_) => accepted_sends += 1,
            Err(err) => break err,
        }
        assert!(accepted_sends <= 4, "backlog never filled");
    };

    assert_eq!(accepted_sends, 4);
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(matches!(
        err,
        TernStreamError::BacklogFull {
            channel: 0,
            capacity: 4096,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Secure connections
// ---------------------------------------------------------------------------

#[test]
fn secure_connection_exchanges_data() {
    let mut server = open(Settings::default(), ConnectionTypes::SECURE);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (mut client, peer, accepted) = connect(&mut server, client, ConnectionMode::Secure);
    assert_eq!(peer.mode(), ConnectionMode::Secure);
    assert_eq!(accepted.mode(), ConnectionMode::Secure);
    assert!(peer.max_payload() < ternstream::packet::max_payload(peer.mtu(), false));

    let sent = messages(3);
    for payload in &sent {
        peer.send(payload.clone(), Delivery::Reliable).unwrap();
    }
    assert_eq!(receive(&mut server, 3), sent);

    accepted
        .send(Bytes::from_static(b"reply"), Delivery::Reliable)
        .unwrap();
    assert_eq!(receive(&mut client, 1), vec![Bytes::from_static(b"reply")]);
}

#[test]
fn unaccepted_mode_is_refused() {
    let mut server = open(Settings::default(), ConnectionTypes::INSECURE);
    let mut client = open(Settings::default(), ConnectionTypes::ALL);

    let peer = client
        .connect(server.local_addr().unwrap(), ConnectionMode::Secure)
        .unwrap();
    let (disconnected, reason) = wait_for_disconnection(&mut client);
    assert_eq!(disconnected, peer);
    assert_eq!(reason, PeerReason::Refused);
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert_eq!(peer.reason(), Some(PeerReason::Refused));
    assert!(server.peers().is_empty());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn send_before_connected_fails() {
    let silent = UdpSocket::bind(localhost()).unwrap();
    let mut client = open(Settings::default(), ConnectionTypes::ALL);
    let peer = client
        .connect(silent.local_addr().unwrap(), ConnectionMode::Insecure)
        .unwrap();

    assert_eq!(peer.state(), PeerState::Connecting);
    let err = peer
        .send(Bytes::from_static(b"early"), Delivery::Reliable)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::NotConnected));
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[test]
fn unanswered_connect_is_unreachable() {
    let silent = UdpSocket::bind(localhost()).unwrap();
    let settings = Settings::default()
        .with_resend_timeout(Duration::from_millis(10))
        .with_ack_backoff(1.0)
        .with_ack_fail_limit(3);
    let mut client = open(settings, ConnectionTypes::ALL);
    let peer = client
        .connect(silent.local_addr().unwrap(), ConnectionMode::Insecure)
        .unwrap();

    let (disconnected, reason) = wait_for_disconnection(&mut client);
    assert_eq!(disconnected, peer);
    assert_eq!(reason, PeerReason::Unreachable);
}

#[test]
fn close_disconnects_both_sides() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (mut client, peer, accepted) = connect(&mut server, client, ConnectionMode::Insecure);
    assert_eq!(client.peers(), vec![peer.clone()]);
    assert_eq!(server.peer(accepted.endpoint()), Some(accepted.clone()));

    peer.send(Bytes::from_static(b"last words"), Delivery::Reliable)
        .unwrap();
    peer.close();

    assert_eq!(
        receive(&mut server, 1),
        vec![Bytes::from_static(b"last words")]
    );
    let (_, reason) = wait_for_disconnection(&mut client);
    assert_eq!(reason, PeerReason::Closed);
    let (_, reason) = wait_for_disconnection(&mut server);
    assert_eq!(reason, PeerReason::Reset);

    assert!(client.peers().is_empty());
    assert!(server.peers().is_empty());
    assert_eq!(peer.state(), PeerState::Disconnected);
}

#[test]
fn host_open_and_close_states() {
    let mut host = Host::new();
    assert!(!host.is_open());
    assert!(matches!(host.try_get_event(), Err(TernStreamError::NotOpen)));
    assert!(matches!(
        host.connect("127.0.0.1:9".parse().unwrap(), ConnectionMode::Insecure),
        Err(TernStreamError::NotOpen)
    ));

    host.open(localhost(), Settings::default(), ConnectionTypes::ALL)
        .unwrap();
    assert!(host.is_open());
    assert_ne!(host.local_addr().unwrap().port(), 0);
    let err = host
        .open(localhost(), Settings::default(), ConnectionTypes::ALL)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::AlreadyOpen));

    host.close().unwrap();
    assert!(!host.is_open());
    assert!(matches!(host.close(), Err(TernStreamError::NotOpen)));
}

#[test]
fn closing_host_disconnects_its_peers() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (mut client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);

    client.close().unwrap();
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert_eq!(peer.reason(), Some(PeerReason::Closed));

    let (_, reason) = wait_for_disconnection(&mut server);
    assert_eq!(reason, PeerReason::Reset);
}

#[test]
fn io_thread_panic_disconnects_every_peer() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let armed = Arc::new(AtomicBool::new(false));
    let mut client = Host::new().with_interceptor(Box::new(PanicOnSend {
        armed: Arc::clone(&armed),
    }));
    client
        .open(localhost(), Settings::default(), ConnectionTypes::ALL)
        .unwrap();
    let (mut client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);
    assert_eq!(peer.state(), PeerState::Connected);

    armed.store(true, Ordering::Relaxed);
    peer.send(Bytes::from_static(b"doomed"), Delivery::Reliable)
        .unwrap();

    let err = wait_for_failure(&mut client);
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(!client.is_open());
    assert!(client.peers().is_empty());
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert_eq!(peer.reason(), Some(PeerReason::Error));
    let err = peer
        .send(Bytes::from_static(b"after"), Delivery::Reliable)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::NotConnected));
    assert!(matches!(client.try_get_event(), Err(TernStreamError::NotOpen)));
}

#[test]
fn full_host_refuses_connections() {
    let mut server = open(Settings::default().with_capacity(1), ConnectionTypes::ALL);
    let first = open(Settings::default(), ConnectionTypes::ALL);
    let (_first, _peer, _accepted) = connect(&mut server, first, ConnectionMode::Insecure);

    let mut second = open(Settings::default(), ConnectionTypes::ALL);
    let peer = second
        .connect(server.local_addr().unwrap(), ConnectionMode::Insecure)
        .unwrap();
    let (disconnected, reason) = wait_for_disconnection(&mut second);
    assert_eq!(disconnected, peer);
    assert_eq!(reason, PeerReason::Refused);
}

// ---------------------------------------------------------------------------
// Fragmentation, volatile sends, termination and pinned keys
// ---------------------------------------------------------------------------

#[test]
fn large_reliable_message_arrives_whole() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (_client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);

    let large = Bytes::from((0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    assert!(large.len() > peer.max_payload());
    peer.send(large.clone(), Delivery::Reliable).unwrap();
    peer.send(Bytes::from_static(b"after"), Delivery::Reliable)
        .unwrap();
    assert_eq!(
        receive(&mut server, 2),
        vec![large, Bytes::from_static(b"after")]
    );

    let err = peer
        .send(vec![0u8; peer.max_message() + 1], Delivery::Reliable)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::PayloadTooLarge { .. }));
    let err = peer
        .send(vec![0u8; peer.max_payload() + 1], Delivery::Semireliable)
        .unwrap_err();
    assert!(matches!(err, TernStreamError::PayloadTooLarge { .. }));
}

#[test]
fn volatile_message_within_its_time_limit_is_delivered() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (_client, peer, _accepted) = connect(&mut server, client, ConnectionMode::Insecure);

    peer.send_volatile(Bytes::from_static(b"tick"), Duration::from_secs(5))
        .unwrap();
    match wait_for(&mut server, |e| matches!(e, Event::Data { .. })) {
        Event::Data { delivery, payload, .. } => {
            assert_eq!(delivery, Delivery::Unreliable);
            assert_eq!(payload, Bytes::from_static(b"tick"));
        }
        _ => unreachable!(),
    }
}

#[test]
fn terminated_peer_yields_only_its_disconnection() {
    let mut server = open(Settings::default(), ConnectionTypes::ALL);
    let client = open(Settings::default(), ConnectionTypes::ALL);
    let (mut client, peer, accepted) = connect(&mut server, client, ConnectionMode::Secure);

    for payload in messages(3) {
        accepted.send(payload, Delivery::Reliable).unwrap();
    }
    // Let the messages land in the client's queue unread.
    thread::sleep(Duration::from_millis(200));
    peer.terminate();

    let events = next_events(&mut client, 1);
    match &events[..] {
        [Event::Disconnection { peer: gone, reason }] => {
            assert_eq!(gone, &peer);
            assert_eq!(*reason, PeerReason::Closed);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(drain_events(&mut client, Duration::from_millis(100)).is_empty());
    assert!(client.peers().is_empty());

    let (_, reason) = wait_for_disconnection(&mut server);
    assert_eq!(reason, PeerReason::Reset);
}

#[test]
fn pinned_key_connects_only_to_its_owner() {
    init_tracing();
    let identity = Key::from_bytes([0x42; 32]);
    let mut server = Host::new().with_private_key(identity);
    server
        .open(localhost(), Settings::default(), ConnectionTypes::SECURE)
        .unwrap();
    let server_key = server.public_key().unwrap();
    let remote = server.local_addr().unwrap();

    let mut trusting = open(Settings::default(), ConnectionTypes::ALL);
    let peer = trusting.connect_with_key(remote, server_key.clone()).unwrap();
    assert_eq!(peer.mode(), ConnectionMode::Secure);
    assert_eq!(peer.pinned_key(), Some(&server_key));
    assert_eq!(wait_for_connection(&mut trusting), peer);
    let accepted = wait_for_connection(&mut server);
    peer.send(Bytes::from_static(b"hello"), Delivery::Reliable)
        .unwrap();
    assert_eq!(receive(&mut server, 1), vec![Bytes::from_static(b"hello")]);
    assert_eq!(accepted.mode(), ConnectionMode::Secure);

    let mut suspicious = open(Settings::default(), ConnectionTypes::ALL);
    let wrong = Key::from_bytes([0x17; 32]);
    let peer = suspicious.connect_with_key(remote, wrong).unwrap();
    let (disconnected, reason) = wait_for_disconnection(&mut suspicious);
    assert_eq!(disconnected, peer);
    assert_eq!(reason, PeerReason::Error);
}
