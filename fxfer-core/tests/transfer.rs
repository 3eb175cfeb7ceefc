//! Two engines talking over a Unix socket pair, each with its own pump thread.

use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fxfer_core::integrity;
use fxfer_core::parser::Step;
use fxfer_core::wire::encode_packet;
use fxfer_core::{
    Config, Fault, FrameBuffer, MemoryStorage, Message, MessageId, NackCode, Parser, Progress,
    RequestError, SessionState, XferCore,
};

type Core = XferCore<UnixStream, MemoryStorage>;

/// Start an engine on `stream` with its pump running on a background thread.
fn spawn_end(stream: &UnixStream, config: Config, storage: MemoryStorage) -> (Core, JoinHandle<()>) {
    let core = XferCore::new(config, stream.try_clone().unwrap(), storage).unwrap();
    let mut pump = core.pump(stream.try_clone().unwrap());
    let handle = thread::spawn(move || loop {
        if let Progress::Fault(Fault::Read(_)) = pump.step() {
            break;
        }
    });
    (core, handle)
}

struct Link {
    a: Core,
    b: Core,
    streams: (UnixStream, UnixStream),
    pumps: Vec<JoinHandle<()>>,
}

impl Link {
    fn new(config: Config, a_files: MemoryStorage, b_files: MemoryStorage) -> Self {
        let (sa, sb) = UnixStream::pair().unwrap();
        let (a, pa) = spawn_end(&sa, config.clone(), a_files);
        let (b, pb) = spawn_end(&sb, config, b_files);
        Self {
            a,
            b,
            streams: (sa, sb),
            pumps: vec![pa, pb],
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.streams.0.shutdown(Shutdown::Both);
        let _ = self.streams.1.shutdown(Shutdown::Both);
        for p in self.pumps.drain(..) {
            let _ = p.join();
        }
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn storage(files: &[(&str, Vec<u8>)]) -> MemoryStorage {
    let mut s = MemoryStorage::new();
    for (name, data) in files {
        s.insert(*name, data.clone());
    }
    s
}

#[test]
fn handshake_list_hash_and_send() {
    let link = Link::new(
        Config::default(),
        storage(&[("a.bin", sample(600))]),
        storage(&[("notes.txt", b"hello".to_vec()), ("readme", sample(40))]),
    );
    link.a.initiate_handshake(256).unwrap();
    assert!(link.a.handshake_done());
    assert!(link.b.handshake_done());
    assert_eq!(link.a.peer_window(), 256);
    assert_eq!(link.b.peer_window(), 256);

    let list = link.a.request_file_list().unwrap();
    assert_eq!(list.names, vec!["notes.txt".to_string(), "readme".to_string()]);

    let hash = link.a.request_file_hash("notes.txt").unwrap();
    assert_eq!(hash, integrity::checksum(b"hello"));

    assert_eq!(link.a.send_file("a.bin").unwrap(), 600);
    assert_eq!(
        link.b.with_storage(|s| s.get("a.bin").map(<[u8]>::to_vec)),
        Some(sample(600))
    );
    assert_eq!(link.b.session_state(), SessionState::Idle);
    assert_eq!(link.a.session_state(), SessionState::Idle);

    // Either end may ask once the handshake is done.
    let hash = link.b.request_file_hash("a.bin").unwrap();
    assert_eq!(hash, integrity::checksum(&sample(600)));
}

#[test]
fn send_sizes_around_chunk_boundaries() {
    let config = Config {
        window_size: 32,
        ..Config::default()
    };
    let files = [
        ("exact.bin", sample(90)),
        ("one.bin", sample(1)),
        ("empty.bin", Vec::new()),
        ("odd.bin", sample(31)),
    ];
    let link = Link::new(config, storage(&files), MemoryStorage::new());
    link.a.initiate_handshake(32).unwrap();
    for (name, data) in &files {
        assert_eq!(link.a.send_file(name).unwrap(), data.len() as u64);
        assert_eq!(
            link.b.with_storage(|s| s.get(name).map(<[u8]>::to_vec)).as_ref(),
            Some(data),
            "{}",
            name
        );
    }
}

#[test]
fn smaller_peer_window_limits_chunks() {
    let small = Config {
        window_size: 16,
        ..Config::default()
    };
    let (sa, sb) = UnixStream::pair().unwrap();
    let (a, pa) = spawn_end(&sa, Config::default(), storage(&[("big.bin", sample(500))]));
    let (b, pb) = spawn_end(&sb, small, MemoryStorage::new());
    a.initiate_handshake(256).unwrap();
    assert_eq!(a.peer_window(), 16);
    a.send_file("big.bin").unwrap();
    assert_eq!(b.with_storage(|s| s.get("big.bin").map(<[u8]>::to_vec)), Some(sample(500)));
    sa.shutdown(Shutdown::Both).unwrap();
    sb.shutdown(Shutdown::Both).unwrap();
    pa.join().unwrap();
    pb.join().unwrap();
}

#[test]
fn missing_file_hash_is_nacked() {
    let link = Link::new(Config::default(), MemoryStorage::new(), MemoryStorage::new());
    link.a.initiate_handshake(256).unwrap();
    let err = link.a.request_file_hash("nope").unwrap_err();
    assert!(matches!(err, RequestError::Nack(NackCode::BadRequest)));
    assert_eq!(link.a.session_state(), SessionState::Idle);
    // The session is usable afterwards.
    assert!(link.a.request_file_list().unwrap().is_empty());
}

#[test]
fn oversized_send_fails_before_touching_receiver() {
    let config = Config {
        window_size: 16,
        ..Config::default()
    };
    // Chunks of 14 bytes: one byte past 65 536 segments.
    let size = 14 * 65_536 + 1;
    let link = Link::new(
        config,
        storage(&[("big.bin", vec![0x5A; size])]),
        storage(&[("big.bin", b"precious contents".to_vec())]),
    );
    link.a.initiate_handshake(16).unwrap();
    assert!(matches!(
        link.a.send_file("big.bin"),
        Err(RequestError::Plan(fxfer_core::PlanError::TooManySegments { .. }))
    ));
    assert_eq!(link.a.session_state(), SessionState::Idle);
    assert_eq!(link.b.session_state(), SessionState::Idle);
    assert_eq!(
        link.b.with_storage(|s| s.get("big.bin").map(<[u8]>::to_vec)),
        Some(b"precious contents".to_vec())
    );
    // The receiver is still free to start its own requests.
    assert_eq!(link.b.request_file_list().unwrap().names, vec!["big.bin".to_string()]);
}

#[test]
fn requests_before_handshake_are_refused() {
    let link = Link::new(
        Config::default(),
        storage(&[("a.bin", sample(10))]),
        storage(&[("b.bin", sample(10))]),
    );
    assert!(matches!(
        link.a.request_file_list(),
        Err(RequestError::Nack(NackCode::NoHandshake))
    ));
    assert!(matches!(
        link.a.send_file("a.bin"),
        Err(RequestError::Nack(NackCode::NoHandshake))
    ));
    assert!(link.b.with_storage(|s| s.get("a.bin").is_none()));
}

#[test]
fn silent_peer_times_out() {
    let (sa, _silent) = UnixStream::pair().unwrap();
    let config = Config {
        response_timeout_ms: 50,
        ..Config::default()
    };
    let (a, pa) = spawn_end(&sa, config, MemoryStorage::new());
    assert!(matches!(
        a.initiate_handshake(256),
        Err(RequestError::Timeout(SessionState::WaitHandshake))
    ));
    assert_eq!(a.session_state(), SessionState::Idle);
    sa.shutdown(Shutdown::Both).unwrap();
    pa.join().unwrap();
}

/// Raw end of a socket pair for byte-level tests against one engine.
struct Probe {
    stream: UnixStream,
    parser: Parser,
}

impl Probe {
    fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            parser: Parser::new(1024),
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn next_packet(&mut self) -> (MessageId, Vec<u8>) {
        loop {
            match self.parser.step(&mut self.stream) {
                Step::Advanced => {}
                Step::Packet { kind, payload } => return (kind, payload.to_vec()),
                Step::Fault(f) => panic!("probe: {}", f),
            }
        }
    }
}

fn frame(msg: &Message<'_>) -> Vec<u8> {
    let mut buf = FrameBuffer::for_payload(1024);
    encode_packet(&mut buf, msg).unwrap().to_vec()
}

#[test]
fn corrupted_packet_gets_wrong_crc() {
    let (sa, sb) = UnixStream::pair().unwrap();
    let (a, pa) = spawn_end(&sa, Config::default(), MemoryStorage::new());
    let mut probe = Probe::new(sb);

    let mut bad = frame(&Message::HandshakeReq { window: 64 });
    bad[7] ^= 0x01;
    probe.send_raw(&bad);
    let (kind, payload) = probe.next_packet();
    assert_eq!(kind, MessageId::Nack);
    assert_eq!(payload, vec![NackCode::WrongCrc.as_byte()]);
    assert!(!a.handshake_done());

    // Garbage then a good packet: the engine resynchronizes.
    let mut bytes = vec![0x00, 0xEF, 0x42];
    bytes.extend(frame(&Message::HandshakeReq { window: 64 }));
    probe.send_raw(&bytes);
    let (kind, payload) = probe.next_packet();
    assert_eq!(kind, MessageId::HandshakeRes);
    assert_eq!(payload, 256u16.to_le_bytes().to_vec());
    assert!(a.handshake_done());
    assert_eq!(a.peer_window(), 64);

    probe.stream.shutdown(Shutdown::Both).unwrap();
    pa.join().unwrap();
}

#[test]
fn unknown_id_is_dropped_silently() {
    let (sa, sb) = UnixStream::pair().unwrap();
    let (a, pa) = spawn_end(&sa, Config::default(), MemoryStorage::new());
    let mut probe = Probe::new(sb);

    let mut unknown = frame(&Message::Ack);
    unknown[4] = 42;
    let at = unknown.len() - 4;
    let crc = integrity::checksum(&unknown[..at]);
    unknown[at..].copy_from_slice(&crc.to_le_bytes());
    probe.send_raw(&unknown);
    probe.send_raw(&frame(&Message::HandshakeReq { window: 128 }));

    // The first reply is the handshake response; nothing was sent for id 42.
    let (kind, _) = probe.next_packet();
    assert_eq!(kind, MessageId::HandshakeRes);
    assert_eq!(a.peer_window(), 128);

    probe.stream.shutdown(Shutdown::Both).unwrap();
    pa.join().unwrap();
}

#[test]
fn peer_disconnect_aborts_waiting_request() {
    let (sa, sb) = UnixStream::pair().unwrap();
    let config = Config {
        response_timeout_ms: 5_000,
        ..Config::default()
    };
    let (a, pa) = spawn_end(&sa, config, MemoryStorage::new());
    let requester = {
        let a = a.clone();
        thread::spawn(move || a.initiate_handshake(256))
    };
    let mut probe = Probe::new(sb);
    let (kind, _) = probe.next_packet();
    assert_eq!(kind, MessageId::HandshakeReq);
    drop(probe);
    let err = requester.join().unwrap().unwrap_err();
    assert!(matches!(err, RequestError::Aborted));
    assert_eq!(a.session_state(), SessionState::Idle);
    pa.join().unwrap();
}
