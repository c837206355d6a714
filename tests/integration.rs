use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use nsq_client::{
    CallbackOutcome, Client, ClientConfig, ConnectionManager, ConsistencyLevel, DedupeService, LookupService, Message,
};

fn init_logging() {
    let _ = env_logger::try_init();
}

fn read_magic(stream: &mut TcpStream) {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).expect("read MAGIC");
    assert_eq!(b"  V2", &magic);
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("read command line");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).expect("command line is ASCII")
}

fn read_pub_body(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let line = read_line(stream);
    let topic = line.strip_prefix("PUB ").expect("PUB command").to_owned();
    let len = stream.read_u32::<BigEndian>().expect("PUB body length") as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("PUB body");
    (topic, body)
}

fn write_response(stream: &mut TcpStream, body: &[u8]) {
    write_frame(stream, 0, body);
}

fn write_error(stream: &mut TcpStream, body: &[u8]) {
    write_frame(stream, 1, body);
}

fn write_message(stream: &mut TcpStream, id: &[u8; 16], body: &[u8]) {
    let mut payload = Vec::new();
    payload.write_i64::<BigEndian>(1_700_000_000).unwrap();
    payload.write_u16::<BigEndian>(1).unwrap();
    payload.extend_from_slice(id);
    payload.extend_from_slice(body);
    write_frame(stream, 2, &payload);
}

fn write_frame(stream: &mut TcpStream, frame_type: u32, payload: &[u8]) {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.write_u32::<BigEndian>((4 + payload.len()) as u32).unwrap();
    out.write_u32::<BigEndian>(frame_type).unwrap();
    out.extend_from_slice(payload);
    stream.write_all(&out).expect("write frame");
}

/// Accepts up to `accepts` successive connections on a loopback listener,
/// running `behavior` against each in turn. Mirrors the way the client
/// reconnects between `try_func` attempts. Gives up after two seconds so a
/// node the client never ends up contacting (e.g. because quorum was
/// already met by others) doesn't hang the test.
fn spawn_mock_broker<F>(accepts: usize, behavior: F) -> (String, JoinHandle<()>)
where
    F: Fn(&mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    listener.set_nonblocking(true).unwrap();

    let handle = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut handled = 0;

        while handled < accepts && Instant::now() < deadline {
            match listener.accept() {
                Ok((stream, _)) => {
                    let mut stream = stream;
                    stream.set_nonblocking(false).unwrap();
                    behavior(&mut stream);
                    handled += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
    });

    (addr, handle)
}

struct FixedLookup {
    hosts: Vec<String>,
}

impl LookupService for FixedLookup {
    fn lookup_hosts(&self, _topic: &str) -> Result<Vec<String>, nsq_client::NsqError> {
        Ok(self.hosts.clone())
    }
}

#[derive(Default)]
struct RecordingDedupe {
    seen: Mutex<Vec<String>>,
    hit_next: std::sync::atomic::AtomicBool,
}

impl DedupeService for RecordingDedupe {
    fn contains_and_add(&self, _topic: &str, _channel: &str, message: &Message) -> bool {
        let already_hit = self.hit_next.swap(false, Ordering::SeqCst);
        self.seen.lock().unwrap().push(message.id());
        already_hit
    }

    fn erase(&self, _topic: &str, _channel: &str, message: &Message) {
        self.seen.lock().unwrap().retain(|id| id != &message.id());
    }
}

#[test]
fn publish_pub_one_succeeds_on_first_attempt() {
    init_logging();
    ConnectionManager::reset_for_test();

    let (addr, broker) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        let (topic, body) = read_pub_body(stream);
        assert_eq!("t", topic);
        assert_eq!(b"hello", body.as_slice());
        write_response(stream, b"OK");
    });

    let mut client = Client::new(ClientConfig::default()).unwrap();
    client.publish_to(addr.as_str(), ConsistencyLevel::One).unwrap();
    let achieved = client.publish("t", b"hello").unwrap();

    assert_eq!(1, achieved);
    broker.join().unwrap();
}

#[test]
fn publish_pub_quorum_tolerates_one_failing_node() {
    init_logging();
    ConnectionManager::reset_for_test();

    let (addr_a, broker_a) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        read_pub_body(stream);
        write_response(stream, b"OK");
    });
    let (addr_b, broker_b) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        read_pub_body(stream);
        write_response(stream, b"OK");
    });
    // tries=2 means up to 3 attempts, each a fresh TCP connection.
    let (addr_c, broker_c) = spawn_mock_broker(3, |stream| {
        read_magic(stream);
        read_pub_body(stream);
        write_error(stream, b"E_PUB_FAILED");
    });

    let mut client = Client::new(ClientConfig::default()).unwrap();
    let hosts = vec![addr_a.clone(), addr_b.clone(), addr_c.clone()];
    client.publish_to(hosts, ConsistencyLevel::Quorum).unwrap();
    let achieved = client.publish("t", b"hello").unwrap();

    assert_eq!(2, achieved);
    broker_a.join().unwrap();
    broker_b.join().unwrap();
    let _ = broker_c.join();
}

#[test]
fn publish_pub_two_fails_when_every_node_errors() {
    init_logging();
    ConnectionManager::reset_for_test();

    let brokers: Vec<_> = (0..3)
        .map(|_| {
            spawn_mock_broker(3, |stream| {
                read_magic(stream);
                read_pub_body(stream);
                write_error(stream, b"E_PUB_FAILED");
            })
        })
        .collect();
    let hosts: Vec<String> = brokers.iter().map(|(addr, _)| addr.clone()).collect();

    let mut client = Client::new(ClientConfig::default()).unwrap();
    client.publish_to(hosts, ConsistencyLevel::Two).unwrap();
    let result = client.publish("t", b"hello");

    assert!(result.is_err());
    for (_, handle) in brokers {
        let _ = handle.join();
    }
}

#[test]
fn publish_replies_nop_to_a_heartbeat_before_completing() {
    init_logging();
    ConnectionManager::reset_for_test();

    let (addr, broker) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        read_pub_body(stream);
        write_response(stream, b"_heartbeat_");

        let nop = read_line(stream);
        assert_eq!("NOP", nop);

        write_response(stream, b"OK");
    });

    let mut client = Client::new(ClientConfig::default()).unwrap();
    client.publish_to(addr.as_str(), ConsistencyLevel::One).unwrap();
    let achieved = client.publish("t", b"hello").unwrap();

    assert_eq!(1, achieved);
    broker.join().unwrap();
}

#[test]
fn subscribe_happy_path_acks_with_fin_and_rdy() {
    init_logging();

    let (addr, broker) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        let sub = read_line(stream);
        assert_eq!("SUB t c", sub);
        let rdy = read_line(stream);
        assert_eq!("RDY 1", rdy);

        write_message(stream, b"0123456789abcdef", b"x");

        let fin = read_line(stream);
        assert_eq!("FIN 0123456789abcdef", fin);
        let rdy_again = read_line(stream);
        assert_eq!("RDY 1", rdy_again);
    });

    let config = ClientConfig::builder()
        .lookup(Arc::new(FixedLookup { hosts: vec![addr] }))
        .build();
    let mut client = Client::new(config).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let received_in_callback = received.clone();
    client
        .subscribe("t", "c", move |_msg: &Message| {
            received_in_callback.fetch_add(1, Ordering::SeqCst);
            CallbackOutcome::Ack
        })
        .unwrap();

    client.run(Some(Duration::from_millis(300))).unwrap();

    assert_eq!(1, received.load(Ordering::SeqCst));
    broker.join().unwrap();
}

#[test]
fn subscribe_requeue_emits_req_without_fin() {
    init_logging();

    let (addr, broker) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        read_line(stream);
        read_line(stream);

        write_message(stream, b"0123456789abcdef", b"x");

        let req = read_line(stream);
        assert_eq!("REQ 0123456789abcdef 500", req);
        let rdy_again = read_line(stream);
        assert_eq!("RDY 1", rdy_again);
    });

    let config = ClientConfig::builder()
        .lookup(Arc::new(FixedLookup { hosts: vec![addr] }))
        .build();
    let mut client = Client::new(config).unwrap();

    client
        .subscribe("t", "c", move |_msg: &Message| CallbackOutcome::Requeue(500))
        .unwrap();

    client.run(Some(Duration::from_millis(300))).unwrap();

    broker.join().unwrap();
}

#[test]
fn subscribe_skips_callback_on_dedupe_hit_but_still_acks() {
    init_logging();

    let (addr, broker) = spawn_mock_broker(1, |stream| {
        read_magic(stream);
        read_line(stream);
        read_line(stream);

        write_message(stream, b"0123456789abcdef", b"x");

        let fin = read_line(stream);
        assert_eq!("FIN 0123456789abcdef", fin);
        read_line(stream);
    });

    let dedupe = Arc::new(RecordingDedupe::default());
    dedupe.hit_next.store(true, Ordering::SeqCst);

    let config = ClientConfig::builder()
        .lookup(Arc::new(FixedLookup { hosts: vec![addr] }))
        .dedupe(dedupe)
        .build();
    let mut client = Client::new(config).unwrap();

    let called = Arc::new(AtomicUsize::new(0));
    let called_in_callback = called.clone();
    client
        .subscribe("t", "c", move |_msg: &Message| {
            called_in_callback.fetch_add(1, Ordering::SeqCst);
            CallbackOutcome::Ack
        })
        .unwrap();

    client.run(Some(Duration::from_millis(300))).unwrap();

    assert_eq!(0, called.load(Ordering::SeqCst));
    broker.join().unwrap();
}
