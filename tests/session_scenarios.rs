//! End-to-end scenarios against a hand-rolled fake broker over real TCP
//! sockets, exercising `Session` the way a live broker would drive it —
//! as opposed to the mock-free unit tests colocated with each module.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coserver_client::codec::{Codec, DecodedFrame, FrameDecoder};
use coserver_client::spawner::Spawner;
use coserver_client::{Endpoint, Event, EventSink, Message, Session};

/// A minimal broker driven entirely by a list of scripted responses: for
/// every inbound frame, `on_frame` decides what (if anything) to write
/// back. Runs on its own thread so the test body can drive `Session`
/// exactly as an application would.
struct FakeBroker {
    stream: TcpStream,
    codec: Codec,
    decoder: FrameDecoder,
}

impl FakeBroker {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            stream,
            codec: Codec::new(true),
            decoder: FrameDecoder::new(),
        }
    }

    fn recv(&mut self) -> Message {
        use std::io::Read;
        loop {
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "broker-side stream closed while awaiting a frame");
            for body in self.decoder.feed(&buf[..n]) {
                if let Some(DecodedFrame::ClientToServer { message, .. }) = self.codec.decode(&body).unwrap() {
                    return message;
                }
            }
        }
    }

    fn send(&mut self, message: &Message) {
        use std::io::Write;
        let bytes = self.codec.encode_from(0, message);
        self.stream.write_all(&bytes).unwrap();
    }

    fn registered_client(my_id: i32, rows: &[(i32, &str, &str)]) -> Message {
        let mut m = Message::new("registeredclient");
        m.add_common("id", my_id.to_string());
        m.add_data_desc("id");
        m.add_data_desc("type");
        m.add_data_desc("name");
        for (id, t, n) in rows {
            m.add_data_values(vec![id.to_string(), (*t).to_string(), (*n).to_string()]);
        }
        m
    }
}

fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let on_event: EventSink = Box::new(move |evt| sink.lock().unwrap().push(evt));
    (on_event, events)
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[derive(Debug, Default, Clone)]
struct AutoStartSpawner {
    calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl Spawner for AutoStartSpawner {
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<()> {
        self.calls.lock().unwrap().push((command.to_string(), args.to_vec()));
        let port: u16 = args
            .last()
            .and_then(|url| url.rsplit(':').next())
            .and_then(|p| p.parse().ok())
            .expect("spawn args carry a co4://host:port url");

        std::thread::spawn(move || {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
                let mut broker = FakeBroker::accept(&listener);
                let handshake = broker.recv();
                assert_eq!(handshake.command(), "SETTYPE");
                broker.send(&FakeBroker::registered_client(7, &[]));
                broker.recv(); // SETPEERS
            }
        });
        Ok(())
    }
}

/// Scenario 1: cold start, local broker absent, auto-start succeeds.
#[test]
fn cold_start_auto_starts_local_broker() {
    let port = free_port();
    let spawner = AutoStartSpawner::default();
    let calls = Arc::clone(&spawner.calls);

    let (on_event, events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![Endpoint::tcp("127.0.0.1", port)],
        "coserver4".to_string(),
        true,
        Arc::new(spawner),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    assert!(wait_until(Duration::from_secs(3), || !calls.lock().unwrap().is_empty()));
    let recorded = calls.lock().unwrap().clone();
    assert_eq!(recorded[0].0, "coserver4");
    assert_eq!(recorded[0].1, vec!["-d".to_string(), "-u".to_string(), format!("co4://:{port}")]);

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.my_id() == 7
    }));
    assert!(events.lock().unwrap().iter().any(|e| matches!(e, Event::ReceivedId(7))));
}

/// Scenario 2: peer registration then connect.
#[test]
fn peer_registers_then_comes_online() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let broker_thread = std::thread::spawn(move || {
        let mut broker = FakeBroker::accept(&listener);
        let handshake = broker.recv();
        assert_eq!(handshake.command(), "SETTYPE");

        broker.send(&FakeBroker::registered_client(7, &[(12, "diana", "diana-a")]));
        let set_peers = broker.recv();
        assert_eq!(set_peers.command(), "SETPEERS");
        assert_eq!(set_peers.data_rows(), &[vec!["12".to_string()]]);

        let mut new_client = Message::new("newclient");
        new_client.add_common("id", "12");
        broker.send(&new_client);
    });

    let (on_event, events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![Endpoint::tcp("127.0.0.1", port)],
        "coserver4".to_string(),
        false,
        Arc::new(AutoStartSpawner::default()),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.peer_name(12) == Some("diana-a") && matches!(session.peer_type(12), Some("diana"))
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        events.lock().unwrap().iter().any(|e| matches!(e, Event::ClientNew(12)))
    }));
    assert!(session.has_client_of_type("diana"));

    broker_thread.join().unwrap();
}

/// Scenario 3: subscription filtering and a rename of a subscribed peer.
#[test]
fn subscription_filter_and_rename_resend_set_peers() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let broker_thread = std::thread::spawn(move || {
        let mut broker = FakeBroker::accept(&listener);
        broker.recv(); // SETTYPE

        broker.send(&FakeBroker::registered_client(
            7,
            &[(12, "diana", "diana-a"), (13, "diana", "diana-b")],
        ));
        let initial_set_peers = broker.recv();
        let mut rows: Vec<String> = initial_set_peers.data_rows().iter().map(|r| r[0].clone()).collect();
        rows.sort();
        assert_eq!(rows, vec!["12".to_string(), "13".to_string()]);

        let filtered = broker.recv();
        assert_eq!(filtered.data_rows(), &[vec!["13".to_string()]]);

        let mut rename = Message::new("renameclient");
        rename.add_common("id", "13");
        rename.add_common("name", "diana-c");
        broker.send(&rename);

        let after_rename = broker.recv();
        assert_eq!(after_rename.data_rows(), &[vec!["13".to_string()]]);
    });

    let (on_event, _events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![Endpoint::tcp("127.0.0.1", port)],
        "coserver4".to_string(),
        false,
        Arc::new(AutoStartSpawner::default()),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.known_ids().len() == 2
    }));

    session.set_selected_peer_names(vec!["diana-b".to_string()]);

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.peer_name(13) == Some("diana-c")
    }));

    broker_thread.join().unwrap();
}

/// Scenario 4: remote close, then reconnect to the same candidate, with
/// the peer table cleared in between and repopulated afresh.
#[test]
fn remote_close_reconnects_and_clears_peer_table() {
    let port = free_port();

    let (on_event, events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![Endpoint::tcp("127.0.0.1", port)],
        "coserver4".to_string(),
        false,
        Arc::new(AutoStartSpawner::default()),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let mut broker = FakeBroker::accept(&listener);
        broker.recv();
        broker.send(&FakeBroker::registered_client(7, &[(12, "diana", "diana-a")]));
        broker.recv();
        // listener and broker both dropped here, closing the transport.
    }

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        events.lock().unwrap().iter().any(|e| matches!(e, Event::Disconnected))
    }));
    assert_eq!(session.known_ids().len(), 0);

    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let broker_thread = std::thread::spawn(move || {
        let mut broker = FakeBroker::accept(&listener);
        broker.recv();
        broker.send(&FakeBroker::registered_client(9, &[]));
        broker.recv();
    });

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.my_id() == 9
    }));
    broker_thread.join().unwrap();
}

/// Scenario 5: the candidate list is exhausted by failures on
/// non-local-looking hosts, and neither one ever triggers an auto-start
/// (only a local-ish candidate refusal is eligible for that).
#[test]
fn failover_skips_non_local_candidates_without_spawn() {
    let unreachable = Endpoint::tcp("203.0.113.1", 1); // TEST-NET-3, reserved non-routable.
    let refused_port = free_port();

    let spawner = AutoStartSpawner::default();
    let calls = Arc::clone(&spawner.calls);

    let (on_event, events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![unreachable, Endpoint::tcp("remotehost.example", refused_port)],
        "coserver4".to_string(),
        true,
        Arc::new(spawner),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    assert!(wait_until(Duration::from_secs(8), || {
        session.pump();
        events.lock().unwrap().iter().any(|e| matches!(e, Event::UnableToConnect))
    }));
    assert!(calls.lock().unwrap().is_empty(), "non-local candidate must never trigger auto-start");
}

/// Scenario 6: V0 then V1 negotiation — confirmed at the codec layer
/// (unit-tested in `codec.rs`) and observed end-to-end here: the session
/// keeps working after the broker upgrades it mid-stream.
#[test]
fn session_keeps_working_across_protocol_upgrade() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let broker_thread = std::thread::spawn(move || {
        let mut broker = FakeBroker::accept(&listener);
        broker.recv(); // SETTYPE, written and read as V0

        // Write the reply as a V1 frame; the client's codec observes the
        // magic sentinel and bumps its own protocol version to match.
        broker.codec = Codec::with_version(true, 1);
        broker.send(&FakeBroker::registered_client(7, &[]));
        let set_peers = broker.recv();
        assert_eq!(set_peers.command(), "SETPEERS");
    });

    let (on_event, _events) = collecting_sink();
    let mut session = Session::new(
        "diana",
        "alice",
        vec![Endpoint::tcp("127.0.0.1", port)],
        "coserver4".to_string(),
        false,
        Arc::new(AutoStartSpawner::default()),
        "thishost".to_string(),
        on_event,
    );
    session.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        session.pump();
        session.my_id() == 7
    }));

    broker_thread.join().unwrap();
}
