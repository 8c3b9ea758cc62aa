//! Manual exercise binary for `coserver-client`: connects to whatever
//! broker endpoint discovery resolves to, logs every event, and relays
//! lines typed on stdin as broadcast `LINE` messages.
//!
//! Run with `RUST_LOG=debug cargo run --example demo_client`.

use std::io::BufRead;
use std::sync::mpsc;
use std::time::Duration;

use coserver_client::{Event, Message, Session};

fn main() {
    env_logger::init();

    let on_event: coserver_client::EventSink = Box::new(|event| match event {
        Event::Connected(endpoint) => println!("connected to {endpoint}"),
        Event::Disconnected => println!("disconnected"),
        Event::UnableToConnect => println!("unable to connect to any candidate"),
        Event::ReceivedId(id) => println!("assigned id {id}"),
        Event::ClientRegistered(id) => println!("peer {id} registered"),
        Event::ClientNew(id) => println!("peer {id} online"),
        Event::ClientRename(id) => println!("peer {id} renamed"),
        Event::ClientGone(id) => println!("peer {id} offline"),
        Event::ClientUnregistered(id) => println!("peer {id} unregistered"),
        Event::ReceivedMessage { from, message, .. } => {
            println!("message from {from}: {} {:?}", message.command(), message.common_values());
        }
        Event::AddressListChanged => println!("peer list changed"),
    });

    let mut session = Session::discover("diana-demo", Vec::new(), on_event);
    session.connect();

    let (line_tx, line_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        session.pump();

        match line_rx.try_recv() {
            Ok(line) if line == "quit" => break,
            Ok(line) => {
                let mut message = Message::new("LINE");
                message.add_common("text", line);
                session.send(Vec::new(), message);
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    session.disconnect();
}
