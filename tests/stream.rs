//! TLS over byte streams, using the rustls engine. Short engine writes use
//! the toy engine, which can cap what one write accepts.


use engine_common::*;
use fifotls::certificate::TEST_CERT_HOST;
use fifotls::{
    AlpnProto, ClientParams, HandshakeFailure, HandshakeState, Role, SendParams, TlsEngine,
    TransportProto, CTRL_BYTES,
};

fn stream() -> ClientParams {
    ClientParams::new(TransportProto::Stream)
}

#[test]
fn client_without_hostname_connects() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let pair = Pair::connect(&main, stream(), &[]);

    let client = pair.worker.get(pair.client).expect("client context");
    let server = pair.worker.get(pair.server).expect("server context");
    assert!(client.is_hs_done());
    assert!(server.is_hs_done());
    assert_eq!(client.role(), Some(Role::Client));
    assert_eq!(server.role(), Some(Role::Server));
    assert_eq!(client.engine(), "rustls");
    assert!(client.cipher_name().is_some());

    assert_eq!(
        pair.tp.count(|e| matches!(e, Event::Connected(c, _) if *c == pair.client)),
        1
    );
    assert_eq!(
        pair.tp.count(|e| matches!(e, Event::Accepted(s, _) if *s == pair.server)),
        1
    );
    assert_eq!(pair.tp.count(|e| matches!(e, Event::ConnectFailed(..))), 0);
}

#[test]
fn client_with_matching_hostname_connects() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let pair = Pair::connect(&main, stream().with_hostname(TEST_CERT_HOST), &[]);

    let client = pair.worker.get(pair.client).expect("client context");
    assert!(client.is_hs_done());
    assert_eq!(client.hostname(), Some(TEST_CERT_HOST));
    assert_eq!(pair.tp.count(|e| matches!(e, Event::ConnectFailed(..))), 0);
}

#[test]
fn client_with_mismatched_hostname_fails() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let pair = Pair::connect(&main, stream().with_hostname("example.com"), &[]);

    let client = pair.worker.get(pair.client).expect("client context");
    assert!(!client.is_hs_done());
    assert_eq!(client.hs_state(), HandshakeState::Failed);
    assert!(client.app().is_none());

    let failed = pair
        .tp
        .events()
        .iter()
        .find_map(|e| match e {
            Event::ConnectFailed(c, reason) if *c == pair.client => Some(reason.clone()),
            _ => None,
        })
        .expect("connect failure reported");
    assert!(matches!(failed, HandshakeFailure::Verification(_)));
    assert!(pair.tp.has(&Event::Disconnect(pair.client_ts)));
    assert_eq!(
        pair.tp.count(|e| matches!(e, Event::Connected(c, _) if *c == pair.client)),
        0
    );
}

#[test]
fn data_round_trip() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let mut pair = Pair::connect(&main, stream(), &[]);

    assert_eq!(pair.client_to_server(b"hello"), b"hello");
    assert_eq!(pair.server_to_client(b"world"), b"world");

    let big: Vec<u8> = (0..12_000u32).map(|i| i as u8).collect();
    assert_eq!(pair.client_to_server(&big), big);

    let server_app = pair.server_app();
    assert!(pair.tp.has(&Event::AppRx(server_app)));
}

#[test]
fn read_without_input_is_silent() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let mut pair = Pair::connect(&main, stream(), &[]);
    // Session tickets and the like.
    pair.read(pair.client);
    pair.read(pair.server);
    pair.tp.take_events();

    assert_eq!(pair.read(pair.server), 0);
    assert_eq!(pair.read(pair.client), 0);
    assert!(pair.tp.events().is_empty(), "{:?}", pair.tp.events());
}

#[test]
fn alpn_is_negotiated() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let params = stream().with_alpn(&[AlpnProto::Http1]);
    let pair = Pair::connect(&main, params, &[AlpnProto::Http2, AlpnProto::Http1]);

    let client = pair.worker.get(pair.client).expect("client context");
    let server = pair.worker.get(pair.server).expect("server context");
    assert_eq!(client.alpn_selected(), Some(AlpnProto::Http1));
    assert_eq!(server.alpn_selected(), Some(AlpnProto::Http1));
}

#[test]
fn handshake_done_is_reported_once() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let mut pair = Pair::connect(&main, stream(), &[]);

    for _ in 0..3 {
        pair.client_to_server(b"ping");
        pair.server_to_client(b"pong");
    }
    assert_eq!(pair.tp.count(|e| matches!(e, Event::Connected(..))), 1);
    assert_eq!(pair.tp.count(|e| matches!(e, Event::Accepted(..))), 1);
}

#[test]
fn write_beyond_budget_deschedules() {
    let _ = env_logger::try_init();

    let fifo_size = 8 * 1024;
    let main = rustls_main();
    let mut pair = Pair::connect_with(&main, stream(), &[], fifo_size, None);
    pair.read(pair.client);
    pair.tp.take_events();

    let budget = pair.tp.get(pair.server_ts).tx_fifo.borrow().max_enqueue();
    assert_eq!(budget, fifo_size);

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let app = pair.server_app();
    pair.tp.app_send(app, &data);

    let mut sp = SendParams::new(usize::MAX);
    let wrote = pair
        .worker
        .write(&mut pair.tp, pair.server, &mut sp)
        .expect("first write");
    assert_eq!(wrote, data.len().min(budget - CTRL_BYTES));
    assert!(sp.descheduled);
    assert!(pair.tp.has(&Event::Deschedule(pair.server)));
    assert!(pair.tp.get(pair.server_ts).tx_fifo.borrow().wants_deq_ntf());
    assert_eq!(
        pair.tp.get(app).tx_fifo.borrow().max_dequeue(),
        data.len() - wrote
    );

    // Peer drains the transport, the session layer offers another pass.
    pair.read(pair.client);
    let mut sp = SendParams::new(usize::MAX);
    let rest = pair
        .worker
        .write(&mut pair.tp, pair.server, &mut sp)
        .expect("second write");
    assert_eq!(wrote + rest, data.len());
    assert!(!sp.descheduled);
    assert!(pair.tp.has(&Event::RescheduleTx(app)));

    pair.read(pair.client);
    assert_eq!(pair.tp.app_recv(pair.client_app()), data);
}

#[test]
fn write_respects_burst() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let mut pair = Pair::connect(&main, stream(), &[]);
    pair.read(pair.client);

    let app = pair.client_app();
    pair.tp.app_send(app, &[7; 3000]);
    assert_eq!(pair.write(pair.client, 1000), 1000);
    assert_eq!(pair.tp.get(app).tx_fifo.borrow().max_dequeue(), 2000);
    assert_eq!(pair.write(pair.client, usize::MAX), 2000);

    pair.read(pair.server);
    assert_eq!(pair.tp.app_recv(pair.server_app()), vec![7; 3000]);
}

#[test]
fn peer_close_notify_is_read_as_end() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    let mut pair = Pair::connect(&main, stream(), &[]);
    pair.read(pair.client);

    pair.tp.take_events();
    pair.worker
        .app_close(&mut pair.tp, pair.client, false)
        .expect("app close");
    assert!(pair.tp.has(&Event::Closed(pair.client)));
    assert!(pair.tp.has(&Event::Disconnect(pair.client_ts)));

    // close_notify reached the server: nothing to deliver, nothing broken.
    assert_eq!(pair.read(pair.server), 0);
    assert_eq!(pair.tp.count(|e| matches!(e, Event::IoError(_))), 0);
}

#[test]
fn short_engine_writes_round_trip_across_fifo_wrap() {
    let _ = env_logger::try_init();

    let opts = ToyOptions {
        write_cap: Some(300),
        ..Default::default()
    };
    let (main, _) = toy_main(opts);
    let tp = MemTransport::with_app_fifo_size(1000);
    let mut pair = Pair::connect_over(&main, stream(), &[], tp, 16 * 1024, None);

    let data: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    let app = pair.client_app();
    assert_eq!(pair.tp.app_send(app, &data[..700]), 700);
    assert_eq!(pair.write(pair.client, usize::MAX), 300);
    assert_eq!(pair.tp.get(app).tx_fifo.borrow().max_dequeue(), 400);

    // The rest wraps around the end of the app tx ring.
    assert_eq!(pair.tp.app_send(app, &data[700..]), 500);

    let mut got = Vec::new();
    let mut passes = Vec::new();
    for _ in 0..16 {
        while pair.read(pair.server) > 0 {}
        got.extend(pair.tp.app_recv(pair.server_app()));
        if pair.tp.get(app).tx_fifo.borrow().is_empty() && got.len() == data.len() {
            break;
        }
        passes.push(pair.write(pair.client, usize::MAX));
    }

    // The last pass spans both segments: 100 bytes to the ring end, 200 after.
    assert_eq!(passes, vec![300, 300, 300]);
    assert_eq!(got, data);
    assert_eq!(pair.tp.count(|e| matches!(e, Event::IoError(_))), 0);
}
