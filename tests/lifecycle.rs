//! Context lifetime: alloc/free, close paths, listeners and renegotiation.


use std::sync::Arc;

use engine_common::*;
use fifotls::{
    ClientParams, ConnFlags, ContextHandle, Error, HandshakeFailure, HandshakeState,
    ListenHandle, SendParams, TlsEngine, TlsMain, TransportProto,
};

fn stream() -> ClientParams {
    ClientParams::new(TransportProto::Stream)
}

fn toy_pair() -> (Arc<TlsMain>, Pair) {
    let (main, _) = toy_main(ToyOptions::default());
    let pair = Pair::connect(&main, stream(), &[]);
    (main, pair)
}

#[test]
fn free_releases_slot_once() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let mut worker = main.worker(3);
    let mut tp = MemTransport::new();

    let a = worker.alloc();
    let b = worker.alloc();
    assert_eq!(a, ContextHandle::new(3, 0));
    assert_eq!(worker.len(), 2);
    assert_eq!(worker.get(a).expect("allocated").engine(), "toy");

    worker.free(&mut tp, a).expect("free");
    assert!(matches!(
        worker.free(&mut tp, a),
        Err(Error::UnknownContext(_))
    ));
    assert_eq!(worker.alloc(), a);
    worker.free(&mut tp, b).expect("free");
    assert!(tp.events().is_empty());
}

#[test]
fn uninitialised_context_refuses_io() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let mut worker = main.worker(0);
    let mut tp = MemTransport::new();
    let ctx = worker.alloc();

    assert!(matches!(
        worker.read(&mut tp, ctx),
        Err(Error::NotInitialized(_))
    ));
    let mut sp = SendParams::new(100);
    assert!(matches!(
        worker.write(&mut tp, ctx, &mut sp),
        Err(Error::NotInitialized(_))
    ));
    assert!(matches!(
        worker.read(&mut tp, ContextHandle::new(1, 0)),
        Err(Error::WrongThread(_))
    ));
}

#[test]
fn free_sends_close_notify() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    pair.tp.take_events();

    pair.worker
        .free(&mut pair.tp, pair.client)
        .expect("free");
    assert!(pair.worker.get(pair.client).is_none());
    assert!(pair.tp.has(&Event::ProgramTx(pair.client_ts)));

    // The server sees the close as end of stream.
    assert_eq!(pair.read(pair.server), 0);
    assert_eq!(pair.tp.count(|e| matches!(e, Event::IoError(_))), 0);
}

#[test]
fn app_close_confirms_immediately_when_idle() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    pair.tp.take_events();

    pair.worker
        .app_close(&mut pair.tp, pair.client, true)
        .expect("app close");
    let flags = pair.worker.get(pair.client).expect("client").flags();
    assert!(flags.contains(ConnFlags::APP_CLOSED));
    assert!(flags.contains(ConnFlags::CLOSE_CONFIRMED));
    assert!(pair.tp.has(&Event::Shutdown(pair.client_ts)));
    assert!(pair.tp.has(&Event::Closed(pair.client)));
    assert!(!pair.tp.has(&Event::Disconnect(pair.client_ts)));

    // Confirmation runs once.
    pair.worker
        .app_close(&mut pair.tp, pair.client, true)
        .expect("second app close");
    assert_eq!(pair.tp.count(|e| *e == Event::Closed(pair.client)), 1);
}

#[test]
fn app_close_waits_for_pending_data() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    let app = pair.client_app();
    pair.tp.app_send(app, b"flush me first");
    pair.tp.take_events();

    pair.worker
        .app_close(&mut pair.tp, pair.client, false)
        .expect("app close");
    assert!(!pair.tp.has(&Event::Closed(pair.client)));

    assert_eq!(pair.write(pair.client, usize::MAX), 14);
    assert!(pair.tp.has(&Event::Closed(pair.client)));
    assert!(pair.tp.has(&Event::Disconnect(pair.client_ts)));

    pair.read(pair.server);
    assert_eq!(pair.tp.app_recv(pair.server_app()), b"flush me first");
}

#[test]
fn transport_close_during_handshake_fails_connect() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let mut worker = main.worker(0);
    let mut tp = MemTransport::new();
    let (client_ts, _server_ts) = tp.pipe(4096);

    let client = worker.alloc();
    worker
        .init_client(&mut tp, client, client_ts, stream())
        .expect("init client");
    worker
        .transport_close(&mut tp, client)
        .expect("transport close");

    assert!(tp.has(&Event::ConnectFailed(
        client,
        HandshakeFailure::TransportClosed
    )));
    assert!(tp.has(&Event::Disconnect(client_ts)));
    let ctx = worker.get(client).expect("client");
    assert_eq!(ctx.hs_state(), HandshakeState::Failed);
    assert!(ctx.flags().contains(ConnFlags::PASSIVE_CLOSE));
}

#[test]
fn transport_close_when_established_notifies_closing() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    pair.tp.take_events();

    pair.worker
        .transport_close(&mut pair.tp, pair.server)
        .expect("transport close");
    assert_eq!(pair.tp.take_events(), vec![Event::Closing(pair.server)]);

    // Peer closed: free does not try to send close_notify.
    pair.worker.free(&mut pair.tp, pair.server).expect("free");
    assert!(pair.tp.events().is_empty());
}

#[test]
fn transport_reset_reports_reset_and_closed() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    pair.tp.take_events();

    pair.worker
        .transport_reset(&mut pair.tp, pair.client)
        .expect("reset");
    assert_eq!(
        pair.tp.take_events(),
        vec![
            Event::Reset(pair.client),
            Event::Closed(pair.client),
            Event::Disconnect(pair.client_ts),
        ]
    );
}

#[test]
fn resume_requires_outstanding_handshake() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    assert!(matches!(
        pair.worker.resume(pair.client),
        Err(Error::NotHandshaking(_))
    ));
    assert!(matches!(
        pair.worker.resume(ContextHandle::new(0, 99)),
        Err(Error::UnknownContext(_))
    ));
    assert!(!pair
        .worker
        .get(pair.client)
        .expect("client")
        .flags()
        .contains(ConnFlags::RESUME));
}

#[test]
fn refused_accept_marks_context() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let listener = listen(&main, TransportProto::Stream, &[]);
    let mut worker = main.worker(0);
    let mut tp = MemTransport::new();
    tp.refuse_accept = true;
    let (client_ts, server_ts) = tp.pipe(4096);

    let client = worker.alloc();
    worker
        .init_client(&mut tp, client, client_ts, stream())
        .expect("init client");
    let server = worker.alloc();
    worker
        .init_server(&mut tp, server, server_ts, listener)
        .expect("init server");
    drive(&mut [&mut worker], &mut tp, &[server], None);

    let ctx = worker.get(server).expect("server");
    assert!(!ctx.is_hs_done());
    assert!(ctx.flags().contains(ConnFlags::NO_APP_SESSION));
    assert!(ctx.app().is_none());
    assert!(tp.has(&Event::Disconnect(server_ts)));
}

#[test]
fn verification_failure_is_ignored_without_hostname() {
    let _ = env_logger::try_init();

    let opts = ToyOptions {
        verify_error: Some("self signed".into()),
        ..Default::default()
    };
    let (main, _) = toy_main(opts.clone());
    let pair = Pair::connect(&main, stream(), &[]);
    assert!(pair.worker.get(pair.client).expect("client").is_hs_done());

    let (main, _) = toy_main(opts);
    let pair = Pair::connect(&main, stream().with_hostname("peer.test"), &[]);
    let ctx = pair.worker.get(pair.client).expect("client");
    assert_eq!(ctx.hs_state(), HandshakeState::Failed);
    assert!(pair.tp.has(&Event::ConnectFailed(
        pair.client,
        HandshakeFailure::Verification("self signed".into())
    )));
}

#[test]
fn stopped_listener_keeps_accepted_connections() {
    let _ = env_logger::try_init();

    let (main, mut pair) = toy_pair();
    let lctx = main.listener(pair.listener).expect("listener");
    assert!(lctx.cert_key().is_some());

    main.stop_listen(pair.listener).expect("stop");
    assert!(lctx.cert_key().is_none());
    assert!(main.listener(pair.listener).is_none());
    assert!(matches!(
        main.stop_listen(pair.listener),
        Err(Error::UnknownListener(_))
    ));

    assert_eq!(pair.client_to_server(b"still here"), b"still here");

    let (_, ts) = pair.tp.pipe(4096);
    let ctx = pair.worker.alloc();
    assert!(matches!(
        pair.worker.init_server(&mut pair.tp, ctx, ts, pair.listener),
        Err(Error::UnknownListener(_))
    ));
    assert!(matches!(
        pair.worker
            .init_server(&mut pair.tp, ctx, ts, ListenHandle(1234)),
        Err(Error::UnknownListener(_))
    ));
}

#[test]
fn renegotiation_is_silent() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();

    // Server asks for a new handshake.
    pair.tp
        .get(pair.server_ts)
        .tx_fifo
        .borrow_mut()
        .enqueue(&toy_record(REC_RENEG, &[]));
    assert_eq!(pair.read(pair.client), 0);
    assert_eq!(
        pair.worker.get(pair.client).expect("client").hs_state(),
        HandshakeState::Complete
    );

    // Server answers the new hello, client finishes.
    pair.read(pair.server);
    pair.read(pair.client);
    let ctx = pair.worker.get(pair.client).expect("client");
    assert_eq!(ctx.hs_state(), HandshakeState::Complete);
    assert!(ctx.is_hs_done());

    assert_eq!(pair.client_to_server(b"renegotiated"), b"renegotiated");
    assert_eq!(pair.tp.count(|e| matches!(e, Event::Connected(..))), 1);
    assert_eq!(pair.tp.count(|e| matches!(e, Event::IoError(_))), 0);
}

#[test]
fn failed_renegotiation_is_an_io_error() {
    let _ = env_logger::try_init();

    let (_main, mut pair) = toy_pair();
    pair.tp
        .get(pair.server_ts)
        .tx_fifo
        .borrow_mut()
        .enqueue(&toy_record(REC_RENEG, &[]));
    pair.read(pair.client);

    // Garbage instead of a welcome.
    pair.tp
        .get(pair.server_ts)
        .tx_fifo
        .borrow_mut()
        .enqueue(&toy_record(REC_DATA, b"not a welcome"));
    pair.tp.take_events();
    pair.read(pair.client);

    let ctx = pair.worker.get(pair.client).expect("client");
    assert_eq!(ctx.hs_state(), HandshakeState::Failed);
    assert!(pair.tp.has(&Event::IoError(pair.client)));
    assert!(pair.tp.has(&Event::Disconnect(pair.client_ts)));
    assert_eq!(pair.tp.count(|e| matches!(e, Event::ConnectFailed(..))), 0);
}

#[test]
fn admin_updates_apply_to_new_connections() {
    let _ = env_logger::try_init();

    let main = rustls_main();
    main.set_ciphers("TLS13_CHACHA20_POLY1305_SHA256")
        .expect("set ciphers");
    assert_eq!(
        main.config().ciphers().to_vec(),
        vec!["TLS13_CHACHA20_POLY1305_SHA256".to_string()]
    );
    main.set_record_tuning(Some(4096), None, None)
        .expect("record size");
    assert_eq!(main.config().record_size(), Some(4096));
    assert!(main.set_record_tuning(Some(10), None, None).is_err());

    let pair = Pair::connect(&main, stream(), &[]);
    let client = pair.worker.get(pair.client).expect("client");
    assert_eq!(
        client.cipher_name().as_deref(),
        Some("TLS13_CHACHA20_POLY1305_SHA256")
    );
    main.reinit_ca_chain().expect("reinit");
    assert_eq!(main.trust().expect("trust store").len(), 1);
}
