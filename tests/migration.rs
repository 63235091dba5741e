//! Moving connections between workers.


use engine_common::*;
use fifotls::{
    ClientParams, ConnFlags, ContextHandle, Error, SendParams, TlsEngine, TransportProto,
};

#[test]
fn established_connection_moves_between_workers() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let mut pair = Pair::connect(&main, ClientParams::new(TransportProto::Stream), &[]);
    assert_eq!(pair.client_to_server(b"before"), b"before");

    let server_app = pair.server_app();
    let mut other = main.worker(1);

    let detached = pair.worker.detach(pair.server).expect("detach");
    assert_eq!(detached.old_handle(), pair.server);
    assert!(detached.context().flags().contains(ConnFlags::MIGRATED));
    assert!(pair.worker.get(pair.server).is_none());

    let ts = pair.tp.migrate_session(pair.server_ts, 1);
    let moved = other.attach(detached, ts);
    assert_eq!(moved.thread, 1);

    let ctx = other.get(moved).expect("attached context");
    assert_eq!(ctx.handle(), moved);
    assert_eq!(ctx.transport(), ts);
    assert_eq!(ctx.app(), Some(server_app));
    assert!(ctx.is_hs_done());
    assert!(!ctx.flags().contains(ConnFlags::MIGRATED));

    // Client to migrated server.
    let client_app = pair.client_app();
    pair.tp.app_send(client_app, b"after");
    pair.write(pair.client, usize::MAX);
    assert_eq!(other.read(&mut pair.tp, moved).expect("read"), 5);
    assert_eq!(pair.tp.app_recv(server_app), b"after");

    // Migrated server to client.
    pair.tp.app_send(server_app, b"reply");
    let mut sp = SendParams::new(usize::MAX);
    assert_eq!(other.write(&mut pair.tp, moved, &mut sp).expect("write"), 5);
    pair.read(pair.client);
    assert_eq!(pair.tp.app_recv(client_app), b"reply");

    // Old handle is gone on the source worker.
    let mut sp = SendParams::new(usize::MAX);
    assert!(matches!(
        pair.worker.write(&mut pair.tp, pair.server, &mut sp),
        Err(Error::UnknownContext(_))
    ));
    assert!(matches!(
        other.read(&mut pair.tp, pair.server),
        Err(Error::WrongThread(_))
    ));
}

#[test]
fn handshake_resumes_after_attach() {
    let _ = env_logger::try_init();

    let (main, _) = toy_main(ToyOptions::default());
    let listener = listen(&main, TransportProto::Stream, &[]);
    let mut w0 = main.worker(0);
    let mut w1 = main.worker(1);
    let mut tp = MemTransport::new();
    let (client_ts, server_ts) = tp.pipe_on(0, 0, 16 * 1024);

    let client = w0.alloc();
    w0.init_client(
        &mut tp,
        client,
        client_ts,
        ClientParams::new(TransportProto::Stream),
    )
    .expect("init client");
    let server = w0.alloc();
    w0.init_server(&mut tp, server, server_ts, listener)
        .expect("init server");

    // Server moves before it saw the client hello.
    let detached = w0.detach(server).expect("detach");
    let ts = tp.migrate_session(server_ts, 1);
    let server = w1.attach(detached, ts);
    let ctx = w1.get(server).expect("attached");
    assert!(ctx.flags().contains(ConnFlags::RESUME));
    assert!(!ctx.is_hs_done());

    drive(&mut [&mut w0, &mut w1], &mut tp, &[client, server], None);
    assert!(w0.get(client).expect("client").is_hs_done());
    assert!(w1.get(server).expect("server").is_hs_done());
    assert!(tp.has(&Event::Accepted(server, app_of(&w1, server))));
}

fn app_of(worker: &fifotls::Worker, ctx: ContextHandle) -> fifotls::SessionHandle {
    worker.get(ctx).and_then(|c| c.app()).expect("app session")
}

#[test]
fn detach_is_refused_with_async_in_flight() {
    let _ = env_logger::try_init();

    let opts = ToyOptions {
        async_writes: true,
        ..Default::default()
    };
    let (main, hw) = toy_main_async(opts);
    let mut pair = Pair::connect(&main, ClientParams::new(TransportProto::Stream), &[]);

    let app = pair.client_app();
    pair.tp.app_send(app, b"queued");
    assert_eq!(pair.write(pair.client, usize::MAX), 0);
    assert_eq!(hw.in_flight(), 1);

    assert!(matches!(
        pair.worker.detach(pair.client),
        Err(Error::AsyncInFlight(_))
    ));

    hw.complete_all();
    assert_eq!(pair.worker.poll_async(&mut pair.tp), 1);
    let detached = pair.worker.detach(pair.client).expect("detach after completion");
    assert_eq!(detached.context().async_pending(), 0);
}

#[test]
fn async_completions_follow_the_context() {
    let _ = env_logger::try_init();

    let opts = ToyOptions {
        async_writes: true,
        ..Default::default()
    };
    let (main, hw) = toy_main_async(opts);
    let mut pair = Pair::connect(&main, ClientParams::new(TransportProto::Stream), &[]);
    let mut other = main.worker(1);

    let detached = pair.worker.detach(pair.client).expect("detach");
    let ts = pair.tp.migrate_session(pair.client_ts, 1);
    let moved = other.attach(detached, ts);

    let app = other.get(moved).and_then(|c| c.app()).expect("app");
    pair.tp.app_send(app, b"moved");
    let mut sp = SendParams::new(usize::MAX);
    assert_eq!(other.write(&mut pair.tp, moved, &mut sp).expect("write"), 0);

    hw.complete_on_thread();
    assert_eq!(pair.worker.poll_async(&mut pair.tp), 0);
    assert_eq!(other.poll_async(&mut pair.tp), 1);

    pair.read(pair.server);
    assert_eq!(pair.tp.app_recv(pair.server_app()), b"moved");
}
