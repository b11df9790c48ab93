//! 精简协议栈后端：进程内协议栈上的描述符表与 `select` 聚合。

use spark_socket::backend::lwip_sockets::{LwipSocket, LwipSocketsBackend};
use spark_socket::{
    AcceptOutcome, AddressFamily, ConnectOutcome, Protocol, ReadOutcome, RecvOutcome, Socket,
    SocketAddress, SocketConfig, SocketError, SocketFactory, SocketType, WriteOutcome,
};

fn backend(max_descriptors: usize) -> LwipSocketsBackend {
    LwipSocketsBackend::with_config(SocketConfig::new().with_max_descriptors(max_descriptors))
        .unwrap()
}

fn loopback(port: u16) -> SocketAddress {
    SocketAddress::parse("127.0.0.1", port).unwrap()
}

fn open_stream(factory: &SocketFactory<LwipSocketsBackend>, monitored: bool) -> LwipSocket {
    factory
        .open(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp, monitored)
        .unwrap()
}

fn connect(client: &mut LwipSocket, backend: &LwipSocketsBackend, port: u16) {
    for _ in 0..8 {
        if client.connect(&loopback(port)).unwrap() == ConnectOutcome::Connected {
            return;
        }
        backend.service();
    }
    panic!("loopback handshake did not complete");
}

#[test]
fn descriptor_table_exhaustion_is_reported() {
    let factory = SocketFactory::unmonitored(backend(2));
    let _a = open_stream(&factory, false);
    let _b = open_stream(&factory, false);
    let error = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Default, false)
        .unwrap_err();
    assert!(matches!(error, SocketError::Exhausted { .. }));
    assert_eq!(factory.backend().open_descriptors(), 2);
}

#[test]
fn freed_descriptor_is_reused_without_stale_readiness() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(backend(4));
    let mut first = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Udp, true)
        .unwrap();
    first.bind(&loopback(6000)).unwrap();
    let mut sender = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Udp, false)
        .unwrap();
    sender.send_to(b"x", &loopback(6000)).unwrap();

    aggregator.refresh();
    assert!(first.ready());
    let fd = first.descriptor().unwrap();
    assert_eq!(fd, 0);

    first.close().unwrap();
    assert!(!aggregator.is_registered(fd));
    let reused = open_stream(&factory, true);
    assert_eq!(reused.descriptor(), Some(fd));
    assert!(!reused.ready());

    aggregator.refresh();
    assert!(!reused.ready());
}

#[test]
fn monitored_stream_reports_ready_after_peer_writes() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(backend(8));
    let mut listener = open_stream(&factory, true);
    listener.bind(&loopback(8080)).unwrap();
    listener.listen(2).unwrap();

    let mut client = open_stream(&factory, false);
    connect(&mut client, factory.backend(), 8080);

    aggregator.refresh();
    assert!(listener.ready());
    let AcceptOutcome::Accepted(mut server) = listener.accept_loop_monitored().unwrap() else {
        panic!("handshake completed, connection should be queued");
    };
    assert!(server.is_loop_monitored());
    assert_eq!(server.peer_ip().unwrap(), "127.0.0.1");
    assert_eq!(server.local_addr().unwrap().port(), 8080);

    aggregator.refresh();
    assert!(!server.ready());

    assert_eq!(client.write(b"0123456789").unwrap(), WriteOutcome::Written(10));
    aggregator.refresh();
    assert!(server.ready());

    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(10));
    assert_eq!(&buf[..10], b"0123456789");
    assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);

    client.close().unwrap();
    aggregator.refresh();
    assert!(server.ready());
    assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Closed);
}

#[test]
fn second_bind_to_the_same_port_fails() {
    let factory = SocketFactory::unmonitored(backend(4));
    let mut first = open_stream(&factory, false);
    first.bind(&loopback(7000)).unwrap();
    let mut second = open_stream(&factory, false);
    let error = second.bind(&loopback(7000)).unwrap_err();
    assert_eq!(error.io_kind(), Some(std::io::ErrorKind::AddrInUse));

    second.set_reuse_address(true).unwrap();
    second.bind(&loopback(7000)).unwrap();
}

#[test]
fn datagrams_carry_their_source() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(backend(4));
    let mut receiver = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Default, true)
        .unwrap();
    receiver.bind(&loopback(5353)).unwrap();
    let mut sender = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Default, false)
        .unwrap();
    sender.bind(&loopback(5454)).unwrap();

    aggregator.refresh();
    assert!(!receiver.ready());
    assert_eq!(
        sender.send_to(b"query", &loopback(5353)).unwrap(),
        WriteOutcome::Written(5)
    );
    aggregator.refresh();
    assert!(receiver.ready());

    let mut buf = [0u8; 16];
    let RecvOutcome::Received { len, from } = receiver.recv_from(&mut buf).unwrap() else {
        panic!("datagram should have arrived");
    };
    assert_eq!(&buf[..len], b"query");
    assert_eq!(from, loopback(5454));
    assert_eq!(receiver.recv_from(&mut buf).unwrap(), RecvOutcome::WouldBlock);
}

#[test]
fn operations_after_close_fail_and_close_is_idempotent() {
    let factory = SocketFactory::unmonitored(backend(2));
    let mut socket = open_stream(&factory, false);
    socket.close().unwrap();
    socket.close().unwrap();
    assert!(matches!(
        socket.bind(&loopback(1)),
        Err(SocketError::Closed { .. })
    ));
    assert_eq!(factory.backend().open_descriptors(), 0);
}
