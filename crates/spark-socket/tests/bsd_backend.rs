//! 完整协议栈后端：真实回环套接字上的端到端场景。
#![cfg(unix)]

use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

use spark_socket::backend::bsd::{BsdBackend, BsdSocket};
use spark_socket::{
    AcceptOutcome, AddressFamily, ConnectOutcome, Protocol, ReadOutcome, RecvOutcome, Socket,
    SocketAddress, SocketError, SocketFactory, SocketType, WriteOutcome,
};

fn retry<T>(mut attempt: impl FnMut() -> Option<T>) -> T {
    for _ in 0..400 {
        if let Some(value) = attempt() {
            return value;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("operation did not complete in time");
}

fn loopback(port: u16) -> SocketAddress {
    SocketAddress::parse("127.0.0.1", port).unwrap()
}

fn listener(factory: &SocketFactory<BsdBackend>) -> BsdSocket {
    let mut socket = factory
        .open(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp, true)
        .unwrap();
    socket.set_reuse_address(true).unwrap();
    socket.bind(&loopback(0)).unwrap();
    socket.listen(4).unwrap();
    socket
}

fn accept(listener: &mut BsdSocket) -> BsdSocket {
    retry(|| match listener.accept_loop_monitored().unwrap() {
        AcceptOutcome::Accepted(socket) => Some(socket),
        AcceptOutcome::WouldBlock => None,
    })
}

#[test]
fn monitored_socket_reports_ready_after_peer_writes() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(BsdBackend::new());
    let mut listener = listener(&factory);
    assert!(listener.is_loop_monitored());
    let port = listener.local_addr().unwrap().port();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut server = accept(&mut listener);
    assert!(server.is_loop_monitored());

    aggregator.refresh();
    assert!(!server.ready());

    peer.write_all(b"0123456789").unwrap();
    let report = aggregator.refresh_with_timeout(Duration::from_secs(2));
    assert!(!report.degraded);
    assert!(server.ready());

    let mut buf = [0u8; 32];
    assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Read(10));
    assert_eq!(&buf[..10], b"0123456789");
    assert_eq!(server.peer_ip().unwrap(), "127.0.0.1");
}

#[test]
fn unmonitored_socket_is_always_ready_and_reads_would_block() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(BsdBackend::new());
    let mut listener = listener(&factory);
    let port = listener.local_addr().unwrap().port();
    let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut server = retry(|| listener.accept().unwrap().into_socket());
    assert!(!server.is_loop_monitored());

    aggregator.refresh();
    assert!(server.ready());
    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);
}

#[test]
fn nonblocking_connect_completes_and_carries_data() {
    let (factory, _aggregator) = SocketFactory::with_aggregator(BsdBackend::new());
    let mut listener = listener(&factory);
    let port = listener.local_addr().unwrap().port();

    let mut client = factory
        .open(AddressFamily::Inet, SocketType::Stream, Protocol::Default, false)
        .unwrap();
    client.set_nodelay(true).unwrap();
    retry(|| match client.connect(&loopback(port)).unwrap() {
        ConnectOutcome::Connected => Some(()),
        ConnectOutcome::InProgress => None,
    });
    let mut server = accept(&mut listener);

    assert_eq!(client.write(b"ping").unwrap(), WriteOutcome::Written(4));
    let mut buf = [0u8; 8];
    let n = retry(|| match server.read(&mut buf).unwrap() {
        ReadOutcome::Read(n) => Some(n),
        _ => None,
    });
    assert_eq!(&buf[..n], b"ping");

    client.close().unwrap();
    client.close().unwrap();
    assert!(matches!(
        client.write(b"x"),
        Err(SocketError::Closed { .. })
    ));
    assert_eq!(client.descriptor(), None);

    let eof = retry(|| match server.read(&mut buf).unwrap() {
        ReadOutcome::WouldBlock => None,
        other => Some(other),
    });
    assert_eq!(eof, ReadOutcome::Closed);
}

#[test]
fn closing_deregisters_before_releasing_the_descriptor() {
    let (factory, aggregator) = SocketFactory::with_aggregator(BsdBackend::new());
    let mut socket = listener(&factory);
    let fd = socket.descriptor().unwrap();
    assert!(aggregator.is_registered(fd));
    socket.close().unwrap();
    assert!(!aggregator.is_registered(fd));
    assert!(socket.ready());
}

#[test]
fn datagram_round_trip() {
    let (factory, mut aggregator) = SocketFactory::with_aggregator(BsdBackend::new());
    let mut socket = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Default, true)
        .unwrap();
    socket.bind(&loopback(0)).unwrap();
    let port = socket.local_addr().unwrap().port();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"hello", ("127.0.0.1", port)).unwrap();
    aggregator.refresh_with_timeout(Duration::from_secs(2));
    assert!(socket.ready());

    let mut buf = [0u8; 16];
    let RecvOutcome::Received { len, from } = socket.recv_from(&mut buf).unwrap() else {
        panic!("datagram should be queued");
    };
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from.port(), peer.local_addr().unwrap().port());

    let sent = socket
        .send_to(b"world", &SocketAddress::from(peer.local_addr().unwrap()))
        .unwrap();
    assert_eq!(sent, WriteOutcome::Written(5));
    assert_eq!(socket.recv_from(&mut buf).unwrap(), RecvOutcome::WouldBlock);
}

#[test]
fn empty_datagram_is_not_a_close() {
    let factory = SocketFactory::unmonitored(BsdBackend::new());
    let mut socket = factory
        .open(AddressFamily::Inet, SocketType::Datagram, Protocol::Default, false)
        .unwrap();
    socket.bind(&loopback(0)).unwrap();
    let port = socket.local_addr().unwrap().port();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"", ("127.0.0.1", port)).unwrap();
    peer.send_to(b"tail", ("127.0.0.1", port)).unwrap();

    let mut buf = [0u8; 16];
    let first = retry(|| match socket.read(&mut buf).unwrap() {
        ReadOutcome::WouldBlock => None,
        outcome => Some(outcome),
    });
    assert_eq!(first, ReadOutcome::Read(0));
    let second = retry(|| match socket.read(&mut buf).unwrap() {
        ReadOutcome::WouldBlock => None,
        outcome => Some(outcome),
    });
    assert_eq!(second, ReadOutcome::Read(4));
    assert_eq!(&buf[..4], b"tail");
}

#[cfg(feature = "ipv6")]
#[test]
fn ipv6_socket_accepts_ipv4_addresses() {
    let factory = SocketFactory::unmonitored(BsdBackend::new());
    let mut socket = factory
        .open(AddressFamily::Inet6, SocketType::Stream, Protocol::Tcp, true)
        .unwrap();
    assert!(!socket.is_loop_monitored());
    socket.bind(&loopback(0)).unwrap();
    let local = socket.local_addr().unwrap();
    assert_eq!(local.family(), AddressFamily::Inet6);
    assert_eq!(local.unmapped().ip_text(), "127.0.0.1");
}
