//! 地址构造器的编码性质：写入长度、网络序端口、容量不足时不落字节。

use std::net::{Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;
use spark_socket::{
    AddressFamily, SOCKADDR_IN_LEN, SOCKADDR_IN6_LEN, SocketAddress, SocketError, set_sockaddr,
    set_sockaddr_any,
};

proptest! {
    #[test]
    fn ipv4_text_encodes_to_sockaddr_in(octets in any::<[u8; 4]>(), port in any::<u16>()) {
        let text = Ipv4Addr::from(octets).to_string();
        let mut buf = [0xAAu8; 32];
        let written = set_sockaddr(&mut buf, &text, port).unwrap();
        prop_assert_eq!(written, SOCKADDR_IN_LEN);
        prop_assert_eq!(&buf[2..4], &port.to_be_bytes());
        prop_assert_eq!(&buf[4..8], &octets);
        prop_assert!(buf[SOCKADDR_IN_LEN..].iter().all(|byte| *byte == 0xAA));

        let decoded = SocketAddress::decode(&buf[..written]).unwrap();
        prop_assert_eq!(decoded, SocketAddress::V4 { addr: octets, port });
    }

    #[test]
    fn undersized_buffer_is_left_untouched(octets in any::<[u8; 4]>(), port in any::<u16>()) {
        let text = Ipv4Addr::from(octets).to_string();
        let mut buf = [0x5Au8; SOCKADDR_IN_LEN - 1];
        let error = set_sockaddr(&mut buf, &text, port).unwrap_err();
        let is_too_small = matches!(
            error,
            SocketError::BufferTooSmall {
                required: SOCKADDR_IN_LEN,
                capacity,
            } if capacity == SOCKADDR_IN_LEN - 1
        );
        prop_assert!(is_too_small);
        prop_assert!(buf.iter().all(|byte| *byte == 0x5A));
    }

    #[cfg(feature = "ipv6")]
    #[test]
    fn ipv6_text_encodes_to_sockaddr_in6(segments in any::<[u16; 8]>(), port in any::<u16>()) {
        let text = Ipv6Addr::from(segments).to_string();
        let mut buf = [0u8; SOCKADDR_IN6_LEN];
        let written = set_sockaddr(&mut buf, &text, port).unwrap();
        prop_assert_eq!(written, SOCKADDR_IN6_LEN);
        prop_assert_eq!(&buf[2..4], &port.to_be_bytes());
        prop_assert_eq!(&buf[8..24], &Ipv6Addr::from(segments).octets());

        let decoded = SocketAddress::decode(&buf).unwrap();
        prop_assert_eq!(decoded.ip(), Ipv6Addr::from(segments));
        prop_assert_eq!(decoded.port(), port);
    }
}

#[test]
fn loopback_v4_at_exact_capacity() {
    let mut buf = [0u8; SOCKADDR_IN_LEN];
    assert_eq!(set_sockaddr(&mut buf, "127.0.0.1", 8080).unwrap(), 16);
    assert_eq!(&buf[2..4], &[0x1F, 0x90]);
    assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
    assert_eq!(&buf[8..], &[0; 8]);
}

#[cfg(not(feature = "ipv6"))]
#[test]
fn ipv6_text_is_rejected_without_dual_stack() {
    let mut buf = [0xAAu8; SOCKADDR_IN_LEN];
    let error = set_sockaddr(&mut buf, "::1", 5353).unwrap_err();
    assert!(matches!(
        error,
        SocketError::FamilyUnsupported(AddressFamily::Inet6)
    ));
    assert_eq!(buf, [0xAAu8; SOCKADDR_IN_LEN]);
}

#[cfg(feature = "ipv6")]
#[test]
fn ipv6_text_needs_the_larger_buffer() {
    let mut buf = [0u8; SOCKADDR_IN_LEN];
    let error = set_sockaddr(&mut buf, "::1", 5353).unwrap_err();
    assert!(matches!(
        error,
        SocketError::BufferTooSmall {
            required: SOCKADDR_IN6_LEN,
            capacity: SOCKADDR_IN_LEN,
        }
    ));
    assert_eq!(buf, [0u8; SOCKADDR_IN_LEN]);
}

#[test]
fn wildcard_uses_the_preferred_family() {
    let mut buf = [0u8; SOCKADDR_IN6_LEN];
    let written = set_sockaddr_any(&mut buf, 80).unwrap();
    let decoded = SocketAddress::decode(&buf[..written]).unwrap();
    assert!(decoded.is_wildcard());
    assert_eq!(decoded.port(), 80);
    assert_eq!(decoded.family(), AddressFamily::preferred());
    assert_eq!(written, AddressFamily::preferred().sockaddr_len());
}

#[test]
fn malformed_text_is_rejected_before_writing() {
    let mut buf = [0x11u8; SOCKADDR_IN6_LEN];
    for text in ["", "256.0.0.1", "1.2.3", "localhost", "1.2.3.4 "] {
        let error = set_sockaddr(&mut buf, text, 1).unwrap_err();
        assert!(matches!(error, SocketError::InvalidAddress { .. }), "{text}");
    }
    assert!(buf.iter().all(|byte| *byte == 0x11));
}

#[cfg(feature = "ipv6")]
#[test]
fn scope_id_survives_the_binary_layout() {
    let addr = SocketAddress::parse("fe80::1%3", 5353).unwrap();
    let mut buf = [0u8; SOCKADDR_IN6_LEN];
    addr.encode(&mut buf).unwrap();
    assert_eq!(SocketAddress::decode(&buf).unwrap(), addr);
    assert_eq!(addr.to_string(), "[fe80::1%3]:5353");
}
