//! 地址构造器：文本 IP + 端口 → 与后端无关的二进制套接字地址。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 三种后端对地址的要求各不相同（BSD 需要 `sockaddr_in{,6}`，精简协议栈需要自身的
//!   端点结构，回调式引擎只认标准库地址），上层协议却只持有“文本 + 端口”。本模块提供
//!   唯一的转换入口，并给出一种稳定的二进制布局，供跨后端传递与校验。
//! - 地址族在编译期决定：启用 `ipv6` 特性时按“是否包含冒号”嗅探地址族；未启用时遇到
//!   IPv6 文本直接报 [`SocketError::FamilyUnsupported`]，绝不悄悄回退成 IPv4。
//!
//! ## 二进制布局（What）
//! - IPv4，共 [`SOCKADDR_IN_LEN`] 字节：`[0..2]` 地址族标记（主机序）、`[2..4]` 端口（网络序）、
//!   `[4..8]` 地址、`[8..16]` 填零；
//! - IPv6，共 [`SOCKADDR_IN6_LEN`] 字节：`[0..2]` 地址族标记（主机序）、`[2..4]` 端口（网络序）、
//!   `[4..8]` flowinfo（恒为零）、`[8..24]` 地址、`[24..28]` scope id（主机序）。
//!
//! ## 失败语义
//! - 先完成全部校验（文本解析、地址族、容量），再写入目标缓冲区；任何失败都不会留下
//!   半成品地址。

use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::SocketError;

/// IPv4 二进制地址长度。
pub const SOCKADDR_IN_LEN: usize = 16;
/// IPv6 二进制地址长度。
pub const SOCKADDR_IN6_LEN: usize = 28;
/// 当前构建是否启用双栈。
pub const IPV6_ENABLED: bool = cfg!(feature = "ipv6");

const FAMILY_TAG_INET: u16 = 2;
const FAMILY_TAG_INET6: u16 = 10;

/// 地址族。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// 双栈偏好：启用 IPv6 时返回 `Inet6`，否则 `Inet`。
    pub const fn preferred() -> Self {
        if IPV6_ENABLED {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        }
    }

    /// 该地址族是否编译进当前构建。
    pub const fn is_compiled(self) -> bool {
        match self {
            AddressFamily::Inet => true,
            AddressFamily::Inet6 => IPV6_ENABLED,
        }
    }

    /// 该地址族二进制结构的长度。
    pub const fn sockaddr_len(self) -> usize {
        match self {
            AddressFamily::Inet => SOCKADDR_IN_LEN,
            AddressFamily::Inet6 => SOCKADDR_IN6_LEN,
        }
    }

    const fn tag(self) -> u16 {
        match self {
            AddressFamily::Inet => FAMILY_TAG_INET,
            AddressFamily::Inet6 => FAMILY_TAG_INET6,
        }
    }
}

/// 与后端无关的套接字地址。
///
/// # 教案级注释
///
/// ## 合同（What）
/// - `V4`/`V6` 两个分支构成带标签联合体，端口在 API 边界上始终为主机序；
/// - 地址族随值确定，之后不会改变；需要跨族使用时通过 [`SocketAddress::to_family`]
///   生成新值；
/// - “通配地址”不单独存储标记，而由地址本身是否为 unspecified 推出，
///   见 [`SocketAddress::is_wildcard`]，两者因此不可能失配。
///
/// ## 风险提示（Trade-offs）
/// - `scope_id` 仅对链路本地 IPv6 地址有意义，其余情况保持为 0。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketAddress {
    /// IPv4 端点。
    V4 { addr: [u8; 4], port: u16 },
    /// IPv6 端点。
    V6 {
        addr: [u16; 8],
        port: u16,
        scope_id: u32,
    },
}

impl SocketAddress {
    /// 按“是否包含冒号”嗅探地址族并解析文本地址。
    ///
    /// - 含冒号：IPv6，可带 `%<数字>` 形式的 scope id；未启用 `ipv6` 特性时返回
    ///   [`SocketError::FamilyUnsupported`]；
    /// - 不含冒号：点分十进制 IPv4。
    pub fn parse(text: &str, port: u16) -> Result<Self, SocketError> {
        Self::parse_with(text, port, IPV6_ENABLED)
    }

    pub(crate) fn parse_with(text: &str, port: u16, ipv6: bool) -> Result<Self, SocketError> {
        let invalid = || SocketError::InvalidAddress {
            text: text.to_owned(),
        };
        if text.contains(':') {
            if !ipv6 {
                return Err(SocketError::FamilyUnsupported(AddressFamily::Inet6));
            }
            let (host, scope) = match text.split_once('%') {
                Some((host, scope)) => (host, Some(scope)),
                None => (text, None),
            };
            let addr: Ipv6Addr = host.parse().map_err(|_| invalid())?;
            let scope_id = match scope {
                Some(scope) => scope.parse::<u32>().map_err(|_| invalid())?,
                None => 0,
            };
            return Ok(SocketAddress::V6 {
                addr: addr.segments(),
                port,
                scope_id,
            });
        }
        let addr: Ipv4Addr = text.parse().map_err(|_| invalid())?;
        Ok(SocketAddress::V4 {
            addr: addr.octets(),
            port,
        })
    }

    /// 当前编译地址族的通配地址（`0.0.0.0` 或 `::`）。
    pub fn any(port: u16) -> Self {
        Self::any_with(port, IPV6_ENABLED)
    }

    pub(crate) fn any_with(port: u16, ipv6: bool) -> Self {
        if ipv6 {
            SocketAddress::V6 {
                addr: Ipv6Addr::UNSPECIFIED.segments(),
                port,
                scope_id: 0,
            }
        } else {
            SocketAddress::V4 {
                addr: Ipv4Addr::UNSPECIFIED.octets(),
                port,
            }
        }
    }

    /// 地址族。
    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::V4 { .. } => AddressFamily::Inet,
            SocketAddress::V6 { .. } => AddressFamily::Inet6,
        }
    }

    /// 主机序端口。
    pub fn port(&self) -> u16 {
        match self {
            SocketAddress::V4 { port, .. } | SocketAddress::V6 { port, .. } => *port,
        }
    }

    /// IP 部分。
    pub fn ip(&self) -> IpAddr {
        match self {
            SocketAddress::V4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(*addr)),
            SocketAddress::V6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(*addr)),
        }
    }

    /// IP 部分的文本形式，对应 `getpeername`/`getsockname` 的字符串输出。
    pub fn ip_text(&self) -> String {
        self.ip().to_string()
    }

    /// 是否为“绑定全部本地接口”的通配地址。
    pub fn is_wildcard(&self) -> bool {
        self.ip().is_unspecified()
    }

    /// 二进制编码所需的字节数。
    pub fn encoded_len(&self) -> usize {
        self.family().sockaddr_len()
    }

    /// 转换到指定地址族。
    ///
    /// - IPv4 → IPv6：生成 IPv4-mapped 地址（`::ffff:a.b.c.d`），通配地址映射为 `::`；
    /// - IPv6 → IPv4：仅 IPv4-mapped 地址与 `::` 可转换，其余返回 `None`。
    pub fn to_family(self, family: AddressFamily) -> Option<Self> {
        match (self, family) {
            (SocketAddress::V4 { .. }, AddressFamily::Inet)
            | (SocketAddress::V6 { .. }, AddressFamily::Inet6) => Some(self),
            (SocketAddress::V4 { addr, port }, AddressFamily::Inet6) => {
                let v4 = Ipv4Addr::from(addr);
                let v6 = if v4.is_unspecified() {
                    Ipv6Addr::UNSPECIFIED
                } else {
                    v4.to_ipv6_mapped()
                };
                Some(SocketAddress::V6 {
                    addr: v6.segments(),
                    port,
                    scope_id: 0,
                })
            }
            (SocketAddress::V6 { addr, port, .. }, AddressFamily::Inet) => {
                let v6 = Ipv6Addr::from(addr);
                let v4 = if v6.is_unspecified() {
                    Some(Ipv4Addr::UNSPECIFIED)
                } else {
                    v6.to_ipv4_mapped()
                };
                v4.map(|v4| SocketAddress::V4 {
                    addr: v4.octets(),
                    port,
                })
            }
        }
    }

    /// IPv4-mapped IPv6 地址还原为 IPv4，其余地址原样返回。
    pub fn unmapped(self) -> Self {
        match self {
            SocketAddress::V6 { addr, port, .. } => match Ipv6Addr::from(addr).to_ipv4_mapped() {
                Some(v4) => SocketAddress::V4 {
                    addr: v4.octets(),
                    port,
                },
                None => self,
            },
            SocketAddress::V4 { .. } => self,
        }
    }

    /// 写入二进制布局，返回写入的字节数。
    ///
    /// 容量不足时返回 [`SocketError::BufferTooSmall`]，且目标缓冲区保持原样。
    pub fn encode(&self, dest: &mut [u8]) -> Result<usize, SocketError> {
        let required = self.encoded_len();
        if dest.len() < required {
            return Err(SocketError::BufferTooSmall {
                required,
                capacity: dest.len(),
            });
        }
        let out = &mut dest[..required];
        out.fill(0);
        out[0..2].copy_from_slice(&self.family().tag().to_ne_bytes());
        out[2..4].copy_from_slice(&self.port().to_be_bytes());
        match self {
            SocketAddress::V4 { addr, .. } => out[4..8].copy_from_slice(addr),
            SocketAddress::V6 { addr, scope_id, .. } => {
                out[8..24].copy_from_slice(&Ipv6Addr::from(*addr).octets());
                out[24..28].copy_from_slice(&scope_id.to_ne_bytes());
            }
        }
        Ok(required)
    }

    /// 从二进制布局还原地址。
    pub fn decode(src: &[u8]) -> Result<Self, SocketError> {
        if src.len() < 4 {
            return Err(SocketError::MalformedAddress);
        }
        let tag = u16::from_ne_bytes([src[0], src[1]]);
        let port = u16::from_be_bytes([src[2], src[3]]);
        match tag {
            FAMILY_TAG_INET if src.len() >= SOCKADDR_IN_LEN => Ok(SocketAddress::V4 {
                addr: [src[4], src[5], src[6], src[7]],
                port,
            }),
            FAMILY_TAG_INET6 if src.len() >= SOCKADDR_IN6_LEN => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&src[8..24]);
                let scope_id = u32::from_ne_bytes([src[24], src[25], src[26], src[27]]);
                Ok(SocketAddress::V6 {
                    addr: Ipv6Addr::from(octets).segments(),
                    port,
                    scope_id,
                })
            }
            _ => Err(SocketError::MalformedAddress),
        }
    }
}

/// 将文本地址与端口写入 `dest`，返回写入字节数。
///
/// 等价于 `SocketAddress::parse(ip_address, port)?.encode(dest)`：先解析、再校验容量、
/// 最后写入。
pub fn set_sockaddr(dest: &mut [u8], ip_address: &str, port: u16) -> Result<usize, SocketError> {
    set_sockaddr_with(dest, ip_address, port, IPV6_ENABLED)
}

fn set_sockaddr_with(
    dest: &mut [u8],
    ip_address: &str,
    port: u16,
    ipv6: bool,
) -> Result<usize, SocketError> {
    SocketAddress::parse_with(ip_address, port, ipv6)?.encode(dest)
}

/// 写入当前编译地址族的通配地址，返回写入字节数。
pub fn set_sockaddr_any(dest: &mut [u8], port: u16) -> Result<usize, SocketError> {
    SocketAddress::any(port).encode(dest)
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::from(*self).fmt(f)
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SocketAddress::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => SocketAddress::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
                scope_id: v6.scope_id(),
            },
        }
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> Self {
        match addr {
            SocketAddress::V4 { addr, port } => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port))
            }
            SocketAddress::V6 {
                addr,
                port,
                scope_id,
            } => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(addr), port, 0, scope_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_text_without_dual_stack_is_rejected() {
        let err = SocketAddress::parse_with("::1", 5353, false).unwrap_err();
        assert!(matches!(
            err,
            SocketError::FamilyUnsupported(AddressFamily::Inet6)
        ));
    }

    #[test]
    fn encoding_ipv6_text_without_dual_stack_leaves_buffer_untouched() {
        let mut buf = [0xAAu8; 16];
        let err = set_sockaddr_with(&mut buf, "::1", 5353, false).unwrap_err();
        assert!(matches!(
            err,
            SocketError::FamilyUnsupported(AddressFamily::Inet6)
        ));
        assert_eq!(buf, [0xAAu8; 16]);

        // 同一缓冲足以容纳 IPv4 地址，说明失败不是容量问题，也没有回退到 IPv4。
        assert_eq!(
            set_sockaddr_with(&mut buf, "127.0.0.1", 5353, false).unwrap(),
            SOCKADDR_IN_LEN
        );
    }

    #[test]
    fn ipv6_text_with_dual_stack_is_parsed() {
        let addr = SocketAddress::parse_with("::1", 5353, true).unwrap();
        assert_eq!(addr.family(), AddressFamily::Inet6);
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port(), 5353);
    }

    #[test]
    fn any_follows_compiled_family() {
        assert_eq!(
            SocketAddress::any_with(80, false),
            SocketAddress::V4 {
                addr: [0, 0, 0, 0],
                port: 80
            }
        );
        let v6 = SocketAddress::any_with(80, true);
        assert_eq!(v6.family(), AddressFamily::Inet6);
        assert!(v6.is_wildcard());
    }

    #[test]
    fn scoped_link_local_keeps_scope_id() {
        let addr = SocketAddress::parse_with("fe80::1%3", 9, true).unwrap();
        assert!(matches!(addr, SocketAddress::V6 { scope_id: 3, .. }));
        assert!(matches!(
            SocketAddress::parse_with("fe80::1%eth0", 9, true),
            Err(SocketError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn malformed_text_is_rejected() {
        for text in ["", "256.0.0.1", "1.2.3", "localhost", "1.2.3.4.5"] {
            assert!(
                matches!(
                    SocketAddress::parse_with(text, 1, true),
                    Err(SocketError::InvalidAddress { .. })
                ),
                "{text} should be rejected"
            );
        }
        assert!(matches!(
            SocketAddress::parse_with("::g", 1, true),
            Err(SocketError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn encode_writes_port_in_network_order() {
        let mut buf = [0xAAu8; SOCKADDR_IN_LEN];
        let addr = SocketAddress::parse_with("10.1.2.3", 0x1234, false).unwrap();
        assert_eq!(addr.encode(&mut buf).unwrap(), SOCKADDR_IN_LEN);
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
        assert_eq!(&buf[4..8], &[10, 1, 2, 3]);
        assert!(buf[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn mapped_conversion_round_trips() {
        let v4 = SocketAddress::parse_with("127.0.0.1", 1234, false).unwrap();
        let v6 = v4.to_family(AddressFamily::Inet6).unwrap();
        assert_eq!(v6.ip_text(), "::ffff:127.0.0.1");
        assert_eq!(v6.to_family(AddressFamily::Inet), Some(v4));

        let any = SocketAddress::any_with(7, false);
        assert!(any.to_family(AddressFamily::Inet6).unwrap().is_wildcard());

        let loopback6 = SocketAddress::parse_with("::1", 7, true).unwrap();
        assert_eq!(loopback6.to_family(AddressFamily::Inet), None);
    }

    #[test]
    fn decode_rejects_unknown_tags_and_short_input() {
        assert!(SocketAddress::decode(&[0u8; 3]).is_err());
        assert!(SocketAddress::decode(&[0u8; SOCKADDR_IN6_LEN]).is_err());
        let mut buf = [0u8; SOCKADDR_IN6_LEN];
        SocketAddress::any_with(1, true).encode(&mut buf).unwrap();
        assert!(SocketAddress::decode(&buf[..SOCKADDR_IN6_LEN - 1]).is_err());
    }
}
