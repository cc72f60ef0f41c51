//! 原始目标地址恢复
//!
//! - NAT（iptables REDIRECT）重定向的 TCP 连接：通过 SO_ORIGINAL_DST 查询
//! - tproxy 重定向的 UDP 数据报：通过 IP_ORIGDSTADDR / IP_TTL 控制消息获取
//! - 透明 UDP socket 的收发配置

#[cfg(target_os = "linux")]
mod linux;
mod sockopt;

pub use sockopt::{sockopts, SockOptTable};

#[cfg(target_os = "linux")]
pub(crate) use linux::setsockopt_int;

use crate::error::{RelayError, Result};
#[cfg(target_os = "linux")]
use socket2::SockRef;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd};
use tokio::net::UdpSocket;

/// 协议头和封装预留：1 + 28 + 2 + 64
pub const PACKET_HEADER_SIZE: usize = 1 + 28 + 2 + 64;

/// UDP 中继使用的路径 MTU
pub const UDP_PATH_MTU: usize = 1492;

/// 每个数据报的最大中继负载
pub const DEFAULT_PACKET_SIZE: usize = UDP_PATH_MTU - PACKET_HEADER_SIZE;

/// 被重定向前客户端想要访问的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalDestination {
    pub addr: SocketAddr,
    /// 入站数据报的 TTL / hop limit
    pub ttl: Option<u8>,
}

/// 通过 tproxy 收到的一个数据报
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TproxyDatagram {
    /// 写入缓冲区的字节数
    pub len: usize,
    /// 发送方地址
    pub source: SocketAddr,
    pub target: OriginalDestination,
}

/// 把 IPv4 映射的 IPv6 地址还原为 IPv4
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// 查询 NAT 重定向前的原始目标地址
///
/// socket 没有经过 NAT 重定向时返回 `DestinationUnavailable`。
#[cfg(target_os = "linux")]
pub fn recover_tcp_original_destination<S: AsRawFd>(socket: &S) -> Result<SocketAddr> {
    let fd = socket.as_raw_fd();
    let local = linux::local_addr(fd)?;
    let original = linux::original_dst(fd, local.is_ipv6()).map_err(|e| {
        RelayError::destination_unavailable(format!("SO_ORIGINAL_DST query failed: {}", e))
    })?;

    let original = canonical(original);
    if original == canonical(local) {
        return Err(RelayError::destination_unavailable(
            "connection was not redirected",
        ));
    }
    Ok(original)
}

#[cfg(not(target_os = "linux"))]
pub fn recover_tcp_original_destination<S: AsRawFd>(_socket: &S) -> Result<SocketAddr> {
    Err(RelayError::destination_unavailable(
        "NAT redirection is not supported on this platform",
    ))
}

/// 接收一个 tproxy 数据报及其原始目标地址
///
/// 缺少原始目标控制消息时返回 `MalformedAncillaryData`，数据报超出
/// `buf` 时返回 `DatagramTruncated`。
#[cfg(target_os = "linux")]
pub async fn recover_udp_target(socket: &UdpSocket, buf: &mut [u8]) -> Result<TproxyDatagram> {
    let fd = socket.as_raw_fd();
    let raw = socket
        .async_io(tokio::io::Interest::READABLE, || linux::recv_msg(fd, buf))
        .await?;

    if raw.truncated {
        return Err(RelayError::DatagramTruncated { limit: buf.len() });
    }
    let ancillary = raw.ancillary.map_err(RelayError::MalformedAncillaryData)?;
    let addr = ancillary.target.ok_or_else(|| {
        RelayError::malformed_ancillary("original destination control message is missing")
    })?;

    Ok(TproxyDatagram {
        len: raw.len,
        source: canonical(raw.source),
        target: OriginalDestination {
            addr: canonical(addr),
            ttl: ancillary.ttl,
        },
    })
}

#[cfg(not(target_os = "linux"))]
pub async fn recover_udp_target(_socket: &UdpSocket, _buf: &mut [u8]) -> Result<TproxyDatagram> {
    Err(RelayError::malformed_ancillary(
        "original destination control messages are not supported on this platform",
    ))
}

/// 请求内核在后续数据报上附带原始目标地址（以及可选的 TTL）
///
/// 不需要特权，可重复调用。
#[cfg(target_os = "linux")]
pub fn enable_original_dst_recv<S: AsRawFd>(socket: &S, is_ipv4: bool, want_ttl: bool) -> Result<()> {
    let fd = socket.as_raw_fd();
    let table = sockopts();
    let (level, origdst, recvttl) = if is_ipv4 {
        (table.sol_ip, table.ip_recvorigdstaddr, table.ip_recvttl)
    } else {
        (table.sol_ipv6, table.ipv6_recvorigdstaddr, table.ipv6_recvhoplimit)
    };

    linux::setsockopt_int(fd, level, origdst, 1)
        .map_err(|e| annotate(e, "setsockopt IP_RECVORIGDSTADDR"))?;
    if want_ttl {
        linux::setsockopt_int(fd, level, recvttl, 1)
            .map_err(|e| annotate(e, "setsockopt IP_RECVTTL"))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_original_dst_recv<S: AsRawFd>(_socket: &S, _is_ipv4: bool, _want_ttl: bool) -> Result<()> {
    Err(unsupported())
}

/// 配置 tproxy 监听用的 UDP socket（需要 CAP_NET_ADMIN）
#[cfg(target_os = "linux")]
pub fn bind_transparent_udp<S: AsRawFd>(socket: &S, is_ipv4: bool, want_ttl: bool) -> Result<()> {
    set_transparent(socket.as_raw_fd(), is_ipv4)?;
    enable_original_dst_recv(socket, is_ipv4, want_ttl)
}

#[cfg(not(target_os = "linux"))]
pub fn bind_transparent_udp<S: AsRawFd>(_socket: &S, _is_ipv4: bool, _want_ttl: bool) -> Result<()> {
    Err(unsupported())
}

/// 让出站 UDP socket 以 `target` 为源地址发送，回包看起来来自原始目标
#[cfg(target_os = "linux")]
pub fn bind_transparent_udp_target<S: AsFd>(
    socket: &S,
    is_ipv4: bool,
    target: SocketAddr,
) -> Result<()> {
    let sock = SockRef::from(socket);
    sock.set_reuse_address(true)
        .map_err(|e| annotate(e, "setsockopt SO_REUSEADDR"))?;
    set_transparent(socket.as_fd().as_raw_fd(), is_ipv4)?;
    sock.bind(&target.into())
        .map_err(|e| annotate(e, &format!("bind {}", target)))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_transparent_udp_target<S: AsFd>(
    _socket: &S,
    _is_ipv4: bool,
    _target: SocketAddr,
) -> Result<()> {
    Err(unsupported())
}

#[cfg(target_os = "linux")]
fn set_transparent(fd: std::os::fd::RawFd, is_ipv4: bool) -> Result<()> {
    let table = sockopts();
    let (level, name) = if is_ipv4 {
        (table.sol_ip, table.ip_transparent)
    } else {
        (table.sol_ipv6, table.ipv6_transparent)
    };
    linux::setsockopt_int(fd, level, name, 1)
        .map_err(|e| annotate(e, "setsockopt IP_TRANSPARENT"))
}

#[cfg(target_os = "linux")]
fn annotate(err: std::io::Error, what: &str) -> RelayError {
    RelayError::Io(std::io::Error::new(err.kind(), format!("{} failed: {}", what, err)))
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> RelayError {
    RelayError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "transparent proxy sockets require Linux",
    ))
}
