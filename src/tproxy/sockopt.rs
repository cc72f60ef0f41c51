//! 内核 socket 选项能力表
//!
//! 透明代理相关选项的数值在进程内只解析一次。平台头文件（libc）提供的
//! 常量优先，缺失时使用 Linux 内核 ABI 文档中的数值。

use libc::c_int;
use std::sync::OnceLock;

/// 透明代理使用的 socket 选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockOptTable {
    pub sol_ip: c_int,
    pub sol_ipv6: c_int,
    /// linux/netfilter_ipv4.h
    pub so_original_dst: c_int,
    /// linux/netfilter_ipv6/ip6_tables.h
    pub ip6t_so_original_dst: c_int,
    pub ip_transparent: c_int,
    pub ipv6_transparent: c_int,
    pub ip_recvorigdstaddr: c_int,
    pub ipv6_recvorigdstaddr: c_int,
    pub ip_origdstaddr: c_int,
    pub ipv6_origdstaddr: c_int,
    pub ip_recvttl: c_int,
    pub ip_ttl: c_int,
    pub ipv6_recvhoplimit: c_int,
    pub ipv6_hoplimit: c_int,
    /// 平台不支持时为 None
    pub tcp_fastopen_connect: Option<c_int>,
}

impl SockOptTable {
    /// Linux 内核 ABI 数值
    pub const LINUX_ABI: SockOptTable = SockOptTable {
        sol_ip: 0,
        sol_ipv6: 41,
        so_original_dst: 80,
        ip6t_so_original_dst: 80,
        ip_transparent: 19,
        ipv6_transparent: 75,
        ip_recvorigdstaddr: 20,
        ipv6_recvorigdstaddr: 74,
        ip_origdstaddr: 20,
        ipv6_origdstaddr: 74,
        ip_recvttl: 12,
        ip_ttl: 2,
        ipv6_recvhoplimit: 51,
        ipv6_hoplimit: 52,
        tcp_fastopen_connect: Some(30),
    };

    #[cfg(target_os = "linux")]
    fn detect() -> SockOptTable {
        SockOptTable {
            sol_ip: libc::SOL_IP,
            sol_ipv6: libc::SOL_IPV6,
            ip_transparent: libc::IP_TRANSPARENT,
            ipv6_transparent: libc::IPV6_TRANSPARENT,
            ip_recvorigdstaddr: libc::IP_RECVORIGDSTADDR,
            ipv6_recvorigdstaddr: libc::IPV6_RECVORIGDSTADDR,
            ip_origdstaddr: libc::IP_ORIGDSTADDR,
            ipv6_origdstaddr: libc::IPV6_ORIGDSTADDR,
            ip_recvttl: libc::IP_RECVTTL,
            ip_ttl: libc::IP_TTL,
            ipv6_recvhoplimit: libc::IPV6_RECVHOPLIMIT,
            ipv6_hoplimit: libc::IPV6_HOPLIMIT,
            tcp_fastopen_connect: Some(libc::TCP_FASTOPEN_CONNECT),
            ..Self::LINUX_ABI
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn detect() -> SockOptTable {
        SockOptTable {
            tcp_fastopen_connect: None,
            ..Self::LINUX_ABI
        }
    }
}

/// 当前平台的能力表
pub fn sockopts() -> &'static SockOptTable {
    static TABLE: OnceLock<SockOptTable> = OnceLock::new();
    TABLE.get_or_init(SockOptTable::detect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_resolved_once() {
        let a = sockopts() as *const SockOptTable;
        let b = sockopts() as *const SockOptTable;
        assert_eq!(a, b);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_headers_match_abi() {
        assert_eq!(*sockopts(), SockOptTable::LINUX_ABI);
    }
}
