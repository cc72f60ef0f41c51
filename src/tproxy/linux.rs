//! Linux 上的 NAT/tproxy 原始目标提取

use super::sockopt::sockopts;
use libc::{c_int, c_void, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

/// 控制消息缓冲区（按 cmsghdr 对齐）
const CONTROL_WORDS: usize = 64;

pub(crate) fn setsockopt_int(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn getsockopt_raw<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut value = MaybeUninit::<T>::zeroed();
    let mut len = mem::size_of::<T>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, level, name, value.as_mut_ptr() as *mut c_void, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { value.assume_init() })
}

fn v4_from_raw(sin: &sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

fn v6_from_raw(sin6: &sockaddr_in6) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
        u16::from_be(sin6.sin6_port),
        sin6.sin6_flowinfo,
        sin6.sin6_scope_id,
    ))
}

fn from_storage(storage: &sockaddr_storage, len: socklen_t) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in) };
            Ok(v4_from_raw(sin))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in6) };
            Ok(v6_from_raw(sin6))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", family),
        )),
    }
}

pub(super) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = MaybeUninit::<sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    let rc = unsafe { libc::getsockname(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    from_storage(unsafe { &storage.assume_init() }, len)
}

/// 查询 SO_ORIGINAL_DST（IPv6 socket 先查 IP6T_SO_ORIGINAL_DST）
pub(super) fn original_dst(fd: RawFd, is_ipv6: bool) -> io::Result<SocketAddr> {
    let table = sockopts();
    if is_ipv6 {
        if let Ok(sin6) = getsockopt_raw::<sockaddr_in6>(fd, table.sol_ipv6, table.ip6t_so_original_dst) {
            return Ok(v6_from_raw(&sin6));
        }
    }
    getsockopt_raw::<sockaddr_in>(fd, table.sol_ip, table.so_original_dst).map(|sin| v4_from_raw(&sin))
}

/// 从控制消息中解析出的字段
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Ancillary {
    pub target: Option<SocketAddr>,
    pub ttl: Option<u8>,
}

pub(super) struct RawDatagram {
    pub len: usize,
    pub source: SocketAddr,
    pub truncated: bool,
    pub ancillary: Result<Ancillary, String>,
}

/// 非阻塞 recvmsg，同时收取控制消息
pub(super) fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<RawDatagram> {
    let mut source = MaybeUninit::<sockaddr_storage>::zeroed();
    let mut control = [0u64; CONTROL_WORDS];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = source.as_mut_ptr() as *mut c_void;
    msg.msg_namelen = mem::size_of::<sockaddr_storage>() as socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let source = from_storage(unsafe { &source.assume_init() }, msg.msg_namelen)?;
    let ancillary = unsafe { parse_control(&msg) };
    Ok(RawDatagram {
        len: n as usize,
        source,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        ancillary,
    })
}

unsafe fn read_cmsg<T: Copy>(cmsg: *const libc::cmsghdr) -> Result<T, String> {
    let need = libc::CMSG_LEN(mem::size_of::<T>() as u32) as usize;
    if ((*cmsg).cmsg_len as usize) < need {
        return Err(format!(
            "control message level={} type={} too short ({} < {})",
            (*cmsg).cmsg_level,
            (*cmsg).cmsg_type,
            (*cmsg).cmsg_len,
            need
        ));
    }
    Ok(ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const T))
}

/// 遍历控制消息，取出原始目标地址和 TTL/hop limit
///
/// # Safety
/// `msg` 的控制缓冲区必须有效且 `msg_controllen` 不超过其长度。
pub(super) unsafe fn parse_control(msg: &libc::msghdr) -> Result<Ancillary, String> {
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(format!(
            "control messages truncated (MSG_CTRUNC, buffer {} bytes)",
            msg.msg_controllen
        ));
    }

    let table = sockopts();
    let mut out = Ancillary::default();

    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let level = (*cmsg).cmsg_level;
        let kind = (*cmsg).cmsg_type;

        if level == table.sol_ip && kind == table.ip_origdstaddr {
            out.target = Some(v4_from_raw(&read_cmsg::<sockaddr_in>(cmsg)?));
        } else if level == table.sol_ipv6 && kind == table.ipv6_origdstaddr {
            out.target = Some(v6_from_raw(&read_cmsg::<sockaddr_in6>(cmsg)?));
        } else if (level == table.sol_ip && kind == table.ip_ttl)
            || (level == table.sol_ipv6 && kind == table.ipv6_hoplimit)
        {
            let value = read_cmsg::<c_int>(cmsg)?;
            out.ttl = u8::try_from(value).ok();
        }

        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }

    Ok(out)
}
