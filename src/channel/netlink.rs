//! Raw netlink datagram transport.

use std::{io, mem, os::unix::io::RawFd};

use super::Transport;

/// Netlink socket bound to this process, unicasting to the kernel.
pub struct NetlinkTransport {
    fd: RawFd,
}

impl NetlinkTransport {
    /// Creates and binds the socket. Fails when the collaborator module is
    /// not loaded.
    pub fn connect(family: i32) -> io::Result<NetlinkTransport> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, family) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = unsafe { libc::getpid() } as u32;
        // unicast
        addr.nl_groups = 0;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(NetlinkTransport { fd })
    }

    fn kernel_addr() -> libc::sockaddr_nl {
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // nl_pid 0 addresses the kernel
        addr
    }
}

impl Transport for NetlinkTransport {
    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        let dst = Self::kernel_addr();
        let rc = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &dst as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for NetlinkTransport {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
