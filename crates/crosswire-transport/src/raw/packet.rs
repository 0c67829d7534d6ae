//! `AF_PACKET` link bound to one interface and EtherType `0x88B5`.
//!
//! Requires `CAP_NET_RAW`. Only Linux has packet sockets; elsewhere
//! [`PacketLink::open`] reports [`TransportError::Unsupported`].

use async_trait::async_trait;

use crate::codec::MacAddr;
use crate::error::{Result, TransportError};
use crate::raw::link::FrameLink;

#[cfg(target_os = "linux")]
pub use linux::PacketLink;

#[cfg(not(target_os = "linux"))]
pub use fallback::PacketLink;

/// Parse the `aa:bb:cc:dd:ee:ff` contents of `/sys/class/net/<if>/address`.
pub fn parse_sysfs_mac(contents: &str) -> Result<MacAddr> {
    contents.trim().parse()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::io::Read;
    use std::mem;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use tokio::io::unix::AsyncFd;
    use tracing::info;

    use crosswire_shared::constants::ETHER_TYPE;

    use super::*;

    /// Large enough for any standard Ethernet frame.
    const RECV_BUF: usize = 2048;

    #[derive(Debug)]
    pub struct PacketLink {
        fd: AsyncFd<Socket>,
        mac: MacAddr,
        interface: String,
    }

    impl PacketLink {
        pub fn open(interface: &str) -> Result<Self> {
            let ifindex = interface_index(interface)?;
            let mac = interface_mac(interface)?;

            let protocol = i32::from(ETHER_TYPE.to_be());
            let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))?;

            // SAFETY: sockaddr_storage is large enough for sockaddr_ll and
            // is fully zeroed before the three fields we need are set.
            let addr = unsafe {
                let mut storage: libc::sockaddr_storage = mem::zeroed();
                let sll = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
                (*sll).sll_family = libc::AF_PACKET as libc::sa_family_t;
                (*sll).sll_protocol = ETHER_TYPE.to_be();
                (*sll).sll_ifindex = ifindex;
                SockAddr::new(
                    storage,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            socket.bind(&addr)?;
            socket.set_nonblocking(true)?;

            info!(interface, %mac, ifindex, "opened raw packet socket");

            Ok(Self {
                fd: AsyncFd::new(socket)?,
                mac,
                interface: interface.to_string(),
            })
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }
    }

    fn interface_index(interface: &str) -> Result<i32> {
        let name = CString::new(interface)
            .map_err(|_| TransportError::InvalidAddress(interface.to_string()))?;
        // SAFETY: `name` is a valid NUL-terminated string for the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(index as i32)
    }

    fn interface_mac(interface: &str) -> Result<MacAddr> {
        let path = format!("/sys/class/net/{interface}/address");
        let contents = std::fs::read_to_string(path)?;
        parse_sysfs_mac(&contents)
    }

    #[async_trait]
    impl FrameLink for PacketLink {
        async fn send(&self, frame: &[u8]) -> Result<()> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send(frame)) {
                    Ok(result) => {
                        result?;
                        return Ok(());
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            let mut buf = vec![0u8; RECV_BUF];
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let mut socket: &Socket = inner.get_ref();
                    socket.read(&mut buf)
                }) {
                    Ok(result) => {
                        let n = result?;
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        fn local_mac(&self) -> MacAddr {
            self.mac
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    #[derive(Debug)]
    pub struct PacketLink {
        mac: MacAddr,
    }

    impl PacketLink {
        pub fn open(interface: &str) -> Result<Self> {
            Err(TransportError::Unsupported(format!(
                "raw packet sockets are Linux-only (interface {interface})"
            )))
        }
    }

    #[async_trait]
    impl FrameLink for PacketLink {
        async fn send(&self, _frame: &[u8]) -> Result<()> {
            Err(TransportError::Unsupported("raw packet sockets".into()))
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            Err(TransportError::Unsupported("raw packet sockets".into()))
        }

        fn local_mac(&self) -> MacAddr {
            self.mac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sysfs_mac() {
        let mac = parse_sysfs_mac("0a:1b:2c:3d:4e:5f\n").unwrap();
        assert_eq!(mac, MacAddr([0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]));
        assert!(parse_sysfs_mac("").is_err());
    }
}
