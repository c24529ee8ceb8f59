//! Local Layer-2 endpoints.
//!
//! Raw mode opens a PF_PACKET socket bound to a physical interface and
//! reconstructs 802.1Q tags from the kernel's packet auxdata, since the
//! kernel strips VLAN headers before delivering frames to packet sockets.
//! Tap modes read and write a TAP character device and carry frames
//! verbatim.
//!
//! This is the only module that talks to libc directly; everything it
//! hands out is a plain frame in a caller-owned buffer.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use tun::Device as _;

use crate::config::{Config, Mode};
use crate::error::{Result, TunnelError};

/// Largest Ethernet frame carried through the tunnel.
pub const MAX_FRAME: usize = 2048;
/// Headroom reserved in receive buffers for a synthesised 802.1Q tag.
pub const VLAN_TAG_LEN: usize = 4;

/// Matches the UDP side's receive buffer sizing.
const RECV_BUFFER_BYTES: usize = 40 * 1024 * 1024;

// Not exported by every libc version; value is fixed kernel ABI.
const TP_STATUS_VLAN_VALID: u32 = 1 << 4;

/// Receiving half of the local endpoint; owned by the tap-to-UDP task.
pub enum TapReader {
    Raw(Arc<PacketSocket>),
    Dev(ReadHalf<tun::AsyncDevice>),
}

/// Sending half; cloned into each UDP-to-tap task.
#[derive(Clone)]
pub enum TapWriter {
    Raw(Arc<PacketSocket>),
    Dev(Arc<Mutex<WriteHalf<tun::AsyncDevice>>>),
}

/// Open the endpoint described by the configuration.
pub fn open(config: &Config) -> Result<(TapReader, TapWriter)> {
    match &config.mode {
        Mode::Ether { interface } => {
            let socket = Arc::new(PacketSocket::open(interface, !config.no_promisc)?);
            Ok((TapReader::Raw(socket.clone()), TapWriter::Raw(socket)))
        }
        Mode::Tap { address, prefix_len } => {
            let mut cfg = tun::Configuration::default();
            cfg.layer(tun::Layer::L2)
                .address(*address)
                .netmask(mask_from_prefix(*prefix_len))
                .up();
            cfg.platform(|p| {
                p.packet_information(false);
            });
            open_device(&cfg)
        }
        Mode::Bridge { bridge } => {
            let mut cfg = tun::Configuration::default();
            cfg.layer(tun::Layer::L2).up();
            cfg.platform(|p| {
                p.packet_information(false);
            });
            let endpoint = open_device(&cfg)?;
            info!(bridge = %bridge, "tap ready; add it to the bridge to go live");
            Ok(endpoint)
        }
    }
}

fn open_device(cfg: &tun::Configuration) -> Result<(TapReader, TapWriter)> {
    let dev = tun::create_as_async(cfg).map_err(|e| TunnelError::Tap(e.to_string()))?;
    info!(device = ?dev.get_ref().name(), "tap device opened");
    let (reader, writer) = tokio::io::split(dev);
    Ok((
        TapReader::Dev(reader),
        TapWriter::Dev(Arc::new(Mutex::new(writer))),
    ))
}

fn mask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len.min(32))))
    }
}

impl TapReader {
    /// Receive one frame into `buf` (sized `MAX_FRAME + VLAN_TAG_LEN` or
    /// more) and return `(length, offset)`: the frame occupies
    /// `buf[offset..offset + length]`. Raw mode reserves the first
    /// `VLAN_TAG_LEN` bytes so a stripped tag can be reinserted without
    /// copying the payload; offset is 0 exactly when a tag was inserted.
    pub async fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<(usize, usize)> {
        match self {
            TapReader::Raw(socket) => socket.recv_frame(buf).await,
            TapReader::Dev(dev) => {
                let max = buf.len().min(MAX_FRAME);
                let n = dev.read(&mut buf[..max]).await?;
                Ok((n, 0))
            }
        }
    }
}

impl TapWriter {
    /// Transmit one frame verbatim. Short writes cannot happen on either
    /// endpoint kind; errors are the caller's signal to drop the frame.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        match self {
            TapWriter::Raw(socket) => socket.send_frame(frame).await,
            TapWriter::Dev(dev) => {
                dev.lock().await.write(frame).await?;
                Ok(())
            }
        }
    }
}

/// PF_PACKET socket bound to one interface, with packet auxdata enabled.
pub struct PacketSocket {
    fd: AsyncFd<OwnedFd>,
    ifindex: i32,
}

impl PacketSocket {
    pub fn open(interface: &str, promisc: bool) -> Result<Self> {
        if interface.len() >= libc::IFNAMSIZ {
            return Err(TunnelError::Config(format!(
                "interface name '{interface}' too long"
            )));
        }
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(protocol),
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ifindex = interface_index(&fd, interface)?;
        if promisc {
            set_promiscuous(&fd, interface)?;
        }

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol;
        sll.sll_ifindex = ifindex;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Before the bind the socket saw every interface; drain whatever
        // queued up so the first frames forwarded really are ours.
        let mut scratch = [0u8; MAX_FRAME];
        loop {
            let n = unsafe {
                libc::recv(
                    fd.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                break;
            }
        }

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_AUXDATA,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOPROTOOPT) {
                return Err(err.into());
            }
        }

        let rcvbuf: libc::c_int = RECV_BUFFER_BYTES as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!(interface, "could not grow raw receive buffer");
        }

        info!(interface, ifindex, promisc, "raw packet socket ready");
        Ok(Self { fd: AsyncFd::new(fd)?, ifindex })
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<(usize, usize)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_with_auxdata(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(
                        inner.get_ref().as_raw_fd(),
                        frame.as_ptr().cast(),
                        frame.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match sent {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// One `recvmsg` with room for packet auxdata. Returns `(length, offset)`
/// per the [`TapReader::recv_frame`] contract.
fn recv_with_auxdata(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, usize)> {
    let capacity = buf.len().saturating_sub(VLAN_TAG_LEN).min(MAX_FRAME);
    let mut iov = libc::iovec {
        iov_base: buf[VLAN_TAG_LEN..].as_mut_ptr().cast(),
        iov_len: capacity,
    };
    // 8-aligned storage for the control messages
    let mut cmsg_space = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&cmsg_space) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_TRUNC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    // MSG_TRUNC reports the untruncated length
    let len = (n as usize).min(capacity);

    if let Some(tci) = vlan_tci(&msg) {
        if len >= 12 {
            return Ok((insert_vlan_tag(buf, len, tci), 0));
        }
    }
    Ok((len, VLAN_TAG_LEN))
}

/// Extract the VLAN TCI from packet auxdata, if the kernel flagged one as
/// valid. A TCI of zero without the validity flag means "no tag".
fn vlan_tci(msg: &libc::msghdr) -> Option<u16> {
    let aux_len = mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::tpacket_auxdata>();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_PACKET
            && header.cmsg_type == libc::PACKET_AUXDATA
            && header.cmsg_len as usize >= aux_len
        {
            let aux = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::tpacket_auxdata) };
            if aux.tp_status & TP_STATUS_VLAN_VALID != 0 {
                return Some(aux.tp_vlan_tci);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

/// Shift the MAC addresses into the reserved headroom and write the 802.1Q
/// tag behind them. The received frame sits at `buf[VLAN_TAG_LEN..]` with
/// `len` valid bytes; returns the tagged frame's length at offset 0.
fn insert_vlan_tag(buf: &mut [u8], len: usize, tci: u16) -> usize {
    buf.copy_within(VLAN_TAG_LEN..VLAN_TAG_LEN + 12, 0);
    buf[12] = 0x81;
    buf[13] = 0x00;
    buf[14..16].copy_from_slice(&tci.to_be_bytes());
    len + VLAN_TAG_LEN
}

fn interface_index(fd: &OwnedFd, interface: &str) -> Result<i32> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    copy_ifname(&mut ifr, interface);
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFINDEX, &mut ifr) };
    if rc != 0 {
        return Err(TunnelError::Config(format!(
            "interface '{interface}': {}",
            io::Error::last_os_error()
        )));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

fn set_promiscuous(fd: &OwnedFd, interface: &str) -> Result<()> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    copy_ifname(&mut ifr, interface);
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_PROMISC as libc::c_short;
    }
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS, &mut ifr) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn copy_ifname(ifr: &mut libc::ifreq, interface: &str) {
    for (dst, src) in ifr.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
}
