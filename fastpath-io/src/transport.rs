//! Raw-socket datagram transport over slot buffers.
//!
//! Payload bytes move straight between caller slots and the kernel: single
//! datagrams through `sendto`/`recvfrom`, batches through one `sendmmsg`/`recvmmsg`
//! call whose descriptors point into the slots themselves.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use log::debug;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{NetError, Result};
use crate::slot::{AddressFamily, Slot, SlotRegion};

/// Upper bound on messages per batched call.
pub const MAX_BATCH: usize = 1024;

/// The socket operations the transport issues. Implemented for [`socket2::Socket`];
/// tests substitute a recording stub.
pub trait RawIo {
    fn send_to(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)>;

    /// # Safety
    /// Every header's name and iovec pointers must be valid for the duration of the call.
    unsafe fn send_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize>;

    /// Blocks for the first datagram, then drains whatever is already queued.
    ///
    /// # Safety
    /// Same as [`RawIo::send_mmsg`]; the pointed-to memory must also be writable.
    unsafe fn recv_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize>;

    fn set_send_buffer_size(&self, bytes: usize) -> io::Result<()>;

    fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

impl RawIo for Socket {
    fn send_to(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
        Socket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
        // SAFETY: initialized bytes are valid `MaybeUninit<u8>`; the kernel only writes.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        Socket::recv_from(self, uninit)
    }

    unsafe fn send_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize> {
        let ret = libc::sendmmsg(self.as_raw_fd(), msgs.as_mut_ptr(), msgs.len() as libc::c_uint, 0);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    unsafe fn recv_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize> {
        let ret = libc::recvmmsg(
            self.as_raw_fd(),
            msgs.as_mut_ptr(),
            msgs.len() as libc::c_uint,
            libc::MSG_WAITFORONE,
            ptr::null_mut(),
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn set_send_buffer_size(&self, bytes: usize) -> io::Result<()> {
        Socket::set_send_buffer_size(self, bytes)
    }

    fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        Socket::set_recv_buffer_size(self, bytes)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Socket::set_read_timeout(self, timeout)
    }

    fn close(self) -> io::Result<()> {
        let fd = self.into_raw_fd();
        // SAFETY: `fd` was just released by the socket and is closed exactly once.
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Socket options applied by [`RawSocket::open_with`].
#[derive(Debug, Clone)]
pub struct RawSocketConfig {
    pub family: AddressFamily,
    /// IP protocol number, e.g. 253 for experimental traffic.
    pub protocol: i32,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    pub read_timeout: Option<Duration>,
}

impl RawSocketConfig {
    pub fn new(family: AddressFamily, protocol: i32) -> Self {
        Self { family, protocol, send_buffer: None, recv_buffer: None, read_timeout: None }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
union SockName {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SockName {
    fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => SockName {
                v4: libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: 0,
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.octets()) },
                    sin_zero: [0; 8],
                },
            },
            IpAddr::V6(v6) => SockName {
                v6: libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: 0,
                    sin6_flowinfo: 0,
                    sin6_addr: libc::in6_addr { s6_addr: v6.octets() },
                    sin6_scope_id: 0,
                },
            },
        }
    }

    fn to_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        // SAFETY: every variant is plain old data and the buffer starts zeroed, so any
        // read yields initialized bytes; the family tag selects the meaningful one.
        unsafe {
            match family {
                AddressFamily::Ipv4 if self.v4.sin_family == libc::AF_INET as libc::sa_family_t => {
                    Some(IpAddr::V4(Ipv4Addr::from(self.v4.sin_addr.s_addr.to_ne_bytes())))
                }
                AddressFamily::Ipv6 if self.v6.sin6_family == libc::AF_INET6 as libc::sa_family_t => {
                    Some(IpAddr::V6(Ipv6Addr::from(self.v6.sin6_addr.s6_addr)))
                }
                _ => None,
            }
        }
    }
}

const fn sockaddr_len(family: AddressFamily) -> libc::socklen_t {
    match family {
        AddressFamily::Ipv4 => mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        AddressFamily::Ipv6 => mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
    }
}

/// Descriptor storage for one batched call, sized once to [`MAX_BATCH`].
struct BatchScratch {
    headers: Vec<libc::mmsghdr>,
    iovecs: Vec<libc::iovec>,
    names: Vec<SockName>,
}

// SAFETY: the raw pointers inside are rebuilt at the start of every call and never
// dereferenced once that call returns.
unsafe impl Send for BatchScratch {}

impl BatchScratch {
    fn new() -> Self {
        Self {
            headers: Vec::with_capacity(MAX_BATCH),
            iovecs: Vec::with_capacity(MAX_BATCH),
            names: Vec::with_capacity(MAX_BATCH),
        }
    }

    fn reset(&mut self, count: usize) {
        debug_assert!(count <= MAX_BATCH);
        // SAFETY: all-zero is a valid bit pattern for these C structs.
        let (header, name) = unsafe { (mem::zeroed::<libc::mmsghdr>(), mem::zeroed::<SockName>()) };
        let iovec = libc::iovec { iov_base: ptr::null_mut(), iov_len: 0 };

        self.headers.clear();
        self.headers.resize(count, header);
        self.iovecs.clear();
        self.iovecs.resize(count, iovec);
        self.names.clear();
        self.names.resize(count, name);
    }

    fn set_iov(&mut self, index: usize, base: *mut u8, len: usize) {
        self.iovecs[index] = libc::iovec { iov_base: base.cast(), iov_len: len };
    }

    fn set_peer(&mut self, index: usize, peer: IpAddr) {
        self.names[index] = SockName::from_ip(peer);
    }

    /// Points every header at its iovec and name storage.
    fn link(&mut self, family: AddressFamily) -> &mut [libc::mmsghdr] {
        let namelen = sockaddr_len(family);
        for (index, header) in self.headers.iter_mut().enumerate() {
            let hdr = &mut header.msg_hdr;
            hdr.msg_iov = &mut self.iovecs[index];
            hdr.msg_iovlen = 1;
            hdr.msg_name = (&mut self.names[index] as *mut SockName).cast();
            hdr.msg_namelen = namelen;
        }
        &mut self.headers
    }

    fn message_len(&self, index: usize) -> u32 {
        self.headers[index].msg_len
    }

    fn peer(&self, index: usize, family: AddressFamily) -> Option<IpAddr> {
        if self.headers[index].msg_hdr.msg_namelen == 0 {
            return None;
        }
        self.names[index].to_ip(family)
    }
}

fn check_batch_len(requested: usize) -> Result<()> {
    if requested > MAX_BATCH {
        return Err(NetError::BatchTooLarge { requested, max: MAX_BATCH });
    }
    Ok(())
}

/// A raw IP socket bound to one address family, plus the batch descriptors it reuses.
///
/// # Thread Safety
/// One thread drives a socket at a time; nothing inside is synchronized.
pub struct RawSocket<S: RawIo = Socket> {
    io: Option<S>,
    family: AddressFamily,
    scratch: BatchScratch,
}

impl RawSocket<Socket> {
    /// Opens `socket(family, SOCK_RAW, protocol)`.
    ///
    /// # Errors
    /// `NetError::Os` if the kernel refuses the socket (commonly `EPERM` without `CAP_NET_RAW`).
    pub fn open(family: AddressFamily, protocol: i32) -> Result<Self> {
        let domain = match family {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(protocol)))
            .map_err(|e| NetError::os("socket", e))?;
        debug!("Raw {} socket open (fd: {}, protocol: {})", family, socket.as_raw_fd(), protocol);
        Ok(Self::from_io(socket, family))
    }

    pub fn open_with(config: &RawSocketConfig) -> Result<Self> {
        let socket = Self::open(config.family, config.protocol)?;
        if let Some(bytes) = config.send_buffer {
            socket.set_send_buffer_size(bytes)?;
        }
        if let Some(bytes) = config.recv_buffer {
            socket.set_recv_buffer_size(bytes)?;
        }
        if config.read_timeout.is_some() {
            socket.set_read_timeout(config.read_timeout)?;
        }
        Ok(socket)
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.io.as_ref().map(|s| s.as_raw_fd())
    }
}

impl<S: RawIo> RawSocket<S> {
    pub fn from_io(io: S, family: AddressFamily) -> Self {
        Self { io: Some(io), family, scratch: BatchScratch::new() }
    }

    #[inline]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    fn io(&self) -> Result<&S> {
        self.io.as_ref().ok_or(NetError::Closed)
    }

    pub fn set_send_buffer_size(&self, bytes: usize) -> Result<()> {
        self.io()?.set_send_buffer_size(bytes).map_err(|e| NetError::os("setsockopt(SO_SNDBUF)", e))
    }

    pub fn set_recv_buffer_size(&self, bytes: usize) -> Result<()> {
        self.io()?.set_recv_buffer_size(bytes).map_err(|e| NetError::os("setsockopt(SO_RCVBUF)", e))
    }

    /// Bounds blocking receives; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.io()?.set_read_timeout(timeout).map_err(|e| NetError::os("setsockopt(SO_RCVTIMEO)", e))
    }

    /// Receives one datagram into the payload area of `buffer`, treated as a single
    /// slot, and records the sender and length in the slot header.
    ///
    /// Returns the datagram size reported by the kernel.
    pub fn receive_one(&self, buffer: &mut [u8]) -> Result<usize> {
        let io = self.io()?;
        let mut slot = Slot::new(buffer, self.family)?;
        let (received, addr) = io.recv_from(slot.payload_mut()).map_err(|e| NetError::os("recvfrom", e))?;
        if let Some(peer) = addr.as_socket() {
            slot.set_peer(peer.ip())?;
        }
        slot.set_payload_len(received.min(slot.capacity()) as u32);
        Ok(received)
    }

    /// Sends `length` payload bytes of the single slot in `buffer` to the slot's peer.
    pub fn send_one(&self, buffer: &[u8], length: usize) -> Result<usize> {
        let io = self.io()?;
        let slot = Slot::new(buffer, self.family)?;
        if length > slot.capacity() {
            return Err(NetError::PayloadOverflow { len: length, capacity: slot.capacity() });
        }
        let addr = SockAddr::from(SocketAddr::new(slot.peer(), 0));
        io.send_to(&slot.payload()[..length], &addr).map_err(|e| NetError::os("sendto", e))
    }

    /// Sends the first `slot_count` slots of `buffer` with one `sendmmsg` call.
    ///
    /// # Logic
    /// Each slot contributes its peer address and `payload_len` bytes of payload. One
    /// `mmsghdr` per slot is built in the socket's scratch region; its iovec points
    /// straight at the slot payload. Returns how many messages the kernel accepted,
    /// which may be fewer than `slot_count`. A short count is not an error.
    ///
    /// # Performance
    /// No payload is copied and nothing is allocated: the scratch region is sized to
    /// [`MAX_BATCH`] when the socket is created and reset per call.
    ///
    /// # Errors
    /// Argument errors are reported before any syscall. These cover a batch over
    /// [`MAX_BATCH`], undersized slots or buffer, and a length field beyond slot
    /// capacity. `NetError::Os` carries the `sendmmsg` errno; `NetError::Closed`
    /// follows [`RawSocket::close`].
    pub fn send_batch(&mut self, buffer: &[u8], slot_count: usize, slot_size: usize) -> Result<usize> {
        let io = self.io.as_ref().ok_or(NetError::Closed)?;
        check_batch_len(slot_count)?;
        if slot_count == 0 {
            return Ok(0);
        }

        let region = SlotRegion::new(buffer, self.family, slot_size)?;
        region.require(slot_count)?;

        let scratch = &mut self.scratch;
        scratch.reset(slot_count);
        for index in 0..slot_count {
            let slot = region
                .slot(index)
                .ok_or(NetError::BufferTooSmall { len: buffer.len(), required: (index + 1) * slot_size })?;
            let len = slot.payload_len() as usize;
            if len > slot.capacity() {
                return Err(NetError::PayloadOverflow { len, capacity: slot.capacity() });
            }
            scratch.set_peer(index, slot.peer());
            // The kernel only reads through send iovecs.
            scratch.set_iov(index, slot.payload().as_ptr() as *mut u8, len);
        }

        let headers = scratch.link(self.family);
        // SAFETY: every iovec points inside `buffer`, every name into `scratch`; both
        // outlive the call.
        unsafe { io.send_mmsg(headers) }.map_err(|e| NetError::os("sendmmsg", e))
    }

    /// Receives up to `max_slots` datagrams into consecutive slots of `buffer` with one
    /// `recvmmsg` call.
    ///
    /// # Logic
    /// `MSG_WAITFORONE` blocks for the first datagram (bounded by the read timeout, if
    /// set), then drains whatever is already queued up to `max_slots`. Only the first
    /// `received` slots get their peer and length fields written. The remaining slots
    /// are left as they were. IPv4 datagrams arrive with their IP header in the
    /// payload area (see [`Slot::ip_payload`]).
    ///
    /// # Performance
    /// The kernel writes payloads directly into the slots. Sender addresses land in
    /// scratch and only the address bytes are copied into each slot header.
    ///
    /// # Errors
    /// Same argument checks as [`RawSocket::send_batch`]. A read timeout surfaces as
    /// `NetError::Os` with `EAGAIN`.
    pub fn receive_batch(&mut self, buffer: &mut [u8], max_slots: usize, slot_size: usize) -> Result<usize> {
        let io = self.io.as_ref().ok_or(NetError::Closed)?;
        check_batch_len(max_slots)?;
        if max_slots == 0 {
            return Ok(0);
        }

        let family = self.family;
        SlotRegion::new(&*buffer, family, slot_size)?.require(max_slots)?;

        let header_len = family.header_len();
        let base = buffer.as_mut_ptr();
        let scratch = &mut self.scratch;
        scratch.reset(max_slots);
        for index in 0..max_slots {
            // SAFETY: `require` proved `max_slots * slot_size <= buffer.len()`.
            let payload = unsafe { base.add(index * slot_size + header_len) };
            scratch.set_iov(index, payload, slot_size - header_len);
        }

        let headers = scratch.link(family);
        // SAFETY: iovecs cover disjoint payload areas inside `buffer`, names live in
        // `scratch`; both outlive the call.
        let received = unsafe { io.recv_mmsg(headers) }.map_err(|e| NetError::os("recvmmsg", e))?;
        let received = received.min(max_slots);

        let mut region = SlotRegion::new(buffer, family, slot_size)?;
        for index in 0..received {
            let len = scratch.message_len(index);
            let peer = scratch.peer(index, family);
            if let Some(mut slot) = region.slot_mut(index) {
                if let Some(peer) = peer {
                    slot.set_peer(peer)?;
                }
                slot.set_payload_len(len);
            }
        }
        Ok(received)
    }

    /// Closes the socket. Later calls on this handle fail with [`NetError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let io = self.io.take().ok_or(NetError::Closed)?;
        debug!("Raw {} socket closed", self.family);
        io.close().map_err(|e| NetError::os("close", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct Record {
        calls: Vec<&'static str>,
        sent: Vec<(Vec<u8>, IpAddr)>,
    }

    #[derive(Default)]
    struct StubIo {
        record: Rc<RefCell<Record>>,
        queued: RefCell<VecDeque<(Vec<u8>, IpAddr)>>,
        accept: Option<usize>,
    }

    impl StubIo {
        fn with_queue(datagrams: Vec<(Vec<u8>, IpAddr)>) -> Self {
            Self { queued: RefCell::new(datagrams.into()), ..Default::default() }
        }
    }

    unsafe fn write_name(msg: &mut libc::mmsghdr, peer: IpAddr) {
        let name = SockName::from_ip(peer);
        let len = match peer {
            IpAddr::V4(_) => mem::size_of::<libc::sockaddr_in>(),
            IpAddr::V6(_) => mem::size_of::<libc::sockaddr_in6>(),
        };
        ptr::copy_nonoverlapping(&name as *const SockName as *const u8, msg.msg_hdr.msg_name.cast::<u8>(), len);
        msg.msg_hdr.msg_namelen = len as libc::socklen_t;
    }

    impl RawIo for StubIo {
        fn send_to(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
            let mut record = self.record.borrow_mut();
            record.calls.push("sendto");
            let peer = addr.as_socket().map(|a| a.ip()).ok_or(io::ErrorKind::InvalidInput)?;
            record.sent.push((buf.to_vec(), peer));
            Ok(buf.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
            self.record.borrow_mut().calls.push("recvfrom");
            let (data, peer) = self.queued.borrow_mut().pop_front().ok_or(io::ErrorKind::WouldBlock)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((data.len(), SockAddr::from(SocketAddr::new(peer, 0))))
        }

        unsafe fn send_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize> {
            let mut record = self.record.borrow_mut();
            record.calls.push("sendmmsg");
            let accepted = self.accept.unwrap_or(msgs.len()).min(msgs.len());
            for msg in msgs.iter_mut().take(accepted) {
                let iov = &*msg.msg_hdr.msg_iov;
                let data = std::slice::from_raw_parts(iov.iov_base as *const u8, iov.iov_len).to_vec();
                let name = &*(msg.msg_hdr.msg_name as *const SockName);
                let family = if msg.msg_hdr.msg_namelen == sockaddr_len(AddressFamily::Ipv4) {
                    AddressFamily::Ipv4
                } else {
                    AddressFamily::Ipv6
                };
                let peer = name.to_ip(family).ok_or(io::ErrorKind::InvalidInput)?;
                msg.msg_len = data.len() as u32;
                record.sent.push((data, peer));
            }
            Ok(accepted)
        }

        unsafe fn recv_mmsg(&self, msgs: &mut [libc::mmsghdr]) -> io::Result<usize> {
            self.record.borrow_mut().calls.push("recvmmsg");
            let mut queued = self.queued.borrow_mut();
            if queued.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut count = 0;
            for msg in msgs.iter_mut() {
                let Some((data, peer)) = queued.pop_front() else { break };
                let iov = &*msg.msg_hdr.msg_iov;
                let n = data.len().min(iov.iov_len);
                ptr::copy_nonoverlapping(data.as_ptr(), iov.iov_base.cast::<u8>(), n);
                msg.msg_len = n as u32;
                write_name(msg, peer);
                count += 1;
            }
            Ok(count)
        }

        fn set_send_buffer_size(&self, _bytes: usize) -> io::Result<()> {
            self.record.borrow_mut().calls.push("SO_SNDBUF");
            Ok(())
        }

        fn set_recv_buffer_size(&self, _bytes: usize) -> io::Result<()> {
            self.record.borrow_mut().calls.push("SO_RCVBUF");
            Ok(())
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            self.record.borrow_mut().calls.push("SO_RCVTIMEO");
            Ok(())
        }
    }

    fn v6(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_batch_issues_no_call() {
        let stub = StubIo::default();
        let record = stub.record.clone();
        let mut socket = RawSocket::from_io(stub, AddressFamily::Ipv4);
        let buffer = [0u8; 0];
        assert_eq!(socket.send_batch(&buffer, 0, 64).unwrap(), 0);
        assert!(record.borrow().calls.is_empty());
    }

    #[test]
    fn test_oversized_batch_rejected_before_syscall() {
        let stub = StubIo::default();
        let record = stub.record.clone();
        let mut socket = RawSocket::from_io(stub, AddressFamily::Ipv6);
        let mut buffer = vec![0u8; 1025 * 128];

        let err = socket.send_batch(&buffer, 1025, 128).unwrap_err();
        assert!(matches!(err, NetError::BatchTooLarge { requested: 1025, max: 1024 }));
        assert!(err.is_invalid_argument());

        let err = socket.receive_batch(&mut buffer, 1025, 128).unwrap_err();
        assert!(matches!(err, NetError::BatchTooLarge { requested: 1025, .. }));
        assert!(record.borrow().calls.is_empty());
    }

    #[test]
    fn test_receive_batch_fills_only_received_slots() {
        let slot_size = 256;
        let queued = vec![
            (vec![1u8; 10], v6("2001:db8::1")),
            (vec![2u8; 20], v6("2001:db8::2")),
            (vec![3u8; 30], v6("2001:db8::3")),
        ];
        let mut socket = RawSocket::from_io(StubIo::with_queue(queued), AddressFamily::Ipv6);
        let mut buffer = vec![0xEEu8; 10 * slot_size];

        assert_eq!(socket.receive_batch(&mut buffer, 10, slot_size).unwrap(), 3);

        let region = SlotRegion::new(&buffer[..], AddressFamily::Ipv6, slot_size).unwrap();
        for i in 0..3 {
            let slot = region.slot(i).unwrap();
            assert_eq!(slot.payload_len() as usize, 10 * (i + 1));
            assert_eq!(slot.peer(), v6(&format!("2001:db8::{}", i + 1)));
            assert!(slot.data().iter().all(|&b| b == (i + 1) as u8));
            // Reserved ranges stay as the caller left them.
            assert_eq!(&slot.as_bytes()[0..8], &[0xEE; 8]);
            assert_eq!(&slot.as_bytes()[24..28], &[0xEE; 4]);
        }
        for i in 3..10 {
            assert_eq!(region.slot(i).unwrap().payload_len(), u32::from_ne_bytes([0xEE; 4]));
        }
    }

    #[test]
    fn test_send_batch_reads_slot_fields() {
        let slot_size = 128;
        let stub = StubIo { accept: Some(2), ..Default::default() };
        let record = stub.record.clone();
        let mut socket = RawSocket::from_io(stub, AddressFamily::Ipv4);

        let mut buffer = vec![0u8; 3 * slot_size];
        {
            let mut region = SlotRegion::new(&mut buffer[..], AddressFamily::Ipv4, slot_size).unwrap();
            for (i, mut slot) in region.iter_mut().enumerate() {
                slot.set_peer(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1 + i as u8))).unwrap();
                slot.write_payload(&vec![i as u8; 4 + i]).unwrap();
            }
        }

        // A short send is a count, not an error.
        assert_eq!(socket.send_batch(&buffer, 3, slot_size).unwrap(), 2);
        let record = record.borrow();
        assert_eq!(record.calls, vec!["sendmmsg"]);
        assert_eq!(record.sent[0], (vec![0u8; 4], IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert_eq!(record.sent[1], (vec![1u8; 5], IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))));
    }

    #[test]
    fn test_send_batch_argument_errors() {
        let stub = StubIo::default();
        let record = stub.record.clone();
        let mut socket = RawSocket::from_io(stub, AddressFamily::Ipv6);

        let mut buffer = vec![0u8; 2 * 100];
        assert!(matches!(socket.send_batch(&buffer, 2, 64), Err(NetError::SlotTooSmall { .. })));
        assert!(matches!(socket.send_batch(&buffer, 3, 100), Err(NetError::BufferTooSmall { .. })));

        Slot::new(&mut buffer[100..], AddressFamily::Ipv6).unwrap().set_payload_len(29);
        assert!(matches!(
            socket.send_batch(&buffer, 2, 100),
            Err(NetError::PayloadOverflow { len: 29, capacity: 28 })
        ));
        assert!(record.borrow().calls.is_empty());
    }

    #[test]
    fn test_single_datagram_round_trip() {
        let peer = v6("fe80::42");
        let stub = StubIo::with_queue(vec![(b"pong".to_vec(), peer)]);
        let record = stub.record.clone();
        let socket = RawSocket::from_io(stub, AddressFamily::Ipv6);

        let mut slot_bytes = [0u8; 200];
        assert_eq!(socket.receive_one(&mut slot_bytes).unwrap(), 4);
        let slot = Slot::new(&slot_bytes[..], AddressFamily::Ipv6).unwrap();
        assert_eq!(slot.peer(), peer);
        assert_eq!(slot.data(), b"pong");

        // Reply from the same slot: the peer field is the destination.
        assert_eq!(socket.send_one(&slot_bytes, 4).unwrap(), 4);
        assert_eq!(record.borrow().sent[0], (b"pong".to_vec(), peer));
        assert!(matches!(socket.send_one(&slot_bytes, 129), Err(NetError::PayloadOverflow { .. })));
    }

    #[test]
    fn test_closed_socket_fails_deterministically() {
        let stub = StubIo::with_queue(vec![(vec![0u8; 8], v6("::1"))]);
        let record = stub.record.clone();
        let mut socket = RawSocket::from_io(stub, AddressFamily::Ipv6);
        socket.close().unwrap();
        assert!(socket.is_closed());

        let mut buffer = vec![0u8; 4 * 128];
        assert!(matches!(socket.receive_batch(&mut buffer, 4, 128), Err(NetError::Closed)));
        assert!(matches!(socket.send_batch(&buffer, 4, 128), Err(NetError::Closed)));
        assert!(matches!(socket.receive_one(&mut buffer), Err(NetError::Closed)));
        assert!(matches!(socket.set_send_buffer_size(1 << 20), Err(NetError::Closed)));
        assert!(matches!(socket.close(), Err(NetError::Closed)));
        assert!(record.borrow().calls.is_empty());
    }
}
