//! Zero-copy receive ring: a TPACKET_V3 `PACKET_RX_RING` mapped into this process.
//!
//! The kernel fills blocks of captured link-layer frames; the reader flips each
//! block back to the kernel once it is done with it.

use std::io;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetError, Result};
use crate::platform::iface;
use crate::sys;

/// Block retire timeout handed to the kernel, in milliseconds.
pub const RETIRE_TIMEOUT_MS: u32 = 60;

/// Block and frame layout of a ring. `frame_count` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    block_size: u32,
    block_count: u32,
    frame_size: u32,
}

impl RingGeometry {
    /// # Errors
    /// `InvalidGeometry` when a dimension is zero, the ring size overflows, or the
    /// ring size is not an exact multiple of `frame_size`.
    pub fn new(block_size: u32, block_count: u32, frame_size: u32) -> Result<Self> {
        if block_size == 0 || block_count == 0 || frame_size == 0 {
            return Err(NetError::InvalidGeometry("block size, block count and frame size must be non-zero"));
        }
        let total = block_size
            .checked_mul(block_count)
            .ok_or(NetError::InvalidGeometry("block size times block count overflows"))?;
        if total % frame_size != 0 {
            return Err(NetError::InvalidGeometry("ring size is not a multiple of frame size"));
        }
        if (block_size as usize) < sys::BLOCK_HEADER_LEN {
            return Err(NetError::InvalidGeometry("block size cannot hold a block header"));
        }
        Ok(Self { block_size, block_count, frame_size })
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.block_size * self.block_count / self.frame_size
    }

    /// Bytes mapped for the ring.
    #[inline]
    pub fn map_len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    fn request(&self) -> sys::tpacket_req3 {
        sys::tpacket_req3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count(),
            tp_retire_blk_tov: RETIRE_TIMEOUT_MS,
            tp_sizeof_priv: 0,
            tp_feature_req_word: sys::TP_FT_REQ_FILL_RXHASH,
        }
    }
}

/// A shared, locked mapping of the ring. Unmapped on drop.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(fd: RawFd, len: usize) -> Result<Self> {
        // SAFETY: fresh mapping chosen by the kernel; no existing memory is affected.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(NetError::last_os("mmap"));
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or(NetError::InvalidGeometry("kernel mapped the ring at null"))?;
        Ok(Self { ptr, len })
    }

    fn unmap(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `ptr`/`len` describe a live mapping created in `new`, released once.
        if unsafe { libc::munmap(this.ptr.as_ptr().cast(), this.len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: see `unmap`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// Field order is teardown order: unmap, then close.
struct RingInner {
    map: Mapping,
    socket: Socket,
}

/// An open capture ring bound to one interface.
///
/// # Thread Safety
/// Owned by one reader thread. `Send` but not `Sync`.
pub struct RxRing {
    inner: Option<RingInner>,
    geometry: RingGeometry,
    if_index: u32,
    cursor: usize,
}

// SAFETY: the mapping is owned exclusively by this value; moving it between threads
// moves that ownership.
unsafe impl Send for RxRing {}

fn set_packet_opt<T>(fd: RawFd, name: libc::c_int, value: &T, op: &'static str) -> Result<()> {
    // SAFETY: `value` points at `size_of::<T>()` readable bytes.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NetError::last_os(op));
    }
    Ok(())
}

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

impl RxRing {
    /// Opens a capture ring on `if_index`.
    ///
    /// # Logic
    /// Creates an `AF_PACKET` socket for `ETH_P_ALL`, negotiates TPACKET_V3, requests a
    /// ring of `geometry` with a [`RETIRE_TIMEOUT_MS`] block timeout and RX hash
    /// annotation, maps it `MAP_SHARED | MAP_LOCKED`, then binds the socket to the
    /// interface. Each completed step is undone if a later one fails, so an error
    /// never leaves a socket or mapping behind.
    ///
    /// # Performance
    /// The mapping is locked into RAM up front. Frames are then read in place with no
    /// per-packet syscall.
    ///
    /// # Errors
    /// `NetError::Os` naming the failing step: socket creation (commonly `EPERM` without
    /// `CAP_NET_RAW`), either `setsockopt`, `mmap` (`EAGAIN`/`ENOMEM` past
    /// `RLIMIT_MEMLOCK`), or `bind`.
    pub fn open(if_index: u32, geometry: RingGeometry) -> Result<Self> {
        let protocol = eth_p_all();
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(i32::from(protocol))))
            .map_err(|e| NetError::os("socket(AF_PACKET)", e))?;
        let fd = socket.as_raw_fd();

        set_packet_opt(fd, sys::PACKET_VERSION, &sys::TPACKET_V3, "setsockopt(PACKET_VERSION)")?;
        set_packet_opt(fd, sys::PACKET_RX_RING, &geometry.request(), "setsockopt(PACKET_RX_RING)")?;

        let map = Mapping::new(fd, geometry.map_len())?;

        // SAFETY: all-zero is a valid `sockaddr_ll`.
        let mut ll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        ll.sll_family = libc::AF_PACKET as u16;
        ll.sll_protocol = protocol;
        ll.sll_ifindex = if_index as i32;
        // SAFETY: `ll` is a fully initialized `sockaddr_ll` of the stated length.
        let ret = unsafe {
            libc::bind(
                fd,
                ptr::addr_of!(ll).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(NetError::last_os("bind(AF_PACKET)"));
        }

        debug!(
            "Rx ring open on ifindex {} (fd: {}, {} blocks x {} bytes, {} frames, {} bytes mapped)",
            if_index,
            fd,
            geometry.block_count,
            geometry.block_size,
            geometry.frame_count(),
            geometry.map_len()
        );

        Ok(Self { inner: Some(RingInner { map, socket }), geometry, if_index, cursor: 0 })
    }

    fn inner(&self) -> Result<&RingInner> {
        self.inner.as_ref().ok_or(NetError::Closed)
    }

    #[inline]
    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    #[inline]
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Base address of the mapping. The memory belongs to the kernel except for
    /// blocks it has handed to user space.
    pub fn as_ptr(&self) -> Result<*const u8> {
        Ok(self.inner()?.map.ptr.as_ptr() as *const u8)
    }

    pub fn map_len(&self) -> Result<usize> {
        Ok(self.inner()?.map.len)
    }

    pub fn as_raw_fd(&self) -> Result<RawFd> {
        Ok(self.inner()?.socket.as_raw_fd())
    }

    /// Waits for the ring to become readable.
    ///
    /// `timeout_ms`: 0 returns immediately, negative blocks, positive bounds the wait.
    /// Returns the number of ready descriptors (0 on timeout).
    pub fn poll(&self, timeout_ms: i32) -> Result<usize> {
        let fd = self.inner()?.socket.as_raw_fd();
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN | libc::POLLERR, revents: 0 };
        // SAFETY: one valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(NetError::last_os("poll"));
        }
        Ok(ret as usize)
    }

    /// Joins or leaves promiscuous mode on the bound interface.
    pub fn set_promiscuous(&self, enable: bool) -> Result<()> {
        let fd = self.inner()?.socket.as_raw_fd();
        iface::set_promiscuous(fd, self.if_index, enable)
    }

    /// Returns the block under the cursor if the kernel has released it to user space.
    ///
    /// Dropping the [`Block`] returns it to the kernel and advances the cursor.
    pub fn next_block(&mut self) -> Result<Option<Block<'_>>> {
        let RxRing { inner, geometry, cursor, .. } = self;
        let inner = inner.as_ref().ok_or(NetError::Closed)?;
        let block_size = geometry.block_size as usize;
        // SAFETY: `cursor < block_count`, so the block lies inside the mapping.
        let base = unsafe { inner.map.ptr.as_ptr().add(*cursor * block_size) };
        // SAFETY: block headers are 8-byte aligned inside a page-aligned mapping.
        let status = unsafe { &*(base.add(sys::BLOCK_STATUS_OFFSET) as *const AtomicU32) };
        if status.load(Ordering::Acquire) & sys::TP_STATUS_USER == 0 {
            return Ok(None);
        }
        Ok(Some(Block {
            base,
            len: block_size,
            index: *cursor,
            block_count: geometry.block_count as usize,
            cursor,
            _ring: PhantomData,
        }))
    }

    /// Unmaps the ring, then closes the socket. Both steps are attempted; the first
    /// failure is returned. Later calls on this handle fail with [`NetError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let RingInner { map, socket } = self.inner.take().ok_or(NetError::Closed)?;
        let map_len = map.len;
        let unmapped = map.unmap();
        let fd = socket.into_raw_fd();
        // SAFETY: `fd` was released by the socket and is closed exactly once.
        let closed = if unsafe { libc::close(fd) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) };

        match (unmapped, closed) {
            (Ok(()), Ok(())) => {
                debug!("Rx ring closed on ifindex {} ({} bytes unmapped)", self.if_index, map_len);
                Ok(())
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Rx ring close also failed after munmap error: {}", close_err);
                }
                Err(NetError::os("munmap", e))
            }
            (Ok(()), Err(e)) => Err(NetError::os("close", e)),
        }
    }
}

/// One block handed to user space by the kernel.
pub struct Block<'a> {
    base: *mut u8,
    len: usize,
    index: usize,
    block_count: usize,
    cursor: &'a mut usize,
    _ring: PhantomData<&'a RxRing>,
}

impl<'a> Block<'a> {
    fn bytes(&self) -> &[u8] {
        // SAFETY: the block is user-owned until this value drops.
        unsafe { slice::from_raw_parts(self.base, self.len) }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_packets(&self) -> u32 {
        sys::read_u32(self.bytes(), sys::BLOCK_NUM_PKTS_OFFSET)
    }

    pub fn seq_num(&self) -> u64 {
        sys::read_u64(self.bytes(), sys::BLOCK_SEQ_NUM_OFFSET)
    }

    /// Bytes of the block the kernel filled.
    pub fn filled_len(&self) -> u32 {
        sys::read_u32(self.bytes(), sys::BLOCK_LEN_OFFSET)
    }

    pub fn frames(&self) -> Frames<'_> {
        let bytes = self.bytes();
        Frames {
            block: bytes,
            offset: sys::read_u32(bytes, sys::BLOCK_FIRST_PKT_OFFSET) as usize,
            remaining: self.num_packets(),
        }
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        // SAFETY: the block header lies inside the mapping; see `RxRing::next_block`.
        let status = unsafe { &*(self.base.add(sys::BLOCK_STATUS_OFFSET) as *const AtomicU32) };
        status.store(sys::TP_STATUS_KERNEL, Ordering::Release);
        *self.cursor = (self.index + 1) % self.block_count;
    }
}

/// Iterator over the frames of a block. Stops early at a malformed offset.
pub struct Frames<'b> {
    block: &'b [u8],
    offset: usize,
    remaining: u32,
}

impl<'b> Iterator for Frames<'b> {
    type Item = Frame<'b>;

    fn next(&mut self) -> Option<Frame<'b>> {
        if self.remaining == 0 {
            return None;
        }
        let end = self.offset.checked_add(sys::FRAME_HEADER_LEN)?;
        if end > self.block.len() {
            self.remaining = 0;
            return None;
        }
        let frame = Frame { bytes: &self.block[self.offset..] };
        self.remaining -= 1;
        let next = frame.next_offset() as usize;
        if next == 0 {
            self.remaining = 0;
        } else {
            self.offset += next;
        }
        Some(frame)
    }
}

/// A captured frame record (`tpacket3_hdr` plus captured bytes).
#[derive(Clone, Copy)]
pub struct Frame<'b> {
    bytes: &'b [u8],
}

impl<'b> Frame<'b> {
    fn next_offset(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_NEXT_OFFSET)
    }

    pub fn sec(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_SEC_OFFSET)
    }

    pub fn nsec(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_NSEC_OFFSET)
    }

    /// Bytes captured into the ring.
    pub fn snaplen(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_SNAPLEN_OFFSET)
    }

    /// Length of the packet on the wire.
    pub fn len(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_LEN_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.snaplen() == 0
    }

    pub fn status(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_STATUS_OFFSET)
    }

    pub fn rxhash(&self) -> u32 {
        sys::read_u32(self.bytes, sys::FRAME_RXHASH_OFFSET)
    }

    /// Offset of the link-layer header from the frame start.
    pub fn mac_offset(&self) -> u16 {
        sys::read_u16(self.bytes, sys::FRAME_MAC_OFFSET)
    }

    /// Offset of the network-layer header from the frame start.
    pub fn net_offset(&self) -> u16 {
        sys::read_u16(self.bytes, sys::FRAME_NET_OFFSET)
    }

    /// Captured bytes starting at the link-layer header.
    pub fn data(&self) -> &'b [u8] {
        self.captured_from(self.mac_offset() as usize)
    }

    /// Captured bytes starting at the network-layer header.
    pub fn network(&self) -> &'b [u8] {
        self.captured_from(self.net_offset() as usize)
    }

    fn captured_from(&self, start: usize) -> &'b [u8] {
        let mac = self.mac_offset() as usize;
        let end = (mac + self.snaplen() as usize).min(self.bytes.len());
        self.bytes.get(start..end).unwrap_or(&[])
    }
}
