//! C ABI for a managed runtime.
//!
//! Every call reports failure in-band: `FASTPATH_OS_ERROR` when the kernel refused
//! the operation, `FASTPATH_INVALID_ARGUMENT` when the call was rejected before any
//! syscall. [`fastpath_last_error`] returns the errno behind the most recent failure
//! on the calling thread. Handle-returning calls return null on failure.
//!
//! A handle is owned by one thread at a time. `*_close` releases the kernel
//! resources and leaves the handle valid but closed; `*_free` releases the handle.

use std::cell::Cell;
use std::os::raw::c_int;
use std::ptr;
use std::slice;

use crate::error::NetError;
use crate::ring::{RingGeometry, RxRing};
use crate::slot::AddressFamily;
use crate::transport::RawSocket;

pub const FASTPATH_OS_ERROR: c_int = -1;
pub const FASTPATH_INVALID_ARGUMENT: c_int = -2;

thread_local! {
    static LAST_ERROR: Cell<c_int> = Cell::new(0);
}

fn fail(err: NetError) -> c_int {
    LAST_ERROR.with(|last| last.set(err.raw_os_error()));
    if err.is_invalid_argument() {
        FASTPATH_INVALID_ARGUMENT
    } else {
        FASTPATH_OS_ERROR
    }
}

fn invalid() -> c_int {
    LAST_ERROR.with(|last| last.set(libc::EINVAL));
    FASTPATH_INVALID_ARGUMENT
}

fn count(result: crate::Result<usize>) -> c_int {
    match result {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(e) => fail(e),
    }
}

fn family_of(raw: c_int) -> Option<AddressFamily> {
    AddressFamily::from_raw(raw)
}

fn non_negative(value: c_int) -> Option<usize> {
    usize::try_from(value).ok()
}

/// # Safety
/// A non-null `ptr` must be valid for `len` bytes for the duration of the call.
unsafe fn buffer_mut<'a>(ptr: *mut u8, len: usize) -> Option<&'a mut [u8]> {
    if ptr.is_null() {
        return if len == 0 { Some(&mut []) } else { None };
    }
    Some(slice::from_raw_parts_mut(ptr, len))
}

/// Runs `op` against a live socket handle whose family matches `family`.
unsafe fn with_socket<F>(handle: *mut RawSocket, family: c_int, op: F) -> c_int
where
    F: FnOnce(&mut RawSocket) -> crate::Result<usize>,
{
    let Some(socket) = handle.as_mut() else {
        return invalid();
    };
    let Some(family) = family_of(family) else {
        return invalid();
    };
    if family != socket.family() {
        return fail(NetError::FamilyMismatch { expected: socket.family(), actual: family });
    }
    count(op(socket))
}

/// Opens a raw socket. `family` is `AF_INET` or `AF_INET6`.
#[no_mangle]
pub extern "C" fn fastpath_raw_open(family: c_int, protocol: c_int) -> *mut RawSocket {
    let Some(family) = family_of(family) else {
        invalid();
        return ptr::null_mut();
    };
    match RawSocket::open(family, protocol) {
        Ok(socket) => Box::into_raw(Box::new(socket)),
        Err(e) => {
            fail(e);
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must be null or a pointer returned by [`fastpath_raw_open`] and not freed.
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_set_send_buffer_size(handle: *mut RawSocket, bytes: c_int) -> c_int {
    let Some(socket) = handle.as_ref() else { return invalid() };
    let Some(bytes) = non_negative(bytes) else { return invalid() };
    match socket.set_send_buffer_size(bytes) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// # Safety
/// As [`fastpath_raw_set_send_buffer_size`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_set_recv_buffer_size(handle: *mut RawSocket, bytes: c_int) -> c_int {
    let Some(socket) = handle.as_ref() else { return invalid() };
    let Some(bytes) = non_negative(bytes) else { return invalid() };
    match socket.set_recv_buffer_size(bytes) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Receives one datagram into the single slot at `buffer`.
///
/// # Safety
/// `handle` as in [`fastpath_raw_set_send_buffer_size`]; `buffer` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_receive(handle: *mut RawSocket, buffer: *mut u8, len: usize, family: c_int) -> c_int {
    let Some(buffer) = buffer_mut(buffer, len) else { return invalid() };
    with_socket(handle, family, |socket| socket.receive_one(buffer))
}

/// Sends `length` payload bytes of the single slot at `buffer`.
///
/// # Safety
/// As [`fastpath_raw_receive`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_send(
    handle: *mut RawSocket,
    buffer: *mut u8,
    len: usize,
    family: c_int,
    length: c_int,
) -> c_int {
    let Some(buffer) = buffer_mut(buffer, len) else { return invalid() };
    let Some(length) = non_negative(length) else { return invalid() };
    with_socket(handle, family, |socket| socket.send_one(buffer, length))
}

/// Sends `slot_count` slots with one batched call. Returns the accepted count.
///
/// # Safety
/// As [`fastpath_raw_receive`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_send_batch(
    handle: *mut RawSocket,
    buffer: *mut u8,
    len: usize,
    family: c_int,
    slot_count: c_int,
    slot_size: c_int,
) -> c_int {
    let Some(buffer) = buffer_mut(buffer, len) else { return invalid() };
    let (Some(slot_count), Some(slot_size)) = (non_negative(slot_count), non_negative(slot_size)) else {
        return invalid();
    };
    with_socket(handle, family, |socket| socket.send_batch(buffer, slot_count, slot_size))
}

/// Receives up to `max_slots` datagrams with one batched call. Returns the received count.
///
/// # Safety
/// As [`fastpath_raw_receive`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_receive_batch(
    handle: *mut RawSocket,
    buffer: *mut u8,
    len: usize,
    family: c_int,
    max_slots: c_int,
    slot_size: c_int,
) -> c_int {
    let Some(buffer) = buffer_mut(buffer, len) else { return invalid() };
    let (Some(max_slots), Some(slot_size)) = (non_negative(max_slots), non_negative(slot_size)) else {
        return invalid();
    };
    with_socket(handle, family, |socket| socket.receive_batch(buffer, max_slots, slot_size))
}

/// # Safety
/// As [`fastpath_raw_set_send_buffer_size`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_close(handle: *mut RawSocket) -> c_int {
    let Some(socket) = handle.as_mut() else { return invalid() };
    match socket.close() {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Releases the handle, closing the socket first if still open.
///
/// # Safety
/// `handle` must be null or a live pointer from [`fastpath_raw_open`]; it is
/// invalid after this call.
#[no_mangle]
pub unsafe extern "C" fn fastpath_raw_free(handle: *mut RawSocket) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Opens a capture ring on `if_index` and stores the mapping base address in
/// `out_map`. Returns null on failure.
///
/// # Safety
/// `out_map` must be null or valid for one `u64` write.
#[no_mangle]
pub unsafe extern "C" fn fastpath_ring_open(
    if_index: c_int,
    out_map: *mut u64,
    block_count: c_int,
    block_size: c_int,
    frame_size: c_int,
) -> *mut RxRing {
    let dims = (
        u32::try_from(if_index),
        u32::try_from(block_count),
        u32::try_from(block_size),
        u32::try_from(frame_size),
    );
    let (Ok(if_index), Ok(block_count), Ok(block_size), Ok(frame_size)) = dims else {
        invalid();
        return ptr::null_mut();
    };
    let ring = RingGeometry::new(block_size, block_count, frame_size).and_then(|g| RxRing::open(if_index, g));
    match ring {
        Ok(ring) => {
            if let (Some(out), Ok(base)) = (out_map.as_mut(), ring.as_ptr()) {
                *out = base as u64;
            }
            Box::into_raw(Box::new(ring))
        }
        Err(e) => {
            fail(e);
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must be null or a live pointer from [`fastpath_ring_open`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_ring_poll(handle: *mut RxRing, timeout_ms: c_int) -> c_int {
    let Some(ring) = handle.as_ref() else { return invalid() };
    count(ring.poll(timeout_ms))
}

/// Unmaps the ring and closes its socket. The handle stays valid but closed.
///
/// # Safety
/// As [`fastpath_ring_poll`].
#[no_mangle]
pub unsafe extern "C" fn fastpath_ring_close(handle: *mut RxRing) -> c_int {
    let Some(ring) = handle.as_mut() else { return invalid() };
    match ring.close() {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// # Safety
/// `handle` must be null or a live pointer from [`fastpath_ring_open`]; it is
/// invalid after this call.
#[no_mangle]
pub unsafe extern "C" fn fastpath_ring_free(handle: *mut RxRing) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Errno of the most recent failing `fastpath_*` call on this thread.
#[no_mangle]
pub extern "C" fn fastpath_last_error() -> c_int {
    LAST_ERROR.with(|last| last.get())
}
