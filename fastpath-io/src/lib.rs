//! Fastpath I/O: raw packet transport and zero-copy capture for Linux.
//!
//! Two data paths share this crate. The batched transport moves datagrams between
//! fixed-layout slot buffers and a raw IP socket, one `sendmmsg`/`recvmmsg` per batch.
//! The receive ring maps a TPACKET_V3 `AF_PACKET` ring so captured frames are read in
//! place. Both are usable from Rust directly or through the C ABI in [`ffi`].

pub mod error;
pub mod ffi;
pub mod memory;
pub mod platform;
pub mod ring;
pub mod slot;
pub mod sys;
pub mod transport;

pub use error::{last_os_error, NetError, Result};
pub use memory::SlotBuffer;
pub use ring::{Block, Frame, RingGeometry, RxRing};
pub use slot::{AddressFamily, Slot, SlotRegion};
pub use transport::{RawIo, RawSocket, RawSocketConfig, MAX_BATCH};
pub use platform::lock_memory_pages as lock_all_memory;
pub use platform::affinity;
