//! Kernel ABI for `PACKET_MMAP` rings (`linux/if_packet.h`).
//!
//! `libc` exports the socket calls but not every ring constant and struct across
//! versions, so the pieces the receive ring depends on are pinned here.

use libc::c_int;

pub const PACKET_RX_RING: c_int = 5;
pub const PACKET_VERSION: c_int = 10;

/// `enum tpacket_versions { TPACKET_V1, TPACKET_V2, TPACKET_V3 }`
pub const TPACKET_V3: c_int = 2;

pub const TP_FT_REQ_FILL_RXHASH: u32 = 0x1;

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1 << 0;

/// Ring request for `PACKET_RX_RING` under TPACKET_V3.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_req3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

// struct tpacket_block_desc { u32 version; u32 offset_to_priv; struct tpacket_hdr_v1 hdr; }
pub const BLOCK_STATUS_OFFSET: usize = 8;
pub const BLOCK_NUM_PKTS_OFFSET: usize = 12;
pub const BLOCK_FIRST_PKT_OFFSET: usize = 16;
pub const BLOCK_LEN_OFFSET: usize = 20;
pub const BLOCK_SEQ_NUM_OFFSET: usize = 24;
pub const BLOCK_HEADER_LEN: usize = 48;

// struct tpacket3_hdr
pub const FRAME_NEXT_OFFSET: usize = 0;
pub const FRAME_SEC_OFFSET: usize = 4;
pub const FRAME_NSEC_OFFSET: usize = 8;
pub const FRAME_SNAPLEN_OFFSET: usize = 12;
pub const FRAME_LEN_OFFSET: usize = 16;
pub const FRAME_STATUS_OFFSET: usize = 20;
pub const FRAME_MAC_OFFSET: usize = 24;
pub const FRAME_NET_OFFSET: usize = 26;
pub const FRAME_RXHASH_OFFSET: usize = 28;
pub const FRAME_HEADER_LEN: usize = 48;

#[inline]
pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

#[inline]
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}
