use std::mem;
use std::os::unix::io::RawFd;

use nix::net::if_::if_nametoindex;

use crate::error::{NetError, Result};

/// Resolves an interface name such as `"eth0"` to its kernel index.
pub fn interface_index(name: &str) -> Result<u32> {
    if_nametoindex(name).map_err(|e| NetError::os("if_nametoindex", e.into()))
}

/// Joins (`enable`) or leaves promiscuous mode on `if_index` through the
/// `AF_PACKET` socket `fd`. Membership is dropped by the kernel when `fd` closes.
pub fn set_promiscuous(fd: RawFd, if_index: u32, enable: bool) -> Result<()> {
    let req = libc::packet_mreq {
        mr_ifindex: if_index as libc::c_int,
        mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let name = if enable { libc::PACKET_ADD_MEMBERSHIP } else { libc::PACKET_DROP_MEMBERSHIP };
    // SAFETY: `req` is a fully initialized `packet_mreq` of the stated length.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            name,
            (&req as *const libc::packet_mreq).cast(),
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NetError::last_os("setsockopt(PACKET_MEMBERSHIP)"));
    }
    Ok(())
}
