use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use fastpath_io::platform::affinity::pin_thread_to_core;
use fastpath_io::platform::iface::interface_index;
use fastpath_io::{Frame, RingGeometry, RxRing};
use log::info;

use crate::config::CaptureArgs;
use crate::report::RateMeter;

const POLL_TIMEOUT_MS: i32 = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub blocks: u64,
    pub frames: u64,
    pub bytes: u64,
    pub matched: u64,
}

impl CaptureStats {
    fn record(&mut self, frame: &Frame<'_>, next_header: u8) {
        self.frames += 1;
        self.bytes += u64::from(frame.len());
        if ipv6_next_header(frame.network()) == Some(next_header) {
            self.matched += 1;
        }
    }
}

/// Next-header field of an IPv6 packet, `None` for anything else.
fn ipv6_next_header(network: &[u8]) -> Option<u8> {
    if network.len() >= 40 && network[0] >> 4 == 6 {
        Some(network[6])
    } else {
        None
    }
}

pub struct CaptureSession {
    ring: RxRing,
    interface: String,
    next_header: u8,
    stats: CaptureStats,
    meter: RateMeter,
}

impl CaptureSession {
    pub fn open(args: &CaptureArgs) -> Result<Self> {
        let if_index = interface_index(&args.interface)
            .with_context(|| format!("Failed to resolve interface {}", args.interface))?;
        let geometry =
            RingGeometry::new(args.block_size, args.blocks, args.frame_size).context("Invalid ring geometry")?;
        let ring = RxRing::open(if_index, geometry).context("Failed to open capture ring")?;
        if args.promiscuous {
            ring.set_promiscuous(true).context("Failed to enable promiscuous mode")?;
        }

        info!(
            "Capturing on {} (ifindex: {}, fd: {}, {} frames across {} blocks)",
            args.interface,
            if_index,
            ring.as_raw_fd()?,
            geometry.frame_count(),
            geometry.block_count()
        );

        Ok(Self {
            ring,
            interface: args.interface.clone(),
            next_header: args.next_header,
            stats: CaptureStats::default(),
            meter: RateMeter::new(Duration::from_secs(args.report_secs.max(1))),
        })
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<CaptureStats> {
        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.ring.poll(POLL_TIMEOUT_MS) {
                if e.raw_os_error() == libc::EINTR {
                    continue;
                }
                return Err(e).context("Ring poll failed");
            }
            self.drain()?;

            if let Some(rate) = self.meter.tick(self.stats.frames, self.stats.bytes) {
                info!(
                    "{}: {:.0} pps, {:.2} Mbit/s ({} frames, {} matched)",
                    self.interface, rate.pps, rate.mbps, self.stats.frames, self.stats.matched
                );
            }
        }
        Ok(self.stats)
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(block) = self.ring.next_block()? {
            self.stats.blocks += 1;
            for frame in block.frames() {
                self.stats.record(&frame, self.next_header);
            }
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.ring.close().context("Failed to close capture ring")
    }
}

pub fn run(args: &CaptureArgs, running: &AtomicBool) -> Result<()> {
    if let Some(core) = args.core {
        pin_thread_to_core(core);
    }
    let mut session = CaptureSession::open(args)?;
    let stats = session.run(running)?;
    session.close()?;
    info!(
        "Capture done: {} blocks, {} frames, {} bytes, {} with next header {}",
        stats.blocks, stats.frames, stats.bytes, stats.matched, args.next_header
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv6_next_header() {
        let mut packet = [0u8; 40];
        packet[0] = 0x60;
        packet[6] = 253;
        assert_eq!(ipv6_next_header(&packet), Some(253));

        packet[0] = 0x45;
        assert_eq!(ipv6_next_header(&packet), None);
        assert_eq!(ipv6_next_header(&packet[..20]), None);
    }
}
