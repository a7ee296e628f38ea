use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fastpath_io::{AddressFamily, RawSocket, RawSocketConfig, SlotBuffer, SlotRegion};
use log::info;

use crate::config::SinkArgs;
use crate::report::{hex_dump, RateMeter};

#[derive(Debug, Default, Clone, Copy)]
pub struct SinkStats {
    pub batches: u64,
    pub received: u64,
    pub bytes: u64,
    pub idle_ticks: u64,
}

pub struct SinkSession {
    socket: RawSocket,
    family: AddressFamily,
    buffer: SlotBuffer,
    slots: usize,
    dump: usize,
    stats: SinkStats,
    meter: RateMeter,
}

impl SinkSession {
    pub fn open(args: &SinkArgs) -> Result<Self> {
        let family = AddressFamily::from(args.family);
        let mut config = RawSocketConfig::new(family, args.protocol);
        config.recv_buffer = args.recv_buffer;
        config.read_timeout = Some(Duration::from_millis(args.timeout_ms.max(1)));
        let socket = RawSocket::open_with(&config).context("Failed to open raw socket")?;

        let buffer = SlotBuffer::new(args.slots, args.slot_size).context("Failed to allocate slot buffer")?;
        if buffer.slot_count() < args.slots {
            return Err(anyhow!("buffer holds {} slots, {} requested", buffer.slot_count(), args.slots));
        }

        info!(
            "Sink listening for {} protocol {} (fd: {}, up to {} datagrams per batch, locked: {})",
            family,
            args.protocol,
            socket.as_raw_fd().unwrap_or(-1),
            args.slots,
            buffer.is_locked()
        );

        Ok(Self {
            socket,
            family,
            buffer,
            slots: args.slots,
            dump: args.dump,
            stats: SinkStats::default(),
            meter: RateMeter::new(Duration::from_secs(args.report_secs.max(1))),
        })
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<SinkStats> {
        let slot_size = self.buffer.slot_size();
        while running.load(Ordering::Relaxed) {
            match self.socket.receive_batch(self.buffer.as_slice_mut(), self.slots, slot_size) {
                Ok(received) => self.account(received)?,
                Err(e) if matches!(e.raw_os_error(), libc::EAGAIN | libc::EINTR) => {
                    self.stats.idle_ticks += 1;
                }
                Err(e) => return Err(e).context("recvmmsg batch failed"),
            }

            if let Some(rate) = self.meter.tick(self.stats.received, self.stats.bytes) {
                info!("Sink: {:.0} pps, {:.2} Mbit/s ({} total)", rate.pps, rate.mbps, self.stats.received);
            }
        }
        Ok(self.stats)
    }

    fn account(&mut self, received: usize) -> Result<()> {
        self.stats.batches += 1;
        self.stats.received += received as u64;

        let region = SlotRegion::new(self.buffer.as_slice(), self.family, self.buffer.slot_size())?;
        for index in 0..received {
            let Some(slot) = region.slot(index) else { break };
            self.stats.bytes += u64::from(slot.payload_len());
            if self.dump > 0 {
                let data = slot.ip_payload();
                println!("{} ({} bytes)\n{}", slot.peer(), data.len(), hex_dump(&data[..data.len().min(self.dump)]));
            }
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.socket.close().context("Failed to close raw socket")
    }
}

pub fn run(args: &SinkArgs, running: &AtomicBool) -> Result<()> {
    let mut session = SinkSession::open(args)?;
    let stats = session.run(running)?;
    session.close()?;
    info!(
        "Sink done: {} datagrams in {} batches, {} payload bytes, {} idle timeouts",
        stats.received, stats.batches, stats.bytes, stats.idle_ticks
    );
    Ok(())
}
