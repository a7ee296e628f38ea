use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_utils::sync::WaitGroup;
use fastpath_io::platform::affinity::pin_thread_to_core;
use fastpath_io::{AddressFamily, RawSocket, RawSocketConfig, SlotBuffer};
use log::{info, warn};
use rand::Rng;

use crate::config::FloodArgs;
use crate::report::RateMeter;

#[derive(Debug, Default, Clone, Copy)]
pub struct FloodStats {
    pub batches: u64,
    pub sent: u64,
    pub bytes: u64,
    pub short_batches: u64,
    pub backpressure: u64,
}

impl FloodStats {
    fn merge(&mut self, other: &FloodStats) {
        self.batches += other.batches;
        self.sent += other.sent;
        self.bytes += other.bytes;
        self.short_batches += other.short_batches;
        self.backpressure += other.backpressure;
    }
}

pub struct FloodSession {
    worker: usize,
    socket: RawSocket,
    buffer: SlotBuffer,
    slots: usize,
    payload_len: usize,
    stats: FloodStats,
    meter: RateMeter,
}

/// Fills the first `slots` slots with `destination` and `payload_len` random bytes.
fn fill_slots(buffer: &mut SlotBuffer, family: AddressFamily, destination: IpAddr, slots: usize, payload_len: usize) -> Result<usize> {
    let mut rng = rand::thread_rng();
    let mut region = buffer.region(family)?;
    if region.slot_count() < slots {
        return Err(anyhow!("buffer holds {} slots, {} requested", region.slot_count(), slots));
    }
    let mut len = payload_len;
    for mut slot in region.iter_mut().take(slots) {
        slot.set_peer(destination)?;
        len = payload_len.min(slot.capacity());
        rng.fill(&mut slot.payload_mut()[..len]);
        slot.set_payload_len(len as u32);
    }
    Ok(len)
}

impl FloodSession {
    pub fn open(args: &FloodArgs, worker: usize) -> Result<Self> {
        let family = AddressFamily::of(&args.destination);
        let mut config = RawSocketConfig::new(family, args.protocol);
        config.send_buffer = args.send_buffer;
        let socket = RawSocket::open_with(&config).context("Failed to open raw socket")?;

        let mut buffer = SlotBuffer::new(args.slots, args.slot_size).context("Failed to allocate slot buffer")?;
        let payload_len = fill_slots(&mut buffer, family, args.destination, args.slots, args.payload_len)?;
        if payload_len < args.payload_len {
            warn!("Worker {}: payload truncated to {} bytes to fit {} byte slots", worker, payload_len, args.slot_size);
        }

        info!(
            "Worker {} flooding {} (fd: {}, {} slots x {} bytes per batch, locked: {})",
            worker,
            args.destination,
            socket.as_raw_fd().unwrap_or(-1),
            args.slots,
            payload_len,
            buffer.is_locked()
        );

        Ok(Self {
            worker,
            socket,
            buffer,
            slots: args.slots,
            payload_len,
            stats: FloodStats::default(),
            meter: RateMeter::new(Duration::from_secs(args.report_secs.max(1))),
        })
    }

    pub fn run(&mut self, running: &AtomicBool, batches: Option<u64>) -> Result<FloodStats> {
        let slot_size = self.buffer.slot_size();
        while running.load(Ordering::Relaxed) && batches.map_or(true, |n| self.stats.batches < n) {
            match self.socket.send_batch(self.buffer.as_slice(), self.slots, slot_size) {
                Ok(sent) => {
                    self.stats.batches += 1;
                    self.stats.sent += sent as u64;
                    self.stats.bytes += (sent * self.payload_len) as u64;
                    if sent < self.slots {
                        self.stats.short_batches += 1;
                    }
                }
                Err(e) if matches!(e.raw_os_error(), libc::ENOBUFS | libc::EAGAIN | libc::EINTR) => {
                    self.stats.backpressure += 1;
                }
                Err(e) => return Err(e).context("sendmmsg batch failed"),
            }

            if let Some(rate) = self.meter.tick(self.stats.sent, self.stats.bytes) {
                info!("Worker {}: {:.0} pps, {:.2} Mbit/s", self.worker, rate.pps, rate.mbps);
            }
        }
        Ok(self.stats)
    }

    pub fn close(mut self) -> Result<()> {
        self.socket.close().context("Failed to close raw socket")
    }
}

fn run_worker(args: &FloodArgs, worker: usize, running: &AtomicBool, ready: WaitGroup) -> Result<FloodStats> {
    if let Some(first) = args.first_core {
        pin_thread_to_core(first + worker);
    }
    let session = FloodSession::open(args, worker);
    drop(ready);
    let mut session = session?;
    let stats = session.run(running, args.batches)?;
    session.close()?;
    Ok(stats)
}

pub fn run(args: FloodArgs, running: Arc<AtomicBool>) -> Result<()> {
    let args = Arc::new(args);
    let wg = WaitGroup::new();
    let mut handles = Vec::with_capacity(args.workers.max(1));

    for worker in 0..args.workers.max(1) {
        let args = Arc::clone(&args);
        let running = Arc::clone(&running);
        let ready = wg.clone();
        handles.push(thread::spawn(move || run_worker(&args, worker, &running, ready)));
    }

    wg.wait();
    info!("All {} flood workers started.", handles.len());

    let mut total = FloodStats::default();
    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(stats)) => total.merge(&stats),
            Ok(Err(e)) => warn!("Worker {} stopped: {:#}", worker, e),
            Err(_) => warn!("Worker {} panicked", worker),
        }
    }

    info!(
        "Flood done: {} datagrams in {} batches ({} short, {} backpressure), {} payload bytes",
        total.sent, total.batches, total.short_batches, total.backpressure, total.bytes
    );
    Ok(())
}
