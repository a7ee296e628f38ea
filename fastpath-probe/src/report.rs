use std::time::{Duration, Instant};

/// Packet and byte rates over one report interval.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub pps: f64,
    pub mbps: f64,
}

/// Turns running totals into per-interval rates.
pub struct RateMeter {
    interval: Duration,
    last_at: Instant,
    last_packets: u64,
    last_bytes: u64,
}

impl RateMeter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_at: Instant::now(), last_packets: 0, last_bytes: 0 }
    }

    /// Returns a rate once per interval, given totals since the session started.
    pub fn tick(&mut self, packets: u64, bytes: u64) -> Option<Rate> {
        self.tick_at(Instant::now(), packets, bytes)
    }

    fn tick_at(&mut self, now: Instant, packets: u64, bytes: u64) -> Option<Rate> {
        let elapsed = now.duration_since(self.last_at);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let rate = Rate {
            pps: packets.saturating_sub(self.last_packets) as f64 / secs,
            mbps: bytes.saturating_sub(self.last_bytes) as f64 * 8.0 / secs / 1e6,
        };
        self.last_at = now;
        self.last_packets = packets;
        self.last_bytes = bytes;
        Some(rate)
    }
}

/// `offset: hex bytes` lines, 16 bytes per line.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        out.push_str(&format!("{:04x}: {}\n", line * 16, hex.join(" ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_waits_for_interval() {
        let start = Instant::now();
        let mut meter = RateMeter { interval: Duration::from_secs(1), last_at: start, last_packets: 0, last_bytes: 0 };
        assert!(meter.tick_at(start + Duration::from_millis(500), 10, 1000).is_none());

        let rate = meter.tick_at(start + Duration::from_secs(2), 200, 250_000).unwrap();
        assert!((rate.pps - 100.0).abs() < 1e-9);
        assert!((rate.mbps - 1.0).abs() < 1e-9);

        let rate = meter.tick_at(start + Duration::from_secs(3), 300, 250_000).unwrap();
        assert!((rate.pps - 100.0).abs() < 1e-9);
        assert_eq!(rate.mbps, 0.0);
    }

    #[test]
    fn test_hex_dump_lines() {
        let dump = hex_dump(&(0u8..18).collect::<Vec<_>>());
        assert_eq!(
            dump,
            "0000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n0010: 10 11\n"
        );
        assert!(hex_dump(&[]).is_empty());
    }
}
