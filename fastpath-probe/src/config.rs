use std::net::IpAddr;

use clap::{Parser, Subcommand, ValueEnum};
use fastpath_io::AddressFamily;

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture, flood and sink harness for the fastpath packet layer")]
pub struct Args {
    /// Lock current process pages into RAM before starting.
    #[arg(long)]
    pub lock_memory: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Count frames arriving on an interface through a TPACKET_V3 ring.
    Capture(CaptureArgs),
    /// Send batches of raw datagrams to a destination.
    Flood(FloodArgs),
    /// Receive batches of raw datagrams and report rates.
    Sink(SinkArgs),
}

#[derive(clap::Args, Debug)]
pub struct CaptureArgs {
    #[arg(short, long, default_value = "lo")]
    pub interface: String,

    #[arg(long, default_value_t = 16)]
    pub blocks: u32,

    #[arg(long, default_value_t = 1 << 16)]
    pub block_size: u32,

    #[arg(long, default_value_t = 2048)]
    pub frame_size: u32,

    #[arg(short, long)]
    pub promiscuous: bool,

    /// IPv6 next-header value counted separately.
    #[arg(long, default_value_t = 253)]
    pub next_header: u8,

    #[arg(long, default_value_t = 1)]
    pub report_secs: u64,

    /// Pin the capture thread to this core.
    #[arg(long)]
    pub core: Option<usize>,
}

#[derive(clap::Args, Debug)]
pub struct FloodArgs {
    pub destination: IpAddr,

    #[arg(long, default_value_t = 253)]
    pub protocol: i32,

    #[arg(short, long, default_value_t = 16)]
    pub slots: usize,

    #[arg(long, default_value_t = 1024)]
    pub slot_size: usize,

    #[arg(short = 'l', long, default_value_t = 512)]
    pub payload_len: usize,

    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,

    /// Pin worker `n` to core `first_core + n`.
    #[arg(long)]
    pub first_core: Option<usize>,

    /// Batches per worker; runs until Ctrl-C when unset.
    #[arg(short, long)]
    pub batches: Option<u64>,

    #[arg(long)]
    pub send_buffer: Option<usize>,

    #[arg(long, default_value_t = 1)]
    pub report_secs: u64,
}

#[derive(clap::Args, Debug)]
pub struct SinkArgs {
    #[arg(short, long, value_enum, default_value_t = FamilyArg::V6)]
    pub family: FamilyArg,

    #[arg(long, default_value_t = 253)]
    pub protocol: i32,

    #[arg(short, long, default_value_t = 16)]
    pub slots: usize,

    #[arg(long, default_value_t = 1024)]
    pub slot_size: usize,

    /// Hex dump this many leading payload bytes of every received slot.
    #[arg(long, default_value_t = 0)]
    pub dump: usize,

    #[arg(long)]
    pub recv_buffer: Option<usize>,

    /// Receive timeout so Ctrl-C is noticed while idle.
    #[arg(long, default_value_t = 500)]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = 1)]
    pub report_secs: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FamilyArg {
    V4,
    V6,
}

impl From<FamilyArg> for AddressFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::V4 => AddressFamily::Ipv4,
            FamilyArg::V6 => AddressFamily::Ipv6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_defaults() {
        let args = Args::parse_from(["fastpath-probe", "flood", "::1"]);
        let Command::Flood(flood) = args.command else { panic!("expected flood") };
        assert_eq!(flood.protocol, 253);
        assert_eq!(flood.slots, 16);
        assert_eq!(flood.slot_size, 1024);
        assert!(flood.destination.is_ipv6());
    }

    #[test]
    fn test_sink_family_flag() {
        let args = Args::parse_from(["fastpath-probe", "--lock-memory", "sink", "-f", "v4", "--dump", "16"]);
        assert!(args.lock_memory);
        let Command::Sink(sink) = args.command else { panic!("expected sink") };
        assert_eq!(AddressFamily::from(sink.family), AddressFamily::Ipv4);
        assert_eq!(sink.dump, 16);
    }
}
