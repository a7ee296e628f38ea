use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

mod capture;
mod config;
mod flood;
mod report;
mod sink;

use config::{Args, Command};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Relaxed);
    })
    .context("Failed to install Ctrl-C handler")?;

    if args.lock_memory {
        info!("Locking memory pages...");
        fastpath_io::lock_all_memory();
    }

    match args.command {
        Command::Capture(opts) => capture::run(&opts, &running),
        Command::Flood(opts) => flood::run(opts, running),
        Command::Sink(opts) => sink::run(&opts, &running),
    }
}
