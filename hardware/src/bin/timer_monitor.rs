//! Print decoded traffic from the GPS timer unit.
//!
//! Reads from the attached timer (auto-detected FT232, or `--port`), the
//! built-in simulated timer, or a captured serial dump, and logs every
//! packet. Optionally starts a sequence of exposures so trigger times can be
//! checked without the camera.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use hardware::timer::messages::hex_dump;
use hardware::timer::{
    find_timer_port, send_command, FramerEvent, PacketFramer, ReplayLink, SerialTimerLink,
    SimulatedTimer, TimerCommand, TimerLink, TimerMessage,
};
use tracing::{info, warn};

/// GPS timer unit traffic monitor
#[derive(Parser, Debug)]
#[command(name = "timer_monitor")]
#[command(about = "Decode and print packets from the GPS timer unit")]
#[command(version)]
struct Args {
    /// Serial device; auto-detected by USB id when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Use the software timer instead of hardware
    #[arg(long, conflicts_with_all = ["port", "replay"])]
    simulate: bool,

    /// Decode a captured byte dump instead of a live link
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Start exposures of this many seconds after connecting
    #[arg(long)]
    start: Option<u16>,

    /// Do not ask the timer to monitor the camera's logic output
    #[arg(long)]
    no_monitor: bool,

    /// Stop after this many seconds (runs until interrupted when omitted)
    #[arg(short, long)]
    duration: Option<f64>,
}

#[derive(Debug, Default)]
struct Statistics {
    current_times: u64,
    download_times: u64,
    debug: u64,
    malformed: u64,
    undecodable: u64,
}

impl Statistics {
    fn report(&self, framer: &PacketFramer) {
        info!(
            "{} packets ({} CURRENT_TIME, {} DOWNLOAD_TIME, {} debug), {} malformed runs, {} undecodable, {} bytes discarded",
            framer.packets_received(),
            self.current_times,
            self.download_times,
            self.debug,
            self.malformed,
            self.undecodable,
            framer.bytes_discarded()
        );
    }
}

fn open_link(args: &Args) -> Result<Box<dyn TimerLink>> {
    if args.simulate {
        return Ok(Box::new(SimulatedTimer::new()));
    }
    if let Some(path) = &args.replay {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        info!("Replaying {} bytes from {}", bytes.len(), path.display());
        return Ok(Box::new(ReplayLink::from_bytes(bytes)));
    }
    let path = match &args.port {
        Some(path) => path.clone(),
        None => find_timer_port().context("Failed to locate timer unit")?,
    };
    Ok(Box::new(SerialTimerLink::new(path)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut link = open_link(&args)?;
    link.connect()
        .with_context(|| format!("Failed to connect to {}", link.name()))?;

    if let Some(seconds) = args.start {
        send_command(
            link.as_mut(),
            TimerCommand::StartExposure {
                seconds,
                use_monitor: !args.no_monitor,
            },
        )
        .context("Failed to start exposures")?;
        info!("Requested {seconds}s exposures");
    }

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let mut framer = PacketFramer::new();
    let mut stats = Statistics::default();
    let mut buf = [0u8; 256];
    let mut idle_reads = 0u32;

    while deadline.map_or(true, |d| Instant::now() < d) {
        let n = link.receive(&mut buf, Duration::from_millis(100))?;
        if n == 0 {
            idle_reads += 1;
            // A finished replay never produces more bytes
            if args.replay.is_some() && idle_reads > 2 {
                break;
            }
            continue;
        }
        idle_reads = 0;

        for event in framer.push_bytes(&buf[..n]) {
            match event {
                FramerEvent::Packet(packet) => match TimerMessage::decode(&packet) {
                    Ok(TimerMessage::CurrentTime(ts)) => {
                        stats.current_times += 1;
                        info!(
                            "CURRENT_TIME  {ts} locked={} remaining={}s",
                            ts.locked, ts.remaining_exposure
                        );
                    }
                    Ok(TimerMessage::DownloadTime(ts)) => {
                        stats.download_times += 1;
                        info!("DOWNLOAD_TIME {ts} locked={}", ts.locked);
                    }
                    Ok(TimerMessage::Debug(text)) => {
                        stats.debug += 1;
                        info!("DEBUG         {text}");
                    }
                    Ok(TimerMessage::DebugRaw(data)) => {
                        stats.debug += 1;
                        info!("DEBUG_RAW     {}", hex_dump(&data));
                    }
                    Err(e) => {
                        stats.undecodable += 1;
                        warn!("Undecodable {} packet: {e}", packet.kind);
                    }
                },
                FramerEvent::Malformed(bad) => {
                    stats.malformed += 1;
                    warn!(
                        "Discarded {} bytes ({:?}), {} consecutive",
                        bad.discarded, bad.reason, bad.consecutive
                    );
                }
            }
        }
    }

    if args.start.is_some() {
        send_command(link.as_mut(), TimerCommand::StopExposure)
            .context("Failed to stop exposures")?;
    }
    link.disconnect()?;
    stats.report(&framer);
    Ok(())
}
