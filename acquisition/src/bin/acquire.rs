//! Acquisition console.
//!
//! Reads commands from stdin: `start [seconds]`, `stop`, `save`, `status`
//! and `quit`. End of input also quits.

use acquisition::config::Args;
use acquisition::delivery::{FitsSink, ScriptHooks};
use acquisition::logging::init_logging;
use acquisition::{AcquisitionContext, Coordinator, UiCommand};
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Sender;
use hardware::timer::{find_timer_port, SerialTimerLink, SimulatedTimer, TimerLink};
use shared::camera_interface::simulated::{trigger_line, SimulatedCamera, SimulatedCameraConfig};
use shared::camera_interface::CameraDriver;
use shared::log_stream::LogBroadcaster;
use shared::preferences::PreferenceStore;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

fn parse_command(line: &str) -> Option<UiCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "start" => match words.next() {
            Some(seconds) => match seconds.parse::<u16>() {
                Ok(seconds) => UiCommand::StartExposure {
                    seconds,
                    use_monitor: true,
                },
                Err(_) => {
                    warn!("Invalid exposure time: {seconds}");
                    return None;
                }
            },
            None => UiCommand::StartFromPreferences,
        },
        "stop" => UiCommand::StopExposure,
        "save" => UiCommand::ToggleSave,
        "status" => UiCommand::ReportStatus,
        "quit" | "exit" => UiCommand::Shutdown,
        other => {
            warn!("Unknown command: {other}");
            return None;
        }
    };
    Some(command)
}

fn spawn_console(commands: Sender<UiCommand>) -> Result<()> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Some(command) = parse_command(&line) {
                    let quit = command == UiCommand::Shutdown;
                    if commands.send(command).is_err() || quit {
                        return;
                    }
                }
            }
            // Dropping the sender tells the coordinator to shut down
        })
        .context("Failed to start console thread")?;
    Ok(())
}

fn open_devices(
    args: &Args,
    camera_config: SimulatedCameraConfig,
) -> Result<(Box<dyn CameraDriver>, Box<dyn TimerLink>)> {
    if args.simulate_timer {
        let (output, input) = trigger_line();
        let camera = SimulatedCamera::new(camera_config).with_trigger(input);
        let timer = SimulatedTimer::new().with_trigger(output);
        return Ok((Box::new(camera), Box::new(timer)));
    }

    let port = match &args.timer_port {
        Some(port) => port.clone(),
        None => find_timer_port().context("Failed to locate timer")?,
    };
    info!("Using timer on {port}");
    // Without a shared trigger line the simulated camera free-runs
    let camera = SimulatedCamera::new(camera_config);
    Ok((Box::new(camera), Box::new(SerialTimerLink::new(port))))
}

fn run(args: Args) -> Result<u8> {
    args.validate()?;

    let broadcaster = Arc::new(LogBroadcaster::default());
    let log_path = init_logging(&args.log_dir, Arc::clone(&broadcaster))?;
    info!("Logging to {}", log_path.display());

    let prefs = Arc::new(
        PreferenceStore::load_or_default(&args.preferences)
            .with_context(|| format!("Failed to load {}", args.preferences.display()))?,
    );
    let (camera, timer) = open_devices(&args, args.simulated_camera())?;

    let ctx = Arc::new(AcquisitionContext::new(args.queue_capacity, broadcaster));
    let sink = FitsSink::new(args.preview_path.clone());
    let hooks = ScriptHooks::new(args.preview_script.clone(), args.saved_script.clone());
    let coordinator = Coordinator::launch(
        ctx,
        prefs,
        camera,
        timer,
        Box::new(sink),
        Box::new(hooks),
        args.coordinator_config(),
    )
    .context("Failed to start workers")?;

    let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
    spawn_console(commands_tx)?;

    let outcome = coordinator.run(commands_rx);
    if let Some(message) = &outcome.report.fatal_error {
        error!("Fatal error: {message}");
    }
    info!(
        "Delivered {} frames, saved {}, discarded {} queued frames",
        outcome.delivery.delivered, outcome.delivery.saved, outcome.report.discarded_frames
    );
    Ok(outcome.exit_code())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}
