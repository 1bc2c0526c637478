use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::channel::mpsc::channel;
use log::{error, info};

use tintlink::config::io::ConfigIO;
use tintlink::device::session::{Session, SessionHandle, SessionOptions};
use tintlink::device::transport::BtleTransport;
use tintlink::device::types::{Phase, Role, Snapshot};
use tintlink::error::AppRunError;
use tintlink::init_logging;

const TRANSPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "tintlink", about = "Control a Tynt smart-tint window over Bluetooth LE")]
struct Cli {
    /// Address or identifier of the window; defaults to the last
    /// connected one.
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for nearby windows and list them.
    Scan,
    /// Connect and print sensor readings as they arrive.
    Watch,
    /// Set the goal tint level.
    SetTint {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },
    /// Set the goal motor opening.
    SetMotor {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },
}

async fn wait_for_scan_end(handle: &SessionHandle) -> Snapshot {
    let mut watch = handle.watch();
    loop {
        let snapshot = watch.borrow_and_update().clone();
        if !snapshot.scanning {
            return snapshot;
        }
        if watch.changed().await.is_err() {
            return snapshot;
        }
    }
}

async fn wait_for_connection(handle: &SessionHandle) -> Result<(), AppRunError> {
    let mut watch = handle.watch();
    loop {
        let phase = watch.borrow_and_update().phase;
        match phase {
            Phase::Connected => return Ok(()),
            Phase::Failed | Phase::Disconnected => {
                return Err(tintlink::error::DeviceError::Transport {
                    reason: format!("connection ended in phase {}", phase),
                }
                .into());
            }
            _ => {}
        }
        if watch.changed().await.is_err() {
            return Err(tintlink::error::DeviceError::SessionClosed.into());
        }
    }
}

/// Connect to the requested window, or scan and pick the strongest
/// signal when none is known yet.
async fn connect(handle: &mut SessionHandle, device: Option<String>) -> Result<(), AppRunError> {
    match device {
        Some(id) => handle.connect(id).await?,
        None => {
            info!("No device given and none remembered; scanning");
            handle.start_scan().await?;
            let snapshot = wait_for_scan_end(handle).await;
            let best = snapshot
                .devices
                .iter()
                .max_by_key(|descriptor| descriptor.rssi.unwrap_or(i16::MIN))
                .ok_or(tintlink::error::DeviceError::UnknownDevice(
                    "no window found during scan".to_string(),
                ))?;
            info!("Selecting {} ({:?})", best.id, best.name);
            handle.connect(best.id.clone()).await?;
        }
    }

    wait_for_connection(handle).await
}

fn print_readings(snapshot: &Snapshot) {
    if let Some(tint) = snapshot.tint {
        println!("tint: {}% (goal {:?})", tint, snapshot.goal_tint);
    }
    if let Some(drive_state) = snapshot.drive_state {
        println!("drive: {}", drive_state);
    }
    if let Some(temperature) = snapshot.temperature {
        println!("temperature: {:.1} C", temperature.celsius());
    }
    if let Some(humidity) = snapshot.humidity {
        println!("humidity: {}%", humidity);
    }
    if let Some(light) = &snapshot.light {
        match light.transmission() {
            Some(transmission) => println!(
                "light: interior {:.1} lx, exterior {:.1} lx, transmission {:.1}%",
                light.interior, light.exterior, transmission
            ),
            None => println!(
                "light: interior {:.1} lx, exterior {:.1} lx",
                light.interior, light.exterior
            ),
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;
    let config = config_io.read().await?;

    let requested = cli.device.clone().or_else(|| config.last_device.clone());

    let (events_tx, events_rx) = channel(TRANSPORT_CHANNEL_CAPACITY);
    let transport = BtleTransport::new(events_tx).await?;
    let options = SessionOptions::from_config(&config, config_io.clone());
    let (session, mut handle) = Session::new(Box::new(transport), events_rx, options);
    let session_task = tokio::spawn(session.run());

    match cli.command {
        Command::Scan => {
            handle.start_scan().await?;
            let snapshot = wait_for_scan_end(&handle).await;
            if snapshot.devices.is_empty() {
                println!("No windows found");
            }
            for descriptor in &snapshot.devices {
                println!(
                    "{}  {}  rssi {}",
                    descriptor.id,
                    descriptor.name.as_deref().unwrap_or("(unnamed)"),
                    descriptor
                        .rssi
                        .map(|rssi| rssi.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                );
            }
        }
        Command::Watch => {
            connect(&mut handle, requested).await?;
            let mut watch = handle.watch();
            loop {
                let snapshot = watch.borrow_and_update().clone();
                print_readings(&snapshot);
                if snapshot.phase != Phase::Connected {
                    info!("Connection lost; exiting");
                    break;
                }
                println!("---");
                if watch.changed().await.is_err() {
                    break;
                }
            }
        }
        Command::SetTint { level } => {
            connect(&mut handle, requested).await?;
            handle.write_and_wait(Role::GoalTint, level).await?;
            println!("Goal tint set to {}%", level);
            handle.disconnect().await?;
        }
        Command::SetMotor { level } => {
            connect(&mut handle, requested).await?;
            handle.write_and_wait(Role::GoalMotorOpen, level).await?;
            println!("Goal motor opening set to {}%", level);
            handle.disconnect().await?;
        }
    }

    drop(handle);
    let _ = session_task.await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
