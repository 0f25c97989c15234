//! Monitor telemetry and session events.
//!
//! Connects to the aircraft on its own access point, prints a telemetry
//! line once per second, and reports every session event as it arrives.
//! Nothing here makes the aircraft move.
//!
//! # Requirements
//!
//! - A Tello powered on, with this machine joined to its `TELLO-XXXXXX`
//!   Wi-Fi network
//! - UDP ports 8889, 8890, and 11111 free locally
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=tello=debug cargo run -p tello --example telemetry_monitor -- --seconds 30
//! ```

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use tello::{Command, SessionEvent, TelloBuilder};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "telemetry_monitor", about)]
struct Cli {
    /// Aircraft address.
    #[arg(long, default_value = "192.168.10.1")]
    device: IpAddr,

    /// How long to monitor before disconnecting.
    #[arg(long, default_value_t = 60)]
    seconds: u64,

    /// Telemetry age, in seconds, treated as link loss.
    #[arg(long, default_value_t = 3)]
    staleness: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tello=info")),
        )
        .init();

    let session = TelloBuilder::new()
        .device_addr(cli.device)
        .staleness_threshold(Duration::from_secs(cli.staleness))
        .video(false)
        .build()?;

    println!("Connecting to Tello at {}...", cli.device);
    session.connect().await?;
    println!(
        "Connected, SDK {}",
        session
            .sdk_version()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".into())
    );

    let serial = session.submit(Command::read_serial_number()).await;
    println!("Serial number: {serial}\n");

    let mut events = session.events();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.seconds);

    println!("{:<6} {:>5} {:>6} {:>6} {:>8}", "seq", "bat%", "h(cm)", "tof", "yaw");
    println!("{:-<6} {:->5} {:->6} {:->6} {:->8}", "", "", "", "", "");

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tick.tick() => {
                if let Some(t) = session.latest_telemetry() {
                    println!(
                        "{:<6} {:>5} {:>6} {:>6} {:>8}",
                        t.seq(), t.battery, t.height, t.tof, t.yaw
                    );
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::LinkLost { staleness }) => {
                    println!("link lost, no telemetry for {staleness:?}");
                    break;
                }
                Ok(event) => println!("event: {event:?}"),
                Err(e) => println!("event stream: {e}"),
            },
        }
    }

    session.disconnect().await?;
    let counters = session.telemetry_counters();
    println!(
        "\n{} datagrams, {} snapshots, {} malformed",
        counters.received, counters.published, counters.parse_errors
    );
    Ok(())
}
