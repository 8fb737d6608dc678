mod clock;
mod jbd;
mod mqtt;

use anyhow::Context;
use bms_telemetry_core::scheduler::Scheduler;
use clap::Parser;
use log::info;
use std::time::Duration;

/// Periodically read a JBD battery management system and publish its state as JSON telemetry.
#[derive(Parser)]
struct Cli {
    /// Serial port the BMS is connected to
    #[arg(short, long)]
    port: String,

    /// Serial baud rate
    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// MQTT broker address
    #[arg(long)]
    broker: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    /// Device identity, used as the MQTT client ID and in the telemetry topic
    #[arg(long)]
    device_id: String,

    /// MQTT username, given together with a password
    #[arg(long, env = "BMS_TELEMETRY_USERNAME")]
    username: Option<String>,

    /// MQTT password
    #[arg(long, env = "BMS_TELEMETRY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Seconds between the start of consecutive cycles
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    period: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "BMS telemetry bridge {}",
        git_version::git_version!(fallback = "unknown")
    );

    let bms = jbd::JbdBms::open(&cli.port, cli.baud)
        .with_context(|| format!("Failed to open serial port {}", cli.port))?;

    let credentials = match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => Some((username.as_str(), password.as_str())),
        (None, None) => None,
        _ => anyhow::bail!("Username and password must be given together"),
    };

    let (transport, connection) = mqtt::MqttTransport::new(&mqtt::MqttConfig {
        broker: &cli.broker,
        port: cli.broker_port,
        device_id: &cli.device_id,
        credentials,
    });
    tokio::spawn(connection.drive());

    info!(
        "Publishing telemetry from {} as {} every {} s",
        cli.port, cli.device_id, cli.period
    );

    let mut scheduler = Scheduler::new(
        bms,
        transport,
        clock::TokioClock::new(),
        Duration::from_secs(cli.period),
    );
    scheduler.run().await
}
