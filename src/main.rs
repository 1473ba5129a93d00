use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tracing::info;
mod config;
mod discord;
mod error;
mod monitor;
mod rcon;
mod sftp;
mod status;

use config::Config;
use discord::DiscordChannel;
use monitor::{Monitor, MonitorSettings};
use rcon::RconClient;
use sftp::SftpProbe;
use status::StatusReport;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env()?;
    info!("Starting with {config:?}");

    let (reports, latest) = watch::channel(StatusReport::default());
    let mut client = discord::create_client(
        &config.discord.token,
        discord::Data::new(latest, config.poll_interval),
    )
    .await?;
    let channel = DiscordChannel::connect(
        client.http.clone(),
        config.discord.channel_id,
        config.poll_interval,
    )
    .await?;

    let mut monitor = Monitor::new(
        SftpProbe::new(config.sftp.clone()),
        RconClient::new(config.rcon.clone()),
        channel,
        MonitorSettings::from(&config),
        reports,
    );
    monitor
        .cleanup()
        .await
        .context("Failed to clean up old status messages")?;

    tokio::spawn(monitor.run());
    client.start().await?;
    Ok(())
}
