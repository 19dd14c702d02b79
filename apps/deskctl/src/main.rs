use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use desk_core::{
    CloudDeviceApi, DeskChange, DeskController, DeskSnapshot, FleetRegistry, SseConnector,
    StreamOptions, TargetOutcome,
};
use shared::{
    domain::{display_name, DeskId},
    protocol::ApiEndpoints,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(name = "deskctl", version, about = "Control standing desks through the device cloud")]
struct Args {
    /// Config file; defaults to ./deskctl.toml.
    #[arg(long, env = "DESKCTL_CONFIG")]
    config: Option<PathBuf>,
    /// Desk to act on instead of the configured active desk.
    #[arg(long)]
    desk: Option<String>,
    /// How long one-shot commands wait for the desk.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log every change of every desk until interrupted.
    Watch,
    Status,
    Raise,
    Lower,
    SetHeight { cm: i32 },
    /// Move to a preset by name or `#n`.
    Preset { preset: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = config::load_settings(args.config.as_deref())?;
    let endpoints = ApiEndpoints::new(settings.api_base_url.clone())
        .context("api_base_url cannot be used as a base URL")?;
    let api = Arc::new(CloudDeviceApi::new(endpoints.clone()));
    let connector = Arc::new(SseConnector::new(StreamOptions {
        idle_timeout: settings.stream_idle_timeout,
        ..StreamOptions::default()
    }));
    let fleet = FleetRegistry::new(endpoints, api, connector);

    for desk in settings.desks {
        fleet.add_desk(desk.config, desk.presets).await?;
    }
    if let Some(id) = args.desk.map(DeskId::new).or(settings.active_desk) {
        fleet.set_active(&id).await?;
    }

    let limit = Duration::from_secs(args.timeout_secs);
    let result = run(&fleet, args.command, limit).await;
    fleet.shutdown().await;
    result
}

async fn run(fleet: &FleetRegistry, command: Command, limit: Duration) -> Result<()> {
    match command {
        Command::Watch => watch(fleet).await,
        Command::Status => {
            let desk = active_desk(fleet).await?;
            let snapshot = match commands::wait_until_ready(&desk, limit).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!("{err:#}");
                    desk.snapshot().await
                }
            };
            println!("{}", commands::describe(&snapshot));
            let presets = fleet.presets(desk.id()).await?;
            for preset in &presets {
                println!("  {}: {} cm", display_name(preset, &presets), preset.height);
            }
            Ok(())
        }
        Command::Raise => {
            let desk = active_desk(fleet).await?;
            let target_cm = desk.limits().standing_cm;
            move_with(&desk, limit, target_cm, |desk| async move { desk.raise().await }).await
        }
        Command::Lower => {
            let desk = active_desk(fleet).await?;
            let target_cm = desk.limits().sitting_cm;
            move_with(&desk, limit, target_cm, |desk| async move { desk.lower().await }).await
        }
        Command::SetHeight { cm } => {
            let desk = active_desk(fleet).await?;
            commands::wait_until_ready(&desk, limit).await?;
            let mut changes = desk.subscribe_changes();
            desk.send_height(cm)
                .await
                .with_context(|| format!("failed to send height {cm} cm"))?;
            let outcome = commands::wait_for_move(&mut changes, limit).await?;
            info!(desk_id = %desk.id(), ?outcome, "move finished");
            println!("{}", commands::describe(&settle(&desk).await));
            Ok(())
        }
        Command::Preset { preset } => {
            let desk = active_desk(fleet).await?;
            commands::wait_until_ready(&desk, limit).await?;
            let presets = fleet.presets(desk.id()).await?;
            let chosen = commands::find_preset(&presets, &preset)
                .with_context(|| format!("desk {} has no preset '{preset}'", desk.id()))?;
            let mut events = fleet.sequencer().subscribe();
            let token = fleet.activate_preset(desk.id(), chosen.order).await?;
            println!(
                "Moving {} to {} ({} cm)",
                desk.name(),
                display_name(&chosen, &presets),
                chosen.height
            );
            match commands::wait_for_target(&mut events, token, limit).await? {
                TargetOutcome::Reached => {
                    println!("{}", commands::describe(&settle(&desk).await));
                    Ok(())
                }
                TargetOutcome::Failed(err) => Err(err).context("preset move failed"),
                other => bail!("preset move ended early: {other:?}"),
            }
        }
    }
}

async fn active_desk(fleet: &FleetRegistry) -> Result<Arc<DeskController>> {
    fleet
        .active_desk()
        .await
        .context("no desks configured; add [[desks]] to deskctl.toml")
}

async fn move_with<F, Fut>(
    desk: &Arc<DeskController>,
    limit: Duration,
    target_cm: i32,
    issue: F,
) -> Result<()>
where
    F: FnOnce(Arc<DeskController>) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    commands::wait_until_ready(desk, limit).await?;
    let mut changes = desk.subscribe_changes();
    if !issue(Arc::clone(desk)).await {
        println!("{} is already at {target_cm} cm", desk.name());
        return Ok(());
    }
    let outcome = commands::wait_for_move(&mut changes, limit).await?;
    info!(desk_id = %desk.id(), ?outcome, "move finished");
    println!("{}", commands::describe(&settle(desk).await));
    Ok(())
}

/// Gives the post-move height fetch a moment to land.
async fn settle(desk: &DeskController) -> DeskSnapshot {
    let mut changes = desk.subscribe_changes();
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match changes.recv().await {
                Ok(DeskChange::Height(_)) | Err(RecvError::Closed) => break,
                _ => {}
            }
        }
    })
    .await;
    desk.snapshot().await
}

async fn watch(fleet: &FleetRegistry) -> Result<()> {
    let mut fleet_events = fleet.subscribe();
    let mut sequencer_events = fleet.sequencer().subscribe();
    for id in fleet.desk_ids().await {
        let desk = fleet.desk(&id).await?;
        let mut changes = desk.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => info!(desk_id = %id, ?change, "desk changed"),
                    Err(RecvError::Lagged(skipped)) => warn!(desk_id = %id, skipped, "watch lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    info!("watching desks; press Ctrl-C to stop");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("stopping");
                return Ok(());
            }
            Ok(event) = fleet_events.recv() => info!(?event, "fleet changed"),
            Ok(event) = sequencer_events.recv() => info!(?event, "preset target"),
        }
    }
}
