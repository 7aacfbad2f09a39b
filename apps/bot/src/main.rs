use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use chat::{parse_command, ChannelMirror, ChatListener, HttpChatGateway};
use coordinator::Coordinator;
use drive::{HttpSpreadsheetStore, SheetMirror};
use registry::Registry;
use shared::domain::PartyConfig;

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Debug, Parser)]
#[command(name = "huntbot", about = "Puzzle-hunt coordination bot")]
struct Args {
    /// Path to the TOML settings file (defaults to ./huntbot.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let settings = load_settings(args.config.as_deref());
    let database_url = prepare_database_url(&settings.database_url)?;
    let registry = Registry::open(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    registry.health_check().await.map_err(|error| {
        error!(%error, "database health check failed");
        error
    })?;

    let gateway = Arc::new(HttpChatGateway::new(
        settings.chat_api_url.clone(),
        settings.chat_token.clone(),
        settings.guild_id.clone(),
    ));
    let store = Arc::new(HttpSpreadsheetStore::new(
        settings.drive_api_url.clone(),
        settings.drive_token.clone(),
    ));
    let channels = ChannelMirror::new(
        gateway,
        settings.live_category.clone(),
        settings.archive_category.clone(),
        settings.voice_category.clone(),
    );
    let sheets = SheetMirror::new(
        store,
        settings.root_folder.clone(),
        settings.archive_category.clone(),
        settings.template_sheet.clone(),
    );
    let party = PartyConfig {
        start_party_size: settings.start_party_size,
        root_folder: settings.root_folder.clone(),
        command_prefix: settings.command_prefix.clone(),
        live_category: settings.live_category.clone(),
        archive_category: settings.archive_category.clone(),
    };
    let coordinator = Arc::new(Coordinator::new(registry, channels, sheets, party));

    match coordinator.reconcile().await {
        Ok(imported) => info!(imported, "startup reconciliation complete"),
        Err(err) => warn!("startup reconciliation failed: {err}"),
    }

    let (tx, mut rx) = mpsc::channel(256);
    let listener = ChatListener::new(
        settings.chat_gateway_url.clone(),
        settings.chat_token.clone(),
    );
    tokio::spawn(listener.run(tx));
    info!("listening for commands");

    while let Some(message) = rx.recv().await {
        let Some(command) = parse_command(&settings.command_prefix, &message.text) else {
            continue;
        };
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator.dispatch(command, &message.channel).await;
        });
    }

    info!("chat gateway stream ended; shutting down");
    Ok(())
}
