use overvis_bridge::{Command, Config, Event, Overvis};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Overvis bridge v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env()?;
    let overvis = Overvis::new(config)?;

    let mut events = overvis.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("[OVERVIS] skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    overvis.start();

    // Newline-delimited JSON commands, e.g. {"state": true}
    let commands = overvis.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            info!("[OVERVIS] received");
            info!("[OVERVIS]   > {line}");
            match serde_json::from_str::<Command>(&line) {
                Ok(command) => commands.handle(command).await,
                Err(e) => error!("[OVERVIS] not able to parse incoming message: {e}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    overvis.stop();
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::Connection { online, info } => {
            let status = if *online {
                "connected to"
            } else {
                "disconnected from"
            };
            let device = info
                .as_ref()
                .map(|info| format!(" ({} {})", info.model.as_deref().unwrap_or("?"), info.name))
                .unwrap_or_default();
            info!("[OVERVIS] {status} device{device}");
        }
        Event::Status(snapshot) | Event::State(snapshot) => {
            info!(
                "[OVERVIS] {} {}",
                event.kind(),
                serde_json::Value::Object(snapshot.clone())
            );
        }
        Event::Report(report) => info!("[OVERVIS] report {}", report.time.to_rfc3339()),
        Event::Error(e) => {
            error!("[OVERVIS] overvis error");
            error!("[OVERVIS]   > {e}");
        }
    }
}
