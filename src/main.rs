use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use holofeed::config::load_settings;
use holofeed::error::Result as AppResult;
use holofeed::holodex::{EventSinks, HolodexEngine};

const STREAM_EVENT_BUFFER: usize = 64;
const CHAT_MESSAGE_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = load_settings()?;
    tracing::info!(
        tracked = settings.tracking.channels.len(),
        interval = settings.polling.interval_secs,
        "Configuration loaded"
    );

    let (stream_tx, mut stream_rx) = mpsc::channel(STREAM_EVENT_BUFFER);
    let (chat_tx, mut chat_rx) = mpsc::channel(CHAT_MESSAGE_BUFFER);
    let (vtuber_tx, mut vtuber_rx) = mpsc::channel(CHAT_MESSAGE_BUFFER);

    let mut engine = HolodexEngine::new(settings.holodex, settings.polling)?;
    engine
        .start(
            settings.tracking.channels,
            EventSinks {
                stream_tx,
                chat_tx,
                vtuber_tx,
            },
        )
        .await?;

    // Stand-in consumers until a delivery layer is wired up: log everything.
    tokio::spawn(async move {
        while let Some(event) = stream_rx.recv().await {
            tracing::info!(
                video.id = %event.video_id,
                channel = %event.channel_name,
                status = ?event.status,
                title = %event.title,
                "Stream event"
            );
        }
    });
    tokio::spawn(async move {
        while let Some(message) = chat_rx.recv().await {
            tracing::info!(
                video.id = %message.video_id,
                author = %message.author,
                translator = message.is_translator,
                "{}",
                message.text
            );
        }
    });
    tokio::spawn(async move {
        while let Some(message) = vtuber_rx.recv().await {
            tracing::info!(
                video.id = %message.video_id,
                author = %message.author,
                "[talent] {}",
                message.text
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    engine.stop().await;

    Ok(())
}
