use color_eyre::{eyre::eyre, Result};
use gramolink::config::{self, AppConfig};
use gramolink::download::{ContentResolver, WebApiResolver};
use gramolink::lifecycle::{Lifecycle, LifecycleState};
use gramolink::realtime::{ChannelEvent, RealtimeClient};
use gramolink::session::{
    Disposable, LocalConnector, LocalPlayer, MediaItem, PlaybackClientHandle, PlayerController,
    PlayerEvent, PlayerListener,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let path = config::ensure_default_config().await?;
    let config = AppConfig::load().await;
    info!("Using configuration from {}", path.display());

    run_session(&config).await?;

    if let Some(content_id) = std::env::args().nth(1) {
        resolve(&config, &content_id).await?;
        if !config.realtime.endpoint.is_empty() {
            request_realtime(&config, &content_id).await?;
        }
    }

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

struct LoggingListener;

impl PlayerListener for LoggingListener {
    fn on_event(&self, event: &PlayerEvent) {
        info!("Player event: {:?}", event);
    }
}

/// Binds an in-process player to a scope, edits its queue and tears it down
async fn run_session(config: &AppConfig) -> Result<()> {
    let queue = vec![
        MediaItem::new("intro").with_title("Intro"),
        MediaItem::new("night-drive").with_title("Night Drive"),
        MediaItem::new("outro").with_title("Outro"),
    ];
    let connector = Arc::new(LocalConnector::new(queue).with_delay(Duration::from_millis(50)));

    let owner = Lifecycle::new();
    owner.set_state(LifecycleState::Created);
    let shutdown = CancellationToken::new();
    let (client, task) = PlaybackClientHandle::<LocalPlayer>::spawn(
        connector,
        config.session.descriptor(),
        owner.clone(),
        shutdown.clone(),
    );

    client
        .add_controller_callback(
            Some(owner.clone()),
            Arc::new(|_: &mut Disposable, controller: &Arc<LocalPlayer>, _: &Lifecycle| {
                info!(
                    "Controller connected with {} queued items",
                    controller.media_item_count()
                );
            }),
        )
        .await?;
    client
        .add_player_listener(
            owner.clone(),
            Arc::new(|_: &Arc<LocalPlayer>| Arc::new(LoggingListener) as Arc<dyn PlayerListener>),
        )
        .await?;

    owner.set_state(LifecycleState::Started);

    let mut controller = None;
    for _ in 0..50 {
        controller = client.controller().await?;
        if controller.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let controller = controller.ok_or_else(|| eyre!("Session did not connect"))?;
    controller.play();

    let outcome = client.remove_media_item("night-drive").await?;
    info!("Removed \"night-drive\": {:?}", outcome);
    debug!("Queue is now {:?}", controller.queue());

    owner.destroy();
    if let Err(e) = task.await {
        error!("Playback client task failed: {}", e);
    }
    info!("Controller released: {}", controller.is_released());
    Ok(())
}

/// Resolves `content_id` to stream urls; the transfer itself belongs to the host
async fn resolve(config: &AppConfig, content_id: &str) -> Result<()> {
    let resolver = WebApiResolver::new(&config.resolver)?;
    match resolver.resolve(content_id).await {
        Some(info) => info!(
            "\"{}\" (lossless: {}): {} [backup: {}]",
            info.title, info.is_lossless, info.primary_url, info.backup_url
        ),
        None => warn!("Nothing to download for {}", content_id),
    }
    Ok(())
}

async fn request_realtime(config: &AppConfig, content_id: &str) -> Result<()> {
    let (client, mut events) = RealtimeClient::create(config.realtime.clone())
        .connect()
        .await?;
    client.send_request(content_id)?;

    let reply = tokio::time::timeout(Duration::from_secs(config.realtime.connect_timeout_secs), async {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message { .. } => return event.json(),
                ChannelEvent::Error(e) => {
                    warn!("Realtime channel error: {}", e);
                    return None;
                }
                ChannelEvent::Disconnected => return None,
                ChannelEvent::Connected => {}
            }
        }
        None
    })
    .await
    .unwrap_or(None);
    info!("Realtime reply: {:?}", reply);

    client.disconnect().await;
    Ok(())
}
