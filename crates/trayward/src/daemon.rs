use anyhow::{Context, Result};
use notifier_watcher::{ItemEvent, Registry, Session};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

pub fn run() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .thread_name("trayward-daemon")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")?;

    rt.block_on(async {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let events = registry.lock().unwrap().subscribe(); // unwrap: mutex poisoning is okay

        let mut session = Session::new(registry.clone());
        session.start();
        log::info!("Initializing trayward daemon");

        // Stand-in for a panel: follow the item stream and put it in the log.
        let consumer = tokio::spawn(log_item_events(events));

        wait_for_termination().await?;
        log::info!("Shutting down trayward daemon...");
        session.stop().await;
        consumer.abort();

        Ok(())
    })
}

async fn log_item_events(mut events: tokio::sync::broadcast::Receiver<ItemEvent>) {
    loop {
        match events.recv().await {
            Ok(ItemEvent::Added { item, properties }) => {
                log::info!("tray item appeared: {} ({:?})", item.key(), properties.id);
            }
            Ok(ItemEvent::Removed { item }) => {
                log::info!("tray item gone: {}", item.key());
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("item event consumer lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
