use anyhow::{Context, Result};
use notifier_watcher::proxy::StatusNotifierWatcherProxy;

/// Ask the running watcher for its item list and print it.
pub fn list_items() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .thread_name("trayward-client")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")?;

    rt.block_on(async {
        let con = zbus::Connection::session().await.context("Failed to connect to the session bus")?;
        let snw = StatusNotifierWatcherProxy::new(&con).await?;
        let items = snw
            .registered_status_notifier_items()
            .await
            .context("Failed to query the watcher -- is a trayward daemon running?")?;

        if items.is_empty() {
            println!("no items registered");
        } else {
            for item in items {
                println!("{}", item);
            }
        }
        Ok(())
    })
}
