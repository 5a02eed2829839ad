use crate::{names, registry::Registry, watcher::Watcher};

use futures::StreamExt;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use zbus::object_server::SignalContext;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Scoped ownership of the watcher's presence on the session bus.
///
/// A `Session` claims the well-known watcher name and reacts to gaining and
/// losing it. Losing the bus (or the name) is not an error: the registry is
/// emptied and the session waits for re-acquisition. Dropping the session
/// (or calling [`Session::stop`]) tears the connection down, which releases
/// the name.
pub struct Session {
    registry: Arc<Mutex<Registry>>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    pub fn new(registry: Arc<Mutex<Registry>>) -> Session {
        Session { registry, driver: None }
    }

    /// Begin acquiring the well-known watcher name. All effects are
    /// asynchronous and observed through the registry.
    ///
    /// Calling `start` twice without an intervening [`Session::stop`] is a
    /// programming error.
    pub fn start(&mut self) {
        assert!(self.driver.is_none(), "bus session already started");
        let registry = self.registry.clone();
        self.driver = Some(tokio::spawn(drive(registry)));
    }

    /// Tear the session down: drop the connection (releasing the name) and
    /// clear the registry. The session can be started again afterwards.
    pub async fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
        // The connection is gone with the driver, so the teardown
        // broadcasts have nowhere to go.
        let _ = self.registry.lock().unwrap().clear_all(); // unwrap: mutex poisoning is okay
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

/// Outer connection loop: run one bus session until the connection falls
/// over, empty the registry, reconnect.
async fn drive(registry: Arc<Mutex<Registry>>) {
    loop {
        match run_session(&registry).await {
            Ok(()) => log::info!("session bus connection closed"),
            Err(e) => log::warn!("session bus connection lost: {}", e),
        }

        // Whatever was registered is no longer being watched; local
        // subscribers hear about it, the bus can't.
        let _ = registry.lock().unwrap().clear_all(); // unwrap: mutex poisoning is okay

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// One connection's worth of watcher service: export the interface, request
/// the name, then follow the bus's NameAcquired/NameLost signals until the
/// connection dies.
async fn run_session(registry: &Arc<Mutex<Registry>>) -> zbus::Result<()> {
    let con = zbus::Connection::session().await?;

    let watcher = Watcher::new(registry.clone());
    if !con.object_server().at(names::WATCHER_OBJECT, watcher).await? {
        // Somebody on this connection beat us to the path. Leave the
        // registry inert until the next connection attempt.
        log::warn!("object already exported at {}, watcher disabled", names::WATCHER_OBJECT);
        return Ok(());
    }

    let ctxt = SignalContext::new(&con, names::WATCHER_OBJECT)?;

    let dbus = zbus::fdo::DBusProxy::new(&con).await?;
    let mut name_acquired = dbus.receive_name_acquired().await?;
    let mut name_lost = dbus.receive_name_lost().await?;

    // not AllowReplacement, not ReplaceExisting, not DoNotQueue: if another
    // watcher owns the name we queue behind it and wait our turn.
    let flags: [zbus::fdo::RequestNameFlags; 0] = [];
    match con.request_name_with_flags(names::WATCHER_BUS, flags.into_iter().collect()).await {
        Ok(zbus::fdo::RequestNameReply::PrimaryOwner) => {}
        Ok(_) | Err(zbus::Error::NameTaken) => {
            log::info!("another {} is already running, queued behind it", names::WATCHER_BUS);
        }
        Err(e) => return Err(e),
    }

    loop {
        tokio::select! {
            Some(sig) = name_acquired.next() => {
                let args = sig.args()?;
                if args.name().as_str() == names::WATCHER_BUS {
                    log::info!("acquired {}, watcher is authoritative", names::WATCHER_BUS);
                    if let Err(e) = Watcher::announce_host_registered(&ctxt).await {
                        log::error!("failed to signal Watcher: {}", e);
                    }
                }
            }
            Some(sig) = name_lost.next() => {
                let args = sig.args()?;
                if args.name().as_str() == names::WATCHER_BUS {
                    log::info!("lost {}, clearing tracked items", names::WATCHER_BUS);
                    let effects = {
                        let mut registry = registry.lock().unwrap(); // unwrap: mutex poisoning is okay
                        registry.clear_all()
                    };
                    // The connection itself may still be up (somebody else
                    // holds the name now), so the per-item goodbyes are
                    // worth attempting.
                    for effect in &effects {
                        Watcher::flush_effects(&ctxt, effect).await;
                    }
                }
            }
            else => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    #[should_panic(expected = "bus session already started")]
    async fn test_start_twice_is_a_programming_error() {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let mut session = Session::new(registry);
        session.start();
        session.start();
    }

    #[tokio::test]
    async fn test_stop_resets_the_start_guard() {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let mut session = Session::new(registry);
        session.start();
        session.stop().await;
        session.start();
    }
}
