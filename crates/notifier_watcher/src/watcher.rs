use crate::{
    item::{fetch_item_properties, ItemHandle},
    registry::{Effects, Registration, Registry},
};

use futures::StreamExt;
use std::sync::{Arc, Mutex};
use zbus::{
    interface,
    message::Header,
    names::BusName,
    object_server::{Interface, SignalContext},
};

/// The exported [`org.kde.StatusNotifierWatcher`] endpoint.
///
/// This is the thin bus-facing layer over the [`Registry`]: it decodes
/// registration requests, forwards them, flushes the resulting broadcasts
/// and spawns the per-item background work (property fetch, owner watch).
/// It holds no state of its own beyond the task set.
///
/// [`org.kde.StatusNotifierWatcher`]: https://freedesktop.org/wiki/Specifications/StatusNotifierItem/StatusNotifierWatcher/
pub struct Watcher {
    // Intentionally using std::sync::Mutex instead of tokio's async mutex,
    // since the registry is never held across an await.
    //
    // See <https://docs.rs/tokio/latest/tokio/sync/struct.Mutex.html#which-kind-of-mutex-should-you-use>
    registry: Arc<Mutex<Registry>>,

    tasks: tokio::task::JoinSet<()>,
}

/// Implementation of the `StatusNotifierWatcher` service.
///
/// Methods and properties correspond to methods and properties on the DBus
/// service, while signals are events that we generate for others to listen
/// to.
#[interface(name = "org.kde.StatusNotifierWatcher")]
impl Watcher {
    /// RegisterStatusNotifierItem method
    async fn register_status_notifier_item(
        &mut self,
        service: &str,
        #[zbus(header)] hdr: Header<'_>,
        #[zbus(connection)] con: &zbus::Connection,
        #[zbus(signal_context)] ctxt: SignalContext<'_>,
    ) -> zbus::fdo::Result<()> {
        let sender = match hdr.sender() {
            Some(sender) => sender.to_string(),
            None => {
                log::warn!("unknown sender");
                return Err(zbus::fdo::Error::InvalidArgs("Unknown bus address".into()));
            }
        };
        if !service.starts_with('/') {
            if let Err(e) = BusName::try_from(service) {
                log::warn!("received invalid bus name {:?}: {}", service, e);
                return Err(zbus::fdo::Error::InvalidArgs(e.to_string()));
            }
        }

        let registration = {
            let mut registry = self.registry.lock().unwrap(); // unwrap: mutex poisoning is okay
            registry.register_item(service, &sender)
        };

        match registration {
            Registration::Inserted { handle, epoch } => {
                log::info!("new item: {}", handle.key());
                self.spawn_start(con, handle.clone(), epoch);
                self.spawn_owner_watch(con, &ctxt, handle);
            }
            Registration::Refreshed { handle, epoch } => {
                log::info!("new item: {} (refresh)", handle.key());
                self.spawn_start(con, handle, epoch);
            }
        }

        self.registered_status_notifier_items_changed(&ctxt).await?;
        Watcher::status_notifier_item_registered(&ctxt, service).await?;

        Ok(())
    }

    /// RegisterStatusNotifierHost method.
    ///
    /// The watcher ships exactly one built-in host, so the answer is always
    /// no.
    async fn register_status_notifier_host(&self, service: &str) -> zbus::fdo::Result<()> {
        self.registry
            .lock()
            .unwrap() // unwrap: mutex poisoning is okay
            .register_host(service)
            .map_err(|e| zbus::fdo::Error::FileExists(e.to_string()))
    }

    /// StatusNotifierItemRegistered signal
    #[zbus(signal)]
    async fn status_notifier_item_registered(ctxt: &SignalContext<'_>, service: &str) -> zbus::Result<()>;

    /// StatusNotifierItemUnregistered signal
    #[zbus(signal)]
    async fn status_notifier_item_unregistered(ctxt: &SignalContext<'_>, service: &str) -> zbus::Result<()>;

    /// StatusNotifierHostRegistered signal
    #[zbus(signal)]
    async fn status_notifier_host_registered(ctxt: &SignalContext<'_>) -> zbus::Result<()>;

    /// RegisteredStatusNotifierItems property
    #[zbus(property)]
    async fn registered_status_notifier_items(&self) -> Vec<String> {
        self.registry.lock().unwrap().registered_items() // unwrap: mutex poisoning is okay
    }

    /// IsStatusNotifierHostRegistered property. Constant: the built-in host
    /// is the one host there is.
    #[zbus(property)]
    async fn is_status_notifier_host_registered(&self) -> bool {
        true
    }

    /// ProtocolVersion property
    #[zbus(property)]
    fn protocol_version(&self) -> i32 {
        0
    }
}

impl Watcher {
    pub fn new(registry: Arc<Mutex<Registry>>) -> Watcher {
        Watcher { registry, tasks: tokio::task::JoinSet::new() }
    }

    /// Kick off the property fetch for `(handle, epoch)`. The fetch runs
    /// detached; a result that arrives after the record moved on is dropped
    /// inside [`Registry::complete_start`].
    fn spawn_start(&mut self, con: &zbus::Connection, handle: ItemHandle, epoch: u64) {
        {
            let mut registry = self.registry.lock().unwrap(); // unwrap: mutex poisoning is okay
            registry.begin_start(handle.key(), epoch);
        }

        let registry = self.registry.clone();
        let con = con.to_owned();
        self.tasks.spawn(async move {
            match fetch_item_properties(&con, handle.bus_name(), handle.object_path()).await {
                Ok(properties) => {
                    let mut registry = registry.lock().unwrap(); // unwrap: mutex poisoning is okay
                    registry.complete_start(handle.key(), epoch, properties);
                }
                Err(e) => {
                    // The item stays invisible and gets cleaned up when its
                    // bus name vanishes.
                    log::warn!("failed to fetch properties of {}: {}", handle.key(), e);
                }
            }
        });
    }

    /// Watch for the item's bus name disappearing. No polite goodbye exists
    /// in the protocol, so this is how items normally get unregistered.
    fn spawn_owner_watch(&mut self, con: &zbus::Connection, ctxt: &SignalContext<'_>, handle: ItemHandle) {
        let registry = self.registry.clone();
        let ctxt = ctxt.to_owned();
        let con = con.to_owned();
        self.tasks.spawn(async move {
            if let Err(e) = wait_for_service_exit(&con, handle.bus_name()).await {
                log::error!("failed to wait for service exit: {}", e);
            }
            log::info!("gone item: {}", handle.key());

            let effects = {
                let mut registry = registry.lock().unwrap(); // unwrap: mutex poisoning is okay
                registry.unregister_item(handle.key(), true)
            };
            Watcher::flush_effects(&ctxt, &effects).await;
        });
    }

    /// Flush the bus-side broadcasts requested by an unregistration.
    /// Best-effort: by the time these go out the connection may already be
    /// gone, so failures are logged and swallowed.
    pub(crate) async fn flush_effects(ctxt: &SignalContext<'_>, effects: &Effects) {
        if effects.republish_items {
            if let Err(e) = Watcher::registered_status_notifier_items_refresh(ctxt).await {
                log::error!("failed to signal Watcher: {}", e);
            }
        }
        if let Some(service) = &effects.item_unregistered {
            if let Err(e) = Watcher::status_notifier_item_unregistered(ctxt, service).await {
                log::error!("failed to signal Watcher: {}", e);
            }
        }
    }

    /// Broadcast that an authoritative watcher (with its built-in host) is
    /// now active, so pre-existing items know they can register.
    pub(crate) async fn announce_host_registered(ctxt: &SignalContext<'_>) -> zbus::Result<()> {
        Watcher::status_notifier_host_registered(ctxt).await
    }

    /// Equivalent to `registered_status_notifier_items_invalidate`, but without requiring `self`.
    async fn registered_status_notifier_items_refresh(ctxt: &SignalContext<'_>) -> zbus::Result<()> {
        zbus::fdo::Properties::properties_changed(
            ctxt,
            Self::name(),
            &std::collections::HashMap::new(),
            &["RegisteredStatusNotifierItems"],
        )
        .await
    }
}

/// Wait for a DBus service to disappear
async fn wait_for_service_exit(con: &zbus::Connection, service: &str) -> zbus::fdo::Result<()> {
    let service = BusName::try_from(service).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
    let dbus = zbus::fdo::DBusProxy::new(con).await?;
    let mut owner_changes = dbus.receive_name_owner_changed_with_args(&[(0, &service)]).await?;

    if !dbus.name_has_owner(service.as_ref()).await? {
        // service has already disappeared
        return Ok(());
    }

    while let Some(sig) = owner_changes.next().await {
        let args = sig.args()?;
        if args.new_owner().is_none() {
            break;
        }
    }

    Ok(())
}
