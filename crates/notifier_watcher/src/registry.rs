use crate::{
    item::{ItemHandle, ItemProperties, ItemRecord, ItemState},
    names, Error, Result,
};

use std::collections::HashMap;
use tokio::sync::broadcast;

/// Capacity of the lifecycle event channel. Subscribers that fall further
/// behind than this lose old events and should re-snapshot via
/// [`Registry::registered_items`].
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle events pushed to presentation-layer subscribers.
///
/// `Added` fires exactly once per exposure, after the item's property fetch
/// has succeeded; `Removed` fires when a previously exposed item is sealed.
/// A refresh of an already exposed item produces neither.
#[derive(Debug, Clone)]
pub enum ItemEvent {
    Added { item: ItemHandle, properties: ItemProperties },
    Removed { item: ItemHandle },
}

/// Bus-side broadcasts requested by an unregistration.
///
/// The registry core never touches the bus itself; it hands these to the
/// exported-interface layer, which flushes them best-effort while the
/// connection is still usable. `item_unregistered` carries the item's own
/// stored service identifier, since by teardown time the caller's view of
/// the registration argument may be long gone.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Effects {
    pub republish_items: bool,
    pub item_unregistered: Option<String>,
}

/// What [`Registry::register_item`] did with the request.
#[derive(Debug)]
pub enum Registration {
    /// A new record was inserted; the caller starts its property fetch and
    /// its owner watch.
    Inserted { handle: ItemHandle, epoch: u64 },
    /// A record already existed for the derived key and was invalidated;
    /// the caller refetches its properties.
    Refreshed { handle: ItemHandle, epoch: u64 },
}

/// Derive the `(bus_name, object_path)` pair an item registered under.
///
/// A service identifier beginning with a path separator is an absolute
/// object path owned by the sender (`/org/ayatana/NotificationItem` style
/// registrations); anything else is taken as a bus name exporting the
/// conventional item path.
pub fn item_address(service: &str, sender: &str) -> (String, String) {
    if service.starts_with('/') {
        (sender.to_owned(), service.to_owned())
    } else {
        (service.to_owned(), names::ITEM_OBJECT.to_owned())
    }
}

/// The item registry behind the watcher.
///
/// Owns every [`ItemRecord`], keyed by the composite
/// `{bus_name}{object_path}` string. All mutation happens through the
/// methods here, synchronously; asynchronous outcomes (property fetches,
/// owner watches) report back in with the epoch they were started under and
/// are discarded when the record has moved on in the meantime.
pub struct Registry {
    items: HashMap<String, ItemRecord>,
    events: broadcast::Sender<ItemEvent>,
    next_epoch: u64,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { items: HashMap::new(), events, next_epoch: 0 }
    }

    /// Subscribe to the lifecycle event stream. Any number of independent
    /// subscribers is fine.
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.events.subscribe()
    }

    /// Full snapshot of the composite keys currently registered, in no
    /// particular order. This is the value of the watcher's
    /// `RegisteredStatusNotifierItems` property.
    pub fn registered_items(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn item_state(&self, key: &str) -> Option<ItemState> {
        self.items.get(key).map(|record| record.state)
    }

    /// The property snapshot fetched from the item, once it has one.
    pub fn item_properties(&self, key: &str) -> Option<ItemProperties> {
        self.items.get(key).and_then(|record| record.properties.clone())
    }

    /// Handle a `RegisterStatusNotifierItem` request from `sender`.
    ///
    /// A second registration for an existing key refreshes the record in
    /// place instead of duplicating it, so items that re-register after a
    /// reconnect don't produce duplicate visual entries.
    pub fn register_item(&mut self, service: &str, sender: &str) -> Registration {
        let (bus_name, object_path) = item_address(service, sender);
        let key = format!("{}{}", bus_name, object_path);

        if let Some(record) = self.items.get_mut(&key) {
            self.next_epoch += 1;
            record.epoch = self.next_epoch;
            record.state = ItemState::Invalid;
            Registration::Refreshed { handle: record.handle.clone(), epoch: record.epoch }
        } else {
            self.next_epoch += 1;
            let handle = ItemHandle::new(key.clone(), bus_name, object_path, service.to_owned());
            self.items.insert(key, ItemRecord::new(handle.clone(), self.next_epoch));
            Registration::Inserted { handle, epoch: self.next_epoch }
        }
    }

    /// Handle a `RegisterStatusNotifierHost` request. This watcher ships its
    /// own single host, so every attempt is rejected and nothing changes.
    pub fn register_host(&self, _service: &str) -> Result<()> {
        Err(Error::HostExists)
    }

    /// Note that the property fetch for `(key, epoch)` is now in flight.
    pub fn begin_start(&mut self, key: &str, epoch: u64) {
        if let Some(record) = self.items.get_mut(key) {
            if record.epoch == epoch && record.state == ItemState::Created {
                record.state = ItemState::Starting;
            }
        }
    }

    /// A property fetch came back. Stale results (the record is gone, or was
    /// invalidated again in the meantime) are discarded by epoch identity,
    /// never by key: a different record may well live at the same key now.
    ///
    /// Returns whether the snapshot was applied.
    pub fn complete_start(&mut self, key: &str, epoch: u64, properties: ItemProperties) -> bool {
        let record = match self.items.get_mut(key) {
            Some(record) => record,
            None => return false,
        };
        if record.epoch != epoch {
            return false;
        }

        record.properties = Some(properties.clone());
        record.state = ItemState::Exposed;
        if !record.exposed {
            record.exposed = true;
            let _ = self.events.send(ItemEvent::Added { item: record.handle.clone(), properties });
        }
        true
    }

    /// Tear down one item.
    ///
    /// `notify_and_remove` is true for client-initiated finishes (the item
    /// said goodbye, or its bus name vanished) and false during bulk
    /// teardown, where the map is drained wholesale afterwards and a
    /// per-item republish would only race a severed connection.
    ///
    /// The local `Removed` event for an exposed item fires before the record
    /// is dropped.
    pub fn unregister_item(&mut self, key: &str, notify_and_remove: bool) -> Effects {
        let mut effects = Effects::default();

        let service = {
            let record = match self.items.get_mut(key) {
                Some(record) => record,
                None => return effects,
            };
            if record.exposed {
                record.exposed = false;
                record.state = ItemState::Sealed;
                let _ = self.events.send(ItemEvent::Removed { item: record.handle.clone() });
            }
            record.state = ItemState::Finished;
            record.handle.service().to_owned()
        };

        effects.item_unregistered = Some(service);

        if notify_and_remove {
            self.items.remove(key);
            effects.republish_items = true;
        }

        effects
    }

    /// Bulk teardown: unregister everything without per-item republish, then
    /// drop the map. Invoked on bus-name loss and on final shutdown; a no-op
    /// on an empty registry.
    pub fn clear_all(&mut self) -> Vec<Effects> {
        let keys: Vec<String> = self.items.keys().cloned().collect();
        let mut effects = Vec::with_capacity(keys.len());
        for key in keys {
            effects.push(self.unregister_item(&key, false));
        }
        self.items.clear();
        effects
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::item::Status;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::TryRecvError;

    fn props(id: &str) -> ItemProperties {
        ItemProperties {
            id: id.to_owned(),
            title: format!("{} title", id),
            status: Status::Active,
            icon_name: String::new(),
            menu: None,
        }
    }

    fn sorted(mut items: Vec<String>) -> Vec<String> {
        items.sort();
        items
    }

    fn epoch_of(registration: &Registration) -> u64 {
        match registration {
            Registration::Inserted { epoch, .. } | Registration::Refreshed { epoch, .. } => *epoch,
        }
    }

    #[test]
    fn test_item_address_derivation() {
        assert_eq!(
            item_address("org.example.App1", ":1.7"),
            ("org.example.App1".to_owned(), "/StatusNotifierItem".to_owned())
        );
        assert_eq!(item_address("/custom/path", "org.example.App2"), ("org.example.App2".to_owned(), "/custom/path".to_owned()));
    }

    #[test]
    fn test_register_and_unregister_track_the_key_set() {
        let mut registry = Registry::new();

        let a = registry.register_item("org.example.App1", "org.example.App1");
        assert!(matches!(a, Registration::Inserted { .. }));
        assert_eq!(registry.registered_items(), vec!["org.example.App1/StatusNotifierItem".to_owned()]);
        assert_eq!(registry.item_state("org.example.App1/StatusNotifierItem"), Some(ItemState::Created));

        let b = registry.register_item("/custom/path", "org.example.App2");
        assert!(matches!(b, Registration::Inserted { .. }));
        assert_eq!(
            sorted(registry.registered_items()),
            vec!["org.example.App1/StatusNotifierItem".to_owned(), "org.example.App2/custom/path".to_owned()]
        );

        let effects = registry.unregister_item("org.example.App1/StatusNotifierItem", true);
        assert_eq!(
            effects,
            Effects { republish_items: true, item_unregistered: Some("org.example.App1".to_owned()) }
        );
        assert_eq!(registry.registered_items(), vec!["org.example.App2/custom/path".to_owned()]);
    }

    #[test]
    fn test_duplicate_registration_refreshes_without_churn() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();
        let key = "org.example.App1/StatusNotifierItem";

        let first = registry.register_item("org.example.App1", ":1.7");
        let first_epoch = epoch_of(&first);
        registry.begin_start(key, first_epoch);
        assert_eq!(registry.item_state(key), Some(ItemState::Starting));

        assert!(registry.complete_start(key, first_epoch, props("app1")));
        assert_eq!(registry.item_state(key), Some(ItemState::Exposed));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Added { .. })));

        // Same key again: one record, invalidated, and no add/remove churn.
        let second = registry.register_item("org.example.App1", ":1.7");
        assert!(matches!(second, Registration::Refreshed { .. }));
        assert_eq!(registry.registered_items().len(), 1);
        assert_eq!(registry.item_state(key), Some(ItemState::Invalid));
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);

        assert!(registry.complete_start(key, epoch_of(&second), props("app1-refreshed")));
        assert_eq!(registry.item_state(key), Some(ItemState::Exposed));
        assert_eq!(registry.item_properties(key).unwrap().id, "app1-refreshed");
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_stale_fetch_is_discarded_by_identity() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();
        let key = "org.example.App1/StatusNotifierItem";

        let first = registry.register_item("org.example.App1", ":1.7");
        let first_epoch = epoch_of(&first);
        registry.unregister_item(key, true);

        // A new record now lives at the same key; the old fetch result must
        // not expose it.
        let second = registry.register_item("org.example.App1", ":1.7");
        assert!(!registry.complete_start(key, first_epoch, props("stale")));
        assert_eq!(registry.item_state(key), Some(ItemState::Created));
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);

        assert!(registry.complete_start(key, epoch_of(&second), props("fresh")));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Added { .. })));
        assert_eq!(registry.item_properties(key).unwrap().id, "fresh");
    }

    #[test]
    fn test_register_host_always_fails_and_never_mutates() {
        let mut registry = Registry::new();
        registry.register_item("org.example.App1", ":1.7");
        let before = sorted(registry.registered_items());

        for service in ["org.freedesktop.StatusNotifierHost-1-0", "org.freedesktop.StatusNotifierHost-1-1"] {
            assert!(matches!(registry.register_host(service), Err(Error::HostExists)));
        }
        assert_eq!(sorted(registry.registered_items()), before);
    }

    #[test]
    fn test_unexposed_item_is_removed_silently() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();
        let key = "org.example.App1/StatusNotifierItem";

        registry.register_item("org.example.App1", ":1.7");
        let effects = registry.unregister_item(key, true);

        // Never exposed, so no Removed event; the bus broadcast request is
        // still produced.
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(effects.item_unregistered, Some("org.example.App1".to_owned()));
        assert!(registry.registered_items().is_empty());
    }

    #[test]
    fn test_bulk_teardown_on_name_loss() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();

        let a = registry.register_item("org.example.App1", ":1.7");
        let b = registry.register_item("/custom/path", ":1.8");
        registry.complete_start("org.example.App1/StatusNotifierItem", epoch_of(&a), props("app1"));
        registry.complete_start(":1.8/custom/path", epoch_of(&b), props("app2"));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Added { .. })));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Added { .. })));

        let effects = registry.clear_all();

        // One Removed per exposed item, no per-item republish, and the map
        // is empty afterwards.
        assert_eq!(effects.len(), 2);
        assert!(effects.iter().all(|e| !e.republish_items));
        assert!(effects.iter().all(|e| e.item_unregistered.is_some()));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Removed { .. })));
        assert!(matches!(events.try_recv(), Ok(ItemEvent::Removed { .. })));
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert!(registry.registered_items().is_empty());
    }

    #[test]
    fn test_clear_all_is_idempotent() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();

        assert!(registry.clear_all().is_empty());
        assert!(registry.clear_all().is_empty());
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_removed_fires_at_the_seal_transition() {
        let mut registry = Registry::new();
        let mut events = registry.subscribe();
        let key = "org.example.App1/StatusNotifierItem";

        let registration = registry.register_item("org.example.App1", ":1.7");
        registry.complete_start(key, epoch_of(&registration), props("app1"));
        let _ = events.try_recv();

        registry.unregister_item(key, true);
        let removed = events.try_recv().unwrap();
        match removed {
            ItemEvent::Removed { item } => assert_eq!(item.key(), key),
            other => panic!("expected Removed, got {:?}", other),
        }
        // Exactly one per seal.
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
    }
}
