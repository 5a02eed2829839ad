use crate::{proxy, Error, Result};

use std::sync::Arc;
use zbus::zvariant::OwnedObjectPath;

/// How long a remote item gets to answer the initial property fetch. Items
/// that never reply simply never become visible.
const PROPERTY_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Recognised values of [`org.freedesktop.StatusNotifierItem.Status`].
///
/// [`org.freedesktop.StatusNotifierItem.Status`]: https://www.freedesktop.org/wiki/Specifications/StatusNotifierItem/StatusNotifierItem/#org.freedesktop.statusnotifieritem.status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The item doesn't convey important information to the user, it can be considered an "idle"
    /// status and is likely that visualizations will chose to hide it.
    Passive,
    /// The item is active, is more important that the item will be shown in some way to the user.
    Active,
    /// The item carries really important information for the user, such as battery charge running
    /// out and is wants to incentive the direct user intervention. Visualizations should emphasize
    /// in some way the items with NeedsAttention status.
    NeedsAttention,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ParseStatusError;

impl std::str::FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, ParseStatusError> {
        match s {
            "Passive" => Ok(Status::Passive),
            "Active" => Ok(Status::Active),
            "NeedsAttention" => Ok(Status::NeedsAttention),
            _ => Err(ParseStatusError),
        }
    }
}

/// Lifecycle state of a registered item.
///
/// A record starts out `Created`, fetches its remote properties during
/// `Starting` and becomes `Exposed` once they arrive. A re-registration for
/// the same key marks it `Invalid` until the refetch lands, without tearing
/// the record down. `Sealed` and `Finished` are the teardown states; they
/// collapse into one step when the owning bus name vanishes without a
/// goodbye.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Created,
    Starting,
    Exposed,
    Invalid,
    Sealed,
    Finished,
}

/// Property snapshot fetched from the remote item while it starts.
#[derive(Debug, Clone)]
pub struct ItemProperties {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub icon_name: String,
    /// Path of the item's dbusmenu object, if it exports one.
    pub menu: Option<OwnedObjectPath>,
}

#[derive(Debug)]
struct ItemAddress {
    key: String,
    bus_name: String,
    object_path: String,
    service: String,
}

/// Cheap cloneable handle identifying one registered item.
///
/// Handles are what the registry pushes to event-stream subscribers; the
/// registry itself keeps the only [`ItemRecord`]. The `key` is the composite
/// `{bus_name}{object_path}` string that also appears in the watcher's
/// `RegisteredStatusNotifierItems` property.
#[derive(Debug, Clone)]
pub struct ItemHandle(Arc<ItemAddress>);

impl ItemHandle {
    pub(crate) fn new(key: String, bus_name: String, object_path: String, service: String) -> Self {
        Self(Arc::new(ItemAddress { key, bus_name, object_path, service }))
    }

    pub fn key(&self) -> &str {
        &self.0.key
    }

    pub fn bus_name(&self) -> &str {
        &self.0.bus_name
    }

    pub fn object_path(&self) -> &str {
        &self.0.object_path
    }

    /// The raw service identifier the item registered with. This is what the
    /// `StatusNotifierItemRegistered`/`Unregistered` broadcasts carry.
    pub fn service(&self) -> &str {
        &self.0.service
    }
}

/// One registered tray item, exclusively owned by the registry.
#[derive(Debug)]
pub(crate) struct ItemRecord {
    pub(crate) handle: ItemHandle,
    pub(crate) state: ItemState,
    /// Identity token for in-flight fetches. Bumped on every invalidation,
    /// so a fetch result that outlives its record (or its registration
    /// generation) is discarded by identity rather than by key.
    pub(crate) epoch: u64,
    pub(crate) exposed: bool,
    pub(crate) properties: Option<ItemProperties>,
}

impl ItemRecord {
    pub(crate) fn new(handle: ItemHandle, epoch: u64) -> Self {
        Self { handle, state: ItemState::Created, epoch, exposed: false, properties: None }
    }
}

/// Fetch the property snapshot of a remote item.
///
/// `Id` and a parseable `Status` are required; anything else missing is
/// tolerated, since plenty of items in the wild only implement a subset of
/// the interface.
pub(crate) async fn fetch_item_properties(
    con: &zbus::Connection,
    bus_name: &str,
    object_path: &str,
) -> Result<ItemProperties> {
    let fetch = async {
        let sni = proxy::StatusNotifierItemProxy::builder(con)
            .destination(bus_name.to_owned())?
            .path(object_path.to_owned())?
            .build()
            .await?;

        let id = sni.id().await?;
        let status = sni.status().await?;
        let status = status.parse::<Status>().map_err(|_| zbus::Error::Failure(format!("Invalid status {:?}", status)))?;
        let title = sni.title().await.unwrap_or_default();
        let icon_name = sni.icon_name().await.unwrap_or_default();
        let menu = sni.menu().await.ok();

        Ok::<_, zbus::Error>(ItemProperties { id, title, status, icon_name, menu })
    };

    match tokio::time::timeout(PROPERTY_FETCH_TIMEOUT, fetch).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::FetchTimeout),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_status() {
        assert_eq!(Status::from_str("Passive").unwrap(), Status::Passive);
        assert_eq!(Status::from_str("Active").unwrap(), Status::Active);
        assert_eq!(Status::from_str("NeedsAttention").unwrap(), Status::NeedsAttention);
        assert!(Status::from_str("passive").is_err());
        assert!(Status::from_str("").is_err());
    }

    #[test]
    fn test_handle_accessors() {
        let handle = ItemHandle::new(
            "org.example.App1/StatusNotifierItem".into(),
            "org.example.App1".into(),
            "/StatusNotifierItem".into(),
            "org.example.App1".into(),
        );
        assert_eq!(handle.key(), "org.example.App1/StatusNotifierItem");
        assert_eq!(handle.bus_name(), "org.example.App1");
        assert_eq!(handle.object_path(), "/StatusNotifierItem");
        assert_eq!(handle.service(), "org.example.App1");
    }
}
