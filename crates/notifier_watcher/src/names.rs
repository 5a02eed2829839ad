//! Well-known names and paths of the [StatusNotifierItem specification].
//!
//! [StatusNotifierItem specification]: https://freedesktop.org/wiki/Specifications/StatusNotifierItem/

/// The well-known bus name of the watcher. Exactly one process on the bus
/// owns this at a time.
pub const WATCHER_BUS: &str = "org.kde.StatusNotifierWatcher";

/// Object path the watcher interface is exported at.
pub const WATCHER_OBJECT: &str = "/StatusNotifierWatcher";

/// Conventional object path of an item that registers with just a bus name.
pub const ITEM_OBJECT: &str = "/StatusNotifierItem";
