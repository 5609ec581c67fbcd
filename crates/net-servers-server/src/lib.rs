//! Runtime machinery for the net-servers control plane: the config watcher,
//! the synchronizer framework and its per-service synchronizers, the
//! certificate lifecycle, the container supervisor, the port allocator and
//! the reload coordinator.

pub mod certs;
pub mod daemon;
pub mod ports;
pub mod reload;
pub mod runtime;
pub mod supervisor;
pub mod sync;
pub mod watcher;

pub use reload::ReloadCoordinator;
pub use runtime::RuntimeClient;
pub use supervisor::Supervisor;
pub use sync::{Channel, Event, EventBus, SyncRegistry};
pub use watcher::ConfigWatcher;
