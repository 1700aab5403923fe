//! Hooks into whatever hosts the device client
//!
//! The remote and the fetcher never talk to a UI, a config store or
//! the network neighbourhood directly. They are handed these traits at
//! construction, so a CLI, a daemon or a test can each plug in their own.

pub mod arp;

pub use arp::ArpTableResolver;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

/// Transient user-facing messages, addressed by id
pub trait Notifier: Send + Sync {
    fn notify(&self, id: &str, title: &str, message: &str);
    fn dismiss(&self, id: &str);
}

/// Looks up the current IP address of a device by MAC
#[async_trait]
pub trait IpResolver: Send + Sync {
    async fn resolve_ip(&self, mac: &str) -> Option<String>;
}

/// Persists a changed device address back to configuration
#[async_trait]
pub trait HostUpdater: Send + Sync {
    async fn update_host(&self, host: &str) -> Result<()>;
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, id: &str, title: &str, message: &str) {
        info!("[{}] {}: {}", id, title, message);
    }

    fn dismiss(&self, id: &str) {
        info!("[{}] dismissed", id);
    }
}
