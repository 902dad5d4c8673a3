//! Control of the live packet filter.
//!
//! The engine never runs filter tooling itself; it talks to a
//! [`FilterControl`] implementation after configuration has been persisted.

use crate::core::Instance;
use crate::errors::Result;
use crate::store::ConfPaths;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// State of an instance's live filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStatus {
    pub instance: String,
    pub running: bool,
    pub enabled: bool,
}

/// A trait for enabling, disabling and reloading per-instance filters.
#[async_trait]
pub trait FilterControl: Send + Sync {
    async fn enable(&self, instance: &Instance, conf: &ConfPaths) -> Result<()>;

    async fn disable(&self, instance: &Instance) -> Result<()>;

    /// Makes a running filter pick up a freshly written configuration.
    async fn reload(&self, instance: &Instance, conf: &ConfPaths) -> Result<()>;

    async fn status(&self, instance: &Instance) -> Result<FilterStatus>;

    /// Raw per-rule hit counters as reported by the filter.
    async fn stats(&self, instance: &Instance) -> Result<Vec<String>>;
}

/// A control implementation that only logs what it would do. Used when no
/// filter tooling is available, e.g. by the command-line front end.
#[derive(Debug, Clone, Default)]
pub struct LoggingFilterControl;

#[async_trait]
impl FilterControl for LoggingFilterControl {
    async fn enable(&self, instance: &Instance, conf: &ConfPaths) -> Result<()> {
        info!(instance = %instance.id, conf = %conf.current.display(), "Would enable filter");
        Ok(())
    }

    async fn disable(&self, instance: &Instance) -> Result<()> {
        info!(instance = %instance.id, "Would disable filter");
        Ok(())
    }

    async fn reload(&self, instance: &Instance, conf: &ConfPaths) -> Result<()> {
        info!(instance = %instance.id, conf = %conf.current.display(), "Would reload filter");
        Ok(())
    }

    async fn status(&self, instance: &Instance) -> Result<FilterStatus> {
        Ok(FilterStatus {
            instance: instance.id.clone(),
            running: instance.running,
            enabled: instance.filter_enabled,
        })
    }

    async fn stats(&self, _instance: &Instance) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
