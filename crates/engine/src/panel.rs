//! Sidebar panel registration.
//!
//! Hosts expose one of two registration mechanisms. [`HostCapabilities`]
//! is probed once at startup and [`RegistrationStrategy::select`] picks
//! which one to use; when the primary path fails at runtime the fallback is
//! tried once. A panel that cannot be registered never affects learning.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

pub const PANEL_URL_PATH: &str = "last_seen_guardian";
pub const PANEL_TITLE: &str = "Last Seen Guardian";
pub const PANEL_ICON: &str = "mdi:shield-check";
pub const PANEL_WEBCOMPONENT: &str = "last-seen-guardian-panel";
pub const PANEL_MODULE_FILE: &str = "panel.js";

/// What the host supports for panel registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostCapabilities {
    /// Custom web-component panels.
    pub custom_panels: bool,
    /// Built-in panel registration plus static file serving.
    pub builtin_panels: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStrategy {
    Primary,
    Fallback,
}

impl RegistrationStrategy {
    /// Preferred strategy for `caps`, or `None` when neither is available.
    pub fn select(caps: HostCapabilities) -> Option<Self> {
        if caps.custom_panels {
            Some(Self::Primary)
        } else if caps.builtin_panels {
            Some(Self::Fallback)
        } else {
            None
        }
    }
}

/// Everything a registrar needs to publish the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelDescriptor {
    pub url_path: String,
    pub title: String,
    pub icon: String,
    pub webcomponent: String,
    pub module_url: String,
    /// Directory holding the panel assets.
    pub asset_dir: PathBuf,
    pub require_admin: bool,
}

impl PanelDescriptor {
    pub fn new(asset_dir: impl Into<PathBuf>) -> Self {
        Self {
            url_path: PANEL_URL_PATH.to_string(),
            title: PANEL_TITLE.to_string(),
            icon: PANEL_ICON.to_string(),
            webcomponent: PANEL_WEBCOMPONENT.to_string(),
            module_url: format!("/local/{PANEL_URL_PATH}/{PANEL_MODULE_FILE}"),
            asset_dir: asset_dir.into(),
            require_admin: false,
        }
    }

    pub fn module_path(&self) -> PathBuf {
        self.asset_dir.join(PANEL_MODULE_FILE)
    }
}

#[async_trait]
pub trait PanelRegistrar: Send + Sync {
    async fn probe(&self) -> HostCapabilities;

    async fn register_primary(&self, panel: &PanelDescriptor) -> EngineResult<()>;

    async fn register_fallback(&self, panel: &PanelDescriptor) -> EngineResult<()>;
}

async fn assets_present(dir: &Path) -> bool {
    tokio::fs::try_exists(dir.join(PANEL_MODULE_FILE))
        .await
        .unwrap_or(false)
}

/// Probe the host and register the panel. Returns the strategy that
/// succeeded.
pub async fn register_panel(
    registrar: &dyn PanelRegistrar,
    panel: &PanelDescriptor,
) -> EngineResult<RegistrationStrategy> {
    if !assets_present(&panel.asset_dir).await {
        return Err(EngineError::Unavailable(format!(
            "panel module not found at {}",
            panel.module_path().display()
        )));
    }

    let caps = registrar.probe().await;
    let strategy = RegistrationStrategy::select(caps).ok_or_else(|| {
        EngineError::Unavailable("host supports no panel registration".to_string())
    })?;

    if strategy == RegistrationStrategy::Primary {
        match registrar.register_primary(panel).await {
            Ok(()) => return Ok(RegistrationStrategy::Primary),
            Err(e) if caps.builtin_panels => {
                tracing::warn!(error = %e, "Primary panel registration failed, trying fallback");
            }
            Err(e) => return Err(e),
        }
    }

    registrar.register_fallback(panel).await?;
    Ok(RegistrationStrategy::Fallback)
}

/// Registrar for hosts without a UI: reports full capabilities and logs
/// what would be registered.
pub struct LoggingRegistrar;

#[async_trait]
impl PanelRegistrar for LoggingRegistrar {
    async fn probe(&self) -> HostCapabilities {
        HostCapabilities {
            custom_panels: true,
            builtin_panels: true,
        }
    }

    async fn register_primary(&self, panel: &PanelDescriptor) -> EngineResult<()> {
        tracing::info!(
            url_path = %panel.url_path,
            module_url = %panel.module_url,
            icon = %panel.icon,
            "Panel registered"
        );
        Ok(())
    }

    async fn register_fallback(&self, panel: &PanelDescriptor) -> EngineResult<()> {
        tracing::info!(
            url_path = %panel.url_path,
            asset_dir = %panel.asset_dir.display(),
            "Panel registered using static assets"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRegistrar {
        caps: HostCapabilities,
        primary_fails: bool,
        fallback_calls: AtomicUsize,
    }

    impl FakeRegistrar {
        fn new(custom_panels: bool, builtin_panels: bool, primary_fails: bool) -> Self {
            Self {
                caps: HostCapabilities {
                    custom_panels,
                    builtin_panels,
                },
                primary_fails,
                fallback_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PanelRegistrar for FakeRegistrar {
        async fn probe(&self) -> HostCapabilities {
            self.caps
        }

        async fn register_primary(&self, _panel: &PanelDescriptor) -> EngineResult<()> {
            if self.primary_fails {
                return Err(EngineError::Unavailable("custom panels rejected".into()));
            }
            Ok(())
        }

        async fn register_fallback(&self, _panel: &PanelDescriptor) -> EngineResult<()> {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn panel_with_assets() -> (tempfile::TempDir, PanelDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PANEL_MODULE_FILE), "// panel").unwrap();
        let panel = PanelDescriptor::new(dir.path());
        (dir, panel)
    }

    #[test]
    fn strategy_follows_capabilities() {
        let both = HostCapabilities {
            custom_panels: true,
            builtin_panels: true,
        };
        assert_eq!(RegistrationStrategy::select(both), Some(RegistrationStrategy::Primary));

        let builtin_only = HostCapabilities {
            custom_panels: false,
            builtin_panels: true,
        };
        assert_eq!(
            RegistrationStrategy::select(builtin_only),
            Some(RegistrationStrategy::Fallback)
        );
        assert_eq!(RegistrationStrategy::select(HostCapabilities::default()), None);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_once() {
        let (_dir, panel) = panel_with_assets();
        let registrar = FakeRegistrar::new(true, true, true);

        let strategy = register_panel(&registrar, &panel).await.unwrap();
        assert_eq!(strategy, RegistrationStrategy::Fallback);
        assert_eq!(registrar.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn primary_failure_without_fallback_is_an_error() {
        let (_dir, panel) = panel_with_assets();
        let registrar = FakeRegistrar::new(true, false, true);

        assert_matches!(register_panel(&registrar, &panel).await, Err(EngineError::Unavailable(_)));
        assert_eq!(registrar.fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_assets_skip_registration() {
        let dir = tempfile::tempdir().unwrap();
        let panel = PanelDescriptor::new(dir.path());

        assert_matches!(
            register_panel(&LoggingRegistrar, &panel).await,
            Err(EngineError::Unavailable(_))
        );
        assert_eq!(panel.module_url, "/local/last_seen_guardian/panel.js");
    }
}
