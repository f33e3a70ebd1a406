//! Hot reload of the `[limits]` section.
//!
//! The watcher remembers the configuration currently in force. Every change
//! to the file is re-loaded, validated and compared section by section.
//! Only a changed `[limits]` section is forwarded to the running server;
//! edits to any other section are logged as needing a restart.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{LimitsConfig, ProxyConfig};

/// Result of comparing a reloaded file against the running configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadDiff {
    /// New limits, if they changed.
    pub limits: Option<LimitsConfig>,
    /// Sections that changed but are only read at startup.
    pub restart_required: Vec<&'static str>,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.limits.is_none() && self.restart_required.is_empty()
    }
}

/// Compare two configurations section by section.
pub fn diff_configs(current: &ProxyConfig, reloaded: &ProxyConfig) -> ReloadDiff {
    let mut restart_required = Vec::new();
    if current.listener != reloaded.listener {
        restart_required.push("listener");
    }
    if current.upstream != reloaded.upstream {
        restart_required.push("upstream");
    }
    if current.queue != reloaded.queue {
        restart_required.push("queue");
    }
    if current.timeouts != reloaded.timeouts {
        restart_required.push("timeouts");
    }
    if current.lifecycle != reloaded.lifecycle {
        restart_required.push("lifecycle");
    }
    if current.observability != reloaded.observability {
        restart_required.push("observability");
    }
    if current.admin != reloaded.admin {
        restart_required.push("admin");
    }

    ReloadDiff {
        limits: (current.limits != reloaded.limits).then(|| reloaded.limits.clone()),
        restart_required,
    }
}

/// Watches the configuration file and streams reloaded limits.
pub struct ConfigWatcher {
    path: PathBuf,
    current: ProxyConfig,
    limits_tx: mpsc::UnboundedSender<LimitsConfig>,
}

impl ConfigWatcher {
    /// `current` is the configuration the server was started with.
    pub fn new(
        path: &Path,
        current: ProxyConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LimitsConfig>) {
        let (limits_tx, limits_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                current,
                limits_tx,
            },
            limits_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    ///
    /// The parent directory is watched rather than the file itself, so
    /// editors that save by renaming a temporary file are still noticed.
    pub fn run(mut self) -> Result<RecommendedWatcher, notify::Error> {
        let watch_dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name: Option<OsString> = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == file_name.as_deref());
                    if relevant {
                        self.reload();
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default(),
        )?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(dir = ?watch_dir, "Config watcher started");
        Ok(watcher)
    }

    /// Load the file and forward whatever can be applied live.
    fn reload(&mut self) -> ReloadDiff {
        let reloaded = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Config reload rejected, keeping current configuration");
                return ReloadDiff {
                    limits: None,
                    restart_required: Vec::new(),
                };
            }
        };

        let diff = diff_configs(&self.current, &reloaded);
        if diff.is_empty() {
            tracing::debug!("Config file touched without changes");
            return diff;
        }
        if !diff.restart_required.is_empty() {
            tracing::warn!(
                sections = ?diff.restart_required,
                "Config changes take effect after restart"
            );
        }
        if let Some(limits) = &diff.limits {
            if self.limits_tx.send(limits.clone()).is_err() {
                tracing::debug!("Server stopped, dropping reloaded limits");
            }
        }
        self.current = reloaded;
        diff
    }
}
