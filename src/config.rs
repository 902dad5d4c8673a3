//! Configuration management.
//!
//! This module defines the `Config` struct and its sub-structs. Settings are
//! layered with `figment`: built-in defaults, an optional TOML file,
//! `FWCONVERGE_`-prefixed environment variables and finally command-line
//! flags.

use crate::cli::Cli;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level (an `EnvFilter` directive).
    pub log_level: String,
    /// Where rules, remote instances and the lock file live.
    pub store: StoreConfig,
    /// How configuration files are rendered.
    pub render: RenderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StoreConfig {
    pub rule_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub lock_file: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RenderConfig {
    /// Configuration file path, relative to each instance root.
    pub conf_path: PathBuf,
    /// Append `set-tag(log=<n>)` to statements of logged rules.
    #[serde(default)]
    pub audit_tags: bool,
}

impl Config {
    /// Loads the configuration, layering defaults, the file named by
    /// `cli.config` (if any), environment variables and CLI flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            // e.g. FWCONVERGE_STORE__RULE_DIR=/tmp/rules
            .merge(Env::prefixed("FWCONVERGE_").split("__"))
            .merge(cli)
            .extract()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreConfig {
                rule_dir: PathBuf::from("/var/fw/rules"),
                mirror_dir: PathBuf::from("/var/fw/vms"),
                lock_file: PathBuf::from("/var/fw/.lockfile"),
            },
            render: RenderConfig {
                conf_path: PathBuf::from("config/pf.conf"),
                audit_tags: false,
            },
        }
    }
}
