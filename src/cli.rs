//! Command-line interface argument parsing.
//!
//! The arguments are parsed with `clap` and then merged over the file and
//! environment configuration, the `Cli` struct acting as a figment provider.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Compiles firewall rules into per-instance packet-filter configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Logging level, e.g. "debug" or "fwconverge=trace".
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Directory holding the rule store.
    #[arg(long, value_name = "DIR")]
    pub rule_dir: Option<PathBuf>,

    /// Directory holding the remote instance store.
    #[arg(long, value_name = "DIR")]
    pub mirror_dir: Option<PathBuf>,

    /// Path of the store lock file.
    #[arg(long, value_name = "FILE")]
    pub lock_file: Option<PathBuf>,

    /// Render audit tags for logged rules.
    #[arg(long)]
    pub audit_tags: bool,

    /// Compute and print results without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Add rules, local instances or remote instances from a JSON payload.
    Add { payload: PathBuf },
    /// Update rules or remote instances from a JSON payload.
    Update { payload: PathBuf },
    /// Delete rules or remote instances listed in a JSON payload.
    Del { payload: PathBuf },
    /// Enable the filter for an instance.
    Enable {
        id: String,
        /// JSON array of instance records.
        instances: PathBuf,
    },
    /// Disable the filter for an instance.
    Disable {
        id: String,
        /// JSON array of instance records.
        instances: PathBuf,
    },
    /// Print one rule.
    Get { id: String },
    /// List rules.
    List {
        /// Only include these fields.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Only include rules owned by this tenant.
        #[arg(long)]
        owner: Option<String>,
    },
    /// List the rules that apply to an instance.
    Rules {
        id: String,
        /// JSON array of instance records.
        instances: PathBuf,
    },
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        let mut store = Dict::new();
        if let Some(dir) = &self.rule_dir {
            store.insert("rule_dir".into(), Value::from(dir.display().to_string()));
        }
        if let Some(dir) = &self.mirror_dir {
            store.insert("mirror_dir".into(), Value::from(dir.display().to_string()));
        }
        if let Some(file) = &self.lock_file {
            store.insert("lock_file".into(), Value::from(file.display().to_string()));
        }
        if !store.is_empty() {
            dict.insert("store".into(), Value::from(store));
        }

        // A bare flag can only switch audit tags on; absence leaves the
        // configured value alone.
        if self.audit_tags {
            let mut render = Dict::new();
            render.insert("audit_tags".into(), Value::from(true));
            dict.insert("render".into(), Value::from(render));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
