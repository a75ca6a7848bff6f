//! Command-line options and configuration layering.

use clap::{Parser, Subcommand, ValueEnum};
use icarium_config::{ConfigResult, SystemConfig, load_system_config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "icariumd")]
#[command(about = "Builds container images when watched repositories are pushed", long_about = None)]
pub struct Cli {
    /// Path to the daemon configuration file
    #[arg(long, env = "ICARIUM_CONFIG")]
    pub config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Registry prefix for built images
    #[arg(long, env = "ICARIUM_REGISTRY")]
    pub registry: Option<String>,

    /// Root directory for build workspaces
    #[arg(long, env = "ICARIUM_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, env = "ICARIUM_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Consume the queue and run builds (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Defaults, then the config file if one was given, then flags and environment.
    pub fn system_config(&self) -> ConfigResult<SystemConfig> {
        let mut config = match &self.config {
            Some(path) => load_system_config(path)?,
            None => SystemConfig::default(),
        };

        if let Some(url) = &self.database_url {
            config.database.url = Some(url.clone());
        }
        if let Some(registry) = &self.registry {
            let registry = registry.trim_end_matches('/');
            config.builder.registry = (!registry.is_empty()).then(|| registry.to_string());
        }
        if let Some(dir) = &self.work_dir {
            config.builder.work_dir = dir.clone();
        }

        Ok(config)
    }
}
