//! Daemon configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub builder: BuilderConfig,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// Settings passed to each queue read.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on messages returned by one read.
    pub max_messages: u32,
    /// How long the transport waits for messages before returning an empty batch.
    pub wait_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Consecutive failed reads after which the dispatcher gives up.
    pub max_failed_reads: u32,
    /// Pause between a failed read and the next attempt.
    pub read_backoff: Duration,
    /// Cap on simultaneously running builds. `None` is unbounded.
    pub max_concurrent_builds: Option<usize>,
    /// Deadline for a single build. `None` waits forever.
    pub build_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_failed_reads: 10,
            read_backoff: Duration::from_secs(1),
            max_concurrent_builds: None,
            build_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Root under which ephemeral workspaces are created.
    pub work_dir: PathBuf,
    /// Registry prefix for pushed images. Without one the push step is skipped.
    pub registry: Option<String>,
    pub git: String,
    pub docker: String,
    pub github_host: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("icarium"),
            registry: None,
            git: "git".to_string(),
            docker: "docker".to_string(),
            github_host: "github.com".to_string(),
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse daemon configuration from KDL text. Missing nodes keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => parse_database(node, &mut config.database)?,
            "queue" => parse_queue(node, &mut config.queue)?,
            "dispatcher" => parse_dispatcher(node, &mut config.dispatcher)?,
            "builder" => parse_builder(node, &mut config.builder)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_database(node: &KdlNode, database: &mut DatabaseConfig) -> ConfigResult<()> {
    for child in children(node) {
        if child.name().value() == "url" {
            database.url = Some(require_string(child, "database.url")?);
        }
    }
    Ok(())
}

fn parse_queue(node: &KdlNode, queue: &mut QueueConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-messages" => {
                let n = require_positive(child, "queue.max-messages")?;
                queue.max_messages = u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
                    field: "queue.max-messages".to_string(),
                    message: format!("{} is too large", n),
                })?;
            }
            "wait-time-secs" => {
                queue.wait_time = Duration::from_secs(require_u64(child, "queue.wait-time-secs")?);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_dispatcher(node: &KdlNode, dispatcher: &mut DispatcherConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-failed-reads" => {
                let n = require_positive(child, "dispatcher.max-failed-reads")?;
                dispatcher.max_failed_reads =
                    u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
                        field: "dispatcher.max-failed-reads".to_string(),
                        message: format!("{} is too large", n),
                    })?;
            }
            "read-backoff-ms" => {
                dispatcher.read_backoff =
                    Duration::from_millis(require_u64(child, "dispatcher.read-backoff-ms")?);
            }
            "max-concurrent-builds" => {
                let n = require_positive(child, "dispatcher.max-concurrent-builds")?;
                dispatcher.max_concurrent_builds = Some(n as usize);
            }
            "build-timeout-secs" => {
                let n = require_positive(child, "dispatcher.build-timeout-secs")?;
                dispatcher.build_timeout = Some(Duration::from_secs(n));
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_builder(node: &KdlNode, builder: &mut BuilderConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "work-dir" => {
                builder.work_dir = PathBuf::from(require_string(child, "builder.work-dir")?);
            }
            "registry" => {
                let registry = require_string(child, "builder.registry")?;
                let registry = registry.trim_end_matches('/').to_string();
                builder.registry = (!registry.is_empty()).then_some(registry);
            }
            "git" => builder.git = require_string(child, "builder.git")?,
            "docker" => builder.docker = require_string(child, "builder.docker")?,
            "github-host" => builder.github_host = require_string(child, "builder.github-host")?,
            _ => {}
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn require_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a string argument".to_string(),
    })
}

fn require_u64(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = get_first_int_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected an integer argument".to_string(),
    })?;

    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}

fn require_positive(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = require_u64(node, field)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
