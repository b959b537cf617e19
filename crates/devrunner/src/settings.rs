//! Layered settings: defaults < config file < environment < flags

use crate::cli::GlobalArgs;
use anyhow::{Context, Result, anyhow};
use devrunner::{
    LaunchMode, PortBinding, ReadinessConfig, SupervisorConfig, TerminationConfig, parse_duration,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "dev-runner.json";

const DEFAULT_COMMAND: &str = "dotnet";
const DEFAULT_PROJECT: &str = "OptimalyAI.csproj";

/// How long the foreground shutdown may take before the CLI gives up
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Contents of `dev-runner.json`; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub name: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub url_scheme: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub grace_period_ms: Option<u64>,
    pub readiness: Option<ReadinessConfig>,
    pub termination: Option<TerminationConfig>,
    pub clean_paths: Option<Vec<PathBuf>>,
    pub build_command: Option<Vec<String>>,
    pub detached: Option<bool>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// An explicit path must exist; the default file is optional
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_path(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.is_file() {
                    debug!(path = %path.display(), "Loading default config file");
                    Self::from_path(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// Everything the commands need, resolved once per invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub supervisor: SupervisorConfig,
    pub clean_paths: Vec<PathBuf>,
    pub build_command: Vec<String>,
    pub open_browser: bool,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn resolve<I, K, V>(file: FileConfig, env: I, flags: &GlobalArgs) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let uses_default_target = file.command.is_none();

        let mut builder = SupervisorConfig::builder();
        builder.command(file.command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()));
        if uses_default_target {
            builder.env_multi(default_child_env());
        }
        builder.env_multi(file.env);
        if let Some(name) = file.name {
            builder.name(name);
        }
        if let Some(dir) = file.working_directory.clone() {
            builder.working_directory(dir);
        }
        if let Some(scheme) = file.url_scheme {
            builder.url_scheme(scheme);
        }
        if let Some(dir) = file.log_dir {
            builder.log_dir(dir);
        }
        if let Some(readiness) = file.readiness {
            builder.readiness(readiness);
        }
        let mut termination = file.termination.unwrap_or_default();
        if let Some(grace) = file.grace_period_ms {
            termination.grace_period_ms = grace;
        }
        builder.termination(termination);

        let defaults = PortBinding::default();
        builder.binding(PortBinding::new(
            file.host.unwrap_or(defaults.host),
            file.port.unwrap_or(defaults.port),
        ));
        builder.launch_mode(if file.detached.unwrap_or(true) {
            LaunchMode::Detached
        } else {
            LaunchMode::Attached
        });

        let mut config = builder
            .build()
            .map_err(|e| anyhow!("invalid configuration: {e}"))?;

        config.apply_env(env)?;

        if let Some(port) = flags.port {
            config.binding.port = port;
        }
        if let Some(host) = &flags.host {
            config.binding.host = host.clone();
        }
        if let Some(dir) = &flags.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(grace) = &flags.grace_period {
            let grace = parse_duration(grace)
                .ok_or_else(|| anyhow!("--grace-period {grace} is not a duration"))?;
            config.termination.grace_period_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        }

        // Only now is the final URL known
        match file.args {
            Some(args) => config.args = args,
            None if uses_default_target => config.args = default_args(&config.url()),
            None => {}
        }

        config.validate()?;

        let base = config
            .working_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let clean_paths = file
            .clean_paths
            .unwrap_or_else(default_clean_paths)
            .into_iter()
            .map(|path| if path.is_absolute() { path } else { base.join(path) })
            .collect();

        Ok(Self {
            supervisor: config,
            clean_paths,
            build_command: file.build_command.unwrap_or_else(default_build_command),
            open_browser: !flags.no_browser,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        })
    }

    /// Supervisor configuration for a foreground run
    pub fn attached(&self) -> SupervisorConfig {
        let mut config = self.supervisor.clone();
        config.launch_mode = LaunchMode::Attached;
        config
    }
}

fn default_args(url: &str) -> Vec<String> {
    ["run", "--project", DEFAULT_PROJECT, "--urls", url]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_child_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("ASPNETCORE_ENVIRONMENT", "Development"),
        ("DOTNET_CLI_TELEMETRY_OPTOUT", "1"),
        ("DOTNET_NOLOGO", "1"),
        ("DOTNET_SKIP_FIRST_TIME_EXPERIENCE", "1"),
    ]
}

fn default_clean_paths() -> Vec<PathBuf> {
    [
        "bin",
        "obj",
        "OAI.Core/bin",
        "OAI.Core/obj",
        "OAI.ServiceLayer/bin",
        "OAI.ServiceLayer/obj",
        "OAI.DataLayer/bin",
        "OAI.DataLayer/obj",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

fn default_build_command() -> Vec<String> {
    [
        DEFAULT_COMMAND,
        "build",
        DEFAULT_PROJECT,
        "--configuration",
        "Debug",
        "-v",
        "minimal",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
