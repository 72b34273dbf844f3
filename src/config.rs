use std::{
    fmt::Debug,
    fmt::Formatter,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Path to a stack definition. Built in defaults are used when omitted.
    #[clap(short, long, env = "WEBSTACK_FILE")]
    pub stack: Option<PathBuf>,

    /// Kubernetes namespace the stack is rendered into.
    #[clap(short, long, env = "WEBSTACK_KUBE_NAMESPACE", default_value = "webstack")]
    pub namespace: KubeNamespace,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the composed spec graph as json.
    Synth,
    /// Print the json schema of the spec graph.
    Schema,
    /// Print the kubernetes manifests for the stack as yaml.
    Manifests,
    /// Build the container images of the stack.
    Build,
    /// Build images and apply the stack to the current kubernetes context.
    Deploy,
}

/// The named constants a stack is composed from.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_app_port")]
    pub app_port: u16,
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,
    #[serde(default = "default_build_file")]
    pub build_file: PathBuf,
    /// Use a published image instead of building `build_context`.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
    #[serde(default = "default_target_utilization")]
    pub target_utilization_percent: u32,
    #[serde(default = "default_max_azs")]
    pub max_azs: u32,
    #[serde(default = "default_log_stream_prefix")]
    pub log_stream_prefix: String,
    #[serde(default = "yes")]
    pub container_insights: bool,
    #[serde(default = "yes")]
    pub public_load_balancer: bool,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default = "yes")]
    pub allow_all_outbound: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            app_port: default_app_port(),
            build_context: default_build_context(),
            build_file: default_build_file(),
            image: None,
            cpu: default_cpu(),
            memory_mib: default_memory_mib(),
            desired_count: default_desired_count(),
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
            target_utilization_percent: default_target_utilization(),
            max_azs: default_max_azs(),
            log_stream_prefix: default_log_stream_prefix(),
            container_insights: true,
            public_load_balancer: true,
            listener_port: default_listener_port(),
            health_check_path: default_health_check_path(),
            allow_all_outbound: true,
        }
    }
}

impl StackConfig {
    /// read a stack definition from a toml file
    /// a relative build context is considered relative to the stack file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let stack_file = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stack file at {}", path.to_string_lossy()))?;
        let mut config: StackConfig = toml::from_str(&stack_file)
            .with_context(|| format!("failed to parse stack file at {}", path.to_string_lossy()))?;
        config.build_context = parent.join(&config.build_context);
        Ok(config)
    }

    /// Load from `path` when given, fall back to the defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

fn default_name() -> String {
    "NextJsFargate".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_build_context() -> PathBuf {
    PathBuf::from("../www")
}

fn default_build_file() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_cpu() -> u32 {
    256
}

fn default_memory_mib() -> u32 {
    512
}

fn default_desired_count() -> u32 {
    1
}

fn default_min_capacity() -> u32 {
    1
}

fn default_max_capacity() -> u32 {
    2
}

fn default_target_utilization() -> u32 {
    70
}

fn default_max_azs() -> u32 {
    2
}

fn default_log_stream_prefix() -> String {
    "myexample-logs".to_string()
}

fn default_listener_port() -> u16 {
    80
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn yes() -> bool {
    true
}

/// RFC 1123 label:
///   must not be empty
///   contain at most 63 characters
///   contain only lowercase alphanumeric characters or '-'
///   start and end with an alphanumeric character
pub fn check_dns_label(s: &str) -> anyhow::Result<()> {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    anyhow::ensure!(!s.is_empty(), "{s:?} is empty");
    anyhow::ensure!(s.len() <= 63, "{s:?} is longer than 63 characters");
    anyhow::ensure!(
        s.chars().all(|c| alnum(c) || c == '-'),
        "{s:?} must contain only lowercase alphanumeric characters or '-'"
    );
    anyhow::ensure!(
        s.starts_with(alnum),
        "{s:?} must start with an alphanumeric character"
    );
    anyhow::ensure!(
        s.ends_with(alnum),
        "{s:?} must end with an alphanumeric character"
    );
    Ok(())
}

/// A namespace is a dns label that should not start with 'kube-'.
#[derive(Clone, PartialEq, Eq)]
pub struct KubeNamespace(String);

impl KubeNamespace {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for KubeNamespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        check_dns_label(s).context("invalid namespace")?;
        anyhow::ensure!(
            !s.starts_with("kube-"),
            "namespace should not start with 'kube-'"
        );
        Ok(Self(s.to_string()))
    }
}

impl Debug for KubeNamespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
