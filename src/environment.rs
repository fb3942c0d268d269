//! Machine, CI and container metadata attached to every execution.
//!
//! The snapshot is computed once per process ([`EnvironmentInfo::current`])
//! and shared by every record. Detection reads through an [`EnvSource`] so
//! it can be exercised without touching the real process environment.
//!
//! # Environment Name Precedence
//!
//! 1. `TESTPULSE_ENVIRONMENT` (explicit override)
//! 2. `"ci"` when a CI provider is detected
//! 3. The configured `environment` value
//! 4. `APP_ENVIRONMENT`, then `ENVIRONMENT` (hosting variables)
//! 5. `"local"`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TelemetryConfig;

/// Variable that overrides every other source of the environment name.
pub const ENVIRONMENT_OVERRIDE_VAR: &str = "TESTPULSE_ENVIRONMENT";

const HOSTING_ENVIRONMENT_VARS: &[&str] = &["APP_ENVIRONMENT", "ENVIRONMENT"];

const DEFAULT_ENVIRONMENT: &str = "local";

/// CI providers, identified by a variable they always set.
const CI_PROVIDERS: &[(&str, &str)] = &[
    ("GITHUB_ACTIONS", "github-actions"),
    ("GITLAB_CI", "gitlab"),
    ("TF_BUILD", "azure-pipelines"),
    ("JENKINS_URL", "jenkins"),
    ("CIRCLECI", "circleci"),
    ("TRAVIS", "travis"),
    ("TEAMCITY_VERSION", "teamcity"),
    ("BUILDKITE", "buildkite"),
    ("APPVEYOR", "appveyor"),
    ("BITBUCKET_BUILD_NUMBER", "bitbucket"),
];

/// Snapshot of the machine the tests run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub machine_name: String,

    pub os: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    pub architecture: String,

    /// Version of this SDK.
    pub sdk_version: String,

    pub is_ci: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_provider: Option<String>,

    pub is_container: bool,

    /// Resolved environment name, see the module docs for precedence.
    pub environment_name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: BTreeMap<String, String>,
}

/// Read access to the host's variables and files.
pub trait EnvSource {
    /// Returns the value of an environment variable.
    fn var(&self, name: &str) -> Option<String>;

    /// Returns whether a file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Reads a small text file.
    fn read_to_string(&self, path: &Path) -> Option<String>;
}

/// [`EnvSource`] backed by the real process environment and file system.
pub struct SystemEnv;

impl EnvSource for SystemEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

static CURRENT: OnceLock<EnvironmentInfo> = OnceLock::new();

impl EnvironmentInfo {
    /// Returns the process-wide snapshot, detecting it on first use.
    ///
    /// Later calls return the cached snapshot even if `config` differs.
    pub fn current(config: &TelemetryConfig) -> &'static EnvironmentInfo {
        CURRENT.get_or_init(|| {
            let info = detect_with(&SystemEnv, &config.environment, &config.custom_properties);
            debug!(
                "Detected environment '{}' (ci: {}, container: {})",
                info.environment_name, info.is_ci, info.is_container
            );
            info
        })
    }
}

/// Detects the environment using the given source.
pub fn detect_with(
    source: &dyn EnvSource,
    configured_environment: &str,
    custom_properties: &BTreeMap<String, String>,
) -> EnvironmentInfo {
    let ci_provider = detect_ci_provider(source);
    let is_ci = ci_provider.is_some();

    EnvironmentInfo {
        machine_name: machine_name(source),
        os: std::env::consts::OS.to_string(),
        os_version: os_version(source),
        architecture: std::env::consts::ARCH.to_string(),
        sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        is_ci,
        ci_provider,
        is_container: detect_container(source),
        environment_name: resolve_environment_name(source, is_ci, configured_environment),
        custom_properties: custom_properties.clone(),
    }
}

/// Resolves the environment name by fixed precedence.
pub fn resolve_environment_name(
    source: &dyn EnvSource,
    is_ci: bool,
    configured_environment: &str,
) -> String {
    if let Some(name) = non_empty(source.var(ENVIRONMENT_OVERRIDE_VAR)) {
        return name;
    }
    if is_ci {
        return "ci".to_string();
    }
    if !configured_environment.trim().is_empty() {
        return configured_environment.trim().to_string();
    }
    HOSTING_ENVIRONMENT_VARS
        .iter()
        .find_map(|var| non_empty(source.var(var)))
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

/// Returns the CI provider name, `"generic"` when only `CI` is set.
pub fn detect_ci_provider(source: &dyn EnvSource) -> Option<String> {
    if let Some((_, name)) = CI_PROVIDERS
        .iter()
        .find(|(var, _)| non_empty(source.var(var)).is_some())
    {
        return Some(name.to_string());
    }
    match source.var("CI").map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" => Some("generic".to_string()),
        _ => None,
    }
}

/// Returns whether the process appears to run inside a container.
pub fn detect_container(source: &dyn EnvSource) -> bool {
    if source.exists(Path::new("/.dockerenv")) || source.exists(Path::new("/run/.containerenv")) {
        return true;
    }
    if non_empty(source.var("KUBERNETES_SERVICE_HOST")).is_some()
        || non_empty(source.var("container")).is_some()
    {
        return true;
    }
    source
        .read_to_string(Path::new("/proc/1/cgroup"))
        .is_some_and(|cgroup| {
            ["docker", "kubepods", "containerd", "lxc"]
                .iter()
                .any(|marker| cgroup.contains(marker))
        })
}

fn machine_name(source: &dyn EnvSource) -> String {
    non_empty(source.var("HOSTNAME"))
        .or_else(|| non_empty(source.var("COMPUTERNAME")))
        .or_else(|| non_empty(source.read_to_string(Path::new("/etc/hostname"))))
        .unwrap_or_else(|| "unknown".to_string())
}

fn os_version(source: &dyn EnvSource) -> Option<String> {
    let release = source.read_to_string(Path::new("/etc/os-release"))?;
    release.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
