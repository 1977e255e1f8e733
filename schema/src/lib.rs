//! Schema definitions for procsitter
//!
//! This crate contains the shared data structures used across the procsitter
//! workspace: launch options passed to the process launcher and the
//! administrator-facing supervision configuration. All types here implement
//! JSON Schema generation for external consumption.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource-limit overrides applied to a child process before it execs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Address space limit in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_space: Option<u64>,
    /// Core file size limit in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_size: Option<u64>,
    /// CPU time limit in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
    /// Open file descriptor limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_files: Option<u64>,
}

impl ResourceLimits {
    /// Whether any override is set
    pub fn is_empty(&self) -> bool {
        self.address_space.is_none()
            && self.core_size.is_none()
            && self.cpu_seconds.is_none()
            && self.open_files.is_none()
    }
}

/// Options record passed opaquely to the process launcher
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChildOptions {
    /// Working directory for the child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Root directory (chroot) for the child; when set, `dir` is interpreted
    /// inside the new root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Numeric user identity to run as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<u32>,
    /// Numeric group identity to run as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    /// Nice increment applied to the child's scheduling priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice_increment: Option<i32>,
    /// Resource limit overrides
    #[serde(default)]
    pub rlimits: ResourceLimits,
}

/// Administrator configuration for a pooled launcher variant.
///
/// The direct Unix launcher starts processes itself; deployments that front
/// process creation with a pooled helper configure it here. The pool's
/// allocation policy is the launcher's own concern and is not re-specified
/// by the supervision core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    /// Path to the helper binary, or None for the platform default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper_path: Option<String>,
    /// Minimum number of pooled helper processes to keep on hand
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_pool: Option<u32>,
    /// Maximum number of pooled helper processes to keep on hand
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pool: Option<u32>,
    /// Interval in seconds at which idle helper processes are reaped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_reap_secs: Option<u64>,
}

/// Configuration for the supervision core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// How long a process has to exit after cooperative termination before
    /// forceful termination is applied, in seconds
    #[serde(default = "default_term_grace_secs")]
    pub term_grace_secs: u64,
    /// Babysitter sweep interval while children are being tracked, in
    /// milliseconds
    #[serde(default = "default_busy_interval_ms")]
    pub busy_interval_ms: u64,
    /// Babysitter sweep interval while no children are tracked, in
    /// milliseconds
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Pooled launcher configuration
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            term_grace_secs: default_term_grace_secs(),
            busy_interval_ms: default_busy_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            launcher: LauncherConfig::default(),
        }
    }
}

fn default_term_grace_secs() -> u64 {
    30
}

fn default_busy_interval_ms() -> u64 {
    10
}

fn default_idle_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.term_grace_secs, 30);
        assert_eq!(config.busy_interval_ms, 10);
        assert_eq!(config.idle_interval_ms, 1000);
        assert_eq!(config.launcher, LauncherConfig::default());
    }

    #[test]
    fn test_supervisor_config_serde_defaults() {
        let config: SupervisorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SupervisorConfig::default());

        let config: SupervisorConfig =
            serde_json::from_str(r#"{"termGraceSecs": 5}"#).unwrap();
        assert_eq!(config.term_grace_secs, 5);
        assert_eq!(config.busy_interval_ms, 10);
    }

    #[test]
    fn test_child_options_roundtrip() {
        let opts = ChildOptions {
            dir: Some("/srv/cgi-bin".to_string()),
            root: None,
            user: Some(99),
            group: Some(99),
            nice_increment: Some(4),
            rlimits: ResourceLimits {
                cpu_seconds: Some(30),
                open_files: Some(256),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&opts).unwrap();
        let back: ChildOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dir.as_deref(), Some("/srv/cgi-bin"));
        assert_eq!(back.user, Some(99));
        assert_eq!(back.rlimits, opts.rlimits);
        // unset fields are omitted from the wire form
        assert!(!json.contains("root"));
    }

    #[test]
    fn test_resource_limits_is_empty() {
        assert!(ResourceLimits::default().is_empty());
        let limits = ResourceLimits {
            core_size: Some(0),
            ..Default::default()
        };
        assert!(!limits.is_empty());
    }
}
