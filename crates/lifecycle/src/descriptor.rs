//! Resource descriptors: what to create, in which order, and how long to wait.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shortest interval between status probes.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kind of externally managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Managed Kubernetes cluster.
    Cluster,
    /// Managed relational database instance.
    ManagedDatabase,
    /// Database subnet group.
    SubnetGroup,
    /// Security group ingress/egress rule.
    SecurityRule,
    /// Helm chart release.
    ChartRelease,
}

impl ResourceKind {
    /// Default budget for a new resource of this kind to become ready.
    #[must_use]
    pub fn default_creation_timeout(self) -> Duration {
        match self {
            Self::Cluster => Duration::from_secs(1200),
            Self::ManagedDatabase => Duration::from_secs(900),
            Self::ChartRelease => Duration::from_secs(600),
            Self::SubnetGroup | Self::SecurityRule => Duration::from_secs(120),
        }
    }

    /// Default budget for a deleted resource of this kind to disappear.
    #[must_use]
    pub fn default_deletion_timeout(self) -> Duration {
        match self {
            Self::Cluster => Duration::from_secs(900),
            Self::ManagedDatabase => Duration::from_secs(600),
            Self::ChartRelease => Duration::from_secs(300),
            Self::SubnetGroup | Self::SecurityRule => Duration::from_secs(120),
        }
    }

    /// Default interval between status probes.
    #[must_use]
    pub fn default_poll_interval(self) -> Duration {
        match self {
            Self::Cluster | Self::ManagedDatabase => Duration::from_secs(15),
            Self::SubnetGroup | Self::SecurityRule | Self::ChartRelease => Duration::from_secs(5),
        }
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::ManagedDatabase => "managed_database",
            Self::SubnetGroup => "subnet_group",
            Self::SecurityRule => "security_rule",
            Self::ChartRelease => "chart_release",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one managed resource.
///
/// Timeouts left unset fall back to the per-kind defaults on
/// [`ResourceKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable logical name, unique within an environment.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Ids that must be ready before this resource is created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Opaque parameters handed to the controller.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Creation readiness budget, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timeout_secs: Option<u64>,
    /// Deletion budget, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timeout_secs: Option<u64>,
    /// Interval between status probes, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

impl ResourceDescriptor {
    /// Create a descriptor with no dependencies and default timings.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            params: BTreeMap::new(),
            creation_timeout_secs: None,
            deletion_timeout_secs: None,
            poll_interval_secs: None,
        }
    }

    /// Add dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set a controller parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Override the creation and deletion budgets.
    #[must_use]
    pub fn with_timeouts(mut self, creation_secs: u64, deletion_secs: u64) -> Self {
        self.creation_timeout_secs = Some(creation_secs);
        self.deletion_timeout_secs = Some(deletion_secs);
        self
    }

    /// Override the status probe interval.
    #[must_use]
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = Some(secs);
        self
    }

    /// Effective creation readiness budget.
    #[must_use]
    pub fn creation_timeout(&self) -> Duration {
        self.creation_timeout_secs
            .map_or_else(|| self.kind.default_creation_timeout(), Duration::from_secs)
    }

    /// Effective deletion budget.
    #[must_use]
    pub fn deletion_timeout(&self) -> Duration {
        self.deletion_timeout_secs
            .map_or_else(|| self.kind.default_deletion_timeout(), Duration::from_secs)
    }

    /// Effective status probe interval, never below one second.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_secs
            .map_or_else(|| self.kind.default_poll_interval(), Duration::from_secs)
            .max(MIN_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let chart = ResourceDescriptor::new("monitoring", ResourceKind::ChartRelease)
            .with_poll_interval(0);
        assert_eq!(chart.poll_interval(), Duration::from_secs(1));

        let yaml = "id: monitoring\nkind: chart_release\npoll_interval_secs: 0\n";
        let parsed: ResourceDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_defaults_follow_kind() {
        let db = ResourceDescriptor::new("database", ResourceKind::ManagedDatabase);
        assert_eq!(db.creation_timeout(), Duration::from_secs(900));
        assert_eq!(db.deletion_timeout(), Duration::from_secs(600));
        assert_eq!(db.poll_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_overrides_win() {
        let rule = ResourceDescriptor::new("db-ingress", ResourceKind::SecurityRule)
            .with_timeouts(30, 45)
            .with_poll_interval(2);
        assert_eq!(rule.creation_timeout(), Duration::from_secs(30));
        assert_eq!(rule.deletion_timeout(), Duration::from_secs(45));
        assert_eq!(rule.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_deserialize_minimal_yaml() {
        let yaml = "id: subnet-group\nkind: subnet_group\ndepends_on: [cluster]\n";
        let descriptor: ResourceDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.kind, ResourceKind::SubnetGroup);
        assert_eq!(descriptor.depends_on, vec!["cluster".to_string()]);
        assert!(descriptor.params.is_empty());
        assert_eq!(descriptor.creation_timeout(), Duration::from_secs(120));
    }
}
