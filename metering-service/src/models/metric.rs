//! Metric catalog.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of measure for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Count,
    Bytes,
    Milliseconds,
}

/// A countable resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ApiCalls,
    FlowExecutions,
    StorageBytes,
    ComputeMillis,
    TeamMembers,
}

impl MetricType {
    /// Every metric in the catalog, in reporting order.
    pub const ALL: [MetricType; 5] = [
        MetricType::ApiCalls,
        MetricType::FlowExecutions,
        MetricType::StorageBytes,
        MetricType::ComputeMillis,
        MetricType::TeamMembers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::ApiCalls => "api_calls",
            MetricType::FlowExecutions => "flow_executions",
            MetricType::StorageBytes => "storage_bytes",
            MetricType::ComputeMillis => "compute_millis",
            MetricType::TeamMembers => "team_members",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "api_calls" => Some(MetricType::ApiCalls),
            "flow_executions" => Some(MetricType::FlowExecutions),
            "storage_bytes" => Some(MetricType::StorageBytes),
            "compute_millis" => Some(MetricType::ComputeMillis),
            "team_members" => Some(MetricType::TeamMembers),
            _ => None,
        }
    }

    pub fn unit(&self) -> UnitKind {
        match self {
            MetricType::ApiCalls | MetricType::FlowExecutions | MetricType::TeamMembers => {
                UnitKind::Count
            }
            MetricType::StorageBytes => UnitKind::Bytes,
            MetricType::ComputeMillis => UnitKind::Milliseconds,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
