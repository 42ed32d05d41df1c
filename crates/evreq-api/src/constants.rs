//! Condition vocabulary and schema bounds shared by the controller and interceptors.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "evictionrequest.coordination.uber.com";
pub const VERSION: &str = "v1alpha1";

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_INTERCEPTING: &str = "Intercepting";
pub const CONDITION_TYPE_EVICTED: &str = "Evicted";

pub const REASON_POD_NOT_FOUND: &str = "PodNotFound";
pub const REASON_INTERCEPTORS_READY: &str = "InterceptorsReady";
pub const REASON_INTERCEPTORS_NOT_READY: &str = "InterceptorsNotReady";
pub const REASON_EVICTION_SUCCEEDED: &str = "EvictionSucceeded";
pub const REASON_EVICTION_FAILED: &str = "EvictionFailed";

/// Heartbeat silence tolerated from the active interceptor, in seconds.
pub const MIN_HEARTBEAT_DEADLINE_SECONDS: i32 = 600;
pub const MAX_HEARTBEAT_DEADLINE_SECONDS: i32 = 86_400;
pub const DEFAULT_HEARTBEAT_DEADLINE_SECONDS: i32 = 1_800;

pub const MIN_INTERCEPTOR_PRIORITY: i32 = 0;
pub const MAX_INTERCEPTOR_PRIORITY: i32 = 100_000;

/// Priorities reserved for interceptors sharing the managing controller's parent domain.
pub const RESERVED_PRIORITY_BAND: std::ops::RangeInclusive<i32> = 9_900..=10_099;
pub const MAX_RESERVED_BAND_INTERCEPTORS: usize = 50;
pub const MAX_UNRESERVED_INTERCEPTORS: usize = 250;
pub const MAX_INTERCEPTORS: usize = 300;

/// Value of a `metav1.Condition` status field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
