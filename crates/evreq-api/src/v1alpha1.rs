//! `evictionrequest.coordination.uber.com/v1alpha1` types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::DEFAULT_HEARTBEAT_DEADLINE_SECONDS;

/// Desired state of an eviction request. Every field except `requesters` is immutable.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "evictionrequest.coordination.uber.com",
    version = "v1alpha1",
    kind = "EvictionRequest",
    plural = "evictionrequests",
    shortname = "evreq",
    namespaced,
    status = "EvictionRequestStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.target.podRef.name","description":"Target pod for eviction"}"#,
    printcolumn = r#"{"name":"ActiveInterceptor","type":"string","jsonPath":".status.activeInterceptorClass","description":"Current active interceptor"}"#,
    printcolumn = r#"{"name":"Heartbeat","type":"date","jsonPath":".status.heartbeatTime","description":"Last heartbeat"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EvictionRequestSpec {
    #[serde(rename = "type", default)]
    pub type_: EvictionRequestType,

    pub target: EvictionTarget,

    /// Empty list signals that the request should be canceled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requesters: Vec<Requester>,

    /// Resolved on admission; unique by `interceptorClass`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interceptors: Vec<Interceptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_deadline_seconds: Option<i32>,
}

/// Mode of an eviction request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EvictionRequestType {
    /// Graceful eviction. No overall deadline; each active interceptor is bounded
    /// only by the heartbeat deadline.
    #[default]
    Soft,
}

/// Reference to the object to evict. Exactly one target kind is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<LocalPodReference>,
}

/// Locates a pod in the namespace of the eviction request.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalPodReference {
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Requester {
    pub name: String,
}

/// A participant that may delay or observe the eviction of the target.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interceptor {
    pub interceptor_class: String,
    /// Higher priorities are handed the request first.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Interceptor {
    pub fn new(interceptor_class: impl Into<String>, priority: i32) -> Self {
        Self {
            interceptor_class: interceptor_class.into(),
            priority,
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Observed state, written by the controller and by the active interceptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionRequestStatus {
    /// Unique by type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub message: String,

    /// `None` until the first interceptor is selected. The legacy empty-string
    /// wire value also reads as `None`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_string_as_none"
    )]
    #[schemars(with = "Option<String>")]
    pub active_interceptor_class: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub active_interceptor_completed: bool,

    /// Last sign of life from the active interceptor. The controller seeds it with
    /// the selection time, so the heartbeat deadline runs from selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_time: Option<Time>,

    /// Advisory estimate from the active interceptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_interceptor_finish_time: Option<Time>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_string_as_none"
    )]
    #[schemars(with = "Option<CancellationPolicy>")]
    pub eviction_request_cancellation_policy: Option<CancellationPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_eviction_status: Option<PodEvictionStatus>,
}

/// Whether the eviction request may be deleted before the target is gone.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CancellationPolicy {
    #[default]
    Allow,
    Forbid,
}

impl CancellationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationPolicy::Allow => "Allow",
            CancellationPolicy::Forbid => "Forbid",
        }
    }
}

impl fmt::Display for CancellationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Allow" => Ok(CancellationPolicy::Allow),
            "Forbid" => Ok(CancellationPolicy::Forbid),
            other => Err(format!(
                "invalid evictionRequestCancellationPolicy '{}'. expected one of: Allow, Forbid",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodEvictionStatus {
    /// Failed Eviction API calls; never decreases.
    #[serde(default, rename = "failedAPIEvictionCounter")]
    pub failed_api_eviction_counter: i32,
}

impl EvictionRequest {
    pub fn pod_ref(&self) -> Option<&LocalPodReference> {
        self.spec.target.pod_ref.as_ref()
    }

    /// Status view that treats a missing status as the default one.
    pub fn status_or_default(&self) -> EvictionRequestStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut EvictionRequestStatus {
        self.status.get_or_insert_with(EvictionRequestStatus::default)
    }

    pub fn active_interceptor_class(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.active_interceptor_class.as_deref())
            .filter(|class| !class.is_empty())
    }

    pub fn active_interceptor_completed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.active_interceptor_completed)
            .unwrap_or(false)
    }

    pub fn heartbeat_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.heartbeat_time.as_ref())
            .map(|t| t.0)
    }

    /// Silence window tolerated from the active interceptor.
    pub fn heartbeat_deadline(&self) -> Duration {
        let seconds = self
            .spec
            .heartbeat_deadline_seconds
            .unwrap_or(DEFAULT_HEARTBEAT_DEADLINE_SECONDS);
        Duration::seconds(i64::from(seconds))
    }

    pub fn failed_api_eviction_counter(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.pod_eviction_status.as_ref())
            .map(|p| p.failed_api_eviction_counter)
            .unwrap_or(0)
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == condition_type)
    }
}

fn empty_string_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
