//! Supporting types shared by the Trellis CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition (True, False, Unknown)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A status condition attached to an intent object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Valid)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True if this condition matches another, ignoring the transition time.
    ///
    /// Used for write deduplication: a condition that differs only in its
    /// timestamp is a no-op and must not be written back.
    pub fn same_verdict(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Virtual host declaration on a root TrellisProxy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostSpec {
    /// Fully qualified hostname this proxy claims (e.g., shop.example.com)
    pub fqdn: String,

    /// TLS configuration; presence makes this a secure virtual host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

/// TLS material reference for a virtual host
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the TLS keypair, either `name` (same namespace)
    /// or `namespace/name` (requires a matching certificate delegation)
    pub secret_name: String,
}

impl TlsSpec {
    /// Split the secret reference into (namespace, name), defaulting the
    /// namespace to `own_namespace` for unqualified references.
    ///
    /// Returns None for malformed references (empty parts, more than one
    /// separator).
    pub fn secret_ref(&self, own_namespace: &str) -> Option<(String, String)> {
        let mut parts = self.secret_name.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(name), None) if !name.is_empty() => {
                Some((own_namespace.to_string(), name.to_string()))
            }
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some((ns.to_string(), name.to_string()))
            }
            _ => None,
        }
    }
}

/// Path and request matching conditions on a route or include
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchConditions {
    /// Path prefix match (most common; "/" when nothing else is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Exact path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    /// Regular-expression path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Header matchers, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatchSpec>,

    /// Query-parameter matchers, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<QueryParamMatchSpec>,
}

impl MatchConditions {
    /// Validate mutual exclusion and well-formedness of the path matchers
    pub fn validate(&self) -> Result<(), crate::Error> {
        let set = [
            self.prefix.is_some(),
            self.exact.is_some(),
            self.regex.is_some(),
        ]
        .iter()
        .filter(|&&p| p)
        .count();
        if set > 1 {
            return Err(crate::Error::validation(
                "route conditions may set at most one of prefix, exact, regex",
            ));
        }
        for path in [&self.prefix, &self.exact].into_iter().flatten() {
            if !path.starts_with('/') {
                return Err(crate::Error::validation(format!(
                    "path match {path:?} must begin with '/'"
                )));
            }
        }
        if matches!(&self.regex, Some(r) if r.is_empty()) {
            return Err(crate::Error::validation("regex path match must not be empty"));
        }
        for h in &self.headers {
            h.validate()?;
        }
        Ok(())
    }
}

/// A single header matcher
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatchSpec {
    /// Header name
    pub name: String,

    /// Exact value the header must carry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    /// Substring the header value must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,

    /// Require mere presence of the header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present: Option<bool>,
}

impl HeaderMatchSpec {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::validation("header matcher requires a name"));
        }
        Ok(())
    }
}

/// A single query-parameter matcher
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryParamMatchSpec {
    /// Query parameter name
    pub name: String,

    /// Exact value the parameter must carry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
}

/// Weighted backend target of a route
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Service name in the proxy's own namespace
    pub name: String,

    /// Service port
    pub port: u16,

    /// Relative traffic weight among this route's backends
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendRef {
    /// Validate the reference shape; malformed references invalidate the
    /// owning proxy rather than degrading the route
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::validation("backend reference requires a service name"));
        }
        if self.port == 0 {
            return Err(crate::Error::validation(format!(
                "backend {} requires a non-zero port",
                self.name
            )));
        }
        Ok(())
    }
}

/// Per-route policy: timeouts, retries, header rewrites
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    /// Upstream response timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,

    /// Number of upstream retry attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Request headers to set before forwarding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValue>,

    /// Request headers to strip before forwarding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
}

/// A header name/value pair for rewrite policies
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValue {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// A route entry on a TrellisProxy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Match conditions; defaults to prefix "/" when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<MatchConditions>,

    /// Weighted backend services
    pub services: Vec<BackendRef>,

    /// Optional per-route policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RoutePolicy>,
}

/// Delegation of a path subtree to a child TrellisProxy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncludeSpec {
    /// Name of the included TrellisProxy
    pub name: String,

    /// Namespace of the included proxy; defaults to the parent's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Conditions prepended to every route of the included proxy.
    /// Only prefix conditions are honoured on includes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<MatchConditions>,
}

impl IncludeSpec {
    /// Namespace the include resolves to, given the parent's namespace
    pub fn resolve_namespace<'a>(&'a self, parent_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(parent_namespace)
    }
}

/// A single certificate delegation grant
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSpec {
    /// Name of the delegated secret in the delegation's own namespace
    pub secret_name: String,

    /// Namespaces allowed to reference the secret; "*" wildcards all
    pub target_namespaces: Vec<String>,
}

impl DelegationSpec {
    /// True if this grant permits `namespace` to reference the secret
    pub fn permits(&self, namespace: &str) -> bool {
        self.target_namespaces
            .iter()
            .any(|t| t == "*" || t == namespace)
    }
}
