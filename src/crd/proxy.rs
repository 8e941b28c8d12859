//! TrellisProxy Custom Resource Definition
//!
//! A TrellisProxy declares routing intent for one virtual host, or a
//! fragment of one when included from a parent proxy. Root proxies set
//! `spec.virtualhost`; children are reached through `spec.includes` chains
//! and must not claim a hostname of their own.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IncludeSpec, RouteSpec, VirtualHostSpec};

/// Specification for a TrellisProxy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "TrellisProxy",
    plural = "trellisproxies",
    shortname = "tp",
    status = "TrellisProxyStatus",
    namespaced,
    printcolumn = r#"{"name":"FQDN","type":"string","jsonPath":".spec.virtualhost.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.description"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrellisProxySpec {
    /// Virtual host declaration; present on root proxies only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<VirtualHostSpec>,

    /// Path subtrees delegated to other TrellisProxies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<IncludeSpec>,

    /// Routes served directly by this proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,
}

impl TrellisProxySpec {
    /// Returns true if this proxy declares a virtual host (routing root)
    pub fn is_root(&self) -> bool {
        self.virtualhost.is_some()
    }

    /// Structural validation of the spec.
    ///
    /// Cross-object invariants (hostname uniqueness, include resolution,
    /// delegation) are the graph builder's job and surface as status, not
    /// as validation errors here.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(vh) = &self.virtualhost {
            if vh.fqdn.is_empty() {
                return Err(crate::Error::validation("virtualhost requires a non-empty fqdn"));
            }
        }
        for route in &self.routes {
            if let Some(conditions) = &route.conditions {
                conditions.validate()?;
            }
            if route.services.is_empty() {
                return Err(crate::Error::validation("route requires at least one service"));
            }
        }
        for include in &self.includes {
            if include.name.is_empty() {
                return Err(crate::Error::validation("include requires a name"));
            }
        }
        Ok(())
    }
}

/// Status for a TrellisProxy, written only by the status reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrellisProxyStatus {
    /// One-word summary of the latest verdict (valid, invalid, orphaned)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Conditions computed by the last rebuild that observed this object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{BackendRef, MatchConditions};

    fn route_to(name: &str) -> RouteSpec {
        RouteSpec {
            conditions: None,
            services: vec![BackendRef {
                name: name.to_string(),
                port: 8080,
                weight: 1,
            }],
            policy: None,
        }
    }

    #[test]
    fn test_root_detection() {
        let root = TrellisProxySpec {
            virtualhost: Some(VirtualHostSpec {
                fqdn: "shop.example.com".to_string(),
                tls: None,
            }),
            ..Default::default()
        };
        assert!(root.is_root());
        assert!(!TrellisProxySpec::default().is_root());
    }

    #[test]
    fn test_empty_fqdn_rejected() {
        let spec = TrellisProxySpec {
            virtualhost: Some(VirtualHostSpec {
                fqdn: String::new(),
                tls: None,
            }),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_route_without_services_rejected() {
        let spec = TrellisProxySpec {
            routes: vec![RouteSpec {
                conditions: None,
                services: vec![],
                policy: None,
            }],
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_conflicting_path_matchers_rejected() {
        let mut route = route_to("storefront");
        route.conditions = Some(MatchConditions {
            prefix: Some("/api".to_string()),
            exact: Some("/api".to_string()),
            ..Default::default()
        });
        let spec = TrellisProxySpec {
            routes: vec![route],
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_well_formed_spec_passes() {
        let spec = TrellisProxySpec {
            virtualhost: Some(VirtualHostSpec {
                fqdn: "shop.example.com".to_string(),
                tls: None,
            }),
            includes: vec![IncludeSpec {
                name: "storefront-api".to_string(),
                namespace: None,
                conditions: Some(MatchConditions {
                    prefix: Some("/api".to_string()),
                    ..Default::default()
                }),
            }],
            routes: vec![route_to("storefront")],
        };
        assert!(spec.validate().is_ok());
    }
}
