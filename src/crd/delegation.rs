//! TrellisCertificateDelegation Custom Resource Definition
//!
//! Grants namespaces the right to reference a TLS secret owned by the
//! delegation's namespace. Without a matching grant, a cross-namespace
//! secret reference on a TrellisProxy is invalid.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, DelegationSpec};

/// Specification for a TrellisCertificateDelegation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "TrellisCertificateDelegation",
    plural = "trelliscertificatedelegations",
    shortname = "tcd",
    status = "TrellisCertificateDelegationStatus",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrellisCertificateDelegationSpec {
    /// Grants carried by this delegation
    pub delegations: Vec<DelegationSpec>,
}

impl TrellisCertificateDelegationSpec {
    /// Structural validation of the grant list
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.delegations.is_empty() {
            return Err(crate::Error::validation(
                "certificate delegation requires at least one grant",
            ));
        }
        for d in &self.delegations {
            if d.secret_name.is_empty() {
                return Err(crate::Error::validation("delegation requires a secret name"));
            }
            if d.target_namespaces.is_empty() {
                return Err(crate::Error::validation(format!(
                    "delegation of {} requires at least one target namespace",
                    d.secret_name
                )));
            }
        }
        Ok(())
    }
}

/// Status for a TrellisCertificateDelegation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrellisCertificateDelegationStatus {
    /// One-word summary of the latest verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Conditions computed by the last rebuild that observed this object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
