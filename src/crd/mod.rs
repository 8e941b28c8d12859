//! Custom Resource Definitions for Trellis
//!
//! This module contains the two owned CRDs and their supporting types.
//! Status subresources are written only by the status reconciler.

mod delegation;
mod proxy;
mod types;

pub use delegation::{
    TrellisCertificateDelegation, TrellisCertificateDelegationSpec,
    TrellisCertificateDelegationStatus,
};
pub use proxy::{TrellisProxy, TrellisProxySpec, TrellisProxyStatus};
pub use types::{
    BackendRef, Condition, ConditionStatus, DelegationSpec, HeaderMatchSpec, HeaderValue,
    IncludeSpec, MatchConditions, QueryParamMatchSpec, RoutePolicy, RouteSpec, TlsSpec,
    VirtualHostSpec,
};
