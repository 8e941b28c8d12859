//! Object cache: an indexed, in-memory mirror of every watched object
//!
//! The cache is mutated by the single watch-delivery path and read by the
//! rebuild pipeline through [`ObjectCache::snapshot`], which hands out a
//! consistent point-in-time view. Snapshots share the underlying objects
//! via `Arc` and are never mutated after handoff, so a rebuild can run
//! against one while the watch path keeps writing.
//!
//! Stored objects are lightweight mirrors carrying only what the graph
//! builder consumes, not raw Kubernetes objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::crd::{TrellisCertificateDelegationSpec, TrellisProxySpec};

// =============================================================================
// Keys and metadata
// =============================================================================

/// Kind of a watched object. Closed set; the builder matches exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// TrellisProxy routing intent
    Proxy,
    /// TrellisCertificateDelegation grant
    Delegation,
    /// Core Secret (TLS material)
    Secret,
    /// Core Service (backend ports)
    Service,
    /// Core Endpoints (ready addresses)
    Endpoints,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxy => write!(f, "TrellisProxy"),
            Self::Delegation => write!(f, "TrellisCertificateDelegation"),
            Self::Secret => write!(f, "Secret"),
            Self::Service => write!(f, "Service"),
            Self::Endpoints => write!(f, "Endpoints"),
        }
    }
}

/// Cache key: kind plus qualified name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Object kind
    pub kind: Kind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The `namespace/name` form used in log fields and reasons
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Metadata mirrored from the source object
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectMeta {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Opaque resource version, the optimistic-concurrency token for
    /// status writes
    pub resource_version: String,
    /// Creation timestamp; the primary hostname-conflict tie-break key
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    /// The `namespace/name` form
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Object mirrors
// =============================================================================

/// Mirror of a TrellisProxy
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyObject {
    /// Source metadata
    pub meta: ObjectMeta,
    /// Proxy spec as declared
    pub spec: TrellisProxySpec,
}

/// Mirror of a TrellisCertificateDelegation
#[derive(Clone, Debug, PartialEq)]
pub struct DelegationObject {
    /// Source metadata
    pub meta: ObjectMeta,
    /// Delegation spec as declared
    pub spec: TrellisCertificateDelegationSpec,
}

/// Mirror of a TLS Secret: the PEM payload plus keypair presence
#[derive(Clone, Debug, PartialEq)]
pub struct SecretObject {
    /// Source metadata
    pub meta: ObjectMeta,
    /// PEM certificate chain (`tls.crt`), if present
    pub cert_chain: Option<String>,
    /// PEM private key (`tls.key`), if present
    pub private_key: Option<String>,
}

impl SecretObject {
    /// True if the secret carries a complete TLS keypair
    pub fn has_tls_keypair(&self) -> bool {
        self.cert_chain.is_some() && self.private_key.is_some()
    }
}

/// A named service port
#[derive(Clone, Debug, PartialEq)]
pub struct ServicePort {
    /// Port name, if any
    pub name: Option<String>,
    /// Port number
    pub port: u16,
}

/// Mirror of a core Service
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceObject {
    /// Source metadata
    pub meta: ObjectMeta,
    /// Declared ports
    pub ports: Vec<ServicePort>,
}

impl ServiceObject {
    /// True if the service declares the given port number
    pub fn has_port(&self, port: u16) -> bool {
        self.ports.iter().any(|p| p.port == port)
    }
}

/// Mirror of a core Endpoints object: the ready addresses
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointsObject {
    /// Source metadata
    pub meta: ObjectMeta,
    /// Ready `ip:port` addresses
    pub addresses: Vec<String>,
}

/// Any watched object, dispatched by kind tag
#[derive(Clone, Debug, PartialEq)]
pub enum IntentObject {
    /// TrellisProxy mirror
    Proxy(ProxyObject),
    /// TrellisCertificateDelegation mirror
    Delegation(DelegationObject),
    /// Secret mirror
    Secret(SecretObject),
    /// Service mirror
    Service(ServiceObject),
    /// Endpoints mirror
    Endpoints(EndpointsObject),
}

impl IntentObject {
    /// Kind tag of this object
    pub fn kind(&self) -> Kind {
        match self {
            Self::Proxy(_) => Kind::Proxy,
            Self::Delegation(_) => Kind::Delegation,
            Self::Secret(_) => Kind::Secret,
            Self::Service(_) => Kind::Service,
            Self::Endpoints(_) => Kind::Endpoints,
        }
    }

    /// Mirrored metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Proxy(o) => &o.meta,
            Self::Delegation(o) => &o.meta,
            Self::Secret(o) => &o.meta,
            Self::Service(o) => &o.meta,
            Self::Endpoints(o) => &o.meta,
        }
    }

    /// Cache key for this object
    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(self.kind(), meta.namespace.clone(), meta.name.clone())
    }

    /// Equality ignoring the resource version.
    ///
    /// Every write to the source store bumps the resource version, even
    /// when the spec is untouched. Rebuilds key off this comparison so
    /// that no-op updates do not churn the pipeline.
    fn content_eq(&self, other: &IntentObject) -> bool {
        fn meta_eq(a: &ObjectMeta, b: &ObjectMeta) -> bool {
            a.namespace == b.namespace
                && a.name == b.name
                && a.creation_timestamp == b.creation_timestamp
        }
        match (self, other) {
            (Self::Proxy(a), Self::Proxy(b)) => meta_eq(&a.meta, &b.meta) && a.spec == b.spec,
            (Self::Delegation(a), Self::Delegation(b)) => {
                meta_eq(&a.meta, &b.meta) && a.spec == b.spec
            }
            (Self::Secret(a), Self::Secret(b)) => {
                meta_eq(&a.meta, &b.meta)
                    && a.cert_chain == b.cert_chain
                    && a.private_key == b.private_key
            }
            (Self::Service(a), Self::Service(b)) => {
                meta_eq(&a.meta, &b.meta) && a.ports == b.ports
            }
            (Self::Endpoints(a), Self::Endpoints(b)) => {
                meta_eq(&a.meta, &b.meta) && a.addresses == b.addresses
            }
            _ => false,
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Concurrent object cache: single writer (the watch path), many readers
/// through point-in-time snapshots
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: DashMap<ObjectKey, Arc<IntentObject>>,
}

impl ObjectCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object.
    ///
    /// The stored entry is always refreshed (so later status writes see the
    /// newest resource version), but the return value reports whether any
    /// rebuild-relevant content changed.
    pub fn insert(&self, object: IntentObject) -> bool {
        let key = object.key();
        let object = Arc::new(object);
        match self.objects.insert(key, object.clone()) {
            Some(previous) => !previous.content_eq(&object),
            None => true,
        }
    }

    /// Remove an object; returns true if it was present
    pub fn remove(&self, key: &ObjectKey) -> bool {
        self.objects.remove(key).is_some()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if the cache holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Keys of every cached object of one kind; used to prune stale
    /// entries when a watch relists
    pub fn keys_of_kind(&self, kind: Kind) -> Vec<ObjectKey> {
        self.objects
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Take a consistent point-in-time view for one rebuild.
    ///
    /// The view is an ordered copy of the index sharing objects by `Arc`;
    /// subsequent cache mutation does not affect it.
    pub fn snapshot(&self) -> CacheSnapshot {
        let objects = self
            .objects
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        CacheSnapshot { objects }
    }
}

/// Immutable point-in-time view of the cache, the graph builder's input
#[derive(Clone, Debug, Default)]
pub struct CacheSnapshot {
    objects: BTreeMap<ObjectKey, Arc<IntentObject>>,
}

impl CacheSnapshot {
    /// Build a snapshot directly from objects (test fixtures and tools)
    pub fn from_objects(objects: impl IntoIterator<Item = IntentObject>) -> Self {
        Self {
            objects: objects
                .into_iter()
                .map(|o| (o.key(), Arc::new(o)))
                .collect(),
        }
    }

    /// Look up any object by key
    pub fn get(&self, key: &ObjectKey) -> Option<&IntentObject> {
        self.objects.get(key).map(|o| o.as_ref())
    }

    /// Number of objects in the view
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if the view is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All proxies, in key order (namespace then name)
    pub fn proxies(&self) -> impl Iterator<Item = &ProxyObject> {
        self.objects.values().filter_map(|o| match o.as_ref() {
            IntentObject::Proxy(p) => Some(p),
            _ => None,
        })
    }

    /// All delegations, in key order
    pub fn delegations(&self) -> impl Iterator<Item = &DelegationObject> {
        self.objects.values().filter_map(|o| match o.as_ref() {
            IntentObject::Delegation(d) => Some(d),
            _ => None,
        })
    }

    /// Look up a proxy by namespace and name
    pub fn proxy(&self, namespace: &str, name: &str) -> Option<&ProxyObject> {
        match self.get(&ObjectKey::new(Kind::Proxy, namespace, name)) {
            Some(IntentObject::Proxy(p)) => Some(p),
            _ => None,
        }
    }

    /// Look up a secret by namespace and name
    pub fn secret(&self, namespace: &str, name: &str) -> Option<&SecretObject> {
        match self.get(&ObjectKey::new(Kind::Secret, namespace, name)) {
            Some(IntentObject::Secret(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up a service by namespace and name
    pub fn service(&self, namespace: &str, name: &str) -> Option<&ServiceObject> {
        match self.get(&ObjectKey::new(Kind::Service, namespace, name)) {
            Some(IntentObject::Service(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up endpoints by namespace and name
    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<&EndpointsObject> {
        match self.get(&ObjectKey::new(Kind::Endpoints, namespace, name)) {
            Some(IntentObject::Endpoints(e)) => Some(e),
            _ => None,
        }
    }
}
