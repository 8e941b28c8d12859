//! Kubernetes watch boundary
//!
//! Streams watch events for the five input kinds and folds each into the
//! object cache, notifying the rebuild trigger only when the cache content
//! actually changed. The feed is trusted to reflect the source of truth;
//! nothing here re-fetches objects.
//!
//! Mirror extraction keeps only what the graph builder consumes: metadata
//! (name, namespace, resource version, creation timestamp) plus the
//! kind-specific payload. Everything else the API server sends is dropped
//! at this boundary.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{info, warn};

use crate::cache::{
    DelegationObject, EndpointsObject, IntentObject, Kind, ObjectCache, ObjectKey, ObjectMeta,
    ProxyObject, SecretObject, ServiceObject, ServicePort,
};
use crate::crd::{TrellisCertificateDelegation, TrellisProxy};
use crate::trigger::{ChangeType, RebuildTrigger};

// =============================================================================
// Mirror extraction
// =============================================================================

fn mirror_meta<K: Resource>(obj: &K) -> Option<ObjectMeta> {
    let meta = obj.meta();
    Some(ObjectMeta {
        namespace: meta.namespace.clone()?,
        name: meta.name.clone()?,
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        creation_timestamp: meta.creation_timestamp.as_ref().map(|t| t.0)?,
    })
}

/// Mirror a TrellisProxy into its cache representation
pub fn mirror_proxy(obj: &TrellisProxy) -> Option<IntentObject> {
    Some(IntentObject::Proxy(ProxyObject {
        meta: mirror_meta(obj)?,
        spec: obj.spec.clone(),
    }))
}

/// Mirror a TrellisCertificateDelegation
pub fn mirror_delegation(obj: &TrellisCertificateDelegation) -> Option<IntentObject> {
    Some(IntentObject::Delegation(DelegationObject {
        meta: mirror_meta(obj)?,
        spec: obj.spec.clone(),
    }))
}

/// Mirror a Secret, keeping the TLS keypair PEM when present
pub fn mirror_secret(obj: &Secret) -> Option<IntentObject> {
    let pem = |key: &str| {
        obj.data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
    };
    Some(IntentObject::Secret(SecretObject {
        meta: mirror_meta(obj)?,
        cert_chain: pem("tls.crt"),
        private_key: pem("tls.key"),
    }))
}

/// Mirror a Service, keeping its declared ports
pub fn mirror_service(obj: &Service) -> Option<IntentObject> {
    let ports = obj
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    Some(ServicePort {
                        name: p.name.clone(),
                        port: u16::try_from(p.port).ok()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(IntentObject::Service(ServiceObject {
        meta: mirror_meta(obj)?,
        ports,
    }))
}

/// Mirror an Endpoints object, flattening ready addresses to `ip:port`
pub fn mirror_endpoints(obj: &Endpoints) -> Option<IntentObject> {
    let mut addresses = Vec::new();
    for subset in obj.subsets.iter().flatten() {
        let ports: Vec<u16> = subset
            .ports
            .iter()
            .flatten()
            .filter_map(|p| u16::try_from(p.port).ok())
            .collect();
        for address in subset.addresses.iter().flatten() {
            for port in &ports {
                addresses.push(format!("{}:{}", address.ip, port));
            }
        }
    }
    addresses.sort();
    Some(IntentObject::Endpoints(EndpointsObject {
        meta: mirror_meta(obj)?,
        addresses,
    }))
}

// =============================================================================
// Event folding
// =============================================================================

fn apply_object(
    cache: &ObjectCache,
    trigger: &RebuildTrigger,
    object: IntentObject,
    change: ChangeType,
) {
    let key = object.key();
    if cache.insert(object) {
        trigger.notify(key.kind, key.namespace, key.name, change);
    }
}

fn delete_object(cache: &ObjectCache, trigger: &RebuildTrigger, key: ObjectKey) {
    if cache.remove(&key) {
        trigger.notify(key.kind, key.namespace, key.name, ChangeType::Delete);
    }
}

/// Replace the cache's view of one kind with a relisted set, pruning
/// entries the relist no longer carries
fn handle_restart(
    cache: &ObjectCache,
    trigger: &RebuildTrigger,
    kind: Kind,
    objects: Vec<IntentObject>,
) {
    let mut stale: std::collections::BTreeSet<ObjectKey> =
        cache.keys_of_kind(kind).into_iter().collect();
    for object in objects {
        stale.remove(&object.key());
        apply_object(cache, trigger, object, ChangeType::Update);
    }
    for key in stale {
        delete_object(cache, trigger, key);
    }
}

async fn watch_kind<K>(
    api: Api<K>,
    kind: Kind,
    cache: Arc<ObjectCache>,
    trigger: RebuildTrigger,
    mirror: fn(&K) -> Option<IntentObject>,
) where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Clone + Default + Eq + std::hash::Hash,
{
    info!(kind = %kind, "starting watch");
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => {
                if let Some(mirrored) = mirror(&obj) {
                    apply_object(&cache, &trigger, mirrored, ChangeType::Update);
                }
            }
            Ok(watcher::Event::Deleted(obj)) => {
                if let Some(namespace) = obj.namespace() {
                    delete_object(
                        &cache,
                        &trigger,
                        ObjectKey::new(kind, namespace, obj.name_any()),
                    );
                }
            }
            Ok(watcher::Event::Restarted(objs)) => {
                let mirrored = objs.iter().filter_map(mirror).collect();
                handle_restart(&cache, &trigger, kind, mirrored);
            }
            Err(e) => {
                // The watcher restarts itself; an error here is a gap the
                // next relist closes.
                warn!(kind = %kind, error = %e, "watch stream error");
            }
        }
    }
}

/// Spawn one watch task per input kind, feeding the cache and trigger
pub fn spawn_watches(
    client: Client,
    cache: Arc<ObjectCache>,
    trigger: RebuildTrigger,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(watch_kind(
            Api::<TrellisProxy>::all(client.clone()),
            Kind::Proxy,
            cache.clone(),
            trigger.clone(),
            mirror_proxy,
        )),
        tokio::spawn(watch_kind(
            Api::<TrellisCertificateDelegation>::all(client.clone()),
            Kind::Delegation,
            cache.clone(),
            trigger.clone(),
            mirror_delegation,
        )),
        tokio::spawn(watch_kind(
            Api::<Secret>::all(client.clone()),
            Kind::Secret,
            cache.clone(),
            trigger.clone(),
            mirror_secret,
        )),
        tokio::spawn(watch_kind(
            Api::<Service>::all(client.clone()),
            Kind::Service,
            cache.clone(),
            trigger.clone(),
            mirror_service,
        )),
        tokio::spawn(watch_kind(
            Api::<Endpoints>::all(client),
            Kind::Endpoints,
            cache,
            trigger,
            mirror_endpoints,
        )),
    ]
}
