//! Snapshot rendering and atomic publication
//!
//! [`render`] translates a routing graph into wire resources grouped by
//! kind, with every list sorted by resource name. Rendering is pure and
//! referentially stable: two structurally identical graphs render to
//! byte-identical resource lists, so subscribers keying on a generation
//! nonce are never forced into spurious reconfiguration.
//!
//! [`SnapshotCache`] owns publication. A publish stamps the rendered
//! resources with the next generation number and swaps the whole snapshot
//! in atomically; readers never block, never see a lock, and never observe
//! a partial mix of old and new resources. Old snapshots stay alive for as
//! long as a slow subscriber holds the `Arc`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crd::{HeaderMatchSpec, HeaderValue, QueryParamMatchSpec};
use crate::dag::{Dag, Route, RouteMatch, VirtualHost};

// =============================================================================
// Wire resources
// =============================================================================

/// A rendered listener
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Listener name (`ingress_http`, `ingress_https`)
    pub name: String,
    /// Bind port
    pub port: u16,
    /// Protocol (HTTP, HTTPS)
    pub protocol: String,
    /// Fully qualified hostnames served, sorted
    pub virtual_hosts: Vec<String>,
}

/// The rendered route table for one virtual host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableConfig {
    /// Resource name: `<listener>/<fqdn>`
    pub name: String,
    /// Hostname this table serves
    pub fqdn: String,
    /// Resolved TLS secret identity, for secure hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    /// Routes, most specific match first
    pub routes: Vec<RouteConfig>,
}

/// A rendered route entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Path match type (exact, regex, prefix)
    pub match_type: String,
    /// Path expression
    pub path: String,
    /// Header matchers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatchSpec>,
    /// Query-parameter matchers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<QueryParamMatchSpec>,
    /// Weighted cluster targets
    pub clusters: Vec<WeightedClusterConfig>,
    /// Upstream timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    /// Upstream retry attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Request headers to set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValue>,
    /// Request headers to strip
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
    /// True when every backend was unresolved or endpoint-less; the data
    /// plane answers 503 instead of forwarding
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_healthy_upstream: bool,
}

/// A weighted cluster reference inside a route
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightedClusterConfig {
    /// Cluster identity (`namespace/name:port`)
    pub name: String,
    /// Relative traffic weight
    pub weight: u32,
}

/// A rendered cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster identity (`namespace/name:port`)
    pub name: String,
    /// Backend service namespace
    pub service_namespace: String,
    /// Backend service name
    pub service_name: String,
    /// Backend port
    pub port: u16,
}

/// Rendered endpoint membership for one cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Owning cluster identity
    pub cluster: String,
    /// Ready `ip:port` addresses, sorted
    pub addresses: Vec<String>,
}

/// A rendered TLS secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    /// Secret identity (`namespace/name`)
    pub name: String,
    /// PEM certificate chain
    pub cert_chain: String,
    /// PEM private key
    pub private_key: String,
}

/// Output of one render pass: resources by kind, each list sorted by name
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderedResources {
    /// Listeners
    pub listeners: Vec<ListenerConfig>,
    /// Route tables
    pub route_tables: Vec<RouteTableConfig>,
    /// Clusters
    pub clusters: Vec<ClusterConfig>,
    /// Endpoints
    pub endpoints: Vec<EndpointConfig>,
    /// TLS secrets
    pub secrets: Vec<SecretConfig>,
    /// Nodes dropped because they were unrenderable; always zero unless a
    /// builder invariant was violated upstream
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// The published unit: rendered resources stamped with a generation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// Monotonically increasing publication number; an opaque nonce to
    /// subscribers
    pub generation: u64,
    /// The rendered resources
    #[serde(flatten)]
    pub resources: RenderedResources,
}

// =============================================================================
// Renderer
// =============================================================================

/// Render a routing graph into wire resources.
///
/// Pure transformation with no external failure mode: an unrenderable node
/// is dropped and counted, never allowed to abort the snapshot.
pub fn render(dag: &Dag) -> RenderedResources {
    let mut out = RenderedResources::default();

    let mut http_hosts = Vec::new();
    for vhost in &dag.http.virtual_hosts {
        match render_route_table(vhost, "ingress_http", None, &mut out.dropped) {
            Some(table) => {
                http_hosts.push(vhost.fqdn.clone());
                out.route_tables.push(table);
            }
            None => warn!(fqdn = %vhost.fqdn, "dropped unrenderable virtual host"),
        }
    }

    let mut https_hosts = Vec::new();
    let mut secrets: BTreeMap<String, SecretConfig> = BTreeMap::new();
    for secure in &dag.https.virtual_hosts {
        let secret_id = secure.secret.identity();
        match render_route_table(
            &secure.host,
            "ingress_https",
            Some(secret_id.clone()),
            &mut out.dropped,
        ) {
            Some(table) => {
                https_hosts.push(secure.host.fqdn.clone());
                out.route_tables.push(table);
                secrets.entry(secret_id).or_insert_with(|| SecretConfig {
                    name: secure.secret.identity(),
                    cert_chain: secure.secret.cert_chain.clone(),
                    private_key: secure.secret.private_key.clone(),
                });
            }
            None => warn!(fqdn = %secure.host.fqdn, "dropped unrenderable virtual host"),
        }
    }

    if !http_hosts.is_empty() {
        http_hosts.sort();
        out.listeners.push(ListenerConfig {
            name: "ingress_http".to_string(),
            port: 80,
            protocol: "HTTP".to_string(),
            virtual_hosts: http_hosts,
        });
    }
    if !https_hosts.is_empty() {
        https_hosts.sort();
        out.listeners.push(ListenerConfig {
            name: "ingress_https".to_string(),
            port: 443,
            protocol: "HTTPS".to_string(),
            virtual_hosts: https_hosts,
        });
    }

    for cluster in &dag.clusters {
        out.clusters.push(ClusterConfig {
            name: cluster.identity(),
            service_namespace: cluster.service_namespace.clone(),
            service_name: cluster.service_name.clone(),
            port: cluster.port,
        });
        let mut addresses = cluster.endpoints.clone();
        addresses.sort();
        out.endpoints.push(EndpointConfig {
            cluster: cluster.identity(),
            addresses,
        });
    }

    out.listeners.sort_by(|a, b| a.name.cmp(&b.name));
    out.route_tables.sort_by(|a, b| a.name.cmp(&b.name));
    out.clusters.sort_by(|a, b| a.name.cmp(&b.name));
    out.endpoints.sort_by(|a, b| a.cluster.cmp(&b.cluster));
    out.secrets = secrets.into_values().collect();

    out
}

fn render_route_table(
    vhost: &VirtualHost,
    listener: &str,
    tls_secret: Option<String>,
    dropped: &mut u64,
) -> Option<RouteTableConfig> {
    if vhost.fqdn.is_empty() {
        *dropped += 1;
        return None;
    }
    let mut routes = Vec::new();
    for route in &vhost.routes {
        match render_route(route) {
            Some(r) => routes.push(r),
            None => {
                *dropped += 1;
                warn!(fqdn = %vhost.fqdn, "dropped unrenderable route");
            }
        }
    }
    Some(RouteTableConfig {
        name: format!("{}/{}", listener, vhost.fqdn),
        fqdn: vhost.fqdn.clone(),
        tls_secret,
        routes,
    })
}

fn render_route(route: &Route) -> Option<RouteConfig> {
    let (match_type, path) = match &route.match_ {
        RouteMatch::Exact(p) => ("exact", p),
        RouteMatch::Regex(p) => ("regex", p),
        RouteMatch::Prefix(p) => ("prefix", p),
    };
    if path.is_empty() {
        return None;
    }
    Some(RouteConfig {
        match_type: match_type.to_string(),
        path: path.clone(),
        headers: route.headers.clone(),
        query_parameters: route.query_parameters.clone(),
        clusters: route
            .clusters
            .iter()
            .map(|wc| WeightedClusterConfig {
                name: wc.cluster.identity(),
                weight: wc.weight,
            })
            .collect(),
        timeout_seconds: route.policy.timeout_seconds,
        retries: route.policy.retries,
        request_headers_to_add: route.policy.request_headers_to_add.clone(),
        request_headers_to_remove: route.policy.request_headers_to_remove.clone(),
        no_healthy_upstream: route.no_healthy_upstream,
    })
}

// =============================================================================
// Published snapshot cache
// =============================================================================

/// Holds the currently published snapshot for concurrent readers.
///
/// Publication order matches generation order because publishes happen
/// only from the single-flight rebuild loop.
pub struct SnapshotCache {
    current: ArcSwap<ConfigSnapshot>,
    generation: AtomicU64,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    /// Create a cache holding an empty generation-zero snapshot
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Atomically publish rendered resources as the next generation.
    ///
    /// Returns the generation number assigned.
    pub fn publish(&self, resources: RenderedResources) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = ConfigSnapshot {
            generation,
            resources,
        };
        debug!(
            generation,
            listeners = snapshot.resources.listeners.len(),
            route_tables = snapshot.resources.route_tables.len(),
            clusters = snapshot.resources.clusters.len(),
            "published configuration snapshot"
        );
        self.current.store(Arc::new(snapshot));
        generation
    }

    /// The latest fully-published snapshot. Never blocks; multiple
    /// transient snapshots may be alive while slow readers catch up.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        Cluster, HttpListener, HttpsListener, SecretNode, SecureVirtualHost, WeightedCluster,
    };
    use crate::crd::RoutePolicy;

    fn cluster(ns: &str, name: &str, port: u16, endpoints: &[&str]) -> Arc<Cluster> {
        Arc::new(Cluster {
            service_namespace: ns.to_string(),
            service_name: name.to_string(),
            port,
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        })
    }

    fn route(prefix: &str, cluster: Arc<Cluster>) -> Route {
        Route {
            match_: RouteMatch::Prefix(prefix.to_string()),
            headers: vec![],
            query_parameters: vec![],
            clusters: vec![WeightedCluster { cluster, weight: 1 }],
            policy: RoutePolicy::default(),
            no_healthy_upstream: false,
        }
    }

    fn sample_dag() -> Dag {
        let web = cluster("shop", "web", 8080, &["10.0.0.2:8080", "10.0.0.1:8080"]);
        let api = cluster("shop", "api", 8080, &["10.0.1.1:8080"]);
        Dag {
            http: HttpListener {
                virtual_hosts: vec![VirtualHost {
                    fqdn: "shop.example.com".to_string(),
                    routes: vec![route("/api", api.clone()), route("/", web.clone())],
                }],
            },
            https: HttpsListener {
                virtual_hosts: vec![SecureVirtualHost {
                    host: VirtualHost {
                        fqdn: "secure.example.com".to_string(),
                        routes: vec![route("/", web.clone())],
                    },
                    secret: SecretNode {
                        namespace: "certs".to_string(),
                        name: "wildcard".to_string(),
                        cert_chain: "CERT".to_string(),
                        private_key: "KEY".to_string(),
                    },
                }],
            },
            clusters: vec![api, web],
        }
    }

    #[test]
    fn test_render_is_byte_identical_for_identical_graphs() {
        let a = serde_json::to_vec(&render(&sample_dag())).expect("serialize");
        let b = serde_json::to_vec(&render(&sample_dag())).expect("serialize");
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_groups_and_sorts_by_kind() {
        let rendered = render(&sample_dag());

        let listener_names: Vec<&str> =
            rendered.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(listener_names, vec!["ingress_http", "ingress_https"]);

        let table_names: Vec<&str> =
            rendered.route_tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            table_names,
            vec![
                "ingress_http/shop.example.com",
                "ingress_https/secure.example.com"
            ]
        );

        let cluster_names: Vec<&str> =
            rendered.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cluster_names, vec!["shop/api:8080", "shop/web:8080"]);

        // Endpoint addresses sorted even when the graph carried them
        // unsorted.
        assert_eq!(
            rendered.endpoints[1].addresses,
            vec!["10.0.0.1:8080", "10.0.0.2:8080"]
        );

        assert_eq!(rendered.secrets.len(), 1);
        assert_eq!(rendered.secrets[0].name, "certs/wildcard");
        assert_eq!(rendered.dropped, 0);
    }

    #[test]
    fn test_secure_table_references_its_secret() {
        let rendered = render(&sample_dag());
        let secure = rendered
            .route_tables
            .iter()
            .find(|t| t.fqdn == "secure.example.com")
            .expect("secure table");
        assert_eq!(secure.tls_secret.as_deref(), Some("certs/wildcard"));
    }

    #[test]
    fn test_unrenderable_host_is_dropped_and_counted() {
        let mut dag = sample_dag();
        dag.http.virtual_hosts.push(VirtualHost {
            fqdn: String::new(),
            routes: vec![],
        });
        let rendered = render(&dag);

        assert_eq!(rendered.dropped, 1);
        // The healthy hosts still rendered.
        assert_eq!(rendered.route_tables.len(), 2);
    }

    #[test]
    fn test_no_healthy_upstream_flag_survives_rendering() {
        let dead = cluster("shop", "down", 8080, &[]);
        let mut r = route("/", dead.clone());
        r.no_healthy_upstream = true;
        let dag = Dag {
            http: HttpListener {
                virtual_hosts: vec![VirtualHost {
                    fqdn: "shop.example.com".to_string(),
                    routes: vec![r],
                }],
            },
            https: HttpsListener::default(),
            clusters: vec![dead],
        };
        let rendered = render(&dag);
        assert!(rendered.route_tables[0].routes[0].no_healthy_upstream);
    }

    #[test]
    fn test_publish_is_monotone_and_wholesale() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.current().generation, 0);

        let g1 = cache.publish(render(&sample_dag()));
        assert_eq!(g1, 1);
        let held = cache.current();
        assert_eq!(held.generation, 1);

        // A later publish replaces the snapshot wholesale; the held Arc
        // still sees the old generation.
        let g2 = cache.publish(RenderedResources::default());
        assert_eq!(g2, 2);
        assert_eq!(cache.current().generation, 2);
        assert!(cache.current().resources.route_tables.is_empty());
        assert_eq!(held.generation, 1);
        assert_eq!(held.resources.route_tables.len(), 2);
    }
}
