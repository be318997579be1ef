//! EDS: Endpoints objects to `ClusterLoadAssignment`s.
//!
//! Assignments are only emitted for clusters in the DAG, never for
//! services nothing routes to. A resolved cluster with no ready
//! addresses still gets an (empty) assignment so envoy finishes warming
//! and serves 503 instead of hanging.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints};
use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::envoy::config::endpoint::v3 as xds_endpoint;
use xds_api::pb::google::protobuf;

use crate::cache::ObjectKey;
use crate::dag::{Cluster, Dag};
use crate::envoy::{into_any, load_assignment_name};

pub(crate) fn build(
    dag: &Dag,
    endpoints: &BTreeMap<ObjectKey, Arc<Endpoints>>,
) -> Vec<(String, protobuf::Any)> {
    // several clusters (differing only in policy) share one assignment.
    let mut assignments: BTreeMap<String, xds_endpoint::ClusterLoadAssignment> = BTreeMap::new();

    for cluster in dag.clusters.values() {
        let name = load_assignment_name(cluster);
        if assignments.contains_key(&name) {
            continue;
        }

        let lb_endpoints = endpoints
            .get(&cluster.service)
            .map(|ep| project(cluster, ep.as_ref()))
            .unwrap_or_default();

        let cla = xds_endpoint::ClusterLoadAssignment {
            cluster_name: name.clone(),
            endpoints: if lb_endpoints.is_empty() {
                Vec::new()
            } else {
                vec![xds_endpoint::LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        assignments.insert(name, cla);
    }

    assignments
        .into_iter()
        .map(|(name, cla)| (name, into_any!(cla)))
        .collect()
}

/// Project the subsets of one Endpoints object onto a cluster's port.
fn project(cluster: &Cluster, endpoints: &Endpoints) -> Vec<xds_endpoint::LbEndpoint> {
    let mut out = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        let Some(port) = subset_port(cluster, subset) else {
            continue;
        };
        // empty subsets carry nothing worth sending.
        let Some(addresses) = &subset.addresses else {
            continue;
        };

        let mut ips: Vec<&str> = addresses.iter().map(|a| a.ip.as_str()).collect();
        ips.sort_unstable();

        for ip in ips {
            out.push(lb_endpoint(ip, port));
        }
    }

    out
}

/// Find the subset port matching the cluster: by name when the service
/// port is named, by number otherwise.
fn subset_port(cluster: &Cluster, subset: &EndpointSubset) -> Option<i32> {
    for port in subset.ports.iter().flatten() {
        let matches = match &cluster.port_name {
            Some(name) => port.name.as_deref() == Some(name),
            None => port.port == cluster.port,
        };
        if matches {
            return Some(port.port);
        }
    }
    None
}

fn lb_endpoint(ip: &str, port: i32) -> xds_endpoint::LbEndpoint {
    let socket_address = xds_core::SocketAddress {
        address: ip.to_string(),
        port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(
            port as u32,
        )),
        ..Default::default()
    };

    xds_endpoint::LbEndpoint {
        health_status: xds_core::HealthStatus::Healthy as i32,
        host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
            xds_endpoint::Endpoint {
                address: Some(xds_core::Address {
                    address: Some(xds_core::address::Address::SocketAddress(socket_address)),
                }),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dag::{CircuitBreakers, LbPolicy, Protocol};
    use serde_json::json;

    fn dag_with_cluster(cluster: Cluster) -> Dag {
        let name = crate::dag::cluster_name(&cluster);
        let mut dag = Dag::default();
        dag.clusters.insert(name, Arc::new(cluster));
        dag
    }

    fn cluster(port: i32, port_name: Option<&str>) -> Cluster {
        Cluster {
            service: ObjectKey::new("default", "web"),
            port,
            port_name: port_name.map(|s| s.to_string()),
            protocol: Protocol::Http1,
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            circuit_breakers: CircuitBreakers::default(),
            sni: None,
            unresolved: false,
        }
    }

    fn endpoints(value: serde_json::Value) -> BTreeMap<ObjectKey, Arc<Endpoints>> {
        let ep: Endpoints = serde_json::from_value(value).unwrap();
        [(ObjectKey::new("default", "web"), Arc::new(ep))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_assignment_for_known_cluster() {
        let dag = dag_with_cluster(cluster(8080, Some("http")));
        let eps = endpoints(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"namespace": "default", "name": "web"},
            "subsets": [{
                "addresses": [{"ip": "10.0.0.2"}, {"ip": "10.0.0.1"}],
                "ports": [{"name": "http", "port": 8080}],
            }],
        }));

        let built = build(&dag, &eps);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].0, "default/web/http");

        let projected = project(&cluster(8080, Some("http")), &eps[&ObjectKey::new("default", "web")]);
        assert_eq!(projected.len(), 2);
    }

    #[test]
    fn test_addresses_sorted() {
        let eps = endpoints(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"namespace": "default", "name": "web"},
            "subsets": [{
                "addresses": [{"ip": "10.0.0.9"}, {"ip": "10.0.0.1"}, {"ip": "10.0.0.5"}],
                "ports": [{"port": 8080}],
            }],
        }));

        let projected = project(&cluster(8080, None), &eps[&ObjectKey::new("default", "web")]);
        let ips: Vec<String> = projected
            .iter()
            .map(|e| match e.host_identifier.as_ref().unwrap() {
                xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(ep) => {
                    match ep.address.as_ref().unwrap().address.as_ref().unwrap() {
                        xds_core::address::Address::SocketAddress(sa) => sa.address.clone(),
                        _ => unreachable!(),
                    }
                }
                _ => unreachable!(),
            })
            .collect();

        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.5", "10.0.0.9"]);
    }

    #[test]
    fn test_empty_subsets_ignored() {
        let eps = endpoints(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"namespace": "default", "name": "web"},
            "subsets": [{"ports": [{"port": 8080}]}],
        }));

        let projected = project(&cluster(8080, None), &eps[&ObjectKey::new("default", "web")]);
        assert!(projected.is_empty());
    }

    #[test]
    fn test_unresolved_cluster_gets_empty_assignment() {
        let dag = dag_with_cluster(Cluster {
            unresolved: true,
            ..cluster(9999, None)
        });

        let built = build(&dag, &BTreeMap::new());
        assert_eq!(built.len(), 1, "an empty assignment completes warming");
    }

    #[test]
    fn test_no_assignment_for_unrelated_service() {
        let dag = Dag::default();
        let eps = endpoints(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"namespace": "default", "name": "web"},
            "subsets": [{
                "addresses": [{"ip": "10.0.0.1"}],
                "ports": [{"port": 8080}],
            }],
        }));

        assert!(build(&dag, &eps).is_empty());
    }
}
