//! CDS: DAG clusters to `envoy.config.cluster.v3.Cluster`.

use xds_api::pb::envoy::config::cluster::v3 as xds_cluster;
use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::envoy::extensions::transport_sockets::tls::v3 as xds_tls;
use xds_api::pb::google::protobuf;

use crate::dag::{Cluster, Dag, LbPolicy, Protocol};
use crate::envoy::{ads_config_source, into_any, load_assignment_name};

pub(crate) fn build(dag: &Dag) -> Vec<(String, protobuf::Any)> {
    dag.clusters
        .iter()
        .map(|(name, cluster)| {
            let proto = cluster_proto(name, cluster);
            (name.clone(), into_any!(proto))
        })
        .collect()
}

fn cluster_proto(name: &str, cluster: &Cluster) -> xds_cluster::Cluster {
    let mut proto = xds_cluster::Cluster {
        name: name.to_string(),
        connect_timeout: Some(protobuf::Duration {
            seconds: 0,
            nanos: 250_000_000,
        }),
        lb_policy: lb_policy(cluster.lb_policy) as i32,
        cluster_discovery_type: Some(xds_cluster::cluster::ClusterDiscoveryType::Type(
            xds_cluster::cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(xds_cluster::cluster::EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: load_assignment_name(cluster),
        }),
        ..Default::default()
    };

    if let Some(hc) = &cluster.health_check {
        proto.health_checks = vec![xds_core::HealthCheck {
            timeout: Some(duration(hc.timeout)),
            interval: Some(duration(hc.interval)),
            unhealthy_threshold: Some(hc.unhealthy_threshold),
            healthy_threshold: Some(hc.healthy_threshold),
            health_checker: Some(xds_core::health_check::HealthChecker::HttpHealthCheck(
                xds_core::health_check::HttpHealthCheck {
                    host: hc.host.clone().unwrap_or_default(),
                    path: hc.path.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }];
    }

    if !cluster.circuit_breakers.is_default() {
        let cb = &cluster.circuit_breakers;
        proto.circuit_breakers = Some(xds_cluster::CircuitBreakers {
            thresholds: vec![xds_cluster::circuit_breakers::Thresholds {
                max_connections: cb.max_connections,
                max_pending_requests: cb.max_pending_requests,
                max_requests: cb.max_requests,
                max_retries: cb.max_retries,
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    match cluster.protocol {
        Protocol::Http1 => {}
        Protocol::H2c => {
            proto.http2_protocol_options = Some(Default::default());
        }
        Protocol::H2 => {
            proto.http2_protocol_options = Some(Default::default());
            proto.transport_socket = Some(upstream_tls(cluster, &["h2"]));
        }
        Protocol::Tls => {
            proto.transport_socket = Some(upstream_tls(cluster, &[]));
        }
    }

    proto
}

fn upstream_tls(cluster: &Cluster, alpn: &[&str]) -> xds_core::TransportSocket {
    let context = xds_tls::UpstreamTlsContext {
        common_tls_context: Some(xds_tls::CommonTlsContext {
            alpn_protocols: alpn.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }),
        sni: cluster.sni.clone().unwrap_or_default(),
        ..Default::default()
    };

    xds_core::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(xds_core::transport_socket::ConfigType::TypedConfig(
            into_any!(context),
        )),
    }
}

fn lb_policy(policy: LbPolicy) -> xds_cluster::cluster::LbPolicy {
    match policy {
        LbPolicy::RoundRobin => xds_cluster::cluster::LbPolicy::RoundRobin,
        LbPolicy::WeightedLeastRequest => xds_cluster::cluster::LbPolicy::LeastRequest,
        LbPolicy::Random => xds_cluster::cluster::LbPolicy::Random,
        LbPolicy::RingHash => xds_cluster::cluster::LbPolicy::RingHash,
        LbPolicy::Maglev => xds_cluster::cluster::LbPolicy::Maglev,
    }
}

fn duration(d: std::time::Duration) -> protobuf::Duration {
    protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}
