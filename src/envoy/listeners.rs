//! LDS: the two synthesized listeners with their filter chains.
//!
//! The HTTPS listener carries one filter chain per secure virtual host,
//! selected by SNI. Server name matching is exact and case-sensitive
//! (that is envoy's behavior, not a choice made here). When a fallback
//! certificate is configured and some host opted in, the listener's
//! default chain terminates TLS with that certificate and serves the
//! fallback route table.

use xds_api::pb::envoy::config::accesslog::v3 as xds_accesslog;
use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::envoy::config::listener::v3 as xds_listener;
use xds_api::pb::envoy::extensions::access_loggers::file::v3 as xds_file_accesslog;
use xds_api::pb::envoy::extensions::filters::http::cors::v3 as xds_cors;
use xds_api::pb::envoy::extensions::filters::http::local_ratelimit::v3 as xds_local_ratelimit;
use xds_api::pb::envoy::extensions::filters::http::router::v3 as xds_router;
use xds_api::pb::envoy::extensions::filters::listener::proxy_protocol::v3 as xds_proxy_protocol;
use xds_api::pb::envoy::extensions::filters::listener::tls_inspector::v3 as xds_tls_inspector;
use xds_api::pb::envoy::extensions::filters::network::http_connection_manager::v3 as xds_hcm;
use xds_api::pb::envoy::extensions::filters::network::tcp_proxy::v3 as xds_tcp_proxy;
use xds_api::pb::envoy::extensions::transport_sockets::tls::v3 as xds_tls;
use xds_api::pb::google::protobuf;

use crate::dag::{
    cluster_name, Dag, Listener, SecureVirtualHost, TcpProxyTarget, TlsSecret, TlsVersion,
    FALLBACK_ROUTECONFIG_NAME, HTTPS_LISTENER_NAME, HTTPS_ROUTECONFIG_NAME, HTTP_LISTENER_NAME,
    HTTP_ROUTECONFIG_NAME,
};
use crate::envoy::routes::LOCAL_RATELIMIT_FILTER_NAME;
use crate::envoy::{ads_config_source, into_any, ListenerOptions};

pub(crate) fn build(dag: &Dag, options: &ListenerOptions) -> Vec<(String, protobuf::Any)> {
    dag.listeners
        .iter()
        .map(|listener| {
            let proto = if listener.name == HTTPS_LISTENER_NAME {
                https_listener(listener, dag.fallback_certificate.as_deref(), options)
            } else {
                http_listener(listener, options)
            };
            (listener.name.to_string(), into_any!(proto))
        })
        .collect()
}

fn http_listener(listener: &Listener, options: &ListenerOptions) -> xds_listener::Listener {
    let mut listener_filters = Vec::new();
    if options.use_proxy_protocol {
        listener_filters.push(proxy_protocol_filter());
    }

    xds_listener::Listener {
        name: listener.name.to_string(),
        address: Some(socket_address(&listener.address, listener.port)),
        filter_chains: vec![xds_listener::FilterChain {
            filters: vec![hcm_filter(HTTP_ROUTECONFIG_NAME, "ingress_http", options)],
            ..Default::default()
        }],
        listener_filters,
        ..Default::default()
    }
}

fn https_listener(
    listener: &Listener,
    fallback: Option<&TlsSecret>,
    options: &ListenerOptions,
) -> xds_listener::Listener {
    let mut listener_filters = Vec::new();
    if options.use_proxy_protocol {
        listener_filters.push(proxy_protocol_filter());
    }
    listener_filters.push(xds_listener::ListenerFilter {
        name: "envoy.filters.listener.tls_inspector".to_string(),
        config_type: Some(xds_listener::listener_filter::ConfigType::TypedConfig(
            into_any!(xds_tls_inspector::TlsInspector::default()),
        )),
        ..Default::default()
    });

    let filter_chains = listener
        .filter_chains
        .iter()
        .map(|chain| secure_chain(&chain.server_name, &chain.host, options))
        .collect();

    // the default chain catches clients whose SNI matched nothing.
    let default_filter_chain = fallback.map(|secret| xds_listener::FilterChain {
        transport_socket: Some(downstream_tls_socket(
            secret,
            TlsVersion::default(),
            None,
        )),
        filters: vec![hcm_filter(
            FALLBACK_ROUTECONFIG_NAME,
            "ingress_fallbackcert",
            options,
        )],
        name: "fallback-certificate".to_string(),
        ..Default::default()
    });

    xds_listener::Listener {
        name: listener.name.to_string(),
        address: Some(socket_address(&listener.address, listener.port)),
        filter_chains,
        default_filter_chain,
        listener_filters,
        ..Default::default()
    }
}

fn secure_chain(
    server_name: &str,
    host: &SecureVirtualHost,
    options: &ListenerOptions,
) -> xds_listener::FilterChain {
    let filter_chain_match = Some(xds_listener::FilterChainMatch {
        server_names: vec![server_name.to_string()],
        ..Default::default()
    });

    if host.passthrough {
        let tcp = host
            .tcp_proxy
            .as_ref()
            .expect("passthrough hosts always carry a tcpproxy");
        return xds_listener::FilterChain {
            filter_chain_match: Some(xds_listener::FilterChainMatch {
                server_names: vec![server_name.to_string()],
                transport_protocol: "tls".to_string(),
                ..Default::default()
            }),
            filters: vec![tcp_proxy_filter(tcp, options)],
            name: server_name.to_string(),
            ..Default::default()
        };
    }

    let secret = host
        .secret
        .as_deref()
        .expect("terminating hosts always carry a secret");

    let filters = match &host.tcp_proxy {
        Some(tcp) => vec![tcp_proxy_filter(tcp, options)],
        None => vec![hcm_filter(HTTPS_ROUTECONFIG_NAME, "ingress_https", options)],
    };

    xds_listener::FilterChain {
        filter_chain_match,
        transport_socket: Some(downstream_tls_socket(
            secret,
            host.min_tls,
            host.client_ca.as_deref(),
        )),
        filters,
        name: server_name.to_string(),
        ..Default::default()
    }
}

fn downstream_tls_socket(
    secret: &TlsSecret,
    min_tls: TlsVersion,
    client_ca: Option<&TlsSecret>,
) -> xds_core::TransportSocket {
    let context = xds_tls::DownstreamTlsContext {
        common_tls_context: Some(xds_tls::CommonTlsContext {
            tls_params: Some(xds_tls::TlsParameters {
                tls_minimum_protocol_version: tls_version(min_tls) as i32,
                tls_maximum_protocol_version: xds_tls::tls_parameters::TlsProtocol::TlSv13 as i32,
                ..Default::default()
            }),
            tls_certificates: vec![xds_tls::TlsCertificate {
                certificate_chain: Some(inline(&secret.cert_pem)),
                private_key: Some(inline(&secret.key_pem)),
                ..Default::default()
            }],
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            validation_context_type: client_ca.map(|ca| {
                xds_tls::common_tls_context::ValidationContextType::ValidationContext(
                    xds_tls::CertificateValidationContext {
                        trusted_ca: Some(inline(&ca.cert_pem)),
                        ..Default::default()
                    },
                )
            }),
            ..Default::default()
        }),
        require_client_certificate: client_ca.is_some().then_some(true),
        ..Default::default()
    };

    xds_core::TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(xds_core::transport_socket::ConfigType::TypedConfig(
            into_any!(context),
        )),
    }
}

fn hcm_filter(route_config: &str, stat_prefix: &str, options: &ListenerOptions) -> xds_listener::Filter {
    let hcm = xds_hcm::HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        codec_type: xds_hcm::http_connection_manager::CodecType::Auto as i32,
        route_specifier: Some(xds_hcm::http_connection_manager::RouteSpecifier::Rds(
            xds_hcm::Rds {
                config_source: Some(ads_config_source()),
                route_config_name: route_config.to_string(),
            },
        )),
        http_filters: vec![
            http_filter("envoy.filters.http.cors", into_any!(xds_cors::Cors::default())),
            http_filter(
                LOCAL_RATELIMIT_FILTER_NAME,
                // no bucket at the listener level: rate limits only apply
                // where a route installs one.
                into_any!(xds_local_ratelimit::LocalRateLimit {
                    stat_prefix: "http_local_rate_limiter".to_string(),
                    ..Default::default()
                }),
            ),
            http_filter(
                "envoy.filters.http.router",
                into_any!(xds_router::Router::default()),
            ),
        ],
        access_log: vec![access_log(options)],
        use_remote_address: Some(true),
        request_timeout: options.request_timeout.map(|d| protobuf::Duration {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos() as i32,
        }),
        ..Default::default()
    };

    xds_listener::Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(xds_listener::filter::ConfigType::TypedConfig(into_any!(hcm))),
    }
}

fn http_filter(name: &str, config: protobuf::Any) -> xds_hcm::HttpFilter {
    xds_hcm::HttpFilter {
        name: name.to_string(),
        config_type: Some(xds_hcm::http_filter::ConfigType::TypedConfig(config)),
        ..Default::default()
    }
}

fn tcp_proxy_filter(tcp: &TcpProxyTarget, options: &ListenerOptions) -> xds_listener::Filter {
    let cluster_specifier = if tcp.clusters.len() == 1 {
        xds_tcp_proxy::tcp_proxy::ClusterSpecifier::Cluster(cluster_name(&tcp.clusters[0].cluster))
    } else {
        xds_tcp_proxy::tcp_proxy::ClusterSpecifier::WeightedClusters(
            xds_tcp_proxy::tcp_proxy::WeightedCluster {
                clusters: tcp
                    .clusters
                    .iter()
                    .map(|weighted| {
                        xds_tcp_proxy::tcp_proxy::weighted_cluster::ClusterWeight {
                            name: cluster_name(&weighted.cluster),
                            weight: weighted.weight,
                            ..Default::default()
                        }
                    })
                    .collect(),
            },
        )
    };

    let tcp_proxy = xds_tcp_proxy::TcpProxy {
        stat_prefix: "ingress_tcp".to_string(),
        cluster_specifier: Some(cluster_specifier),
        access_log: vec![access_log(options)],
        ..Default::default()
    };

    xds_listener::Filter {
        name: "envoy.filters.network.tcp_proxy".to_string(),
        config_type: Some(xds_listener::filter::ConfigType::TypedConfig(into_any!(
            tcp_proxy
        ))),
    }
}

fn proxy_protocol_filter() -> xds_listener::ListenerFilter {
    xds_listener::ListenerFilter {
        name: "envoy.filters.listener.proxy_protocol".to_string(),
        config_type: Some(xds_listener::listener_filter::ConfigType::TypedConfig(
            into_any!(xds_proxy_protocol::ProxyProtocol::default()),
        )),
        ..Default::default()
    }
}

const JSON_ACCESS_LOG_FORMAT: &str = concat!(
    "{\"start_time\":\"%START_TIME%\",",
    "\"method\":\"%REQ(:METHOD)%\",",
    "\"path\":\"%REQ(X-ENVOY-ORIGINAL-PATH?:PATH)%\",",
    "\"authority\":\"%REQ(:AUTHORITY)%\",",
    "\"protocol\":\"%PROTOCOL%\",",
    "\"response_code\":\"%RESPONSE_CODE%\",",
    "\"bytes_received\":\"%BYTES_RECEIVED%\",",
    "\"bytes_sent\":\"%BYTES_SENT%\",",
    "\"duration\":\"%DURATION%\",",
    "\"upstream_host\":\"%UPSTREAM_HOST%\",",
    "\"user_agent\":\"%REQ(USER-AGENT)%\",",
    "\"x_forwarded_for\":\"%REQ(X-FORWARDED-FOR)%\"}\n",
);

fn access_log(options: &ListenerOptions) -> xds_accesslog::AccessLog {
    let access_log_format = options.access_log_json.then(|| {
        xds_file_accesslog::file_access_log::AccessLogFormat::LogFormat(
            xds_core::SubstitutionFormatString {
                format: Some(xds_core::substitution_format_string::Format::TextFormatSource(
                    xds_core::DataSource {
                        specifier: Some(xds_core::data_source::Specifier::InlineString(
                            JSON_ACCESS_LOG_FORMAT.to_string(),
                        )),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            },
        )
    });

    let file = xds_file_accesslog::FileAccessLog {
        path: options.access_log_path.clone(),
        access_log_format,
    };

    xds_accesslog::AccessLog {
        name: "envoy.access_loggers.file".to_string(),
        config_type: Some(xds_accesslog::access_log::ConfigType::TypedConfig(
            into_any!(file),
        )),
        ..Default::default()
    }
}

fn socket_address(address: &str, port: u16) -> xds_core::Address {
    xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(
            xds_core::SocketAddress {
                address: address.to_string(),
                port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(
                    port as u32,
                )),
                ..Default::default()
            },
        )),
    }
}

fn tls_version(version: TlsVersion) -> xds_tls::tls_parameters::TlsProtocol {
    match version {
        TlsVersion::V1_2 => xds_tls::tls_parameters::TlsProtocol::TlSv12,
        TlsVersion::V1_3 => xds_tls::tls_parameters::TlsProtocol::TlSv13,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dag::{FilterChain as DagFilterChain, VirtualHost, WeightedCluster};
    use std::sync::Arc;

    fn secure_host(fqdn: &str, passthrough: bool) -> SecureVirtualHost {
        let secret = Arc::new(TlsSecret {
            key: crate::cache::ObjectKey::new("default", "cert"),
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
        });
        let tcp = TcpProxyTarget {
            clusters: vec![WeightedCluster {
                cluster: Arc::new(crate::dag::Cluster {
                    service: crate::cache::ObjectKey::new("default", "db"),
                    port: 5432,
                    port_name: None,
                    protocol: Default::default(),
                    lb_policy: Default::default(),
                    health_check: None,
                    circuit_breakers: Default::default(),
                    sni: None,
                    unresolved: false,
                }),
                weight: 1,
            }],
        };

        SecureVirtualHost {
            vhost: VirtualHost {
                fqdn: fqdn.to_string(),
                routes: Vec::new(),
            },
            secret: (!passthrough).then_some(secret),
            min_tls: TlsVersion::V1_2,
            client_ca: None,
            fallback_certificate: false,
            passthrough,
            tcp_proxy: passthrough.then_some(tcp),
        }
    }

    fn https_dag_listener(hosts: Vec<SecureVirtualHost>) -> Listener {
        Listener {
            name: HTTPS_LISTENER_NAME,
            address: "0.0.0.0".to_string(),
            port: 8443,
            filter_chains: hosts
                .into_iter()
                .map(|host| DagFilterChain {
                    server_name: host.vhost.fqdn.clone(),
                    host,
                })
                .collect(),
        }
    }

    #[test]
    fn test_https_chains_keyed_by_sni() {
        let listener = https_dag_listener(vec![
            secure_host("a.example.com", false),
            secure_host("b.example.com", false),
        ]);
        let proto = https_listener(&listener, None, &ListenerOptions::default());

        assert_eq!(proto.filter_chains.len(), 2);
        assert_eq!(
            proto.filter_chains[0]
                .filter_chain_match
                .as_ref()
                .unwrap()
                .server_names,
            vec!["a.example.com"]
        );
        assert!(proto.default_filter_chain.is_none());
        // tls_inspector drives SNI selection.
        assert!(proto
            .listener_filters
            .iter()
            .any(|f| f.name == "envoy.filters.listener.tls_inspector"));
    }

    #[test]
    fn test_passthrough_chain_has_no_tls_termination() {
        let listener = https_dag_listener(vec![secure_host("db.example.com", true)]);
        let proto = https_listener(&listener, None, &ListenerOptions::default());

        let chain = &proto.filter_chains[0];
        assert!(chain.transport_socket.is_none());
        assert_eq!(
            chain.filter_chain_match.as_ref().unwrap().transport_protocol,
            "tls"
        );
        assert_eq!(chain.filters[0].name, "envoy.filters.network.tcp_proxy");
    }

    #[test]
    fn test_fallback_certificate_becomes_default_chain() {
        let fallback = TlsSecret {
            key: crate::cache::ObjectKey::new("certs", "fallback"),
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
        };
        let listener = https_dag_listener(vec![secure_host("a.example.com", false)]);
        let proto = https_listener(&listener, Some(&fallback), &ListenerOptions::default());

        let default_chain = proto.default_filter_chain.unwrap();
        assert!(default_chain.filter_chain_match.is_none());
        assert!(default_chain.transport_socket.is_some());
    }

    #[test]
    fn test_proxy_protocol_ordering() {
        let options = ListenerOptions {
            use_proxy_protocol: true,
            ..Default::default()
        };
        let listener = https_dag_listener(vec![secure_host("a.example.com", false)]);
        let proto = https_listener(&listener, None, &options);

        let names: Vec<&str> = proto.listener_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "envoy.filters.listener.proxy_protocol",
                "envoy.filters.listener.tls_inspector",
            ]
        );
    }

    #[test]
    fn test_http_listener_shape() {
        let listener = Listener {
            name: HTTP_LISTENER_NAME,
            address: "0.0.0.0".to_string(),
            port: 8080,
            filter_chains: Vec::new(),
        };
        let proto = http_listener(&listener, &ListenerOptions::default());

        assert_eq!(proto.filter_chains.len(), 1);
        assert_eq!(
            proto.filter_chains[0].filters[0].name,
            "envoy.filters.network.http_connection_manager"
        );
    }
}
