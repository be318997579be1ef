//! RDS: virtual hosts and routes to `RouteConfiguration`s.
//!
//! Three configurations are produced: `ingress_http` for the plain
//! listener, `ingress_https` for SNI-terminated traffic, and
//! `ingress_fallbackcert` for the fallback-certificate chain. The HTTPS
//! tables end with a catch-all virtual host answering 421: a client that
//! negotiated SNI for one host and then sent another Host header is
//! misdirected, not lost.

use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::envoy::config::route::v3 as xds_route;
use xds_api::pb::envoy::extensions::filters::http::local_ratelimit::v3 as xds_local_ratelimit;
use xds_api::pb::envoy::r#type::matcher::v3 as xds_matcher;
use xds_api::pb::envoy::r#type::v3 as xds_type;
use xds_api::pb::google::protobuf;

use crate::dag::{
    cluster_name, Dag, HeaderMatchKind, PathMatch, QueryParamMatchKind, RateLimitPolicy, Route,
    Timeout, VirtualHost, FALLBACK_ROUTECONFIG_NAME, HTTPS_ROUTECONFIG_NAME, HTTP_ROUTECONFIG_NAME,
};
use crate::envoy::into_any;

pub(crate) const LOCAL_RATELIMIT_FILTER_NAME: &str = "envoy.filters.http.local_ratelimit";

pub(crate) fn build(dag: &Dag) -> Vec<(String, protobuf::Any)> {
    let mut out = Vec::new();

    if !dag.http_hosts.is_empty() {
        let vhosts: Vec<_> = dag
            .http_hosts
            .values()
            .map(|vhost| virtual_host_proto(vhost))
            .collect();
        let config = xds_route::RouteConfiguration {
            name: HTTP_ROUTECONFIG_NAME.to_string(),
            virtual_hosts: vhosts,
            ..Default::default()
        };
        out.push((HTTP_ROUTECONFIG_NAME.to_string(), into_any!(config)));
    }

    let secure: Vec<_> = dag
        .https_hosts
        .values()
        .filter(|host| !host.passthrough && !host.vhost.routes.is_empty())
        .collect();
    if !secure.is_empty() {
        let mut vhosts: Vec<_> = secure.iter().map(|host| virtual_host_proto(&host.vhost)).collect();
        vhosts.push(misdirected_vhost());
        let config = xds_route::RouteConfiguration {
            name: HTTPS_ROUTECONFIG_NAME.to_string(),
            virtual_hosts: vhosts,
            ..Default::default()
        };
        out.push((HTTPS_ROUTECONFIG_NAME.to_string(), into_any!(config)));
    }

    if dag.fallback_certificate.is_some() {
        let mut vhosts: Vec<_> = dag
            .https_hosts
            .values()
            .filter(|host| host.fallback_certificate && !host.vhost.routes.is_empty())
            .map(|host| virtual_host_proto(&host.vhost))
            .collect();
        vhosts.push(misdirected_vhost());
        let config = xds_route::RouteConfiguration {
            name: FALLBACK_ROUTECONFIG_NAME.to_string(),
            virtual_hosts: vhosts,
            ..Default::default()
        };
        out.push((FALLBACK_ROUTECONFIG_NAME.to_string(), into_any!(config)));
    }

    out
}

fn virtual_host_proto(vhost: &VirtualHost) -> xds_route::VirtualHost {
    // a wildcard host matches exactly one DNS label. envoy's wildcard
    // domains match one or more, so the single-label rule rides on an
    // :authority matcher added to every route.
    let authority = wildcard_authority_matcher(&vhost.fqdn);

    xds_route::VirtualHost {
        name: vhost.fqdn.clone(),
        domains: domains(&vhost.fqdn),
        routes: vhost
            .routes
            .iter()
            .map(|route| route_proto(route, authority.clone()))
            .collect(),
        ..Default::default()
    }
}

/// Host matching is port-insensitive: `fqdn:*` picks up any port
/// suffix.
fn domains(fqdn: &str) -> Vec<String> {
    if fqdn == "*" {
        return vec!["*".to_string()];
    }
    vec![fqdn.to_string(), format!("{fqdn}:*")]
}

fn wildcard_authority_matcher(fqdn: &str) -> Option<xds_route::HeaderMatcher> {
    let rest = fqdn.strip_prefix("*.")?;

    let mut escaped = String::new();
    for c in rest.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    let regex = format!("^[a-z0-9]([-a-z0-9]*[a-z0-9])?\\.{escaped}(:[0-9]+)?$");

    Some(xds_route::HeaderMatcher {
        name: ":authority".to_string(),
        header_match_specifier: Some(
            xds_route::header_matcher::HeaderMatchSpecifier::StringMatch(safe_regex(&regex)),
        ),
        ..Default::default()
    })
}

fn misdirected_vhost() -> xds_route::VirtualHost {
    xds_route::VirtualHost {
        name: "misdirected".to_string(),
        domains: vec!["*".to_string()],
        routes: vec![xds_route::Route {
            r#match: Some(xds_route::RouteMatch {
                path_specifier: Some(xds_route::route_match::PathSpecifier::Prefix(
                    "/".to_string(),
                )),
                ..Default::default()
            }),
            action: Some(xds_route::route::Action::DirectResponse(
                xds_route::DirectResponseAction {
                    status: 421,
                    ..Default::default()
                },
            )),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn route_proto(route: &Route, extra_header: Option<xds_route::HeaderMatcher>) -> xds_route::Route {
    let mut headers: Vec<xds_route::HeaderMatcher> = route
        .headers
        .iter()
        .map(|h| {
            let specifier = match &h.kind {
                HeaderMatchKind::Exact(v) => {
                    xds_route::header_matcher::HeaderMatchSpecifier::StringMatch(exact_string(v))
                }
                HeaderMatchKind::Contains(v) => {
                    xds_route::header_matcher::HeaderMatchSpecifier::StringMatch(
                        xds_matcher::StringMatcher {
                            match_pattern: Some(
                                xds_matcher::string_matcher::MatchPattern::Contains(v.clone()),
                            ),
                            ..Default::default()
                        },
                    )
                }
                HeaderMatchKind::Regex(v) => {
                    xds_route::header_matcher::HeaderMatchSpecifier::StringMatch(safe_regex(v))
                }
                HeaderMatchKind::Present => {
                    xds_route::header_matcher::HeaderMatchSpecifier::PresentMatch(true)
                }
            };
            xds_route::HeaderMatcher {
                name: h.name.clone(),
                invert_match: h.invert,
                header_match_specifier: Some(specifier),
                ..Default::default()
            }
        })
        .chain(extra_header)
        .collect();

    // part of the determinism contract: header matchers come out in a
    // fixed order no matter how the conditions were written.
    headers.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| {
                format!("{:?}", a.header_match_specifier)
                    .cmp(&format!("{:?}", b.header_match_specifier))
            })
    });

    let query_parameters = route
        .query_params
        .iter()
        .map(|q| xds_route::QueryParameterMatcher {
            name: q.name.clone(),
            query_parameter_match_specifier: Some(match &q.kind {
                QueryParamMatchKind::Exact { value, ignore_case } => {
                    xds_route::query_parameter_matcher::QueryParameterMatchSpecifier::StringMatch(
                        xds_matcher::StringMatcher {
                            match_pattern: Some(xds_matcher::string_matcher::MatchPattern::Exact(
                                value.clone(),
                            )),
                            ignore_case: *ignore_case,
                        },
                    )
                }
                QueryParamMatchKind::Regex(regex) => {
                    xds_route::query_parameter_matcher::QueryParameterMatchSpecifier::StringMatch(
                        safe_regex(regex),
                    )
                }
                QueryParamMatchKind::Present => {
                    xds_route::query_parameter_matcher::QueryParameterMatchSpecifier::PresentMatch(
                        true,
                    )
                }
            }),
        })
        .collect();

    let path_specifier = match &route.path {
        PathMatch::Prefix(p) => xds_route::route_match::PathSpecifier::Prefix(p.clone()),
        PathMatch::Exact(p) => xds_route::route_match::PathSpecifier::Path(p.clone()),
        PathMatch::Regex(p) => {
            xds_route::route_match::PathSpecifier::SafeRegex(regex_matcher(p))
        }
    };

    let mut proto = xds_route::Route {
        r#match: Some(xds_route::RouteMatch {
            path_specifier: Some(path_specifier),
            headers,
            query_parameters,
            ..Default::default()
        }),
        ..Default::default()
    };

    if route.https_upgrade {
        proto.action = Some(xds_route::route::Action::Redirect(
            xds_route::RedirectAction {
                scheme_rewrite_specifier: Some(
                    xds_route::redirect_action::SchemeRewriteSpecifier::HttpsRedirect(true),
                ),
                ..Default::default()
            },
        ));
        return proto;
    }

    proto.action = Some(xds_route::route::Action::Route(route_action(route)));

    for (name, value) in &route.request_headers.set {
        proto.request_headers_to_add.push(header_value_option(name, value));
    }
    proto.request_headers_to_remove = route.request_headers.remove.clone();
    for (name, value) in &route.response_headers.set {
        proto.response_headers_to_add.push(header_value_option(name, value));
    }
    proto.response_headers_to_remove = route.response_headers.remove.clone();

    if let Some(rl) = &route.rate_limit {
        proto.typed_per_filter_config = [(
            LOCAL_RATELIMIT_FILTER_NAME.to_string(),
            into_any!(local_rate_limit(rl)),
        )]
        .into_iter()
        .collect();
    }

    proto
}

fn route_action(route: &Route) -> xds_route::RouteAction {
    let cluster_specifier = if route.clusters.len() == 1 {
        xds_route::route_action::ClusterSpecifier::Cluster(cluster_name(
            &route.clusters[0].cluster,
        ))
    } else {
        let clusters = route
            .clusters
            .iter()
            .map(|weighted| xds_route::weighted_cluster::ClusterWeight {
                name: cluster_name(&weighted.cluster),
                weight: Some(weighted.weight),
                ..Default::default()
            })
            .collect();
        xds_route::route_action::ClusterSpecifier::WeightedClusters(xds_route::WeightedCluster {
            clusters,
            ..Default::default()
        })
    };

    let mut action = xds_route::RouteAction {
        cluster_specifier: Some(cluster_specifier),
        timeout: timeout(route.timeout_policy.response),
        idle_timeout: timeout(route.timeout_policy.idle),
        ..Default::default()
    };

    if let Some(retry) = &route.retry_policy {
        action.retry_policy = Some(xds_route::RetryPolicy {
            retry_on: "5xx".to_string(),
            num_retries: Some(retry.count),
            per_try_timeout: retry.per_try_timeout.map(proto_duration),
            ..Default::default()
        });
    }

    if let Some(mirror) = &route.mirror {
        action.request_mirror_policies = vec![xds_route::route_action::RequestMirrorPolicy {
            cluster: cluster_name(mirror),
            ..Default::default()
        }];
    }

    if let Some(prefix) = &route.prefix_rewrite {
        action.prefix_rewrite = prefix.clone();
    }

    if route.websocket {
        action.upgrade_configs = vec![xds_route::route_action::UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }];
    }

    if let Some(cors) = &route.cors {
        action.cors = Some(cors_policy(cors));
    }

    action
}

fn cors_policy(cors: &crate::dag::CorsPolicy) -> xds_route::CorsPolicy {
    xds_route::CorsPolicy {
        allow_origin_string_match: cors.allow_origin.iter().map(|o| exact_string(o)).collect(),
        allow_methods: cors.allow_methods.join(","),
        allow_headers: cors.allow_headers.join(","),
        expose_headers: cors.expose_headers.join(","),
        max_age: cors
            .max_age
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default(),
        allow_credentials: cors.allow_credentials.then_some(true),
        ..Default::default()
    }
}

fn local_rate_limit(policy: &RateLimitPolicy) -> xds_local_ratelimit::LocalRateLimit {
    let fill_interval = match policy.unit {
        crate::dag::RateLimitUnit::Second => 1,
        crate::dag::RateLimitUnit::Minute => 60,
        crate::dag::RateLimitUnit::Hour => 3600,
    };

    xds_local_ratelimit::LocalRateLimit {
        stat_prefix: "vhost_rate_limit".to_string(),
        token_bucket: Some(xds_type::TokenBucket {
            max_tokens: policy.requests,
            tokens_per_fill: Some(policy.requests),
            fill_interval: Some(protobuf::Duration {
                seconds: fill_interval,
                nanos: 0,
            }),
        }),
        filter_enabled: Some(always_on("local_ratelimit_enabled")),
        filter_enforced: Some(always_on("local_ratelimit_enforced")),
        ..Default::default()
    }
}

fn always_on(runtime_key: &str) -> xds_core::RuntimeFractionalPercent {
    xds_core::RuntimeFractionalPercent {
        default_value: Some(xds_type::FractionalPercent {
            numerator: 100,
            denominator: xds_type::fractional_percent::DenominatorType::Hundred as i32,
        }),
        runtime_key: runtime_key.to_string(),
    }
}

fn header_value_option(name: &str, value: &str) -> xds_core::HeaderValueOption {
    xds_core::HeaderValueOption {
        header: Some(xds_core::HeaderValue {
            key: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        append_action: xds_core::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd
            as i32,
        ..Default::default()
    }
}

fn exact_string(value: &str) -> xds_matcher::StringMatcher {
    xds_matcher::StringMatcher {
        match_pattern: Some(xds_matcher::string_matcher::MatchPattern::Exact(
            value.to_string(),
        )),
        ..Default::default()
    }
}

fn safe_regex(regex: &str) -> xds_matcher::StringMatcher {
    xds_matcher::StringMatcher {
        match_pattern: Some(xds_matcher::string_matcher::MatchPattern::SafeRegex(
            regex_matcher(regex),
        )),
        ..Default::default()
    }
}

fn regex_matcher(regex: &str) -> xds_matcher::RegexMatcher {
    xds_matcher::RegexMatcher {
        regex: regex.to_string(),
        ..Default::default()
    }
}

fn timeout(t: Timeout) -> Option<protobuf::Duration> {
    match t {
        Timeout::Default => None,
        // envoy takes an explicit zero to mean "no timeout".
        Timeout::Disabled => Some(protobuf::Duration {
            seconds: 0,
            nanos: 0,
        }),
        Timeout::Duration(d) => Some(proto_duration(d)),
    }
}

fn proto_duration(d: std::time::Duration) -> protobuf::Duration {
    protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::ObjectKey;
    use crate::dag::{
        Cluster, HeaderMatch, LbPolicy, Protocol, TimeoutPolicy, WeightedCluster,
    };
    use std::sync::Arc;

    fn test_cluster(name: &str) -> Arc<Cluster> {
        Arc::new(Cluster {
            service: ObjectKey::new("default", name),
            port: 80,
            port_name: None,
            protocol: Protocol::Http1,
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            circuit_breakers: Default::default(),
            sni: None,
            unresolved: false,
        })
    }

    fn test_route(clusters: Vec<WeightedCluster>) -> Route {
        Route {
            path: PathMatch::Prefix("/".to_string()),
            headers: Vec::new(),
            query_params: Vec::new(),
            clusters,
            mirror: None,
            timeout_policy: TimeoutPolicy::default(),
            retry_policy: None,
            prefix_rewrite: None,
            request_headers: Default::default(),
            response_headers: Default::default(),
            rate_limit: None,
            cors: None,
            websocket: false,
            https_upgrade: false,
            auth_disabled: false,
        }
    }

    #[test]
    fn test_single_cluster_routes_by_name() {
        let route = test_route(vec![WeightedCluster {
            cluster: test_cluster("web"),
            weight: 1,
        }]);
        let action = route_action(&route);

        match action.cluster_specifier.unwrap() {
            xds_route::route_action::ClusterSpecifier::Cluster(name) => {
                assert_eq!(name, "default/web/80")
            }
            other => panic!("expected a plain cluster, got {other:?}"),
        }
    }

    #[test]
    fn test_weighted_clusters() {
        let route = test_route(vec![
            WeightedCluster {
                cluster: test_cluster("v1"),
                weight: 90,
            },
            WeightedCluster {
                cluster: test_cluster("v2"),
                weight: 10,
            },
        ]);
        let action = route_action(&route);

        match action.cluster_specifier.unwrap() {
            xds_route::route_action::ClusterSpecifier::WeightedClusters(wc) => {
                assert_eq!(wc.clusters.len(), 2);
                assert_eq!(wc.clusters[0].weight, Some(90));
            }
            other => panic!("expected weighted clusters, got {other:?}"),
        }
    }

    #[test]
    fn test_https_upgrade_redirects() {
        let mut route = test_route(vec![WeightedCluster {
            cluster: test_cluster("web"),
            weight: 1,
        }]);
        route.https_upgrade = true;

        let proto = route_proto(&route, None);
        assert!(matches!(
            proto.action,
            Some(xds_route::route::Action::Redirect(_))
        ));
    }

    #[test]
    fn test_timeout_mapping() {
        assert_eq!(timeout(Timeout::Default), None);
        assert_eq!(
            timeout(Timeout::Disabled),
            Some(protobuf::Duration { seconds: 0, nanos: 0 })
        );
        assert_eq!(
            timeout(Timeout::Duration(std::time::Duration::from_secs(90))),
            Some(protobuf::Duration { seconds: 90, nanos: 0 })
        );
    }

    #[test]
    fn test_domains_are_port_insensitive() {
        assert_eq!(domains("echo.example.com"), vec![
            "echo.example.com".to_string(),
            "echo.example.com:*".to_string(),
        ]);
        assert_eq!(domains("*"), vec!["*".to_string()]);
    }

    #[test]
    fn test_wildcard_authority_matches_one_label() {
        let matcher = wildcard_authority_matcher("*.example.com").unwrap();
        let xds_route::header_matcher::HeaderMatchSpecifier::StringMatch(sm) =
            matcher.header_match_specifier.unwrap()
        else {
            panic!("expected a string match");
        };
        let xds_matcher::string_matcher::MatchPattern::SafeRegex(rx) = sm.match_pattern.unwrap()
        else {
            panic!("expected a safe regex");
        };

        // one label matches, two don't, dots are literal.
        assert_eq!(rx.regex, "^[a-z0-9]([-a-z0-9]*[a-z0-9])?\\.example\\.com(:[0-9]+)?$");
        assert!(wildcard_authority_matcher("plain.example.com").is_none());
    }

    #[test]
    fn test_header_matchers_sorted_by_name() {
        let mut route = test_route(vec![WeightedCluster {
            cluster: test_cluster("web"),
            weight: 1,
        }]);
        route.headers = vec![
            HeaderMatch {
                name: "x-zulu".to_string(),
                kind: HeaderMatchKind::Present,
                invert: false,
            },
            HeaderMatch {
                name: "x-alpha".to_string(),
                kind: HeaderMatchKind::Exact("1".to_string()),
                invert: false,
            },
        ];

        let proto = route_proto(&route, None);
        let names: Vec<&str> = proto
            .r#match
            .as_ref()
            .unwrap()
            .headers
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["x-alpha", "x-zulu"]);
    }

    #[test]
    fn test_https_table_ends_with_421() {
        let vhost = misdirected_vhost();
        assert_eq!(vhost.domains, vec!["*"]);
        match &vhost.routes[0].action {
            Some(xds_route::route::Action::DirectResponse(dr)) => assert_eq!(dr.status, 421),
            other => panic!("expected a direct response, got {other:?}"),
        }
    }
}
