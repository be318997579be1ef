//! Command line flags and the typed configuration record they produce.
//!
//! Flags override environment variables (the `env` attribute's
//! semantics); there is no configuration file.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::cache::ObjectKey;
use crate::dag::{BuilderConfig, TlsVersion};
use crate::envoy::ListenerOptions;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum AccessLogFormat {
    #[default]
    Envoy,
    Json,
}

/// a kubernetes ingress control plane speaking xDS
#[derive(Parser, Debug)]
#[command(version)]
pub(crate) struct Args {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    pub log_pretty: bool,

    /// The address the xDS gRPC server listens on.
    #[arg(long, env = "GANTRY_XDS_ADDR", default_value = "0.0.0.0:8001")]
    pub xds_addr: String,

    /// The address the prometheus exporter listens on.
    #[arg(long, env = "GANTRY_METRICS_ADDR", default_value = "0.0.0.0:8000")]
    pub metrics_addr: String,

    /// Serve xDS over plaintext gRPC. Without this flag the TLS
    /// credential flags are required.
    #[arg(long)]
    pub permit_insecure_grpc: bool,

    /// Path to the server certificate presented to envoy.
    #[arg(long, env = "GANTRY_GRPC_CERT")]
    pub grpc_cert: Option<PathBuf>,

    /// Path to the server private key.
    #[arg(long, env = "GANTRY_GRPC_KEY")]
    pub grpc_key: Option<PathBuf>,

    /// Path to the CA bundle used to verify envoy client certificates.
    #[arg(long, env = "GANTRY_GRPC_CA")]
    pub grpc_ca: Option<PathBuf>,

    /// Only admit Ingress/HTTPProxy objects with this ingress class.
    /// When unset, unclassed objects and the class "gantry" match.
    #[arg(long, env = "GANTRY_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    /// Namespaces allowed to hold root HTTPProxies. Empty allows all.
    #[arg(long, env = "GANTRY_ROOT_NAMESPACES", value_delimiter = ',')]
    pub root_namespaces: Vec<String>,

    /// Run without leader election; every replica writes status.
    #[arg(long)]
    pub disable_leader_election: bool,

    /// Namespace holding the leader-election lease.
    #[arg(long, env = "GANTRY_NAMESPACE", default_value = "gantry-system")]
    pub leader_election_namespace: String,

    /// The `namespace/name` of the Gateway whose HTTPRoutes to program.
    #[arg(long, env = "GANTRY_GATEWAY")]
    pub gateway: Option<String>,

    /// The address the generated HTTP listener binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub envoy_http_address: String,

    #[arg(long, default_value_t = 8080)]
    pub envoy_http_port: u16,

    /// The address the generated HTTPS listener binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub envoy_https_address: String,

    #[arg(long, default_value_t = 8443)]
    pub envoy_https_port: u16,

    #[arg(long, default_value = "/dev/stdout")]
    pub access_log_path: String,

    #[arg(long, value_enum, default_value = "envoy")]
    pub access_log_format: AccessLogFormat,

    /// Expect PROXY protocol headers on the generated listeners.
    #[arg(long)]
    pub use_proxy_protocol: bool,

    /// Default downstream request timeout, e.g. "30s". Unset means the
    /// proxy default.
    #[arg(long, env = "GANTRY_REQUEST_TIMEOUT")]
    pub request_timeout: Option<String>,

    /// The floor for per-vhost minimum TLS versions: "1.2" or "1.3".
    #[arg(long, env = "GANTRY_MINIMUM_TLS_VERSION", default_value = "1.2")]
    pub minimum_tls_version: String,

    /// `namespace/name` of the secret served when SNI matches no vhost,
    /// for vhosts that opt in.
    #[arg(long, env = "GANTRY_FALLBACK_CERTIFICATE")]
    pub fallback_certificate: Option<String>,

    /// Bound on HTTPProxy include chains.
    #[arg(long, default_value_t = 100)]
    pub max_include_depth: usize,
}

impl Args {
    pub(crate) fn builder_config(&self) -> anyhow::Result<BuilderConfig> {
        let minimum_tls_version = TlsVersion::parse(&self.minimum_tls_version)
            .with_context(|| {
                format!(
                    "--minimum-tls-version must be \"1.2\" or \"1.3\", got {:?}",
                    self.minimum_tls_version
                )
            })?;

        Ok(BuilderConfig {
            minimum_tls_version,
            fallback_certificate: self
                .fallback_certificate
                .as_deref()
                .map(parse_object_ref)
                .transpose()
                .context("--fallback-certificate")?,
            max_include_depth: self.max_include_depth,
            gateway_ref: self
                .gateway
                .as_deref()
                .map(parse_object_ref)
                .transpose()
                .context("--gateway")?,
            http_address: self.envoy_http_address.clone(),
            http_port: self.envoy_http_port,
            https_address: self.envoy_https_address.clone(),
            https_port: self.envoy_https_port,
        })
    }

    pub(crate) fn listener_options(&self) -> anyhow::Result<ListenerOptions> {
        let request_timeout = self
            .request_timeout
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("--request-timeout")?;

        Ok(ListenerOptions {
            access_log_path: self.access_log_path.clone(),
            access_log_json: self.access_log_format == AccessLogFormat::Json,
            use_proxy_protocol: self.use_proxy_protocol,
            request_timeout,
        })
    }

    pub(crate) fn xds_addr(&self) -> anyhow::Result<SocketAddr> {
        self.xds_addr.parse().context("--xds-addr")
    }
}

fn parse_object_ref(reference: &str) -> anyhow::Result<ObjectKey> {
    match reference.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok(ObjectKey::new(namespace, name))
        }
        _ => anyhow::bail!("expected namespace/name, got {reference:?}"),
    }
}
