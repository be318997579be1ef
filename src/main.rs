use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kube::runtime::reflector::{ObjectRef, Store};
use tonic::{server::NamedService, transport::Server};
use tracing_subscriber::EnvFilter;
use xds_api::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer,
    discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer,
    endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer,
    listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer,
    route::v3::route_discovery_service_server::RouteDiscoveryServiceServer,
};

mod apis;
mod cache;
mod coalescer;
mod config;
mod dag;
mod envoy;
mod grpc_access;
mod k8s;
mod leader;
mod metrics;
mod status;
mod xds;

use cache::{Kind, KubeObject, KubernetesCache, ObjectKey};
use coalescer::EventHandler;
use k8s::{KubeResource, Watch};
use xds::AdsServer;

#[tokio::main]
async fn main() {
    let args = config::Args::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "gantry=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder.json().flatten_event(true).with_span_list(false).init();
    }
}

async fn run(args: config::Args) -> anyhow::Result<()> {
    let builder_config = args.builder_config()?;
    let listener_options = args.listener_options()?;
    let xds_addr = args.xds_addr()?;

    crate::metrics::install_prom(&args.metrics_addr)?;

    let client = kube::Client::try_default()
        .await
        .context("building a kubernetes client")?;

    let leadership = if args.disable_leader_election {
        leader::Leadership::standalone()
    } else {
        leader::Leadership::elect(
            client.clone(),
            args.leader_election_namespace.clone(),
            leader::identity(),
        )
    };

    let object_cache = Arc::new(RwLock::new(KubernetesCache::new(
        args.ingress_class.clone(),
        args.root_namespaces.clone(),
    )));
    let (snapshot, writer) = xds::new_snapshot();
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<Kind>(1024);
    let (status_tx, status_rx) = tokio::sync::mpsc::channel(16);

    // the rebuild task: coalesces events, builds the DAG, updates the
    // resource caches and forwards statuses.
    tokio::spawn(
        EventHandler::new(
            event_rx,
            object_cache.clone(),
            dag::Builder::new(builder_config.clone()),
            listener_options,
            writer,
            status_tx,
            leadership.subscribe(),
        )
        .run(),
    );

    tokio::spawn(
        status::StatusWriter::new(client.clone(), status_rx, builder_config.gateway_ref.clone())
            .run(),
    );

    let ingest = ingest(&client, object_cache, event_tx);
    let serve = serve(&args, xds_addr, snapshot);

    tokio::select! {
        result = ingest => result,
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            Ok(())
        }
    }
}

async fn serve(
    args: &config::Args,
    addr: std::net::SocketAddr,
    snapshot: xds::SnapshotCache,
) -> anyhow::Result<()> {
    // tonic server structs have a ::NAME string that we register with
    // the reflection server so that reflection only shows what we're
    // implementing, instead of EVERY single xDS api.
    macro_rules! server_with_reflection {
        ($ads_server:expr => [$($service_type:tt),* $(,)?] $(,)?) => {{
            let reflection = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET)
                .with_service_name("grpc.reflection.v1alpha.ServerReflection");

            let mut server = grpc_server(args)?.layer(grpc_access::layer!());

            $(
                let svc = $service_type::new($ads_server.clone());
                let reflection = reflection.with_service_name($service_type::<AdsServer>::NAME);
                let server = server.add_service(svc);
            )*

            let server = server.add_service(reflection.build_v1alpha()?);
            server
        }};
    }

    let ads = AdsServer::new(snapshot);
    let server = server_with_reflection!(
        ads => [
            AggregatedDiscoveryServiceServer,
            ListenerDiscoveryServiceServer,
            RouteDiscoveryServiceServer,
            ClusterDiscoveryServiceServer,
            EndpointDiscoveryServiceServer,
        ],
    );

    server.serve(addr).await?;
    Ok(())
}

/// Build the tonic server, TLS-terminated unless the operator opted into
/// plaintext.
fn grpc_server(args: &config::Args) -> anyhow::Result<Server> {
    match (&args.grpc_cert, &args.grpc_key) {
        (Some(cert), Some(key)) => {
            let cert = std::fs::read(cert).context("reading --grpc-cert")?;
            let key = std::fs::read(key).context("reading --grpc-key")?;
            let mut tls = tonic::transport::ServerTlsConfig::new()
                .identity(tonic::transport::Identity::from_pem(cert, key));
            if let Some(ca) = &args.grpc_ca {
                let ca = std::fs::read(ca).context("reading --grpc-ca")?;
                tls = tls.client_ca_root(tonic::transport::Certificate::from_pem(ca));
            }
            Ok(Server::builder().tls_config(tls)?)
        }
        (None, None) if args.permit_insecure_grpc => Ok(Server::builder()),
        _ => anyhow::bail!(
            "provide --grpc-cert and --grpc-key, or explicitly allow plaintext with --permit-insecure-grpc"
        ),
    }
}

/// Start every watch and the single fan-in task that owns the object
/// cache.
async fn ingest(
    client: &kube::Client,
    object_cache: Arc<RwLock<KubernetesCache>>,
    event_tx: tokio::sync::mpsc::Sender<Kind>,
) -> anyhow::Result<()> {
    use gateway_api::apis::standard::{gateways::Gateway, httproutes::HTTPRoute};
    use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
    use k8s_openapi::api::networking::v1::Ingress;

    let debounce = Duration::from_millis(250);

    let (services, run_services) = k8s::watch::<Service>(kube::Api::all(client.clone()), debounce);
    let (endpoints, run_endpoints) =
        k8s::watch::<Endpoints>(kube::Api::all(client.clone()), debounce);
    let (secrets, run_secrets) = k8s::watch::<Secret>(kube::Api::all(client.clone()), debounce);
    let (ingresses, run_ingresses) =
        k8s::watch::<Ingress>(kube::Api::all(client.clone()), debounce);
    let (proxies, run_proxies) =
        k8s::watch::<apis::HTTPProxy>(kube::Api::all(client.clone()), debounce);
    let (delegations, run_delegations) =
        k8s::watch::<apis::TLSCertificateDelegation>(kube::Api::all(client.clone()), debounce);

    // the Gateway APIs may not be installed; watch them best-effort, the
    // way the core APIs never are.
    let (gateways, run_gateways) = k8s::watch::<Gateway>(kube::Api::all(client.clone()), debounce);
    let run_gateways = tolerate_missing_api(run_gateways, "Gateway");
    let (httproutes, run_httproutes) =
        k8s::watch::<HTTPRoute>(kube::Api::all(client.clone()), debounce);
    let run_httproutes = tolerate_missing_api(run_httproutes, "HTTPRoute");

    // a single fan-in task is the cache's only writer.
    tokio::spawn(fan_in(
        object_cache,
        event_tx,
        FanIn {
            services,
            endpoints,
            secrets,
            ingresses,
            proxies,
            delegations,
            gateways,
            httproutes,
        },
    ));

    tokio::try_join!(
        flatten(run_services),
        flatten(run_endpoints),
        flatten(run_secrets),
        flatten(run_ingresses),
        flatten(run_proxies),
        flatten(run_delegations),
        run_gateways,
        run_httproutes,
    )?;

    Ok(())
}

async fn flatten<F>(watch: F) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), kube::runtime::watcher::Error>>,
{
    watch.await.map_err(Into::into)
}

async fn tolerate_missing_api<F>(watch: F, api: &'static str) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), kube::runtime::watcher::Error>>,
{
    match watch.await {
        Err(e) if k8s::is_api_not_found(&e) => {
            tracing::info!("{api} API not found. Continuing without Gateway APIs");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

struct FanIn {
    services: Watch<k8s_openapi::api::core::v1::Service>,
    endpoints: Watch<k8s_openapi::api::core::v1::Endpoints>,
    secrets: Watch<k8s_openapi::api::core::v1::Secret>,
    ingresses: Watch<k8s_openapi::api::networking::v1::Ingress>,
    proxies: Watch<apis::HTTPProxy>,
    delegations: Watch<apis::TLSCertificateDelegation>,
    gateways: Watch<gateway_api::apis::standard::gateways::Gateway>,
    httproutes: Watch<gateway_api::apis::standard::httproutes::HTTPRoute>,
}

/// Apply one kind's received change set to the cache, recovering from a
/// lagged subscription by reconciling the whole store against the cache.
fn apply_batch<K: KubeResource>(
    cache: &Arc<RwLock<KubernetesCache>>,
    kind: Kind,
    store: &Store<K>,
    received: Result<k8s::ChangedObjects<K>, tokio::sync::broadcast::error::RecvError>,
    wrap: impl Fn(Arc<K>) -> KubeObject,
) -> bool {
    use tokio::sync::broadcast::error::RecvError;

    match received {
        Ok(changed) => apply_changes(cache, kind, store, &changed, wrap),
        Err(RecvError::Lagged(n)) => {
            tracing::warn!(kind = ?kind, dropped = %n, "fell behind a watch, resyncing");
            // everything in the store might be new; everything cached
            // but no longer in the store was deleted while we lagged.
            let mut all: std::collections::HashSet<ObjectRef<K>> = store
                .state()
                .iter()
                .map(|obj| ObjectRef::from_obj(obj.as_ref()))
                .collect();
            let cached = cache.read().expect("kubernetes cache lock poisoned").keys(kind);
            for key in cached {
                all.insert(ObjectRef::new(&key.name).within(&key.namespace));
            }
            apply_changes(cache, kind, store, &all, wrap)
        }
        // senders live as long as the fan-in itself; closed just means
        // shutdown is underway.
        Err(RecvError::Closed) => false,
    }
}

/// Apply one kind's change set to the cache: present in the store means
/// upsert, absent means delete. Returns true when anything interesting
/// changed.
fn apply_changes<K: KubeResource>(
    cache: &Arc<RwLock<KubernetesCache>>,
    kind: Kind,
    store: &Store<K>,
    changed: &std::collections::HashSet<ObjectRef<K>>,
    wrap: impl Fn(Arc<K>) -> KubeObject,
) -> bool {
    let mut cache = cache.write().expect("kubernetes cache lock poisoned");
    let mut interesting = false;

    for obj_ref in changed {
        let Some(namespace) = obj_ref.namespace.as_deref() else {
            continue;
        };
        let key = ObjectKey::new(namespace, &*obj_ref.name);

        match store.get(obj_ref) {
            Some(obj) => match cache.insert(wrap(obj)) {
                Ok(true) => interesting = true,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(kind = ?kind, object = %key, err = %err, "rejecting object");
                }
            },
            None => {
                if cache.remove(kind, &key) {
                    interesting = true;
                }
            }
        }
    }

    interesting
}

async fn fan_in(
    cache: Arc<RwLock<KubernetesCache>>,
    event_tx: tokio::sync::mpsc::Sender<Kind>,
    watches: FanIn,
) {
    macro_rules! subscribe {
        ($watch:expr) => {
            ($watch.store.clone(), $watch.changes.subscribe())
        };
    }

    let (service_store, mut service_rx) = subscribe!(watches.services);
    let (endpoints_store, mut endpoints_rx) = subscribe!(watches.endpoints);
    let (secret_store, mut secret_rx) = subscribe!(watches.secrets);
    let (ingress_store, mut ingress_rx) = subscribe!(watches.ingresses);
    let (proxy_store, mut proxy_rx) = subscribe!(watches.proxies);
    let (delegation_store, mut delegation_rx) = subscribe!(watches.delegations);
    let (gateway_store, mut gateway_rx) = subscribe!(watches.gateways);
    let (httproute_store, mut httproute_rx) = subscribe!(watches.httproutes);

    loop {
        let (kind, interesting) = tokio::select! {
            received = service_rx.recv() => (
                Kind::Service,
                apply_batch(&cache, Kind::Service, &service_store, received, KubeObject::Service),
            ),
            received = endpoints_rx.recv() => (
                Kind::Endpoints,
                apply_batch(&cache, Kind::Endpoints, &endpoints_store, received, KubeObject::Endpoints),
            ),
            received = secret_rx.recv() => (
                Kind::Secret,
                apply_batch(&cache, Kind::Secret, &secret_store, received, KubeObject::Secret),
            ),
            received = ingress_rx.recv() => (
                Kind::Ingress,
                apply_batch(&cache, Kind::Ingress, &ingress_store, received, KubeObject::Ingress),
            ),
            received = proxy_rx.recv() => (
                Kind::HTTPProxy,
                apply_batch(&cache, Kind::HTTPProxy, &proxy_store, received, KubeObject::HTTPProxy),
            ),
            received = delegation_rx.recv() => (
                Kind::TLSCertificateDelegation,
                apply_batch(&cache, Kind::TLSCertificateDelegation, &delegation_store, received, KubeObject::TLSCertificateDelegation),
            ),
            received = gateway_rx.recv() => (
                Kind::Gateway,
                apply_batch(&cache, Kind::Gateway, &gateway_store, received, KubeObject::Gateway),
            ),
            received = httproute_rx.recv() => (
                Kind::HTTPRoute,
                apply_batch(&cache, Kind::HTTPRoute, &httproute_store, received, KubeObject::HTTPRoute),
            ),
        };

        if interesting && event_tx.send(kind).await.is_err() {
            tracing::debug!("rebuild task gone, fan-in exiting");
            return;
        }
    }
}
