use std::env;

use controller::{
    config::ControllerConfig, finalizer::NodeAnnotationCleanupAgent, reconciler::ShimReconciler,
    telemetry::vending_metrics, Context, ShimController, ShimControllerMetrics,
};
use models::{constants, shim::K8SShimClient, telemetry};

use actix_web::{web::Data, App, HttpServer};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    runtime::{
        reflector,
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    ResourceExt,
};

use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use snafu::ResultExt;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(controller_error::TelemetryInitSnafu)?;

    let config =
        ControllerConfig::from_environment().context(controller_error::ConfigurationSnafu)?;
    event!(Level::INFO, ?config, "Starting shim controller.");

    let k8s_client = kube::Client::try_default()
        .await
        .context(controller_error::ClientCreateSnafu)?;

    // The meter provider has to be installed before the controller metrics are created.
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(controller_error::PrometheusExporterSnafu)?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider.clone());
    let metrics = ShimControllerMetrics::new(global::meter(constants::CONTROLLER));

    // Passes read the node inventory from a `reflector::Store`, which is updated by a reflector
    // that runs concurrently. We'll create the store and run the reflector here.
    let nodes: Api<Node> = Api::all(k8s_client.clone());
    let nodes_store = reflector::store::Writer::<Node>::default();
    let node_reader = nodes_store.as_reader();
    let node_reflector = reflector::reflector(
        nodes_store,
        watcher(nodes, Config::default()).default_backoff(),
    );
    let node_drainer = node_reflector
        .touched_objects()
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|node| {
            event!(
                Level::TRACE,
                node_name = %node.name_any(),
                "Processed a k8s event for a Node."
            );
            futures::future::ready(())
        });

    // Setup and run the controller.
    let reconciler = ShimReconciler::new(
        K8SShimClient::new(k8s_client.clone()),
        node_reader.clone(),
        NodeAnnotationCleanupAgent::new(node_reader.clone()),
        config.poll_intervals,
    );
    let controller = ShimController::new(
        k8s_client,
        config.watch_namespace.as_deref(),
        Context::new(reconciler, metrics, config.pass_timeout),
    );
    let controller_runner = async move {
        // An empty inventory would make every recorded node look stale.
        node_reader
            .wait_until_ready()
            .await
            .context(controller_error::NodeStoreSnafu)?;
        event!(Level::INFO, "Node inventory synced, reconciling Shims.");
        controller.run().await;
        Ok::<(), controller_error::Error>(())
    };

    let bindaddress = match env::var("KUBERNETES_SERVICE_HOST") {
        // IPv6 format
        Ok(k8s_service_addr) if k8s_service_addr.contains(':') => "[::]",
        // IPv4 format
        _ => "0.0.0.0",
    };

    // Setup Http server to vend prometheus metrics
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(registry.clone()))
            .service(vending_metrics)
    })
    .bind(format!("{}:{}", bindaddress, config.metrics_port))
    .context(controller_error::PrometheusServerSnafu)?
    .run();

    let result = tokio::select! {
        _ = node_drainer => {
            event!(Level::ERROR, "node reflector drained");
            controller_error::KubernetesWatcherFailedSnafu { object: "Node" }.fail()
        },
        controller = controller_runner => {
            event!(Level::INFO, "controller exited");
            controller
        },
        server = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
            server.context(controller_error::PrometheusServerSnafu)
        }
    };

    if let Err(err) = provider.shutdown() {
        event!(Level::WARN, %err, "Failed to shut down meter provider.");
    }
    result
}

pub mod controller_error {
    use controller::error;
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Invalid controller configuration: '{}'", source))]
        Configuration { source: error::Error },

        #[snafu(display("The Kubernetes WATCH on {} objects has failed.", object))]
        KubernetesWatcherFailed { object: String },

        #[snafu(display("Node inventory was dropped before it synced: '{}'", source))]
        NodeStore {
            source: kube::runtime::reflector::store::WriterDropped,
        },

        #[snafu(display("Unable to create prometheus exporter: '{}'", source))]
        PrometheusExporter {
            source: opentelemetry::metrics::MetricsError,
        },

        #[snafu(display("Error running prometheus HTTP server: '{}'", source))]
        PrometheusServer { source: std::io::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
