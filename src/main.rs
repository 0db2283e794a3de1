#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::{
    Result,
    WrapErr as _,
};
use futures::StreamExt as _;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    runtime::{
        controller::Action,
        finalizer,
        finalizer::Event,
        watcher,
        Controller,
    },
    Api,
    CustomResourceExt as _,
    Resource as _,
};
use multicluster_dns_operator::{
    config::ControllerConfig,
    context::Context,
    dns::{
        ProviderDescriptor,
        ProviderFactory,
    },
    providers::records_for_provider,
    reconcile::{
        self,
        ReconcileError,
    },
    request::EndpointRequest,
    resources::{
        DNSRecord,
        DNS_RECORD_FINALIZER,
    },
};
use std::{
    path::PathBuf,
    sync::Arc,
};

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Print the DNSRecord CRD
    Crds,
    /// Run the controller
    Controller(ControllerConfig),
    /// List the zones a provider Secret gives access to
    ListZones(ArgsSecret),
    /// Print the DNSRecord generated for an endpoint request
    Generate(ArgsRequest),
}

#[derive(Parser)]
struct ArgsSecret {
    #[clap(help = "Path to a provider Secret manifest (YAML)")]
    secret: PathBuf,
}

#[derive(Parser)]
struct ArgsRequest {
    #[clap(help = "Path to an endpoint request (YAML)")]
    request: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Args::parse() {
        Args::Crds => {
            let yaml = serde_yaml::to_string(&DNSRecord::crd()).wrap_err("Failed to serialize CRD")?;
            print!("{yaml}")
        }
        Args::Controller(config) => {
            run_controller(config).await?;
        }
        Args::ListZones(ArgsSecret { secret }) => {
            let secret: Secret = serde_yaml::from_str(&std::fs::read_to_string(&secret)?)?;
            let descriptor = ProviderDescriptor::from_secret(&secret)?;
            let provider = ProviderFactory::default().build(&descriptor).await?;
            for zone in provider.zones().await? {
                let listed = if provider.filter().allows(&zone) { "" } else { " (filtered)" };
                println!("{zone}{listed}");
            }
        }
        Args::Generate(ArgsRequest { request }) => {
            let request: EndpointRequest = serde_yaml::from_str(&std::fs::read_to_string(&request)?)?;
            let record = request.build_dns_record()?;
            print!("{}", serde_yaml::to_string(&record)?);
        }
    }

    Ok(())
}

async fn run_controller(config: ControllerConfig) -> Result<(), ReconcileError> {
    let client = kube::Client::try_default().await?;

    let records = Api::<DNSRecord>::all(client.clone());
    let context = Arc::new(Context::new(client.clone(), config));

    info!("Starting controller");

    let controller = Controller::new(records, watcher::Config::default());
    let store = controller.store();

    controller
        // provider secret changes re-evaluate every record referencing them
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            move |secret| records_for_provider(&store, &secret),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|msg| async move { info!("Reconciled: {:?}", msg) })
        .await;

    info!("Controller stopped");

    Ok(())
}

async fn reconcile(record: Arc<DNSRecord>, ctx: Arc<Context>) -> Result<Action, finalizer::Error<ReconcileError>> {
    let ns = record.meta().namespace.as_deref().unwrap_or("default");
    let api: Api<DNSRecord> = Api::namespaced(ctx.client.clone(), ns);

    finalizer(&api, DNS_RECORD_FINALIZER, record, |event| async {
        let result = match event {
            Event::Apply(record) => reconcile::apply(record, ctx.clone()).await,
            Event::Cleanup(record) => reconcile::cleanup(record, ctx.clone()).await,
        };

        match result {
            Ok(action) => Ok(action),
            Err(ReconcileError::Kube(kube::Error::Api(err))) if err.code == 409 => {
                warn!("Conflict when reconciling object: {err}");
                Ok(Action::requeue(ctx.config.error_requeue))
            }
            Err(ReconcileError::Kube(kube::Error::Api(err))) if err.code == 404 => {
                warn!("Object not found when reconciling object: {err}");
                Ok(Action::await_change())
            }
            Err(err) => Err(err),
        }
    })
    .await
}

fn error_policy(_object: Arc<DNSRecord>, err: &finalizer::Error<ReconcileError>, ctx: Arc<Context>) -> Action {
    error!("Error reconciling: {:?}", err);
    Action::requeue(ctx.config.error_requeue)
}
