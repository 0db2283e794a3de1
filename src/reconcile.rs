use crate::{
    arbitration::{
        arbitrate,
        release,
        ArbitrationError,
        Changes,
        Verdict,
    },
    conditions::{
        error_condition,
        set_ready_condition,
        success_condition,
        MESSAGE_AWAITING_VALIDATION,
        REASON_AWAITING_VALIDATION,
        REASON_DNS_PROVIDER_ERROR,
        REASON_PROVIDER_ERROR,
    },
    config::ControllerConfig,
    context::Context,
    dns::{
        DnsProvider,
        ProviderDescriptor,
        ProviderError,
    },
    endpoint::is_within,
    locks::ZoneLocks,
    owner::{
        resolve_owner_id,
        OwnerIdError,
    },
    resources::{
        DNSRecord,
        DNSRecordSpec,
        DNSRecordStatus,
    },
    retry::{
        retry_provider_call,
        retry_provider_write,
    },
    zone::{
        select_zone,
        Zone,
        ZoneError,
    },
};
use futures::FutureExt as _;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{
        Patch,
        PatchParams,
    },
    runtime::controller::Action,
    Api,
    ResourceExt as _,
};
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("{0}")]
    InvalidSpec(String),

    #[error(transparent)]
    OwnerIdImmutable(#[from] OwnerIdError),

    #[error("unable to read provider secret {name}: {source}")]
    ProviderSecret { name: String, source: kube::Error },

    #[error("the dns provider could not be loaded: {0}")]
    ProviderLoad(ProviderError),

    #[error("provider is incompatible with zone: {0}")]
    ProviderIncompatible(ZoneError),

    #[error(transparent)]
    NoSuitableZone(ZoneError),

    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("reconciliation panicked: {0}")]
    Panic(String),
}

impl ReconcileError {
    /// Reason of the Ready condition reporting this error.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::ProviderSecret { .. }
            | ReconcileError::ProviderLoad(_)
            | ReconcileError::ProviderIncompatible(_)
            | ReconcileError::NoSuitableZone(_) => REASON_DNS_PROVIDER_ERROR,
            _ => REASON_PROVIDER_ERROR,
        }
    }

    /// Message of the Ready condition reporting this error.
    pub fn condition_message(&self) -> String {
        match self {
            ReconcileError::ProviderSecret { name, source } => {
                format!("The dns provider could not be loaded: secret {name}: {source}")
            }
            ReconcileError::ProviderLoad(err) => format!("The dns provider could not be loaded: {err}"),
            ReconcileError::ProviderIncompatible(err) => format!("The dns provider could not be loaded: {err}"),
            ReconcileError::NoSuitableZone(err) => format!("Unable to find suitable zone in provider: {err}"),
            ReconcileError::Provider(err) => format!("The DNS provider failed to ensure the record: {err}"),
            err => err.to_string(),
        }
    }

    /// Errors worth retrying before the next resync. Everything else waits for an input change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Kube(_) | ReconcileError::ProviderSecret { .. } | ReconcileError::Provider(_) => true,
            ReconcileError::ProviderLoad(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// What a reconciliation pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Ready,
    AwaitingValidation,
}

/// Status computed by a pass, and the failure it reports, if any.
#[derive(Debug)]
pub struct PassOutcome {
    pub status: DNSRecordStatus,
    pub error: Option<ReconcileError>,
}

/// Runs one reconciliation pass against `provider` and computes the resulting status.
///
/// The pass never fails. Failures, including panics, end up in the Ready condition and in
/// [`PassOutcome::error`].
#[instrument(level = "debug", skip_all, fields(record = %record.key()))]
pub async fn run_pass(
    record: &DNSRecord,
    provider: Arc<dyn DnsProvider>,
    locks: &ZoneLocks,
    config: &ControllerConfig,
) -> PassOutcome {
    let generation = record.metadata.generation;
    let mut status = record.status.clone().unwrap_or_default();

    let result = AssertUnwindSafe(write_records(record, provider, locks, config, &mut status))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ReconcileError::Panic(panic_message(panic))));

    let condition = match &result {
        Ok(PassResult::Ready) => success_condition(record, generation),
        Ok(PassResult::AwaitingValidation) => error_condition(
            record,
            REASON_AWAITING_VALIDATION,
            MESSAGE_AWAITING_VALIDATION,
            generation,
        ),
        Err(err) => error_condition(record, err.reason(), err.condition_message(), generation),
    };
    set_ready_condition(&mut status.conditions, condition);
    status.observed_generation = generation;

    PassOutcome {
        status,
        error: result.err(),
    }
}

async fn write_records(
    record: &DNSRecord,
    provider: Arc<dyn DnsProvider>,
    locks: &ZoneLocks,
    config: &ControllerConfig,
    status: &mut DNSRecordStatus,
) -> Result<PassResult, ReconcileError> {
    let uid = record.metadata.uid.as_deref().ok_or(ReconcileError::MissingObjectKey("uid"))?;
    let owner = resolve_owner_id(record.spec.owner_id.as_deref(), status.owner_id.as_deref(), uid)?;
    status.owner_id = Some(owner.clone());

    validate_spec(&record.spec)?;
    let root_host = record.spec.root_host.as_str();

    let previous_zone = status.zone();
    if let Some(zone) = &previous_zone {
        provider.filter().check(zone).map_err(ReconcileError::ProviderIncompatible)?;
    }

    let catalog = retry_provider_call(config.backoff(), config.provider_timeout, "list zones", || provider.zones())
        .await
        .map_err(ReconcileError::ProviderLoad)?;
    let zone = select_zone(root_host, &catalog, provider.filter())
        .map_err(ReconcileError::NoSuitableZone)?
        .clone();

    if let Some(previous) = previous_zone.filter(|previous| previous.id != zone.id) {
        let previous_host = status.root_host.clone().unwrap_or_else(|| root_host.to_string());
        info!(from = %previous, to = %zone, "root host moved zones, releasing previous zone");
        if release_zone(&owner, &previous, &previous_host, provider.clone(), locks, config).await? {
            status.write_counter += 1;
        }
    }

    let _guard = locks.lock(&zone.id, root_host).await;

    let snapshot = retry_provider_call(config.backoff(), config.provider_timeout, "list records", || {
        provider.records(&zone)
    })
    .await?;

    let verdict = arbitrate(&owner, &[root_host.to_string()], &record.spec.endpoints, &snapshot)?;

    status.zone_id = Some(zone.id.clone());
    status.zone_domain_name = Some(zone.domain_name.clone());
    status.root_host = Some(root_host.to_string());

    match verdict {
        Verdict::AwaitingValidation { incompatible, markers } => {
            for incompatibility in &incompatible {
                warn!(%incompatibility, "writers disagree on the shape of a record");
            }
            status.write_counter += 1;
            if !markers.is_empty() {
                debug!(%zone, %markers, "marking contested records");
                apply_changes(provider, zone, markers, config).await?;
            }
            Ok(PassResult::AwaitingValidation)
        }
        Verdict::Apply(changes) if changes.is_empty() => {
            debug!("records are up to date");
            Ok(PassResult::Ready)
        }
        Verdict::Apply(changes) => {
            info!(%zone, %changes, "applying changes");
            status.write_counter += 1;
            apply_changes(provider, zone, changes, config).await?;
            Ok(PassResult::Ready)
        }
    }
}

/// Withdraws the claims of a deleted record from the zone it last wrote to.
///
/// Records that never wrote anywhere have nothing to clean up. Cleanup is refused while the
/// recorded zone is excluded by the provider's filters.
#[instrument(level = "debug", skip_all, fields(record = %record.key()))]
pub async fn run_cleanup(
    record: &DNSRecord,
    provider: Arc<dyn DnsProvider>,
    locks: &ZoneLocks,
    config: &ControllerConfig,
) -> Result<(), ReconcileError> {
    let Some(status) = record.status.as_ref() else {
        return Ok(());
    };
    let (Some(zone), Some(owner)) = (status.zone(), status.owner_id.as_deref()) else {
        debug!("record never wrote to a zone, nothing to clean up");
        return Ok(());
    };

    provider.filter().check(&zone).map_err(ReconcileError::ProviderIncompatible)?;

    let root_host = status.root_host.as_deref().unwrap_or(&record.spec.root_host);
    release_zone(owner, &zone, root_host, provider, locks, config).await?;
    Ok(())
}

/// Releases every claim of `owner` in `zone`. Returns whether anything was written.
async fn release_zone(
    owner: &str,
    zone: &Zone,
    root_host: &str,
    provider: Arc<dyn DnsProvider>,
    locks: &ZoneLocks,
    config: &ControllerConfig,
) -> Result<bool, ReconcileError> {
    let _guard = locks.lock(&zone.id, root_host).await;

    let snapshot = match retry_provider_call(config.backoff(), config.provider_timeout, "list records", || {
        provider.records(zone)
    })
    .await
    {
        Ok(snapshot) => snapshot,
        Err(ProviderError::ZoneNotFound(id)) => {
            info!(zone = %id, "zone no longer exists, nothing to release");
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    let changes = release(owner, &snapshot);
    if changes.is_empty() {
        return Ok(false);
    }
    info!(%zone, %changes, "releasing records");
    apply_changes(provider, zone.clone(), changes, config).await?;
    Ok(true)
}

/// Applies changes on their own task, so a cancelled pass can't interrupt a write in flight.
async fn apply_changes(
    provider: Arc<dyn DnsProvider>,
    zone: Zone,
    changes: Changes,
    config: &ControllerConfig,
) -> Result<(), ReconcileError> {
    let backoff = config.backoff();
    let task = tokio::spawn(async move {
        retry_provider_write(backoff, "apply changes", || provider.apply_changes(&zone, &changes)).await
    });
    match task.await {
        Ok(result) => Ok(result?),
        Err(err) if err.is_panic() => Err(ReconcileError::Panic(panic_message(err.into_panic()))),
        Err(err) => Err(ReconcileError::Panic(err.to_string())),
    }
}

fn validate_spec(spec: &DNSRecordSpec) -> Result<(), ReconcileError> {
    if !is_valid_root_host(&spec.root_host) {
        return Err(ReconcileError::InvalidSpec(format!(
            "rootHost '{}' is not a valid hostname",
            spec.root_host
        )));
    }
    if spec.provider_ref.name.is_empty() {
        return Err(ReconcileError::InvalidSpec("providerRef.name is required".to_string()));
    }
    if let Some(health_check) = &spec.health_check {
        health_check.validate().map_err(ReconcileError::InvalidSpec)?;
    }

    let root_domain = spec.root_host.strip_prefix("*.").unwrap_or(&spec.root_host);
    for endpoint in &spec.endpoints {
        if !is_within(&endpoint.dns_name, root_domain) {
            return Err(ReconcileError::InvalidSpec(format!(
                "endpoint '{}' is not within rootHost '{}'",
                endpoint.dns_name, spec.root_host
            )));
        }
    }
    Ok(())
}

/// Lower-case DNS name with at least two labels. The first label may be `*`.
fn is_valid_root_host(host: &str) -> bool {
    let host = host.strip_prefix("*.").unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    host.len() <= 253
        && labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// kubernetes glue

async fn load_provider(ctx: &Context, ns: &str, name: &str) -> Result<Arc<dyn DnsProvider>, ReconcileError> {
    let secret = Api::<Secret>::namespaced(ctx.client.clone(), ns)
        .get(name)
        .await
        .map_err(|source| ReconcileError::ProviderSecret {
            name: format!("{ns}/{name}"),
            source,
        })?;
    let descriptor = ProviderDescriptor::from_secret(&secret).map_err(ReconcileError::ProviderLoad)?;
    let provider = ctx
        .providers
        .build(&descriptor)
        .await
        .map_err(ReconcileError::ProviderLoad)?;
    Ok(Arc::from(provider))
}

/// Writes `status`, failing with a conflict if the record changed since it was read.
async fn patch_status(api: &Api<DNSRecord>, record: &DNSRecord, status: &DNSRecordStatus) -> Result<(), ReconcileError> {
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": record.resource_version() },
        "status": status,
    });
    api.patch_status(&record.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn failed_status(record: &DNSRecord, err: &ReconcileError) -> DNSRecordStatus {
    let mut status = record.status.clone().unwrap_or_default();
    let condition = error_condition(record, err.reason(), err.condition_message(), record.metadata.generation);
    set_ready_condition(&mut status.conditions, condition);
    status
}

#[instrument(level = "debug", skip_all, fields(record = %record.key()))]
pub async fn apply(record: Arc<DNSRecord>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let ns = record.namespace().ok_or(ReconcileError::MissingObjectKey("namespace"))?;
    let api = Api::<DNSRecord>::namespaced(ctx.client.clone(), &ns);
    info!("reconcile request: DNSRecord {}", record.key());

    let provider = match load_provider(&ctx, &ns, &record.spec.provider_ref.name).await {
        Ok(provider) => provider,
        Err(err) => {
            error!("unable to load provider: {err}");
            patch_status(&api, &record, &failed_status(&record, &err)).await?;
            return Err(err);
        }
    };

    let outcome = run_pass(&record, provider, &ctx.locks, &ctx.config).await;
    patch_status(&api, &record, &outcome.status).await?;

    match outcome.error {
        Some(err) if err.is_retryable() => Err(err),
        Some(err) => {
            warn!("record not ready: {err}");
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        None => Ok(Action::requeue(ctx.config.resync_interval)),
    }
}

/// Runs before the record is deleted. Until this succeeds the finalizer stays on the record.
#[instrument(level = "debug", skip_all, fields(record = %record.key()))]
pub async fn cleanup(record: Arc<DNSRecord>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let ns = record.namespace().ok_or(ReconcileError::MissingObjectKey("namespace"))?;
    let api = Api::<DNSRecord>::namespaced(ctx.client.clone(), &ns);
    info!("delete request: DNSRecord {}", record.key());

    let result = match load_provider(&ctx, &ns, &record.spec.provider_ref.name).await {
        Ok(provider) => run_cleanup(&record, provider, &ctx.locks, &ctx.config).await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        error!("unable to clean up records, deletion is blocked: {err}");
        patch_status(&api, &record, &failed_status(&record, &err)).await?;
        return Err(err);
    }

    Ok(Action::await_change())
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod reconcile_tests;
