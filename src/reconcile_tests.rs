//! Unit tests for `reconcile.rs`

use super::*;
use crate::{
    arbitration::ZoneRecord,
    dns::inmemory::InMemoryRegistry,
    endpoint::Endpoint,
    generate::{
        generate_endpoints,
        NamespacedName,
        LABEL_GEO_CODE,
    },
    resources::{
        HealthCheckSpec,
        ProviderRef,
        RecordState,
        RecordType,
        HEALTH_PORT_MESSAGE,
    },
    routing::{
        AddressKind,
        LoadBalancing,
        Routing,
    },
    selector::Labels,
    zone::ZoneFilter,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

const ROOT_HOST: &str = "app.example.com";

fn record(name: &str, root_host: &str, endpoints: Vec<Endpoint>) -> DNSRecord {
    let mut record = DNSRecord::new(
        name,
        DNSRecordSpec {
            owner_id: None,
            root_host: root_host.to_string(),
            provider_ref: ProviderRef {
                name: "provider".to_string(),
            },
            endpoints,
            health_check: None,
        },
    );
    record.metadata.namespace = Some("dns".to_string());
    record.metadata.uid = Some(format!("uid-{name}"));
    record.metadata.generation = Some(1);
    record
}

fn a(name: &str, targets: &[&str]) -> Endpoint {
    Endpoint::new(
        name,
        targets.iter().map(|target| target.to_string()).collect(),
        RecordType::A,
        "",
        60,
    )
}

fn cname(name: &str, target: &str) -> Endpoint {
    Endpoint::new(name, vec![target.to_string()], RecordType::CNAME, "", 300)
}

async fn provider(registry: &InMemoryRegistry, filter: ZoneFilter) -> Arc<dyn DnsProvider> {
    Arc::new(registry.provider("dns/provider", "example.com,example.org", filter).await)
}

/// Runs a pass and stores the resulting status on the record, as the status patch would.
async fn reconcile(record: &mut DNSRecord, provider: &Arc<dyn DnsProvider>, locks: &ZoneLocks) -> Option<ReconcileError> {
    let outcome = run_pass(record, provider.clone(), locks, &ControllerConfig::default()).await;
    record.status = Some(outcome.status);
    outcome.error
}

fn status(record: &DNSRecord) -> &DNSRecordStatus {
    record.status.as_ref().unwrap()
}

fn ready_message(record: &DNSRecord) -> (String, String) {
    let condition = status(record).ready_condition().unwrap();
    (condition.reason.clone(), condition.message.clone())
}

async fn zone_records(provider: &Arc<dyn DnsProvider>, domain: &str) -> Vec<ZoneRecord> {
    provider.records(&Zone::new(domain, domain)).await.unwrap()
}

fn load_balanced(name: &str, cluster_id: &str) -> Vec<Endpoint> {
    let routing = Routing::load_balanced(
        BTreeMap::from([("127.0.0.1".to_string(), AddressKind::IPAddress)]),
        LoadBalancing {
            cluster_id: cluster_id.to_string(),
            default_geo_code: "IE".to_string(),
            default_weight: 120,
            custom_weights: vec![],
        },
    )
    .unwrap();
    let labels = Labels::from([(LABEL_GEO_CODE.to_string(), "IE".to_string())]);
    generate_endpoints(&NamespacedName::new(name, "dns"), Some(&labels), ROOT_HOST, &routing).unwrap()
}

#[tokio::test]
async fn test_first_pass_publishes_records() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    assert!(reconcile(&mut record, &provider, &locks).await.is_none());

    assert_eq!(record.state(), RecordState::Ready);
    assert_eq!(
        ready_message(&record),
        ("ProviderSuccess".to_string(), "Provider ensured the dns record".to_string())
    );
    let status = status(&record);
    assert_eq!(status.owner_id.as_deref(), Some(crate::owner::owner_id_from_uid("uid-web").as_str()));
    assert_eq!(status.zone_id.as_deref(), Some("example.com"));
    assert_eq!(status.zone_domain_name.as_deref(), Some("example.com"));
    assert_eq!(status.root_host.as_deref(), Some(ROOT_HOST));
    assert_eq!(status.write_counter, 1);
    assert_eq!(status.observed_generation, Some(1));

    let owner = status.owner_id.clone().unwrap();
    assert_eq!(
        zone_records(&provider, "example.com").await,
        vec![ZoneRecord::new(a(ROOT_HOST, &["127.0.0.1"]), [owner])]
    );
}

#[tokio::test]
async fn test_converged_pass_does_not_write() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;
    reconcile(&mut record, &provider, &locks).await;

    assert_eq!(record.state(), RecordState::Ready);
    assert_eq!(status(&record).write_counter, 1);
}

#[tokio::test]
async fn test_load_balanced_writers_converge() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut first = record("api-1", ROOT_HOST, load_balanced("api", "cluster-one"));
    let mut second = record("api-2", ROOT_HOST, load_balanced("api", "cluster-two"));

    assert!(reconcile(&mut first, &provider, &locks).await.is_none());
    assert!(reconcile(&mut second, &provider, &locks).await.is_none());
    assert_eq!(first.state(), RecordState::Ready);
    assert_eq!(second.state(), RecordState::Ready);

    let records = zone_records(&provider, "example.com").await;
    // three shared tiers plus a weighted branch and an address record per cluster
    assert_eq!(records.len(), 7);
    assert_eq!(records.iter().filter(|record| record.owners.len() == 2).count(), 3);

    // a second round changes nothing
    reconcile(&mut first, &provider, &locks).await;
    reconcile(&mut second, &provider, &locks).await;
    assert_eq!(status(&first).write_counter, 1);
    assert_eq!(status(&second).write_counter, 1);
}

#[tokio::test]
async fn test_both_sides_of_a_conflict_await_validation() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut first = record("first", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    let mut second = record("second", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.2"])]);
    reconcile(&mut first, &provider, &locks).await;
    assert_eq!(first.state(), RecordState::Ready);

    assert!(reconcile(&mut second, &provider, &locks).await.is_none());
    assert_eq!(second.state(), RecordState::AwaitingValidation);
    assert_eq!(
        ready_message(&second),
        ("AwaitingValidation".to_string(), "Awaiting validation".to_string())
    );

    // the next pass of the first writer sees the contested record
    assert!(reconcile(&mut first, &provider, &locks).await.is_none());
    assert_eq!(first.state(), RecordState::AwaitingValidation);
    reconcile(&mut second, &provider, &locks).await;
    assert_eq!(second.state(), RecordState::AwaitingValidation);
    assert!(status(&first).write_counter > 1);
    assert!(status(&second).write_counter > 1);

    // the second writer's targets never reached the zone
    let records = zone_records(&provider, "example.com").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].endpoint.targets, vec!["127.0.0.1".to_string()]);

    // agreeing on the shape resolves the conflict for both
    second.spec.endpoints = vec![a(ROOT_HOST, &["127.0.0.1"])];
    assert!(reconcile(&mut second, &provider, &locks).await.is_none());
    assert_eq!(second.state(), RecordState::Ready);
    assert!(reconcile(&mut first, &provider, &locks).await.is_none());
    assert_eq!(first.state(), RecordState::Ready);

    let records = zone_records(&provider, "example.com").await;
    assert_eq!(records[0].owners.len(), 2);
    assert!(records[0].pending.is_empty());
}

#[tokio::test]
async fn test_deleting_a_blocked_writer_unblocks_the_owner() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();
    let config = ControllerConfig::default();

    let mut first = record("first", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    let mut second = record("second", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.2"])]);
    reconcile(&mut first, &provider, &locks).await;
    reconcile(&mut second, &provider, &locks).await;
    reconcile(&mut first, &provider, &locks).await;
    assert_eq!(first.state(), RecordState::AwaitingValidation);

    run_cleanup(&second, provider.clone(), &locks, &config).await.unwrap();
    reconcile(&mut first, &provider, &locks).await;
    assert_eq!(first.state(), RecordState::Ready);

    let owner = status(&first).owner_id.clone().unwrap();
    assert_eq!(
        zone_records(&provider, "example.com").await,
        vec![ZoneRecord::new(a(ROOT_HOST, &["127.0.0.1"]), [owner])]
    );
}

#[tokio::test]
async fn test_record_type_conflict_is_reported() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut first = record("first", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    let mut second = record("second", ROOT_HOST, vec![cname(ROOT_HOST, "lb.cloud.example")]);
    reconcile(&mut first, &provider, &locks).await;

    let err = reconcile(&mut second, &provider, &locks).await.unwrap();
    assert!(matches!(err, ReconcileError::Arbitration(ArbitrationError::RecordTypeConflict { .. })));
    assert!(!err.is_retryable());
    assert_eq!(second.state(), RecordState::Error);
    assert_eq!(
        ready_message(&second),
        (
            "ProviderError".to_string(),
            "record type conflict, cannot update endpoint 'app.example.com' with record type 'CNAME' when endpoint \
             already exists with record type 'A'"
                .to_string()
        )
    );
    assert_eq!(status(&second).write_counter, 0);
}

#[tokio::test]
async fn test_undefined_target_is_reported() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![cname(ROOT_HOST, "lb.app.example.com")]);
    let err = reconcile(&mut record, &provider, &locks).await.unwrap();

    assert!(matches!(err, ReconcileError::Arbitration(ArbitrationError::InvalidTarget { .. })));
    assert_eq!(
        ready_message(&record).1,
        "invalid target, endpoint 'app.example.com' has target 'lb.app.example.com' that matches the root host \
         filters '[app.example.com]' but does not exist in the list of local or remote endpoints"
    );
    assert!(zone_records(&provider, "example.com").await.is_empty());
}

#[tokio::test]
async fn test_endpoints_outside_root_host_are_rejected() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a("www.example.com", &["127.0.0.1"])]);
    let err = reconcile(&mut record, &provider, &locks).await.unwrap();

    assert!(matches!(err, ReconcileError::InvalidSpec(_)));
    assert_eq!(
        ready_message(&record),
        (
            "ProviderError".to_string(),
            "endpoint 'www.example.com' is not within rootHost 'app.example.com'".to_string()
        )
    );
}

#[tokio::test]
async fn test_invalid_health_check_is_rejected() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    record.spec.health_check = Some(HealthCheckSpec {
        endpoint: "/healthz".to_string(),
        port: Some(5),
        ..Default::default()
    });
    let err = reconcile(&mut record, &provider, &locks).await.unwrap();

    assert!(matches!(err, ReconcileError::InvalidSpec(_)));
    assert_eq!(
        ready_message(&record),
        ("ProviderError".to_string(), HEALTH_PORT_MESSAGE.to_string())
    );
    assert!(zone_records(&provider, "example.com").await.is_empty());

    record.spec.health_check = Some(HealthCheckSpec {
        endpoint: "/healthz".to_string(),
        port: Some(8443),
        ..Default::default()
    });
    assert!(reconcile(&mut record, &provider, &locks).await.is_none());
    assert_eq!(record.state(), RecordState::Ready);
}

#[test]
fn test_root_host_validation() {
    assert!(is_valid_root_host("app.example.com"));
    assert!(is_valid_root_host("*.example.com"));
    assert!(is_valid_root_host("a-1.example.com"));
    assert!(!is_valid_root_host("localhost"));
    assert!(!is_valid_root_host("App.example.com"));
    assert!(!is_valid_root_host("-app.example.com"));
    assert!(!is_valid_root_host("app..example.com"));
    assert!(!is_valid_root_host(""));
}

#[tokio::test]
async fn test_owner_id_cannot_change() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    record.spec.owner_id = Some("writer-1".to_string());
    reconcile(&mut record, &provider, &locks).await;
    assert_eq!(status(&record).owner_id.as_deref(), Some("writer-1"));

    record.spec.owner_id = Some("writer-2".to_string());
    let err = reconcile(&mut record, &provider, &locks).await.unwrap();
    assert!(matches!(err, ReconcileError::OwnerIdImmutable(OwnerIdError::Changed)));
    assert_eq!(
        ready_message(&record),
        ("ProviderError".to_string(), "OwnerID is immutable".to_string())
    );
    assert_eq!(status(&record).owner_id.as_deref(), Some("writer-1"));
}

#[tokio::test]
async fn test_no_suitable_zone_keeps_previous_zone() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;

    record.spec.root_host = "app.example.net".to_string();
    record.spec.endpoints = vec![a("app.example.net", &["127.0.0.1"])];
    let err = reconcile(&mut record, &provider, &locks).await.unwrap();

    assert!(matches!(err, ReconcileError::NoSuitableZone(_)));
    assert_eq!(
        ready_message(&record),
        (
            "DNSProviderError".to_string(),
            "Unable to find suitable zone in provider: no valid zone found for host: app.example.net".to_string()
        )
    );
    assert_eq!(status(&record).zone_id.as_deref(), Some("example.com"));
    assert_eq!(status(&record).root_host.as_deref(), Some(ROOT_HOST));
    assert_eq!(zone_records(&provider, "example.com").await.len(), 1);
}

#[tokio::test]
async fn test_filtered_zone_blocks_the_record() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;

    let restricted = self::provider(&registry, ZoneFilter::from_lists(Some("example.org"), None)).await;
    let err = reconcile(&mut record, &restricted, &locks).await.unwrap();

    assert!(matches!(err, ReconcileError::ProviderIncompatible(_)));
    assert_eq!(
        ready_message(&record),
        (
            "DNSProviderError".to_string(),
            "The dns provider could not be loaded: zone domain name 'example.com' is not listed in the providers \
             domain filter"
                .to_string()
        )
    );
    assert_eq!(status(&record).zone_id.as_deref(), Some("example.com"));
}

#[tokio::test]
async fn test_moving_zones_releases_the_previous_zone() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;

    record.spec.root_host = "app.example.org".to_string();
    record.spec.endpoints = vec![a("app.example.org", &["127.0.0.1"])];
    assert!(reconcile(&mut record, &provider, &locks).await.is_none());

    assert!(zone_records(&provider, "example.com").await.is_empty());
    assert_eq!(zone_records(&provider, "example.org").await.len(), 1);
    let status = status(&record);
    assert_eq!(status.zone_id.as_deref(), Some("example.org"));
    assert_eq!(status.root_host.as_deref(), Some("app.example.org"));
    assert_eq!(status.write_counter, 3);
}

#[tokio::test]
async fn test_removed_endpoints_are_released() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record(
        "web",
        ROOT_HOST,
        vec![a(ROOT_HOST, &["127.0.0.1"]), a("www.app.example.com", &["127.0.0.1"])],
    );
    reconcile(&mut record, &provider, &locks).await;
    assert_eq!(zone_records(&provider, "example.com").await.len(), 2);

    record.spec.endpoints.truncate(1);
    reconcile(&mut record, &provider, &locks).await;
    let records = zone_records(&provider, "example.com").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].endpoint.dns_name, ROOT_HOST);
}

#[tokio::test]
async fn test_cleanup_keeps_shared_records() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();
    let config = ControllerConfig::default();

    let mut first = record("first", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    let mut second = record(
        "second",
        ROOT_HOST,
        vec![a(ROOT_HOST, &["127.0.0.1"]), a("www.app.example.com", &["127.0.0.2"])],
    );
    reconcile(&mut first, &provider, &locks).await;
    reconcile(&mut second, &provider, &locks).await;

    run_cleanup(&second, provider.clone(), &locks, &config).await.unwrap();

    let owner = status(&first).owner_id.clone().unwrap();
    assert_eq!(
        zone_records(&provider, "example.com").await,
        vec![ZoneRecord::new(a(ROOT_HOST, &["127.0.0.1"]), [owner])]
    );
}

#[tokio::test]
async fn test_cleanup_without_status_is_a_noop() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);

    run_cleanup(&record, provider, &ZoneLocks::default(), &ControllerConfig::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cleanup_is_blocked_by_filters() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();
    let config = ControllerConfig::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;

    let restricted = self::provider(&registry, ZoneFilter::from_lists(None, Some("example.org"))).await;
    let err = run_cleanup(&record, restricted, &locks, &config).await.unwrap_err();
    assert_eq!(
        err.condition_message(),
        "The dns provider could not be loaded: zone id 'example.com' is not listed in the providers zone id filter"
    );
    assert_eq!(zone_records(&provider, "example.com").await.len(), 1);

    run_cleanup(&record, provider.clone(), &locks, &config).await.unwrap();
    assert!(zone_records(&provider, "example.com").await.is_empty());
}

#[tokio::test]
async fn test_cleanup_uses_the_recorded_zone() {
    let registry = InMemoryRegistry::default();
    let provider = provider(&registry, ZoneFilter::default()).await;
    let locks = ZoneLocks::default();

    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);
    reconcile(&mut record, &provider, &locks).await;

    // the new root host matches no zone, the records still live in the recorded one
    record.spec.root_host = "app.example.net".to_string();
    record.spec.endpoints = vec![a("app.example.net", &["127.0.0.1"])];
    reconcile(&mut record, &provider, &locks).await;

    run_cleanup(&record, provider.clone(), &locks, &ControllerConfig::default())
        .await
        .unwrap();
    assert!(zone_records(&provider, "example.com").await.is_empty());
}

struct PanickingProvider {
    filter: ZoneFilter,
}

#[async_trait]
impl DnsProvider for PanickingProvider {
    async fn zones(&self) -> Result<Vec<Zone>, ProviderError> {
        panic!("zone catalog exploded");
    }

    fn filter(&self) -> &ZoneFilter {
        &self.filter
    }

    async fn records(&self, _zone: &Zone) -> Result<Vec<ZoneRecord>, ProviderError> {
        Ok(vec![])
    }

    async fn apply_changes(&self, _zone: &Zone, _changes: &Changes) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_panics_become_errors() {
    let provider: Arc<dyn DnsProvider> = Arc::new(PanickingProvider {
        filter: ZoneFilter::default(),
    });
    let mut record = record("web", ROOT_HOST, vec![a(ROOT_HOST, &["127.0.0.1"])]);

    let err = reconcile(&mut record, &provider, &ZoneLocks::default()).await.unwrap();
    assert!(matches!(err, ReconcileError::Panic(ref message) if message == "zone catalog exploded"));
    assert_eq!(record.state(), RecordState::Error);
    assert_eq!(ready_message(&record).1, "reconciliation panicked: zone catalog exploded");
}

#[test]
fn test_error_classification() {
    let err = ReconcileError::Provider(ProviderError::RateLimited);
    assert!(err.is_retryable());
    assert_eq!(err.reason(), "ProviderError");
    assert_eq!(
        err.condition_message(),
        "The DNS provider failed to ensure the record: provider rate limit exceeded"
    );

    let err = ReconcileError::ProviderLoad(ProviderError::InvalidSecret {
        secret: "dns/provider".to_string(),
        reason: "missing CLOUDFLARE_API_TOKEN".to_string(),
    });
    assert!(!err.is_retryable());
    assert_eq!(err.reason(), "DNSProviderError");
    assert_eq!(
        err.condition_message(),
        "The dns provider could not be loaded: invalid provider secret dns/provider: missing CLOUDFLARE_API_TOKEN"
    );
}
