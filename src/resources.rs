use crate::endpoint::Endpoint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    CustomResource,
    ResourceExt as _,
};
use schemars::{
    gen::SchemaGenerator,
    schema::Schema,
    JsonSchema,
};
use serde::{
    Deserialize,
    Serialize,
};

pub const DNS_RECORD_FINALIZER: &str = "dns.multicluster.io/dns-record";

pub const READY_CONDITION: &str = "Ready";

#[allow(clippy::upper_case_acronyms)]
#[derive(Default, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
pub enum RecordType {
    #[default]
    #[serde(rename = "A")]
    A,
    #[serde(rename = "AAAA")]
    AAAA,
    #[serde(rename = "CNAME")]
    CNAME,
    #[serde(rename = "TXT")]
    TXT,
    #[serde(rename = "NS")]
    NS,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::TXT => "TXT",
            RecordType::NS => "NS",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "TXT" => Ok(RecordType::TXT),
            "NS" => Ok(RecordType::NS),
            s => Err(eyre::eyre!("Invalid RecordType: {s:?}")),
        }
    }
}

/// A set of DNS records for one root host, contributed by one writer.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dns.multicluster.io",
    version = "v1alpha1",
    kind = "DNSRecord",
    namespaced,
    status = "DNSRecordStatus",
    shortname = "dnsrec",
    printcolumn = r#"{"name":"Root Host","type":"string","jsonPath":".spec.rootHost"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordSpec {
    /// Unique identity of this writer in the zone. Derived from the resource UID when unset.
    /// Cannot be set, changed or cleared once the record has been reconciled.
    #[serde(rename = "ownerID", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// The hostname these records are published for (e.g. `app.example.com`).
    #[schemars(length(min = 1), regex(pattern = r"^(\*\.)?([a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?\.)+[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$"))]
    pub root_host: String,
    /// The provider secret, in the same namespace, that holds the zone credentials.
    pub provider_ref: ProviderRef,
    /// Records to publish. Every `dnsName` must be the root host or one of its subdomains.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// How the health of the published addresses should be checked. Stored and validated, not acted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

pub const HEALTH_PORT_MESSAGE: &str = "Only ports 80, 443, 1024-49151 are allowed";
pub const HEALTH_PROTOCOL_MESSAGE: &str = "Only HTTP or HTTPS protocols are allowed";
pub const HEALTH_THRESHOLD_MESSAGE: &str = "Failure threshold must be greater than 0";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Request path, e.g. `/healthz`.
    #[schemars(regex(pattern = r"^/.*$"))]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "port_schema")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "protocol_schema")]
    pub protocol: Option<HealthProtocol>,
    /// Consecutive failures before an address is considered unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "failure_threshold_schema")]
    pub failure_threshold: Option<i64>,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HealthProtocol {
    HTTP,
    HTTPS,
}

impl HealthCheckSpec {
    /// The rules the API server enforces through the CRD schema.
    pub fn validate(&self) -> Result<(), String> {
        if !self.endpoint.starts_with('/') {
            return Err(format!("healthCheck.endpoint '{}' must start with '/'", self.endpoint));
        }
        if let Some(port) = self.port {
            if !(port == 80 || port == 443 || (1024..=49151).contains(&port)) {
                return Err(HEALTH_PORT_MESSAGE.to_string());
            }
        }
        if self.failure_threshold.is_some_and(|threshold| threshold <= 0) {
            return Err(HEALTH_THRESHOLD_MESSAGE.to_string());
        }
        Ok(())
    }
}

/// Schema of `T` with a CEL rule evaluated by the API server.
fn validated_schema<T: JsonSchema>(gen: &mut SchemaGenerator, rule: &str, message: &str) -> Schema {
    let mut schema = gen.subschema_for::<T>().into_object();
    schema.extensions.insert(
        "x-kubernetes-validations".to_string(),
        serde_json::json!([{ "rule": rule, "message": message }]),
    );
    Schema::Object(schema)
}

fn port_schema(gen: &mut SchemaGenerator) -> Schema {
    validated_schema::<i64>(gen, "self in [80, 443] || (self >= 1024 && self <= 49151)", HEALTH_PORT_MESSAGE)
}

// a plain string, so unknown protocols get the CEL message instead of an enum error
fn protocol_schema(gen: &mut SchemaGenerator) -> Schema {
    validated_schema::<String>(gen, "self in ['HTTP', 'HTTPS']", HEALTH_PROTOCOL_MESSAGE)
}

fn failure_threshold_schema(gen: &mut SchemaGenerator) -> Schema {
    validated_schema::<i64>(gen, "self > 0", HEALTH_THRESHOLD_MESSAGE)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderRef {
    #[schemars(length(min = 1))]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSRecordStatus {
    #[serde(rename = "ownerID", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Effective writes (and blocked write attempts) made against the provider. Never decreases.
    #[serde(default)]
    pub write_counter: i64,
    #[serde(rename = "zoneID", default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_domain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl DNSRecordStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.iter().find(|condition| condition.type_ == READY_CONDITION))
    }

    /// The zone this record last wrote to, if any.
    pub fn zone(&self) -> Option<crate::zone::Zone> {
        match (&self.zone_id, &self.zone_domain_name) {
            (Some(id), Some(domain_name)) => Some(crate::zone::Zone::new(id, domain_name)),
            _ => None,
        }
    }
}

/// Reconciliation state of a record, derived from its metadata and Ready condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    AwaitingValidation,
    Ready,
    Error,
    Terminating,
}

impl DNSRecord {
    pub fn state(&self) -> RecordState {
        if self.metadata.deletion_timestamp.is_some() {
            return RecordState::Terminating;
        }
        let Some(ready) = self.status.as_ref().and_then(|status| status.ready_condition()) else {
            return RecordState::Pending;
        };
        match (ready.status.as_str(), ready.reason.as_str()) {
            ("True", _) => RecordState::Ready,
            (_, crate::conditions::REASON_AWAITING_VALIDATION) => RecordState::AwaitingValidation,
            _ => RecordState::Error,
        }
    }

    /// `{ns}/{name}` of the record, used in logs and lock keys.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}
