use crate::{
    dns::{
        PROVIDER_TYPE_CLOUDFLARE,
        PROVIDER_TYPE_INMEMORY,
    },
    resources::DNSRecord,
};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    runtime::reflector::{
        ObjectRef,
        Store,
    },
    ResourceExt as _,
};

pub fn is_provider_secret(secret: &Secret) -> bool {
    matches!(
        secret.type_.as_deref(),
        Some(PROVIDER_TYPE_INMEMORY | PROVIDER_TYPE_CLOUDFLARE)
    )
}

/// Records in the Secret's namespace that reference it as their provider.
pub fn records_for_provider(store: &Store<DNSRecord>, secret: &Secret) -> Vec<ObjectRef<DNSRecord>> {
    if !is_provider_secret(secret) {
        return Vec::new();
    }
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();

    store
        .state()
        .iter()
        .filter(|record| record.namespace().unwrap_or_default() == namespace && record.spec.provider_ref.name == name)
        .map(|record| ObjectRef::from_obj(&**record))
        .collect()
}
