use crate::{
    config::ControllerConfig,
    dns::{
        cloudflare::CLOUDFLARE_API_URL,
        ProviderFactory,
    },
    locks::ZoneLocks,
};

/// Holds state shared by every reconciliation.
pub struct Context {
    pub client: kube::Client,
    pub config: ControllerConfig,
    pub providers: ProviderFactory,
    /// Serializes passes writing the same root host in the same zone.
    pub locks: ZoneLocks,
}

impl Context {
    pub fn new(client: kube::Client, config: ControllerConfig) -> Self {
        Self {
            client,
            providers: ProviderFactory::new(CLOUDFLARE_API_URL, config.provider_timeout),
            config,
            locks: ZoneLocks::default(),
        }
    }
}
