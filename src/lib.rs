#[macro_use]
extern crate tracing;

pub mod arbitration;
pub mod conditions;
pub mod config;
pub mod context;
pub mod dns;
pub mod endpoint;
pub mod generate;
pub mod hash;
pub mod locks;
pub mod owner;
pub mod providers;
pub mod reconcile;
pub mod request;
pub mod resources;
pub mod retry;
pub mod routing;
pub mod selector;
pub mod zone;
