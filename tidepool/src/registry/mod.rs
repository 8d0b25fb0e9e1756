//! Lookup tables for live local actors and remote proxies.

mod actor_registry;
mod proxy_registry;

pub use actor_registry::ActorRegistry;
pub use proxy_registry::ProxyRegistry;
