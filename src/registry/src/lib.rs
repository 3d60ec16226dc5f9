//! Docker Registry HTTP API v2 subset with a pull-through cache.
//!
//! Pushed content lives in the registry storage root; content pulled from
//! upstream registries through `/v2/proxy/<host>/<repository>/...` lives in a
//! separate proxy root. Both are content addressed and only written through a
//! verify-then-rename commit.

pub mod config;
pub mod digest;
pub mod dns;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod uploads;

pub use config::Config;
pub use digest::{Digest, DigestAlgorithm};
pub use error::{RegistryError, Result};
pub use handlers::AppState;
pub use server::{build_router, ServerHandle};

/// Start the registry server with the given configuration
pub async fn start_server(config: Config) -> Result<ServerHandle> {
    server::start_server(config).await
}
