//! Upstream resolver that orders IPv4 addresses ahead of IPv6.
//!
//! Some hosts resolve to both families while the machine only has an IPv4
//! route; trying IPv4 first keeps proxy fetches working there. IPv6-only hosts
//! still resolve.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct Ipv4FirstResolver;

/// Stable partition: IPv4 addresses first, original order kept within a family.
pub fn order_ipv4_first(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (mut v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(SocketAddr::is_ipv4);
    v4.extend(v6);
    v4
}

impl Resolve for Ipv4FirstResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = tokio::task::spawn_blocking(move || {
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|it| it.collect::<Vec<_>>())
            })
            .await??;

            Ok::<Addrs, BoxError>(Box::new(order_ipv4_first(addrs).into_iter()))
        })
    }
}

pub fn ipv4_first_resolver() -> Arc<Ipv4FirstResolver> {
    Arc::new(Ipv4FirstResolver)
}
