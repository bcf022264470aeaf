use crate::trace::phase::PhaseHooks;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

type SharedLookup = Shared<BoxFuture<'static, Result<Vec<SocketAddr>, Arc<anyhow::Error>>>>;

/// Resolver that shares the result of concurrent lookups for the same
/// host:port instead of issuing them independently. A caller that joins
/// an in-flight lookup reports the query as coalesced through its hook
/// set.
#[derive(Default)]
pub struct CoalescingResolver {
    inflight: Mutex<HashMap<String, SharedLookup>>,
}

impl CoalescingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        hooks: &dyn PhaseHooks,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        hooks.on_dns_start(host);
        let key = format!("{}:{}", host, port);

        let (lookup, coalesced) = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| anyhow!("resolver lock poisoned"))?;
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let lookup = start_lookup(host.to_string(), port);
                    inflight.insert(key.clone(), lookup.clone());
                    (lookup, false)
                }
            }
        };

        let result = lookup.await;
        if !coalesced {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&key);
            }
        }
        hooks.on_dns_done(coalesced);

        let addresses =
            result.map_err(|e| anyhow!("DNS resolution for {} failed: {}", host, e))?;
        if addresses.is_empty() {
            error!("DNS resolution for {} returned no addresses.", host);
            return Err(anyhow!("No IP addresses found for host {}", host));
        }
        for (i, addr) in addresses.iter().enumerate() {
            if i == 0 {
                debug!("Resolved IP: {}", addr.ip());
            } else {
                debug!("Resolved IP (alternative): {}", addr.ip());
            }
        }
        Ok(addresses)
    }
}

fn start_lookup(host: String, port: u16) -> SharedLookup {
    async move {
        debug!("Resolving DNS for: {}", &host);
        let addrs = tokio::task::spawn_blocking(move || (host, port).to_socket_addrs())
            .await
            .map_err(|e| Arc::new(anyhow::Error::from(e)))?
            .map_err(|e| Arc::new(anyhow::Error::from(e)))?;
        Ok(addrs.collect())
    }
    .boxed()
    .shared()
}
