#[cfg(not(test))]
use hickory_resolver::{
    Resolver, config::ResolverConfig, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use rand::seq::SliceRandom;
use tracing::{debug, trace};

pub enum ResolveError {
    /// Lookup failed; worth retrying later.
    Dns(hickory_resolver::ResolveError),
    /// The domain has no mail servers at all (no MX, or a null MX per
    /// RFC 7505); permanent.
    NoMailServers,
}

/// One MX candidate in try-order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub host: String,
    pub preference: u16,
    pub port: u16,
}

/// MX resolution for outbound delivery.
#[derive(Clone)]
pub struct MxResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
}

#[cfg(not(test))]
impl Default for MxResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MxResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut options = ResolverOpts::default();
        options.attempts = 4;
        options.negative_max_ttl = Some(std::time::Duration::from_secs(20));

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
        }
    }

    #[cfg(test)]
    pub fn mock(host: &'static str, port: u16) -> Self {
        Self {
            resolver: mock::Resolver { host: (host, port) },
        }
    }

    /// MX candidates for `domain`, best first: stable by preference with
    /// equal-preference records shuffled so the load spreads.
    pub async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, ResolveError> {
        // lookups that end with a '.' are fully qualified and cheaper
        let fqdn = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        let lookup = self.resolver.mx_lookup(&fqdn).await.map_err(ResolveError::Dns)?;

        let mut hosts: Vec<MxHost> = lookup
            .iter()
            .map(|mx| MxHost {
                host: mx.exchange().to_utf8(),
                preference: mx.preference(),
                port: mx_port(mx),
            })
            .collect();

        if hosts.is_empty() {
            debug!(domain, "no MX records, domain accepts no mail");
            return Err(ResolveError::NoMailServers);
        }
        // null MX (RFC 7505): a single record pointing at the root
        if hosts.len() == 1 && hosts[0].host == "." {
            debug!(domain, "null MX, domain accepts no mail");
            return Err(ResolveError::NoMailServers);
        }

        hosts.shuffle(&mut rand::rng());
        hosts.sort_by_key(|mx| mx.preference);
        trace!(domain, candidates = hosts.len(), "resolved mail servers");
        Ok(hosts)
    }
}

#[cfg(not(test))]
fn mx_port(_mx: &hickory_resolver::proto::rr::rdata::MX) -> u16 {
    25
}

#[cfg(test)]
fn mx_port(mx: &mock::MX) -> u16 {
    mx.port()
}

/// A minimal mock-up for hickory_resolver
#[cfg(test)]
pub(crate) mod mock {
    #[derive(Clone, Copy, Debug)]
    pub struct Resolver {
        pub host: (&'static str, u16),
    }

    impl Resolver {
        pub async fn mx_lookup(
            &self,
            _: impl AsRef<str>,
        ) -> Result<[MX; 1], hickory_resolver::ResolveError> {
            Ok([MX(*self)])
        }
    }

    #[derive(Debug)]
    pub struct MX(Resolver);

    impl MX {
        pub fn preference(&self) -> u16 {
            5
        }

        pub fn exchange(&self) -> ToStr {
            ToStr(self.0)
        }

        pub fn port(&self) -> u16 {
            self.0.host.1
        }
    }

    pub struct ToStr(Resolver);

    impl ToStr {
        pub fn to_utf8(&self) -> String {
            self.0.host.0.into()
        }
    }
}
