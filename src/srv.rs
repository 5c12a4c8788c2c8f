use std::time::Duration;

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

#[cfg(feature = "dns-resolver")]
use crate::trace::SDAM_TRACING_EVENT_TARGET;

/// The options resolved from an SRV-style connection string: the looked-up hosts plus the
/// restricted set of options the TXT record is allowed to carry.
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
    pub(crate) auth_source: Option<String>,
    pub(crate) replica_set: Option<String>,
    pub(crate) load_balanced: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct LookupHosts {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OriginalSrvInfo {
    pub(crate) hostname: String,
    pub(crate) min_ttl: Duration,
}

/// How to treat an SRV target that falls outside the parent domain of the queried hostname:
/// fatal for the initial seed-list lookup, skipped (with a warning) during polling.
pub(crate) enum DomainMismatch {
    Error,
    Skip,
}

#[cfg(feature = "dns-resolver")]
pub(crate) struct SrvResolver {
    resolver: crate::runtime::AsyncResolver,
    srv_service_name: Option<String>,
}

#[cfg(feature = "dns-resolver")]
impl SrvResolver {
    pub(crate) async fn new(
        config: Option<hickory_resolver::config::ResolverConfig>,
        srv_service_name: Option<String>,
    ) -> Result<Self> {
        let resolver = crate::runtime::AsyncResolver::new(config).await?;

        Ok(Self {
            resolver,
            srv_service_name,
        })
    }

    pub(crate) async fn resolve_client_options(&self, hostname: &str) -> Result<ResolvedConfig> {
        let lookup_result = self.get_srv_hosts(hostname, DomainMismatch::Error).await?;
        let mut config = ResolvedConfig {
            hosts: lookup_result.hosts,
            min_ttl: lookup_result.min_ttl,
            auth_source: None,
            replica_set: None,
            load_balanced: None,
        };

        self.get_txt_options(hostname, &mut config).await?;

        Ok(config)
    }

    pub(crate) async fn get_srv_hosts(
        &self,
        original_hostname: &str,
        dm: DomainMismatch,
    ) -> Result<LookupHosts> {
        use hickory_proto::rr::RData;

        let hostname_parts: Vec<_> = original_hostname.split('.').collect();

        if hostname_parts.len() < 3 {
            return Err(ErrorKind::InvalidUri {
                message: "a 'mongodb+srv' hostname must have at least three '.'-delimited parts"
                    .into(),
            }
            .into());
        }

        let lookup_hostname = format!(
            "_{}._tcp.{}",
            self.srv_service_name
                .as_deref()
                .unwrap_or(crate::options::DEFAULT_SRV_SERVICE_NAME),
            original_hostname,
        );

        let srv_lookup = self.resolver.srv_lookup(lookup_hostname.as_str()).await?;
        let mut srv_addresses: Vec<ServerAddress> = Vec::new();
        let mut min_ttl = u32::MAX;

        for record in srv_lookup.as_lookup().record_iter() {
            let srv = match record.data() {
                Some(RData::SRV(s)) => s,
                _ => continue,
            };

            let hostname = srv.target().to_utf8();
            let port = Some(srv.port());

            // The SRV target must be a sub-domain of the domain formed by dropping the
            // queried hostname's first label; anything else could redirect the client
            // outside the deployment's DNS zone.
            let domain_name = &hostname_parts[1..];

            let mut target_parts: Vec<_> = hostname.split('.').collect();

            // Remove empty final section, which indicates a trailing dot.
            if target_parts.last().map(|s| s.is_empty()).unwrap_or(false) {
                target_parts.pop();
            }

            if target_parts.is_empty() || !target_parts[1..].ends_with(domain_name) {
                let message = format!(
                    "SRV lookup for {} returned result {}, which does not match domain name {}",
                    original_hostname,
                    hostname,
                    domain_name.join(".")
                );
                if matches!(dm, DomainMismatch::Error) {
                    return Err(ErrorKind::DnsResolve { message }.into());
                } else {
                    tracing::warn!(target: SDAM_TRACING_EVENT_TARGET, "{}", message);
                }
                continue;
            }

            // The trailing '.' is not part of the canonical hostname, so rejoin the parts we
            // split rather than manipulating the string.
            let address = ServerAddress::Tcp {
                host: target_parts.join(".").to_lowercase(),
                port,
            };

            min_ttl = std::cmp::min(min_ttl, record.ttl());
            srv_addresses.push(address);
        }

        if srv_addresses.is_empty() {
            return Err(ErrorKind::DnsResolve {
                message: format!("SRV lookup for {} returned no records", original_hostname),
            }
            .into());
        }

        Ok(LookupHosts {
            hosts: srv_addresses,
            min_ttl: Duration::from_secs(min_ttl.into()),
        })
    }

    async fn get_txt_options(
        &self,
        original_hostname: &str,
        config: &mut ResolvedConfig,
    ) -> Result<()> {
        let txt_records_response = match self.resolver.txt_lookup(original_hostname).await? {
            Some(response) => response,
            None => return Ok(()),
        };
        let mut txt_records = txt_records_response.iter();

        let txt_record = match txt_records.next() {
            Some(record) => record,
            None => return Ok(()),
        };

        if txt_records.next().is_some() {
            return Err(ErrorKind::DnsResolve {
                message: format!(
                    "TXT lookup for {} returned more than one record, but more than one are not \
                     allowed with 'mongodb+srv'",
                    original_hostname,
                ),
            }
            .into());
        }

        let txt_data: Vec<_> = txt_record
            .txt_data()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes.as_ref()).into_owned())
            .collect();

        let txt_string = txt_data.join("");

        for option_pair in txt_string.split('&') {
            let parts: Vec<_> = option_pair.split('=').collect();

            if parts.len() != 2 {
                return Err(ErrorKind::DnsResolve {
                    message: format!(
                        "TXT record string '{}' is not a valid `key=value` option pair",
                        option_pair
                    ),
                }
                .into());
            }

            match &parts[0].to_lowercase()[..] {
                "authsource" => {
                    config.auth_source = Some(parts[1].to_string());
                }
                "replicaset" => {
                    config.replica_set = Some(parts[1].into());
                }
                "loadbalanced" => {
                    let val = match parts[1] {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(ErrorKind::DnsResolve {
                                message: format!(
                                    "TXT record option 'loadbalanced={}' was returned, only \
                                     'true' and 'false' are allowed values.",
                                    parts[1]
                                ),
                            }
                            .into())
                        }
                    };
                    config.load_balanced = Some(val);
                }
                other => {
                    return Err(ErrorKind::DnsResolve {
                        message: format!(
                            "TXT record option '{}' was returned, but only 'authSource', \
                             'replicaSet', and 'loadBalanced' are allowed",
                            other
                        ),
                    }
                    .into())
                }
            };
        }

        Ok(())
    }
}

#[cfg(feature = "dns-resolver")]
impl SrvResolver {
    /// Checks that an SRV target is acceptable for the given queried hostname without
    /// consulting DNS, for tests of the domain check itself.
    #[cfg(test)]
    pub(crate) fn target_in_domain(original_hostname: &str, target: &str) -> bool {
        let hostname_parts: Vec<_> = original_hostname.split('.').collect();
        if hostname_parts.len() < 3 {
            return false;
        }
        let domain_name = &hostname_parts[1..];

        let mut target_parts: Vec<_> = target.split('.').collect();
        if target_parts.last().map(|s| s.is_empty()).unwrap_or(false) {
            target_parts.pop();
        }

        !target_parts.is_empty() && target_parts[1..].ends_with(domain_name)
    }
}

/// Stub implementation when DNS resolution isn't enabled.
#[cfg(not(feature = "dns-resolver"))]
pub(crate) struct SrvResolver {}

#[cfg(not(feature = "dns-resolver"))]
impl SrvResolver {
    fn unavailable() -> crate::error::Error {
        crate::error::Error::invalid_argument(
            "mongodb+srv connection strings cannot be used when the 'dns-resolver' feature is \
             disabled",
        )
    }

    pub(crate) async fn new(
        _config: Option<()>,
        _srv_service_name: Option<String>,
    ) -> Result<Self> {
        Err(Self::unavailable())
    }

    pub(crate) async fn resolve_client_options(&self, _hostname: &str) -> Result<ResolvedConfig> {
        Err(Self::unavailable())
    }

    pub(crate) async fn get_srv_hosts(
        &self,
        _original_hostname: &str,
        _dm: DomainMismatch,
    ) -> Result<LookupHosts> {
        Err(Self::unavailable())
    }
}

#[cfg(all(test, feature = "dns-resolver"))]
mod test {
    use super::SrvResolver;

    #[test]
    fn srv_targets_must_be_subdomains() {
        // Valid: sub-domain of test.com after dropping the first label of the query.
        assert!(SrvResolver::target_in_domain(
            "cluster0.test.com",
            "shard0.test.com"
        ));
        assert!(SrvResolver::target_in_domain(
            "cluster0.test.com",
            "shard0.sub.test.com."
        ));

        // Invalid: the bare parent domain is not a *sub*-domain.
        assert!(!SrvResolver::target_in_domain(
            "cluster0.test.com",
            "test.com"
        ));

        // Invalid: different domain entirely.
        assert!(!SrvResolver::target_in_domain(
            "cluster0.test.com",
            "shard0.evil.com"
        ));

        // Invalid: suffix match that is not on a label boundary.
        assert!(!SrvResolver::target_in_domain(
            "cluster0.test.com",
            "shard0.faketest.com"
        ));

        // The queried hostname must have at least three labels.
        assert!(!SrvResolver::target_in_domain("test.com", "shard0.test.com"));
    }
}
