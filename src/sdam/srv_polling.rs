use std::time::Duration;

use super::{
    monitor::DEFAULT_HEARTBEAT_FREQUENCY,
    topology::{TopologyUpdater, TopologyWatcher},
    TopologyType,
};
use crate::{
    error::{Error, Result},
    options::ClientOptions,
    runtime,
    srv::{LookupHosts, SrvResolver},
    trace::SDAM_TRACING_EVENT_TARGET,
};

const MIN_RESCAN_SRV_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically rescans the SRV record behind a `mongodb+srv` connection string so mongos
/// additions and removals are picked up without restarting the client.
pub(crate) struct SrvPollingMonitor {
    initial_hostname: String,
    resolver: Option<SrvResolver>,
    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
    rescan_interval: Duration,
    client_options: ClientOptions,
}

impl SrvPollingMonitor {
    pub(crate) fn new(
        topology_watcher: TopologyWatcher,
        topology_updater: TopologyUpdater,
        mut client_options: ClientOptions,
    ) -> Option<Self> {
        let initial_info = client_options.original_srv_info.take()?;

        Some(Self {
            initial_hostname: initial_info.hostname,
            resolver: None,
            topology_watcher,
            topology_updater,
            rescan_interval: initial_info.min_ttl,
            client_options,
        })
    }

    /// Starts a monitoring task that periodically performs SRV record lookups to determine
    /// if the set of mongos in the cluster have changed. Returns without spawning when the
    /// client options did not come from an SRV connection string.
    pub(crate) fn start(
        topology_watcher: TopologyWatcher,
        topology_updater: TopologyUpdater,
        client_options: ClientOptions,
    ) {
        if let Some(monitor) = Self::new(topology_watcher, topology_updater, client_options) {
            runtime::spawn(monitor.execute());
        }
    }

    fn rescan_interval(&self) -> Duration {
        std::cmp::max(self.rescan_interval, MIN_RESCAN_SRV_INTERVAL)
    }

    async fn execute(mut self) {
        fn should_poll(tt: TopologyType) -> bool {
            matches!(tt, TopologyType::Sharded | TopologyType::Unknown)
        }

        while self.topology_watcher.is_alive() {
            runtime::delay_for(self.rescan_interval()).await;

            if !self.topology_watcher.is_alive() {
                break;
            }

            if should_poll(self.topology_watcher.topology_type()) {
                let hosts = self.lookup_hosts().await;

                // Verify the topology type again in case it changed while the lookup was
                // in flight.
                if should_poll(self.topology_watcher.topology_type()) {
                    self.update_hosts(hosts).await;
                }
            }
        }
    }

    async fn update_hosts(&mut self, lookup: Result<LookupHosts>) {
        let lookup = match lookup {
            Ok(LookupHosts { hosts, .. }) if hosts.is_empty() => {
                self.no_valid_hosts(None);
                return;
            }
            Ok(lookup) => lookup,
            Err(err) => {
                self.no_valid_hosts(Some(err));
                return;
            }
        };

        self.rescan_interval = lookup.min_ttl;

        self.topology_updater.sync_hosts(lookup.hosts).await;
    }

    async fn lookup_hosts(&mut self) -> Result<LookupHosts> {
        #[cfg(test)]
        if let Some(mock) = self
            .client_options
            .test_options
            .as_ref()
            .and_then(|to| to.mock_lookup_hosts.as_ref())
        {
            return mock.clone();
        }

        let initial_hostname = self.initial_hostname.clone();
        let resolver = self.get_or_create_srv_resolver().await?;
        resolver
            .get_srv_hosts(initial_hostname.as_str(), crate::srv::DomainMismatch::Skip)
            .await
    }

    async fn get_or_create_srv_resolver(&mut self) -> Result<&SrvResolver> {
        if let Some(ref resolver) = self.resolver {
            return Ok(resolver);
        }

        let resolver = SrvResolver::new(
            self.client_options
                .resolver_config
                .clone()
                .map(|config| config.inner),
            self.client_options.srv_service_name.clone(),
        )
        .await?;

        // Since the resolver was not `Some` above, this will always insert the new resolver
        // and return a reference to it.
        Ok(self.resolver.get_or_insert(resolver))
    }

    /// A failed or empty rescan leaves the current host set in place and slows polling down
    /// to the heartbeat frequency until the record recovers.
    fn no_valid_hosts(&mut self, error: Option<Error>) {
        match error {
            Some(error) => tracing::warn!(
                target: SDAM_TRACING_EVENT_TARGET,
                "SRV lookup for {} failed: {}",
                self.initial_hostname,
                error
            ),
            None => tracing::warn!(
                target: SDAM_TRACING_EVENT_TARGET,
                "SRV lookup for {} returned no valid hosts",
                self.initial_hostname
            ),
        }

        self.rescan_interval = self.heartbeat_freq();
    }

    fn heartbeat_freq(&self) -> Duration {
        self.client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }
}
