use std::time::Duration;

use crate::{
    client::auth::Credential,
    compression::Compressor,
    options::{ClientOptions, DriverInfo, TlsOptions},
};

/// The subset of the client options a per-server connection pool needs.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    pub(crate) app_name: Option<String>,

    pub(crate) compressors: Option<Vec<Compressor>>,

    pub(crate) connect_timeout: Option<Duration>,

    pub(crate) credential: Option<Credential>,

    pub(crate) driver_info: Option<DriverInfo>,

    pub(crate) load_balanced: Option<bool>,

    /// Connections ready for usage in the pool for longer than this will be closed.
    /// A value of zero means connections will not be closed due to being idle.
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections the pool can manage, including those checked out.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections the pool keeps established in the background.
    pub(crate) min_pool_size: Option<u32>,

    pub(crate) socket_timeout: Option<Duration>,

    pub(crate) tls_options: Option<TlsOptions>,

    /// How long a checkout request is willing to wait in a full pool's wait queue.
    pub(crate) wait_queue_timeout: Option<Duration>,

    /// Whether the pool should start out ready; used by tests that have no monitor to mark it.
    #[cfg(test)]
    pub(crate) ready: Option<bool>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            compressors: options.compressors.clone(),
            connect_timeout: options.connect_timeout,
            credential: options.credential.clone(),
            driver_info: options.driver_info.clone(),
            load_balanced: options.load_balanced,
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            socket_timeout: options.socket_timeout,
            tls_options: options.tls_options(),
            wait_queue_timeout: options.wait_queue_timeout,
            #[cfg(test)]
            ready: None,
        }
    }
}
