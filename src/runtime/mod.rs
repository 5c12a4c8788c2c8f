#[cfg(feature = "dns-resolver")]
mod resolver;
mod stream;
#[cfg(feature = "rustls-tls")]
mod tls_rustls;

use std::{future::Future, time::Duration};

#[cfg(feature = "dns-resolver")]
pub(crate) use self::resolver::AsyncResolver;
pub(crate) use self::stream::{AsyncStream, DEFAULT_CONNECT_TIMEOUT};
#[cfg(feature = "rustls-tls")]
pub(crate) use self::tls_rustls::tls_connect;

use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// The task is detached; dropping the returned handle does not cancel it.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Await a future for at most `timeout`, converting expiry into a network
/// timeout error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
