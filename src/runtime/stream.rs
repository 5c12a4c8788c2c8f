use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::{ServerAddress, TlsOptions},
    runtime,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A stream to a server, possibly using TLS. The in-memory variant backs the
/// mock servers used by tests.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// Stand-in value taken from a connection being returned to its pool.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),

    /// A connection over a UNIX domain socket.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),

    /// One half of an in-memory duplex pipe.
    #[cfg(test)]
    Mock(tokio::io::DuplexStream),
}

async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream_future = TcpStream::connect(address);

    // A connect timeout of zero disables the timeout.
    let stream = if connect_timeout == Duration::from_secs(0) {
        stream_future.await?
    } else {
        runtime::timeout(connect_timeout, stream_future).await??
    };

    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    let stream = TcpStream::from_std(std_stream)?;

    Ok(stream)
}

async fn tcp_connect(host: &str, port: u16, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut socket_addrs: Vec<_> = tokio::net::lookup_host((host, port)).await?.collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("no addresses found for host {}", host),
        }
        .into());
    }

    // Try each resolved address in sequence with a preference for IPv4, as the
    // other drivers do.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;

    for address in &socket_addrs {
        connect_error = match try_connect(address, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    Err(connect_error.unwrap_or_else(|| {
        Error::from(ErrorKind::DnsResolve {
            message: format!("no addresses found for host {}", host),
        })
    }))
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, wrapping it in TLS if
    /// `tls_options` is provided.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls_options: Option<&TlsOptions>,
    ) -> Result<Self> {
        match address {
            ServerAddress::Tcp { host, port } => {
                let inner = tcp_connect(host, port.unwrap_or(27017), connect_timeout).await?;

                match tls_options {
                    #[cfg(feature = "rustls-tls")]
                    Some(cfg) => {
                        let stream = runtime::tls_connect(host, inner, cfg).await?;
                        Ok(Self::Tls(Box::new(stream)))
                    }
                    #[cfg(not(feature = "rustls-tls"))]
                    Some(_) => Err(ErrorKind::InvalidTlsConfig {
                        message: "TLS was requested, but the crate was compiled without a TLS \
                                  implementation"
                            .to_string(),
                    }
                    .into()),
                    None => Ok(Self::Tcp(inner)),
                }
            }
            #[cfg(unix)]
            ServerAddress::Unix { path } => {
                let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
                let stream = if timeout == Duration::from_secs(0) {
                    tokio::net::UnixStream::connect(path).await?
                } else {
                    runtime::timeout(timeout, tokio::net::UnixStream::connect(path)).await??
                };
                Ok(Self::Unix(stream))
            }
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(test)]
            Self::Mock(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(0)),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(test)]
            Self::Mock(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(test)]
            Self::Mock(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(test)]
            Self::Mock(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
