#[cfg(feature = "dns-resolver")]
mod resolver_config;
#[cfg(test)]
mod test;

use std::{
    borrow::Cow,
    convert::TryFrom,
    fmt::{self, Write},
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use bson::{Bson, Document};
use derivative::Derivative;
use serde::{de::Error as SerdeDeError, Deserialize, Deserializer, Serialize};
use strsim::jaro_winkler;
use typed_builder::TypedBuilder;

use crate::{
    client::auth::{AuthMechanism, Credential},
    compression::Compressor,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    error::{Error, ErrorKind, Result},
    event::sdam::SdamEventHandler,
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
    srv::{OriginalSrvInfo, SrvResolver},
    trace::CONNECTION_STRING_TRACING_EVENT_TARGET,
};

#[cfg(feature = "dns-resolver")]
pub use resolver_config::ResolverConfig;

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// The default name of the SRV service used to locate deployment hosts.
pub(crate) const DEFAULT_SRV_SERVICE_NAME: &str = "mongodb";

/// The set of URI options this crate recognises, in their canonical lowercased form.
/// Used to produce "did you mean" suggestions for misspelled options.
const URI_OPTIONS: &[&str] = &[
    "appname",
    "authmechanism",
    "authmechanismproperties",
    "authsource",
    "compressors",
    "connecttimeoutms",
    "directconnection",
    "heartbeatfrequencyms",
    "journal",
    "loadbalanced",
    "localthresholdms",
    "maxidletimems",
    "maxpoolsize",
    "maxstalenessseconds",
    "minpoolsize",
    "readconcernlevel",
    "readpreference",
    "readpreferencetags",
    "replicaset",
    "retryreads",
    "retrywrites",
    "safe",
    "serverselectiontimeoutms",
    "sockettimeoutms",
    "srvmaxhosts",
    "srvservicename",
    "ssl",
    "tls",
    "tlsallowinvalidcertificates",
    "tlsallowinvalidhostnames",
    "tlscafile",
    "tlscertificatekeyfile",
    "tlsinsecure",
    "w",
    "waitqueuetimeoutms",
    "wtimeoutms",
    "zlibcompressionlevel",
];

/// Reserved characters as defined by [Section 2.2 of RFC-3986](https://tools.ietf.org/html/rfc3986#section-2.2).
/// Usernames / passwords that contain these characters must instead include the URL encoded
/// version of them when included as part of the connection string.
const USERINFO_RESERVED_CHARACTERS: &[char] = &[':', '/', '?', '#', '[', ']', '@'];

const ILLEGAL_DATABASE_CHARACTERS: &[char] = &['/', '\\', ' ', '"', '$'];

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },

    /// A UNIX domain socket path.
    #[cfg(unix)]
    Unix {
        /// The path to the UNIX domain socket.
        path: PathBuf,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
            #[cfg(unix)]
            (Self::Unix { path }, Self::Unix { path: other_path }) => path == other_path,
            #[cfg(unix)]
            _ => false,
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
            #[cfg(unix)]
            Self::Unix { path } => path.hash(state),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        // UNIX domain socket paths arrive percent-encoded in connection strings and
        // are identified by their ".sock" suffix.
        if address.to_lowercase().ends_with(".sock") {
            #[cfg(unix)]
            {
                let decoded = percent_decode(address, "UNIX domain socket path must be URL encoded")?;
                return Ok(ServerAddress::Unix {
                    path: PathBuf::from(decoded),
                });
            }
            #[cfg(not(unix))]
            return Err(ErrorKind::InvalidArgument {
                message: "UNIX domain sockets are not supported on this platform".to_string(),
            }
            .into());
        }

        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) => {
                if part.is_empty() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; hostname cannot be empty",
                            address
                        ),
                    }
                    .into());
                }
                part
            }
            None => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; port must be non-zero",
                            address
                        ),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "address \"{}\" contains more than one unescaped ':'",
                            address
                        ),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> Cow<'_, str> {
        match self {
            Self::Tcp { host, .. } => Cow::Borrowed(host.as_str()),
            #[cfg(unix)]
            Self::Unix { path } => path.to_string_lossy(),
        }
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
            #[cfg(unix)]
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

/// Extra information to append to the driver version in the metadata of the handshake with the
/// server. This should be used by libraries wrapping this crate, e.g. full drivers or ODMs.
#[derive(Clone, Debug, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DriverInfo {
    /// The name of the library wrapping the driver.
    pub name: String,

    /// The version of the library wrapping the driver.
    #[builder(default)]
    pub version: Option<String>,

    /// Optional platform information for the wrapping driver.
    #[builder(default)]
    pub platform: Option<String>,
}

/// Specifies whether TLS configuration should be used with the operations that the
/// [`Client`](crate::Client) performs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

impl From<TlsOptions> for Option<Tls> {
    fn from(options: TlsOptions) -> Self {
        Some(Tls::Enabled(options))
    }
}

/// Specifies the TLS configuration that the [`Client`](crate::Client) should use.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether or not the [`Client`](crate::Client) should return an error if the server
    /// presents an invalid certificate. This setting should _not_ be set to `true` in
    /// production; it should only be used for testing.
    ///
    /// The default value is to error when the server presents an invalid certificate.
    pub allow_invalid_certificates: Option<bool>,

    /// Whether or not the [`Client`](crate::Client) should return an error if the hostname of
    /// the server does not match the hostname in its certificate. This setting should _not_ be
    /// set to `true` in production; it should only be used for testing.
    pub allow_invalid_hostnames: Option<bool>,

    /// The path to the CA file that the [`Client`](crate::Client) should use for TLS. If
    /// none is specified, then the driver will use the Mozilla root certificates from the
    /// `webpki-roots` crate.
    pub ca_file_path: Option<PathBuf>,

    /// The path to the certificate file that the [`Client`](crate::Client) should present
    /// to the server to verify its identity. If none is specified, then the client will not
    /// attempt to verify its identity to the server.
    pub cert_key_file_path: Option<PathBuf>,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Derivative, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[derivative(Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set the
    /// `direct_connection` field to `true`.
    #[builder(!default)]
    #[serde(default = "default_hosts")]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    /// This can be used in combination with the server logs to determine which Client is
    /// connected to a server.
    pub app_name: Option<String>,

    /// The compressors that the Client is willing to use in the order they are specified
    /// in the configuration. The Client sends this list of compressors to the server.
    /// The server responds with the intersection of its supported list of compressors.
    #[serde(skip)]
    pub compressors: Option<Vec<Compressor>>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to
    /// the server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The credential to use for authenticating connections made by this client.
    pub credential: Option<Credential>,

    /// The default database to use when one is not specified for an operation. Comes from the
    /// path portion of the connection string.
    pub default_database: Option<String>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// Extra information to append to the driver version in the metadata of the handshake with
    /// the server. This should be used by libraries wrapping this crate, e.g. full drivers or
    /// ODMs.
    pub driver_info: Option<DriverInfo>,

    /// The amount of time each monitoring task should wait between sending a hello command
    /// to its respective server.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time between
    /// the driver and server is allowed compared to the least round trip time of all the suitable
    /// servers. For example, if the average round trip times of the suitable servers are 5 ms, 10
    /// ms, and 15 ms, and the local threshold is 8 ms, then the first two servers are within the
    /// latency window and could be chosen for the operation, but the last one is not.
    ///
    /// A value of zero indicates that there is no latency window, so only the server with the
    /// lowest average round trip time is eligible.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a connection pool before being
    /// closed. A value of zero indicates that connections should not be closed due to being idle.
    ///
    /// By default, connections will not be closed due to being idle.
    pub max_idle_time: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server. If an operation is attempted on a server while
    /// `max_pool_size` connections are checked out, the operation will block until an in-progress
    /// operation finishes and its connection is checked back into the pool.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool
    /// at a given time. If fewer than `min_pool_size` connections are in the pool, connections
    /// will be added to the pool in the background until `min_pool_size` is reached.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// Specifies the default read concern for operations performed on the Client. See the
    /// ReadConcern type documentation for more details.
    pub read_concern: Option<ReadConcern>,

    /// The name of the replica set that the Client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The handler that should process all Server Discovery and Monitoring events. See the
    /// [`SdamEventHandler`] type documentation for more details.
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    #[serde(skip)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// The default selection criteria for operations performed on the Client. See the
    /// SelectionCriteria type documentation for more details.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The maximum number of hosts the client will adopt from an SRV lookup or rescan. When more
    /// hosts are returned, a random subset of this size is used.
    pub srv_max_hosts: Option<u32>,

    /// The name of the SRV service to query when resolving a `mongodb+srv` connection string.
    ///
    /// The default value is "mongodb".
    pub srv_service_name: Option<String>,

    /// The amount of time the Client should wait for a socket read or write to return before
    /// timing out.
    pub socket_timeout: Option<Duration>,

    /// The TLS configuration for the Client to use in its connections with the server.
    ///
    /// By default, TLS is disabled.
    pub tls: Option<Tls>,

    /// The amount of time a checkout request should wait for a connection to become available
    /// in a full pool before timing out.
    pub wait_queue_timeout: Option<Duration>,

    /// Specifies the default write concern for operations performed on the Client. See the
    /// WriteConcern type documentation for more details.
    pub write_concern: Option<WriteConcern>,

    /// Information from the SRV URI that generated these client options, if applicable.
    #[builder(default, setter(skip))]
    #[serde(skip)]
    pub(crate) original_srv_info: Option<OriginalSrvInfo>,

    #[builder(default, setter(skip))]
    #[serde(skip)]
    pub(crate) original_uri: Option<String>,

    /// Configuration of the DNS resolver used for SRV and TXT lookups.
    /// By default, the host system's resolver configuration will be used.
    #[cfg(feature = "dns-resolver")]
    #[builder(default, setter(skip))]
    #[serde(skip)]
    pub(crate) resolver_config: Option<ResolverConfig>,

    /// Whether or not the client is connecting to a MongoDB cluster through a load balancer.
    #[builder(default, setter(skip))]
    #[serde(rename = "loadbalanced")]
    pub(crate) load_balanced: Option<bool>,

    /// Control test behavior of the client.
    #[cfg(test)]
    #[builder(default, setter(skip))]
    #[serde(skip)]
    #[derivative(PartialEq = "ignore")]
    pub(crate) test_options: Option<TestOptions>,
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct TestOptions {
    /// Override the minimum wait between heartbeats.
    pub(crate) min_heartbeat_freq: Option<Duration>,

    /// Disable server and SRV-polling monitor tasks.
    pub(crate) disable_monitoring_threads: bool,

    /// Mock response for SRV polling lookups.
    pub(crate) mock_lookup_hosts: Option<Result<crate::srv::LookupHosts>>,
}

fn default_hosts() -> Vec<ServerAddress> {
    vec![ServerAddress::default()]
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().hosts(default_hosts()).build()
    }
}

impl ClientOptions {
    /// Parses a MongoDB connection string into a [`ClientOptions`] struct. If the string is
    /// malformed or one of the options has an invalid value, an error will be returned.
    ///
    /// In the case that "mongodb+srv" is used, SRV and TXT record lookups will be done as
    /// part of this method.
    ///
    /// The format of a MongoDB connection string is described [here](https://www.mongodb.com/docs/manual/reference/connection-string/#connection-string-formats).
    ///
    /// Keys in the options query string are case-insensitive. Unrecognised options are logged
    /// at the warning level and dropped; options with values of the wrong type produce an error.
    pub async fn parse(s: impl AsRef<str>) -> Result<Self> {
        Self::parse_uri(s.as_ref(), None).await
    }

    /// Parses a MongoDB connection string into a [`ClientOptions`] struct using the provided
    /// resolver configuration for SRV and TXT lookups.
    #[cfg(feature = "dns-resolver")]
    pub async fn parse_with_resolver_config(
        uri: impl AsRef<str>,
        resolver_config: ResolverConfig,
    ) -> Result<Self> {
        Self::parse_uri(uri.as_ref(), Some(resolver_config)).await
    }

    /// Populate this `ClientOptions` from the given URI, optionally using the resolver config
    /// for DNS lookups.
    pub(crate) async fn parse_uri(
        uri: &str,
        #[cfg(feature = "dns-resolver")] resolver_config: Option<ResolverConfig>,
        #[cfg(not(feature = "dns-resolver"))] resolver_config: Option<()>,
    ) -> Result<Self> {
        let parser = ClientOptionsParser::parse(uri)?;
        let srv = parser.srv;
        let auth_source_present = parser.auth_source.is_some();
        let mut options: Self = parser.into();
        #[cfg(feature = "dns-resolver")]
        {
            options.resolver_config = resolver_config;
        }
        #[cfg(not(feature = "dns-resolver"))]
        let _ = resolver_config;

        if srv {
            #[cfg(feature = "dns-resolver")]
            let resolver = SrvResolver::new(
                options.resolver_config.clone().map(|config| config.inner),
                options.srv_service_name.clone(),
            )
            .await?;
            #[cfg(not(feature = "dns-resolver"))]
            let resolver = SrvResolver::new(None, options.srv_service_name.clone()).await?;

            let mut config = resolver
                .resolve_client_options(options.hosts[0].host().as_ref())
                .await?;

            // Save the original SRV info to allow mongos polling.
            options.original_srv_info = OriginalSrvInfo {
                hostname: options.hosts[0].host().into_owned(),
                min_ttl: config.min_ttl,
            }
            .into();

            // Set the ClientOptions hosts to those found during the SRV lookup, bounded by
            // srvMaxHosts.
            options.hosts = config.hosts;
            if let Some(max) = options.srv_max_hosts {
                let max = max as usize;
                if max > 0 && max < options.hosts.len() {
                    options.hosts = crate::sdam::choose_n(&options.hosts, max).cloned().collect();
                }
            }

            // Enable TLS unless the user explicitly disabled it.
            if options.tls.is_none() {
                options.tls = Some(Tls::Enabled(Default::default()));
            }

            // Set the authSource TXT option found during SRV lookup unless the user already set
            // it. Note that this _does_ override the default database specified in the URI, since
            // it is supposed to be overridden by authSource.
            if !auth_source_present {
                if let Some(auth_source) = config.auth_source.take() {
                    if let Some(ref mut credential) = options.credential {
                        credential.source = Some(auth_source);
                    }
                }
            }

            // Set the replica set name TXT option found during SRV lookup unless the user already
            // set it.
            if options.repl_set_name.is_none() {
                if let Some(replica_set) = config.replica_set.take() {
                    options.repl_set_name = Some(replica_set);
                }
            }

            if options.load_balanced.is_none() {
                options.load_balanced = config.load_balanced;
            }
        }

        options.validate()?;
        Ok(options)
    }

    /// Parses a connection string without performing SRV or TXT lookups, for tests that exercise
    /// the parser in isolation.
    #[cfg(test)]
    pub(crate) fn parse_without_srv_resolution(s: &str) -> Result<Self> {
        let parser = ClientOptionsParser::parse(s)?;
        let options: Self = parser.into();
        options.validate()?;

        Ok(options)
    }

    pub(crate) fn tls_options(&self) -> Option<TlsOptions> {
        match self.tls {
            Some(Tls::Enabled(ref opts)) => Some(opts.clone()),
            _ => None,
        }
    }

    /// Ensure the options set are valid, returning an error describing the problem if they are
    /// not.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "no hosts specified".to_string(),
            }
            .into());
        }

        if let Some(true) = self.direct_connection {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify multiple seeds with directConnection=true".to_string(),
                }
                .into());
            }
        }

        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }

        if self.load_balanced.unwrap_or(false) {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify multiple seeds with loadBalanced=true".to_string(),
                }
                .into());
            }
            if self.repl_set_name.is_some() {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify replicaSet with loadBalanced=true".to_string(),
                }
                .into());
            }
            if self.direct_connection == Some(true) {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify directConnection=true with loadBalanced=true"
                        .to_string(),
                }
                .into());
            }
        }

        if self.srv_max_hosts.map_or(false, |m| m > 0) {
            if self.repl_set_name.is_some() {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify replicaSet with srvMaxHosts".to_string(),
                }
                .into());
            }
            if self.load_balanced == Some(true) {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot specify loadBalanced=true with srvMaxHosts".to_string(),
                }
                .into());
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < MIN_HEARTBEAT_FREQUENCY {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "'heartbeat_freq' must be at least {}ms, but {}ms was given",
                        MIN_HEARTBEAT_FREQUENCY.as_millis(),
                        heartbeat_freq.as_millis()
                    ),
                }
                .into());
            }
        }

        if let Some(ref compressors) = self.compressors {
            for compressor in compressors {
                compressor.validate()?;
            }
        }

        if let Some(0) = self.max_pool_size {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot specify maxPoolSize=0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Re-serialises these options as a canonical connection string. Parsing the returned string
    /// produces an equivalent set of options.
    pub fn to_connection_string(&self) -> String {
        let mut out = String::from("mongodb://");

        if let Some(ref credential) = self.credential {
            if let Some(ref username) = credential.username {
                out.push_str(&percent_encode_userinfo(username));
                if let Some(ref password) = credential.password {
                    out.push(':');
                    out.push_str(&percent_encode_userinfo(password));
                }
                out.push('@');
            }
        }

        let hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|host| match host {
                ServerAddress::Tcp { host, port } => match port {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.clone(),
                },
                #[cfg(unix)]
                ServerAddress::Unix { path } => percent_encoding::percent_encode(
                    path.to_string_lossy().as_bytes(),
                    percent_encoding::NON_ALPHANUMERIC,
                )
                .to_string(),
            })
            .collect();
        out.push_str(&hosts.join(","));
        out.push('/');

        if let Some(ref db) = self.default_database {
            out.push_str(db);
        }

        let mut options: Vec<(String, String)> = Vec::new();
        macro_rules! push_option {
            ($name:expr, $value:expr) => {
                options.push(($name.to_string(), $value))
            };
        }

        if let Some(ref app_name) = self.app_name {
            push_option!("appName", app_name.clone());
        }
        if let Some(ref credential) = self.credential {
            if let Some(ref mechanism) = credential.mechanism {
                push_option!("authMechanism", mechanism.as_str().to_string());
            }
            if let Some(ref source) = credential.source {
                push_option!("authSource", source.clone());
            }
            if let Some(ref props) = credential.mechanism_properties {
                let rendered: Vec<String> = props
                    .iter()
                    .map(|(k, v)| match v {
                        Bson::String(s) => format!("{}:{}", k, s),
                        other => format!("{}:{}", k, other),
                    })
                    .collect();
                push_option!("authMechanismProperties", rendered.join(","));
            }
        }
        if let Some(ref compressors) = self.compressors {
            let names: Vec<&str> = compressors.iter().map(|c| c.name()).collect();
            push_option!("compressors", names.join(","));
            for compressor in compressors {
                if let Compressor::Zlib { level: Some(level) } = compressor {
                    push_option!("zlibCompressionLevel", level.to_string());
                }
            }
        }
        if let Some(connect_timeout) = self.connect_timeout {
            push_option!("connectTimeoutMS", connect_timeout.as_millis().to_string());
        }
        if let Some(direct) = self.direct_connection {
            push_option!("directConnection", direct.to_string());
        }
        if let Some(heartbeat_freq) = self.heartbeat_freq {
            push_option!("heartbeatFrequencyMS", heartbeat_freq.as_millis().to_string());
        }
        if let Some(load_balanced) = self.load_balanced {
            push_option!("loadBalanced", load_balanced.to_string());
        }
        if let Some(local_threshold) = self.local_threshold {
            push_option!("localThresholdMS", local_threshold.as_millis().to_string());
        }
        if let Some(max_idle_time) = self.max_idle_time {
            push_option!("maxIdleTimeMS", max_idle_time.as_millis().to_string());
        }
        if let Some(max_pool_size) = self.max_pool_size {
            push_option!("maxPoolSize", max_pool_size.to_string());
        }
        if let Some(min_pool_size) = self.min_pool_size {
            push_option!("minPoolSize", min_pool_size.to_string());
        }
        if let Some(ref read_concern) = self.read_concern {
            push_option!("readConcernLevel", read_concern.level.as_str().to_string());
        }
        if let Some(SelectionCriteria::ReadPreference(ref rp)) = self.selection_criteria {
            push_option!("readPreference", rp.mode_str().to_string());
            if let Some(max_staleness) = rp.max_staleness() {
                push_option!("maxStalenessSeconds", max_staleness.as_secs().to_string());
            }
            if let Some(tag_sets) = rp.tag_sets() {
                for tag_set in tag_sets {
                    let mut tags: Vec<String> = tag_set
                        .iter()
                        .map(|(k, v)| format!("{}:{}", k, v))
                        .collect();
                    tags.sort();
                    push_option!("readPreferenceTags", tags.join(","));
                }
            }
        }
        if let Some(ref repl_set_name) = self.repl_set_name {
            push_option!("replicaSet", repl_set_name.clone());
        }
        if let Some(retry_reads) = self.retry_reads {
            push_option!("retryReads", retry_reads.to_string());
        }
        if let Some(retry_writes) = self.retry_writes {
            push_option!("retryWrites", retry_writes.to_string());
        }
        if let Some(server_selection_timeout) = self.server_selection_timeout {
            push_option!(
                "serverSelectionTimeoutMS",
                server_selection_timeout.as_millis().to_string()
            );
        }
        if let Some(socket_timeout) = self.socket_timeout {
            push_option!("socketTimeoutMS", socket_timeout.as_millis().to_string());
        }
        if let Some(srv_max_hosts) = self.srv_max_hosts {
            push_option!("srvMaxHosts", srv_max_hosts.to_string());
        }
        if let Some(ref srv_service_name) = self.srv_service_name {
            push_option!("srvServiceName", srv_service_name.clone());
        }
        match self.tls {
            Some(Tls::Disabled) => push_option!("tls", "false".to_string()),
            Some(Tls::Enabled(ref tls_options)) => {
                push_option!("tls", "true".to_string());
                if let Some(allow) = tls_options.allow_invalid_certificates {
                    push_option!("tlsAllowInvalidCertificates", allow.to_string());
                }
                if let Some(allow) = tls_options.allow_invalid_hostnames {
                    push_option!("tlsAllowInvalidHostnames", allow.to_string());
                }
                if let Some(ref path) = tls_options.ca_file_path {
                    push_option!("tlsCAFile", path.to_string_lossy().into_owned());
                }
                if let Some(ref path) = tls_options.cert_key_file_path {
                    push_option!("tlsCertificateKeyFile", path.to_string_lossy().into_owned());
                }
            }
            None => {}
        }
        if let Some(ref write_concern) = self.write_concern {
            if let Some(ref w) = write_concern.w {
                let rendered = match w {
                    Acknowledgment::Nodes(n) => n.to_string(),
                    Acknowledgment::Majority => "majority".to_string(),
                    Acknowledgment::Custom(ref s) => s.clone(),
                };
                push_option!("w", rendered);
            }
            if let Some(journal) = write_concern.journal {
                push_option!("journal", journal.to_string());
            }
            if let Some(w_timeout) = write_concern.w_timeout {
                push_option!("wtimeoutMS", w_timeout.as_millis().to_string());
            }
        }
        if let Some(wait_queue_timeout) = self.wait_queue_timeout {
            push_option!(
                "waitQueueTimeoutMS",
                wait_queue_timeout.as_millis().to_string()
            );
        }

        if !options.is_empty() {
            out.push('?');
            let mut first = true;
            for (key, value) in options {
                if !first {
                    out.push('&');
                }
                first = false;
                let _ = write!(out, "{}={}", key, value);
            }
        }

        out
    }

    /// Applies the options in other to these options if a value is not already present.
    #[cfg(test)]
    pub(crate) fn merge(&mut self, other: ClientOptions) {
        merge_options!(
            other,
            self,
            [
                app_name,
                compressors,
                connect_timeout,
                credential,
                default_database,
                direct_connection,
                driver_info,
                heartbeat_freq,
                local_threshold,
                max_idle_time,
                max_pool_size,
                min_pool_size,
                read_concern,
                repl_set_name,
                retry_reads,
                retry_writes,
                selection_criteria,
                server_selection_timeout,
                socket_timeout,
                tls,
                write_concern,
                original_srv_info,
                original_uri
            ]
        );
    }

    #[cfg(test)]
    pub(crate) fn test_options_mut(&mut self) -> &mut TestOptions {
        self.test_options.get_or_insert_with(Default::default)
    }
}

fn percent_encode_userinfo(s: &str) -> String {
    percent_encoding::percent_encode(s.as_bytes(), percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Splits a string into a section before a given index and a section exclusively after the index.
/// Empty portions are returned as `None`.
fn exclusive_split_at(s: &str, i: usize) -> (Option<&str>, Option<&str>) {
    let (l, r) = s.split_at(i);

    let lout = if !l.is_empty() { Some(l) } else { None };
    let rout = if r.len() > 1 { Some(&r[1..]) } else { None };

    (lout, rout)
}

fn percent_decode(s: &str, err_message: &str) -> Result<String> {
    match percent_encoding::percent_decode_str(s).decode_utf8() {
        Ok(result) => Ok(result.to_string()),
        Err(_) => Err(ErrorKind::InvalidUri {
            message: err_message.to_string(),
        }
        .into()),
    }
}

fn validate_userinfo(s: &str, userinfo_type: &str) -> Result<()> {
    if s.chars().any(|c| USERINFO_RESERVED_CHARACTERS.contains(&c)) {
        return Err(ErrorKind::InvalidUri {
            message: format!("{} must be URL encoded", userinfo_type),
        }
        .into());
    }

    // All instances of '%' in the username must be part of an percent-encoded substring. This
    // means that there must be two hexadecimal digits following any '%' in the username.
    if s.split('%')
        .skip(1)
        .any(|part| part.len() < 2 || part[0..2].chars().any(|c| !c.is_ascii_hexdigit()))
    {
        return Err(ErrorKind::InvalidUri {
            message: "username/password cannot contain unescaped %".to_string(),
        }
        .into());
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct ClientOptionsParser {
    pub hosts: Vec<ServerAddress>,
    pub srv: bool,
    pub app_name: Option<String>,
    pub tls: Option<Tls>,
    pub heartbeat_freq: Option<Duration>,
    pub local_threshold: Option<Duration>,
    pub read_concern: Option<ReadConcern>,
    pub selection_criteria: Option<SelectionCriteria>,
    pub repl_set_name: Option<String>,
    pub write_concern: Option<WriteConcern>,
    pub server_selection_timeout: Option<Duration>,
    pub max_pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
    pub max_idle_time: Option<Duration>,
    pub wait_queue_timeout: Option<Duration>,
    pub compressors: Option<Vec<Compressor>>,
    pub connect_timeout: Option<Duration>,
    pub retry_reads: Option<bool>,
    pub retry_writes: Option<bool>,
    pub socket_timeout: Option<Duration>,
    pub zlib_compression: Option<i32>,
    pub direct_connection: Option<bool>,
    pub credential: Option<Credential>,
    pub default_database: Option<String>,
    pub srv_max_hosts: Option<u32>,
    pub srv_service_name: Option<String>,
    max_staleness: Option<Duration>,
    tls_insecure: Option<bool>,
    safe: Option<bool>,
    auth_mechanism: Option<AuthMechanism>,
    auth_source: Option<String>,
    auth_mechanism_properties: Option<Document>,
    read_preference: Option<ReadPreference>,
    read_preference_tags: Option<Vec<TagSet>>,
    load_balanced: Option<bool>,
    original_uri: String,
}

impl From<ClientOptionsParser> for ClientOptions {
    fn from(parser: ClientOptionsParser) -> Self {
        Self {
            hosts: parser.hosts,
            app_name: parser.app_name,
            tls: parser.tls,
            heartbeat_freq: parser.heartbeat_freq,
            local_threshold: parser.local_threshold,
            read_concern: parser.read_concern,
            selection_criteria: parser.selection_criteria,
            repl_set_name: parser.repl_set_name,
            write_concern: parser.write_concern,
            max_pool_size: parser.max_pool_size,
            min_pool_size: parser.min_pool_size,
            max_idle_time: parser.max_idle_time,
            wait_queue_timeout: parser.wait_queue_timeout,
            server_selection_timeout: parser.server_selection_timeout,
            compressors: parser.compressors,
            connect_timeout: parser.connect_timeout,
            retry_reads: parser.retry_reads,
            retry_writes: parser.retry_writes,
            socket_timeout: parser.socket_timeout,
            direct_connection: parser.direct_connection,
            default_database: parser.default_database,
            driver_info: None,
            credential: parser.credential,
            srv_max_hosts: parser.srv_max_hosts,
            srv_service_name: parser.srv_service_name,
            original_srv_info: None,
            original_uri: Some(parser.original_uri),
            #[cfg(feature = "dns-resolver")]
            resolver_config: None,
            load_balanced: parser.load_balanced,
            sdam_event_handler: None,
            #[cfg(test)]
            test_options: None,
        }
    }
}

impl ClientOptionsParser {
    fn parse(s: &str) -> Result<Self> {
        let end_of_scheme = match s.find("://") {
            Some(index) => index,
            None => {
                return Err(ErrorKind::InvalidUri {
                    message: "connection string contains no scheme".to_string(),
                }
                .into())
            }
        };

        let srv = match &s[..end_of_scheme] {
            "mongodb" => false,
            "mongodb+srv" => true,
            _ => {
                return Err(ErrorKind::InvalidUri {
                    message: format!("invalid connection string scheme: {}", &s[..end_of_scheme]),
                }
                .into())
            }
        };

        let after_scheme = &s[end_of_scheme + 3..];

        let (pre_slash, post_slash) = match after_scheme.find('/') {
            Some(slash_index) => match exclusive_split_at(after_scheme, slash_index) {
                (Some(section), o) => (section, o),
                (None, _) => {
                    return Err(ErrorKind::InvalidUri {
                        message: "missing hosts".to_string(),
                    }
                    .into())
                }
            },
            None => {
                if after_scheme.find('?').is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "missing delimiting slash between hosts and options".to_string(),
                    }
                    .into());
                }
                (after_scheme, None)
            }
        };

        let (database, options_section) = match post_slash {
            Some(section) => match section.find('?') {
                Some(index) => exclusive_split_at(section, index),
                None => (post_slash, None),
            },
            None => (None, None),
        };

        let db = match database {
            Some(db) => {
                let decoded = percent_decode(db, "database name must be URL encoded")?;
                if decoded
                    .chars()
                    .any(|c| ILLEGAL_DATABASE_CHARACTERS.contains(&c))
                {
                    return Err(ErrorKind::InvalidUri {
                        message: "illegal character in database name".to_string(),
                    }
                    .into());
                }
                Some(decoded)
            }
            None => None,
        };

        let (authentication_requested, cred_section, hosts_section) = match pre_slash.rfind('@') {
            Some(index) => {
                // If '@' is in the host section, it MUST be interpreted as a request for
                // authentication, even if the credentials are empty.
                let (creds, hosts) = exclusive_split_at(pre_slash, index);
                match hosts {
                    Some(hs) => (true, creds, hs),
                    None => {
                        return Err(ErrorKind::InvalidUri {
                            message: "missing hosts".to_string(),
                        }
                        .into())
                    }
                }
            }
            None => (false, None, pre_slash),
        };

        let (username, password) = match cred_section {
            Some(creds) => match creds.find(':') {
                Some(index) => match exclusive_split_at(creds, index) {
                    (username, None) => (username, Some("")),
                    (username, password) => (username, password),
                },
                None => (Some(creds), None), // Lack of ":" implies whole string is username
            },
            None => (None, None),
        };

        let hosts: Result<Vec<_>> = hosts_section.split(',').map(ServerAddress::parse).collect();
        let hosts = hosts?;

        if srv {
            if hosts.len() != 1 {
                return Err(ErrorKind::InvalidUri {
                    message: "exactly one host must be specified with 'mongodb+srv'".into(),
                }
                .into());
            }

            if hosts[0].port().is_some() {
                return Err(ErrorKind::InvalidUri {
                    message: "a port cannot be specified with 'mongodb+srv'".into(),
                }
                .into());
            }

            #[cfg(unix)]
            if matches!(hosts[0], ServerAddress::Unix { .. }) {
                return Err(ErrorKind::InvalidUri {
                    message: "a UNIX domain socket cannot be specified with 'mongodb+srv'".into(),
                }
                .into());
            }
        }

        let mut options = ClientOptionsParser {
            hosts,
            srv,
            original_uri: s.into(),
            ..Default::default()
        };

        if let Some(opts) = options_section {
            options.parse_options(opts)?;
        }

        if !srv {
            if options.srv_max_hosts.is_some() {
                return Err(ErrorKind::InvalidUri {
                    message: "srvMaxHosts can only be specified with 'mongodb+srv'".into(),
                }
                .into());
            }
            if options.srv_service_name.is_some() {
                return Err(ErrorKind::InvalidUri {
                    message: "srvServiceName can only be specified with 'mongodb+srv'".into(),
                }
                .into());
            }
        }

        // Set username and password.
        if let Some(u) = username {
            let credential = options.credential.get_or_insert_with(Default::default);
            validate_userinfo(u, "username")?;
            let decoded_u = percent_decode(u, "username must be URL encoded")?;

            credential.username = Some(decoded_u);

            if let Some(pass) = password {
                validate_userinfo(pass, "password")?;
                let decoded_p = percent_decode(pass, "password must be URL encoded")?;
                credential.password = Some(decoded_p)
            }
        }

        if options.auth_source.as_deref() == Some("") {
            return Err(ErrorKind::InvalidUri {
                message: "empty authSource provided".to_string(),
            }
            .into());
        }

        let db_str = db.as_deref();

        match options.auth_mechanism {
            Some(ref mechanism) => {
                let credential = options.credential.get_or_insert_with(Default::default);

                credential.source = options
                    .auth_source
                    .clone()
                    .or_else(|| Some(mechanism.default_source(db_str).into()));

                if let Some(mut doc) = options.auth_mechanism_properties.take() {
                    match doc.remove("CANONICALIZE_HOST_NAME") {
                        Some(Bson::String(s)) => {
                            let val = match &s.to_lowercase()[..] {
                                "true" => Bson::Boolean(true),
                                "false" => Bson::Boolean(false),
                                _ => Bson::String(s),
                            };
                            doc.insert("CANONICALIZE_HOST_NAME", val);
                        }
                        Some(val) => {
                            doc.insert("CANONICALIZE_HOST_NAME", val);
                        }
                        None => {}
                    }

                    credential.mechanism_properties = Some(doc);
                }

                mechanism.apply_property_defaults(credential);
                mechanism.validate_credential(credential)?;
                credential.mechanism = options.auth_mechanism.take();
            }
            None => {
                if options.auth_mechanism_properties.is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "cannot specify authMechanismProperties without an \
                                  authMechanism"
                            .to_string(),
                    }
                    .into());
                }

                if let Some(ref mut credential) = options.credential {
                    // If credentials exist (i.e. username is specified) but no mechanism, the
                    // default source is chosen from the following list in
                    // order (skipping null ones): authSource option, connection string db,
                    // SCRAM default (i.e. "admin").
                    credential.source = options
                        .auth_source
                        .clone()
                        .or_else(|| db.clone())
                        .or_else(|| Some("admin".into()));
                } else if authentication_requested {
                    return Err(ErrorKind::InvalidUri {
                        message: "username and mechanism both not provided, but authentication \
                                  was requested"
                            .to_string(),
                    }
                    .into());
                }
            }
        };

        options.default_database = db;

        if options.tls.is_none() && options.srv {
            options.tls = Some(Tls::Enabled(Default::default()));
        }

        Ok(options)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = Vec::new();

        for option_pair in options.split('&') {
            let (key, value) = match option_pair.find('=') {
                Some(index) => option_pair.split_at(index),
                None => {
                    return Err(ErrorKind::InvalidUri {
                        message: format!(
                            "connection string options is not a `key=value` pair: {}",
                            option_pair,
                        ),
                    }
                    .into())
                }
            };

            let key = key.to_lowercase();

            // readPreferenceTags is the only option that composes by repetition; any other
            // repeated key is a conflict.
            if key != "readpreferencetags" && keys.contains(&key) {
                return Err(ErrorKind::InvalidUri {
                    message: "repeated options are not allowed in the connection string"
                        .to_string(),
                }
                .into());
            } else {
                keys.push(key.clone());
            }

            // Skip leading '=' in value.
            self.parse_option_pair(
                &key,
                percent_encoding::percent_decode(&value.as_bytes()[1..])
                    .decode_utf8_lossy()
                    .as_ref(),
            )?;
        }

        if let Some(tags) = self.read_preference_tags.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_tags(tags)?),
                None => {
                    return Err(ErrorKind::InvalidUri {
                        message: "cannot set read preference tags without also setting read \
                                  preference mode"
                            .to_string(),
                    }
                    .into())
                }
            };
        }

        if let Some(max_staleness) = self.max_staleness.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_max_staleness(max_staleness)?),
                None => {
                    return Err(ErrorKind::InvalidUri {
                        message: "cannot set max staleness without also setting read preference \
                                  mode"
                            .to_string(),
                    }
                    .into())
                }
            };
        }

        self.selection_criteria = self.read_preference.take().map(Into::into);

        if let Some(true) = self.direct_connection {
            if self.srv {
                return Err(ErrorKind::InvalidUri {
                    message: "cannot use SRV-style URI with directConnection=true".to_string(),
                }
                .into());
            }
        }

        // The legacy "safe" option is an alias for w=1 / w=0; an explicit conflicting `w`
        // is a canonical/deprecated pair disagreement.
        if let Some(safe) = self.safe.take() {
            let implied = Acknowledgment::Nodes(u32::from(safe));
            let write_concern = self.write_concern.get_or_insert_with(Default::default);
            match write_concern.w {
                None => write_concern.w = Some(implied),
                Some(ref w) if *w == implied => {}
                Some(_) => {
                    return Err(ErrorKind::InvalidUri {
                        message: "safe=true conflicts with the specified w value".to_string(),
                    }
                    .into())
                }
            }
        }

        // If zlib and zlib_compression_level are specified then write zlib_compression_level
        // into the zlib enum.
        if let (Some(compressors), Some(zlib_compression)) =
            (self.compressors.as_mut(), self.zlib_compression)
        {
            for compressor in compressors {
                compressor.write_zlib_level(zlib_compression)
            }
        }

        Ok(())
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        macro_rules! get_bool {
            ($value:expr, $option:expr) => {
                match $value {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!(
                                "connection string `{}` option must be a boolean",
                                $option,
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        macro_rules! get_duration {
            ($value:expr, $option:expr) => {
                match $value.parse::<u64>() {
                    Ok(i) => i,
                    _ => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!(
                                "connection string `{}` option must be a non-negative integer",
                                $option
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        macro_rules! get_u32 {
            ($value:expr, $option:expr) => {
                match value.parse::<u32>() {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!(
                                "connection string `{}` argument must be a positive integer",
                                $option,
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        macro_rules! get_i32 {
            ($value:expr, $option:expr) => {
                match value.parse::<i32>() {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!(
                                "connection string `{}` argument must be an integer",
                                $option
                            ),
                        }
                        .into())
                    }
                }
            };
        }

        match key {
            "appname" => {
                self.app_name = Some(value.into());
            }
            "authmechanism" => {
                self.auth_mechanism = Some(AuthMechanism::from_str(value)?);
            }
            "authsource" => self.auth_source = Some(value.to_string()),
            "authmechanismproperties" => {
                let mut doc = Document::new();
                let err_func = || {
                    ErrorKind::InvalidUri {
                        message: "improperly formatted authMechanismProperties".to_string(),
                    }
                    .into()
                };

                for kvp in value.split(',') {
                    match kvp.find(':') {
                        Some(index) => {
                            let (k, v) = exclusive_split_at(kvp, index);
                            let key = k.ok_or_else(err_func)?;
                            let value = v.ok_or_else(err_func)?;
                            doc.insert(key, value);
                        }
                        None => return Err(err_func()),
                    };
                }
                self.auth_mechanism_properties = Some(doc);
            }
            "compressors" => {
                let compressors = value
                    .split(',')
                    .map(Compressor::from_str)
                    .collect::<Result<Vec<Compressor>>>()?;
                self.compressors = if compressors.is_empty() {
                    None
                } else {
                    Some(compressors)
                }
            }
            k @ "connecttimeoutms" => {
                self.connect_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "directconnection" => {
                self.direct_connection = Some(get_bool!(value, k));
            }
            k @ "heartbeatfrequencyms" => {
                let duration = get_duration!(value, k);

                if duration < MIN_HEARTBEAT_FREQUENCY.as_millis() as u64 {
                    return Err(ErrorKind::InvalidUri {
                        message: format!(
                            "'heartbeatFrequencyMS' must be at least {}, but {} was given",
                            MIN_HEARTBEAT_FREQUENCY.as_millis(),
                            duration
                        ),
                    }
                    .into());
                }

                self.heartbeat_freq = Some(Duration::from_millis(duration));
            }
            k @ "journal" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);
                write_concern.journal = Some(get_bool!(value, k));
            }
            k @ "loadbalanced" => {
                self.load_balanced = Some(get_bool!(value, k));
            }
            k @ "localthresholdms" => {
                self.local_threshold = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "maxidletimems" => {
                self.max_idle_time = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "maxstalenessseconds" => {
                let max_staleness = Duration::from_secs(get_duration!(value, k));

                if max_staleness > Duration::from_secs(0) && max_staleness < Duration::from_secs(90)
                {
                    return Err(ErrorKind::InvalidUri {
                        message: "'maxStalenessSeconds' cannot be both positive and below 90"
                            .into(),
                    }
                    .into());
                }

                self.max_staleness = Some(max_staleness);
            }
            k @ "maxpoolsize" => {
                self.max_pool_size = Some(get_u32!(value, k));
            }
            k @ "minpoolsize" => {
                self.min_pool_size = Some(get_u32!(value, k));
            }
            "readconcernlevel" => {
                self.read_concern = Some(ReadConcernLevel::from_str(value).into());
            }
            "readpreference" => {
                self.read_preference = Some(match &value.to_lowercase()[..] {
                    "primary" => ReadPreference::Primary,
                    "secondary" => ReadPreference::Secondary {
                        tag_sets: None,
                        max_staleness: None,
                    },
                    "primarypreferred" => ReadPreference::PrimaryPreferred {
                        tag_sets: None,
                        max_staleness: None,
                    },
                    "secondarypreferred" => ReadPreference::SecondaryPreferred {
                        tag_sets: None,
                        max_staleness: None,
                    },
                    "nearest" => ReadPreference::Nearest {
                        tag_sets: None,
                        max_staleness: None,
                    },
                    other => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!("'{}' is not a valid read preference", other),
                        }
                        .into())
                    }
                });
            }
            "readpreferencetags" => {
                let tags: Result<TagSet> = if value.is_empty() {
                    Ok(TagSet::new())
                } else {
                    value
                        .split(',')
                        .map(|tag| {
                            let mut values = tag.split(':');

                            match (values.next(), values.next()) {
                                (Some(key), Some(value)) => {
                                    Ok((key.to_string(), value.to_string()))
                                }
                                _ => Err(ErrorKind::InvalidUri {
                                    message: format!(
                                        "'{}' is not a valid read preference tag (which must be \
                                         of the form 'key:value')",
                                        value,
                                    ),
                                }
                                .into()),
                            }
                        })
                        .collect()
                };

                self.read_preference_tags
                    .get_or_insert_with(Vec::new)
                    .push(tags?);
            }
            "replicaset" => {
                self.repl_set_name = Some(value.to_string());
            }
            k @ "retrywrites" => {
                self.retry_writes = Some(get_bool!(value, k));
            }
            k @ "retryreads" => {
                self.retry_reads = Some(get_bool!(value, k));
            }
            k @ "safe" => {
                tracing::warn!(
                    target: CONNECTION_STRING_TRACING_EVENT_TARGET,
                    "the `safe` option is deprecated; use `w` instead"
                );
                self.safe = Some(get_bool!(value, k));
            }
            k @ "serverselectiontimeoutms" => {
                self.server_selection_timeout = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "sockettimeoutms" => {
                self.socket_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "srvmaxhosts" => {
                self.srv_max_hosts = Some(get_u32!(value, k));
            }
            "srvservicename" => {
                if value.is_empty() {
                    return Err(ErrorKind::InvalidUri {
                        message: "empty srvServiceName provided".to_string(),
                    }
                    .into());
                }
                self.srv_service_name = Some(value.to_string());
            }
            k @ "tls" | k @ "ssl" => {
                let tls = get_bool!(value, k);

                match (self.tls.as_ref(), tls) {
                    (Some(Tls::Disabled), true) | (Some(Tls::Enabled(..)), false) => {
                        return Err(ErrorKind::InvalidUri {
                            message: "all instances of `tls` and `ssl` must have the same value"
                                .to_string(),
                        }
                        .into());
                    }
                    _ => {}
                };

                if self.tls.is_none() {
                    let tls = if tls {
                        Tls::Enabled(Default::default())
                    } else {
                        Tls::Disabled
                    };

                    self.tls = Some(tls);
                }
            }
            k @ "tlsinsecure" => {
                let val = get_bool!(value, k);

                match self.tls {
                    Some(Tls::Disabled) => {
                        return Err(ErrorKind::InvalidUri {
                            message: "'tlsInsecure' can't be set if tls=false".into(),
                        }
                        .into())
                    }
                    Some(Tls::Enabled(ref options))
                        if options.allow_invalid_certificates.is_some()
                            || options.allow_invalid_hostnames.is_some() =>
                    {
                        return Err(ErrorKind::InvalidUri {
                            message: "'tlsInsecure' cannot be combined with \
                                      'tlsAllowInvalidCertificates' or 'tlsAllowInvalidHostnames'"
                                .into(),
                        }
                        .into());
                    }
                    Some(Tls::Enabled(ref mut options)) => {
                        options.allow_invalid_certificates = Some(val);
                        options.allow_invalid_hostnames = Some(val);
                    }
                    None => {
                        self.tls = Some(Tls::Enabled(
                            TlsOptions::builder()
                                .allow_invalid_certificates(Some(val))
                                .allow_invalid_hostnames(Some(val))
                                .build(),
                        ))
                    }
                }

                self.tls_insecure = Some(val);
            }
            k @ "tlsallowinvalidcertificates" | k @ "tlsallowinvalidhostnames" => {
                let val = get_bool!(value, k);

                if self.tls_insecure.is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "'tlsInsecure' cannot be combined with \
                                  'tlsAllowInvalidCertificates' or 'tlsAllowInvalidHostnames'"
                            .into(),
                    }
                    .into());
                }

                let set = |options: &mut TlsOptions| {
                    if k == "tlsallowinvalidcertificates" {
                        options.allow_invalid_certificates = Some(val);
                    } else {
                        options.allow_invalid_hostnames = Some(val);
                    }
                };

                match self.tls {
                    Some(Tls::Disabled) => {
                        return Err(ErrorKind::InvalidUri {
                            message: format!("'{}' can't be set if tls=false", k),
                        }
                        .into())
                    }
                    Some(Tls::Enabled(ref mut options)) => set(options),
                    None => {
                        let mut options = TlsOptions::default();
                        set(&mut options);
                        self.tls = Some(Tls::Enabled(options));
                    }
                }
            }
            "tlscafile" => match self.tls {
                Some(Tls::Disabled) => {
                    return Err(ErrorKind::InvalidUri {
                        message: "'tlsCAFile' can't be set if tls=false".into(),
                    }
                    .into());
                }
                Some(Tls::Enabled(ref mut options)) => {
                    options.ca_file_path = Some(value.into());
                }
                None => {
                    self.tls = Some(Tls::Enabled(
                        TlsOptions::builder()
                            .ca_file_path(Some(PathBuf::from(value)))
                            .build(),
                    ))
                }
            },
            "tlscertificatekeyfile" => match self.tls {
                Some(Tls::Disabled) => {
                    return Err(ErrorKind::InvalidUri {
                        message: "'tlsCertificateKeyFile' can't be set if tls=false".into(),
                    }
                    .into());
                }
                Some(Tls::Enabled(ref mut options)) => {
                    options.cert_key_file_path = Some(value.into());
                }
                None => {
                    self.tls = Some(Tls::Enabled(
                        TlsOptions::builder()
                            .cert_key_file_path(Some(PathBuf::from(value)))
                            .build(),
                    ))
                }
            },
            "w" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);

                match value.parse::<i32>() {
                    Ok(w) => match u32::try_from(w) {
                        Ok(uw) => write_concern.w = Some(Acknowledgment::from(uw)),
                        Err(_) => {
                            return Err(ErrorKind::InvalidUri {
                                message: "connection string `w` option cannot be a negative \
                                          integer"
                                    .to_string(),
                            }
                            .into())
                        }
                    },
                    Err(_) => {
                        write_concern.w = Some(Acknowledgment::from(value.to_string()));
                    }
                };
            }
            k @ "waitqueuetimeoutms" => {
                self.wait_queue_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "wtimeoutms" => {
                let write_concern = self.write_concern.get_or_insert_with(Default::default);
                write_concern.w_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "zlibcompressionlevel" => {
                let i = get_i32!(value, k);
                if i < -1 {
                    return Err(ErrorKind::InvalidUri {
                        message: "'zlibCompressionLevel' cannot be less than -1".to_string(),
                    }
                    .into());
                }

                if i > 9 {
                    return Err(ErrorKind::InvalidUri {
                        message: "'zlibCompressionLevel' cannot be greater than 9".to_string(),
                    }
                    .into());
                }

                self.zlib_compression = Some(i);
            }

            other => {
                // Unrecognised options are logged and dropped rather than treated as fatal,
                // with a suggestion when a known option is a close match.
                let (similarity, suggestion) =
                    URI_OPTIONS.iter().fold((0.0, ""), |acc, option| {
                        let similarity = jaro_winkler(option, other).abs();
                        if similarity > acc.0 {
                            return (similarity, option);
                        }
                        acc
                    });
                if similarity >= 0.84 {
                    tracing::warn!(
                        target: CONNECTION_STRING_TRACING_EVENT_TARGET,
                        "ignoring unrecognised connection string option `{}`; an option with a \
                         similar name exists: `{}`",
                        other,
                        suggestion,
                    );
                } else {
                    tracing::warn!(
                        target: CONNECTION_STRING_TRACING_EVENT_TARGET,
                        "ignoring unrecognised connection string option `{}`",
                        other,
                    );
                }
            }
        }

        Ok(())
    }
}
