use std::sync::OnceLock;

use bson::{doc, Bson, Document};

use crate::{
    bson_util,
    cmap::{conn::StreamDescription, options::ConnectionPoolOptions, Command, Connection},
    compression::Compressor,
    error::{ErrorKind, Result},
    hello::{hello_command, HelloReply},
    options::{ClientOptions, DriverInfo},
};

/// The maximum size in bytes of the handshake metadata document; larger documents are truncated
/// field by field until they fit.
const MAX_METADATA_SIZE: usize = 512;

const MAX_APP_NAME_LENGTH: usize = 128;

#[derive(Clone, Debug, PartialEq)]
struct ClientMetadata {
    application: Option<String>,
    driver_name: String,
    driver_version: String,
    os_type: String,
    os_architecture: Option<String>,
    platform: Option<String>,
}

fn base_client_metadata() -> &'static ClientMetadata {
    static METADATA: OnceLock<ClientMetadata> = OnceLock::new();
    METADATA.get_or_init(|| ClientMetadata {
        application: None,
        driver_name: "mongodb-core".to_string(),
        driver_version: env!("CARGO_PKG_VERSION").to_string(),
        os_type: std::env::consts::OS.to_string(),
        os_architecture: Some(std::env::consts::ARCH.to_string()),
        platform: Some(format!(
            "{} with tokio",
            rustc_version_runtime::version_meta().short_version_string
        )),
    })
}

impl ClientMetadata {
    fn into_document(self) -> Document {
        let mut metadata = Document::new();

        if let Some(application) = self.application {
            metadata.insert("application", doc! { "name": application });
        }

        metadata.insert(
            "driver",
            doc! {
                "name": self.driver_name,
                "version": self.driver_version,
            },
        );

        let mut os = doc! { "type": self.os_type };
        if let Some(architecture) = self.os_architecture {
            os.insert("architecture", architecture);
        }
        metadata.insert("os", os);

        if let Some(platform) = self.platform {
            metadata.insert("platform", platform);
        }

        metadata
    }
}

/// The combined options a handshaker needs from the client configuration.
#[derive(Clone, Debug, Default)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) driver_info: Option<DriverInfo>,
    pub(crate) compressors: Option<Vec<Compressor>>,
    pub(crate) load_balanced: bool,
    /// The `<source>.<username>` to request `saslSupportedMechs` for, when the client was
    /// configured with a username but no explicit mechanism.
    pub(crate) sasl_supported_mechs_user: Option<String>,
}

impl From<&ConnectionPoolOptions> for HandshakerOptions {
    fn from(options: &ConnectionPoolOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            driver_info: options.driver_info.clone(),
            compressors: options.compressors.clone(),
            load_balanced: options.load_balanced.unwrap_or(false),
            sasl_supported_mechs_user: options.credential.as_ref().and_then(|credential| {
                match (&credential.mechanism, &credential.username) {
                    (None, Some(username)) => {
                        Some(format!("{}.{}", credential.resolved_source(), username))
                    }
                    _ => None,
                }
            }),
        }
    }
}

impl From<&ClientOptions> for HandshakerOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            driver_info: options.driver_info.clone(),
            compressors: options.compressors.clone(),
            load_balanced: options.load_balanced.unwrap_or(false),
            sasl_supported_mechs_user: options.credential.as_ref().and_then(|credential| {
                match (&credential.mechanism, &credential.username) {
                    (None, Some(username)) => {
                        Some(format!("{}.{}", credential.resolved_source(), username))
                    }
                    _ => None,
                }
            }),
        }
    }
}

/// Performs the first message exchange on a new stream: a `hello` (or legacy hello) carrying
/// the client metadata, compression preferences, and `saslSupportedMechs` request.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello or legacy hello command to send when the handshake starts.
    command: Command,

    compressors: Option<Vec<Compressor>>,

    load_balanced: bool,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Result<Self> {
        let mut metadata = base_client_metadata().clone();

        if let Some(app_name) = options.app_name {
            if app_name.len() > MAX_APP_NAME_LENGTH {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "appName must be at most {} bytes, but is {}",
                        MAX_APP_NAME_LENGTH,
                        app_name.len()
                    ),
                }
                .into());
            }
            metadata.application = Some(app_name);
        }

        if let Some(driver_info) = options.driver_info {
            metadata.driver_name = format!("{}|{}", metadata.driver_name, driver_info.name);
            if let Some(version) = driver_info.version {
                metadata.driver_version = format!("{}|{}", metadata.driver_version, version);
            }
            if let Some(platform) = driver_info.platform {
                metadata.platform = Some(match metadata.platform {
                    Some(base) => format!("{}|{}", base, platform),
                    None => platform,
                });
            }
        }

        // The first exchange on a fresh stream always uses the legacy command name unless the
        // deployment is load balanced, which implies a 5.0+ server.
        let mut command = hello_command(options.load_balanced.then_some(true), None, None);

        command
            .body
            .insert("client", truncated_metadata(metadata)?);

        if let Some(ref compressors) = options.compressors {
            command.body.insert(
                "compression",
                compressors
                    .iter()
                    .map(|compressor| Bson::String(compressor.name().to_string()))
                    .collect::<Vec<_>>(),
            );
        }

        if let Some(user) = options.sasl_supported_mechs_user {
            command.body.insert("saslSupportedMechs", user);
        }

        Ok(Self {
            command,
            compressors: options.compressors,
            load_balanced: options.load_balanced,
        })
    }

    /// Runs the handshake on the given connection, filling in its stream description and
    /// negotiated compressor.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let command = self.command.clone();

        // Load-balanced mode implies OP_MSG support; everything else starts with the legacy
        // framing since the server's wire version isn't known yet.
        let response = if self.load_balanced {
            conn.send_command(command).await?
        } else {
            conn.send_handshake(command).await?
        };

        let hello_reply = response.into_hello_reply()?;

        if self.load_balanced && hello_reply.command_response.service_id.is_none() {
            return Err(ErrorKind::IncompatibleServer {
                message: "load-balanced mode requires a serviceId in the handshake response"
                    .to_string(),
            }
            .into());
        }

        conn.set_stream_description(StreamDescription::from_hello_reply(&hello_reply));

        // Use the first compressor in our configured order that the server also supports.
        if let (Some(ours), Some(theirs)) = (
            self.compressors.as_ref(),
            hello_reply.command_response.compressors.as_ref(),
        ) {
            conn.compressor = ours
                .iter()
                .find(|compressor| theirs.iter().any(|name| name == compressor.name()))
                .cloned();
        }

        Ok(hello_reply)
    }
}

/// Shrinks the metadata until its document form fits in the size the server will accept,
/// dropping the least essential fields first.
fn truncated_metadata(mut metadata: ClientMetadata) -> Result<Document> {
    let mut doc = metadata.clone().into_document();
    if bson_util::doc_size_bytes(&doc)? <= MAX_METADATA_SIZE {
        return Ok(doc);
    }

    metadata.platform = None;
    doc = metadata.clone().into_document();
    if bson_util::doc_size_bytes(&doc)? <= MAX_METADATA_SIZE {
        return Ok(doc);
    }

    metadata.os_architecture = None;
    doc = metadata.into_document();
    Ok(doc)
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::{Handshaker, HandshakerOptions};
    use crate::hello::LEGACY_HELLO_COMMAND_NAME;

    #[test]
    fn metadata_sent_in_handshake() {
        let handshaker = Handshaker::new(HandshakerOptions {
            app_name: Some("myApp".to_string()),
            ..Default::default()
        })
        .unwrap();

        let body = &handshaker.command.body;
        assert_eq!(body.get_i32(LEGACY_HELLO_COMMAND_NAME).unwrap(), 1);
        assert!(body.get_bool("helloOk").unwrap());

        let client = body.get_document("client").unwrap();
        assert_eq!(
            client.get_document("application").unwrap(),
            &doc! { "name": "myApp" }
        );
        assert_eq!(
            client
                .get_document("driver")
                .unwrap()
                .get_str("name")
                .unwrap(),
            "mongodb-core"
        );
        assert!(client.get_document("os").unwrap().get_str("type").is_ok());
    }

    #[test]
    fn load_balanced_handshake_uses_hello() {
        let handshaker = Handshaker::new(HandshakerOptions {
            load_balanced: true,
            ..Default::default()
        })
        .unwrap();
        assert!(handshaker.command.body.get("hello").is_some());
        assert!(handshaker.command.body.get_bool("loadBalanced").unwrap());
    }

    #[test]
    fn over_long_app_name_rejected() {
        let result = Handshaker::new(HandshakerOptions {
            app_name: Some("a".repeat(129)),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn sasl_supported_mechs_advertised_for_username() {
        let handshaker = Handshaker::new(HandshakerOptions {
            sasl_supported_mechs_user: Some("admin.alice".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            handshaker
                .command
                .body
                .get_str("saslSupportedMechs")
                .unwrap(),
            "admin.alice"
        );
    }
}
