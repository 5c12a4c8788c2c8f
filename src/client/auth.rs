//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).
//!
//! This crate validates credentials at the connection-string level and advertises
//! `saslSupportedMechs` during the handshake; the authentication conversations themselves
//! are the responsibility of the full driver layered on top.

use std::{fmt::Debug, str::FromStr};

use bson::{Bson, Document};
use derivative::Derivative;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::{Error, ErrorKind, Result};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_CR_STR: &str = "MONGODB-CR";
const GSSAPI_STR: &str = "GSSAPI";
const MONGODB_AWS_STR: &str = "MONGODB-AWS";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const PLAIN_STR: &str = "PLAIN";
const MONGODB_OIDC_STR: &str = "MONGODB-OIDC";

/// The OIDC provider environments a credential's `ENVIRONMENT` mechanism property may name.
const VALID_OIDC_ENVIRONMENTS: &[&str] = &["test", "azure", "gcp", "k8s"];

/// The authentication mechanisms supported by MongoDB.
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// MongoDB Challenge Response nonce and MD5 based authentication system. It is currently
    /// deprecated and will never be supported by this driver.
    MongoDbCr,

    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,

    /// Kerberos authentication mechanism as defined in [RFC 4752](http://tools.ietf.org/html/rfc4752).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/kerberos/) for more information.
    Gssapi,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](https://tools.ietf.org/html/rfc4616),
    /// is used in MongoDB to perform LDAP authentication and cannot be used for any other type
    /// of authentication.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-ldap/#ldap-proxy-authentication) for more information on LDAP authentication.
    Plain,

    /// MONGODB-AWS authenticates using AWS IAM credentials (an access key ID and a secret access
    /// key), temporary AWS IAM credentials obtained from an AWS Security Token Service (STS)
    /// Assume Role request, or temporary AWS IAM credentials assigned to an EC2 instance or ECS
    /// task.
    MongoDbAws,

    /// MONGODB-OIDC authenticates using [OpenID Connect](https://openid.net/developers/specs/) access tokens.
    MongoDbOidc,
}

impl AuthMechanism {
    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 | AuthMechanism::Plain => {
                if credential.username.as_deref().unwrap_or("").is_empty() {
                    return Err(ErrorKind::InvalidUri {
                        message: format!(
                            "a non-empty username is required for {} authentication",
                            self.as_str()
                        ),
                    }
                    .into());
                }

                if credential.password.as_deref().unwrap_or("").is_empty() {
                    return Err(ErrorKind::InvalidUri {
                        message: format!(
                            "a non-empty password is required for {} authentication",
                            self.as_str()
                        ),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "a password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidUri {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::Gssapi => {
                if credential.username.as_deref().unwrap_or("").is_empty() {
                    return Err(ErrorKind::InvalidUri {
                        message: "a username is required for GSSAPI authentication".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidUri {
                        message: "only $external may be specified as an auth source for GSSAPI"
                            .to_string(),
                    }
                    .into());
                }

                if let Some(properties) = credential.mechanism_properties.as_ref() {
                    match properties.get("CANONICALIZE_HOST_NAME") {
                        None | Some(Bson::Boolean(_)) => {}
                        Some(other) => {
                            return Err(ErrorKind::InvalidUri {
                                message: format!(
                                    "CANONICALIZE_HOST_NAME must be \"true\" or \"false\", got \
                                     {}",
                                    other
                                ),
                            }
                            .into())
                        }
                    }
                }

                Ok(())
            }
            AuthMechanism::MongoDbAws => {
                if credential.username.is_some() != credential.password.is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "username and password must either both be specified or both be \
                                  omitted for MONGODB-AWS authentication"
                            .to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidUri {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-AWS"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::MongoDbOidc => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidUri {
                        message: "a password cannot be specified with MONGODB-OIDC".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidUri {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-OIDC"
                            .to_string(),
                    }
                    .into());
                }

                let environment = credential
                    .mechanism_properties
                    .as_ref()
                    .and_then(|p| p.get_str("ENVIRONMENT").ok());
                let has_token_resource = credential
                    .mechanism_properties
                    .as_ref()
                    .map_or(false, |p| p.contains_key("TOKEN_RESOURCE"));

                match environment {
                    None => Ok(()),
                    Some(env) if !VALID_OIDC_ENVIRONMENTS.contains(&env) => {
                        Err(ErrorKind::InvalidUri {
                            message: format!(
                                "unsupported OIDC ENVIRONMENT {:?}; accepted environments are: \
                                 {}",
                                env,
                                VALID_OIDC_ENVIRONMENTS.join(", ")
                            ),
                        }
                        .into())
                    }
                    Some(env @ ("azure" | "gcp")) => {
                        if !has_token_resource {
                            return Err(ErrorKind::InvalidUri {
                                message: format!(
                                    "TOKEN_RESOURCE must be specified for the {} OIDC \
                                     environment",
                                    env
                                ),
                            }
                            .into());
                        }
                        if env == "gcp" && credential.username.is_some() {
                            return Err(ErrorKind::InvalidUri {
                                message: "a username cannot be specified for the gcp OIDC \
                                          environment"
                                    .to_string(),
                            }
                            .into());
                        }
                        Ok(())
                    }
                    Some(env) => {
                        if has_token_resource {
                            return Err(ErrorKind::InvalidUri {
                                message: format!(
                                    "TOKEN_RESOURCE cannot be specified for the {} OIDC \
                                     environment",
                                    env
                                ),
                            }
                            .into());
                        }
                        if env == "test" && credential.username.is_some() {
                            return Err(ErrorKind::InvalidUri {
                                message: "a username cannot be specified for the test OIDC \
                                          environment"
                                    .to_string(),
                            }
                            .into());
                        }
                        Ok(())
                    }
                }
            }
            AuthMechanism::MongoDbCr => Err(ErrorKind::InvalidUri {
                message: "MONGODB-CR is deprecated and not supported by this driver. Use SCRAM \
                          for password-based authentication instead"
                    .to_string(),
            }
            .into()),
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbCr => MONGODB_CR_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::Plain => PLAIN_STR,
            AuthMechanism::MongoDbAws => MONGODB_AWS_STR,
            AuthMechanism::MongoDbOidc => MONGODB_OIDC_STR,
        }
    }

    /// Get the default authSource for a given mechanism depending on the database provided in
    /// the connection string.
    pub(crate) fn default_source<'a>(&'a self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1
            | AuthMechanism::ScramSha256
            | AuthMechanism::Plain
            | AuthMechanism::MongoDbCr => uri_db.unwrap_or("admin"),
            AuthMechanism::MongoDbX509
            | AuthMechanism::Gssapi
            | AuthMechanism::MongoDbAws
            | AuthMechanism::MongoDbOidc => "$external",
        }
    }

    /// Applies mechanism-specific property defaults, e.g. GSSAPI's `SERVICE_NAME`.
    pub(crate) fn apply_property_defaults(&self, credential: &mut Credential) {
        if let AuthMechanism::Gssapi = self {
            let properties = credential
                .mechanism_properties
                .get_or_insert_with(Document::new);
            if !properties.contains_key("SERVICE_NAME") {
                properties.insert("SERVICE_NAME", "mongodb");
            }
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_CR_STR => Ok(AuthMechanism::MongoDbCr),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            MONGODB_AWS_STR => Ok(AuthMechanism::MongoDbAws),
            MONGODB_OIDC_STR => Ok(AuthMechanism::MongoDbOidc),

            _ => Err(ErrorKind::InvalidUri {
                message: format!(
                    "invalid mechanism string: {}; accepted mechanisms are: {}",
                    str,
                    [
                        SCRAM_SHA_1_STR,
                        SCRAM_SHA_256_STR,
                        MONGODB_X509_STR,
                        GSSAPI_STR,
                        PLAIN_STR,
                        MONGODB_AWS_STR,
                        MONGODB_OIDC_STR,
                    ]
                    .join(", ")
                ),
            }
            .into()),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned
/// a default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder, Derivative)]
#[derivative(PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted
    /// when authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to
    /// "admin" in SCRAM authentication mechanisms, "$external" for GSSAPI, MONGODB-X509,
    /// MONGODB-AWS, and MONGODB-OIDC, and the database name or "admin" for PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The database this credential resolves authentication against.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // The password is deliberately not included.
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .field("mechanism_properties", &self.mechanism_properties)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{AuthMechanism, Credential};

    fn credential(username: Option<&str>, password: Option<&str>) -> Credential {
        Credential {
            username: username.map(String::from),
            password: password.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn scram_requires_username_and_password() {
        let mechanism = AuthMechanism::ScramSha256;
        assert!(mechanism
            .validate_credential(&credential(Some("user"), Some("pass")))
            .is_ok());
        assert!(mechanism
            .validate_credential(&credential(Some("user"), None))
            .is_err());
        assert!(mechanism
            .validate_credential(&credential(None, Some("pass")))
            .is_err());
        assert!(mechanism
            .validate_credential(&credential(Some(""), Some("pass")))
            .is_err());
    }

    #[test]
    fn x509_forbids_password() {
        let mechanism = AuthMechanism::MongoDbX509;
        assert!(mechanism.validate_credential(&credential(None, None)).is_ok());
        assert!(mechanism
            .validate_credential(&credential(Some("CN=client"), None))
            .is_ok());
        assert!(mechanism
            .validate_credential(&credential(Some("CN=client"), Some("pass")))
            .is_err());

        let mut with_source = credential(None, None);
        with_source.source = Some("admin".to_string());
        assert!(mechanism.validate_credential(&with_source).is_err());
    }

    #[test]
    fn aws_requires_both_or_neither() {
        let mechanism = AuthMechanism::MongoDbAws;
        assert!(mechanism.validate_credential(&credential(None, None)).is_ok());
        assert!(mechanism
            .validate_credential(&credential(Some("key"), Some("secret")))
            .is_ok());
        assert!(mechanism
            .validate_credential(&credential(Some("key"), None))
            .is_err());
        assert!(mechanism
            .validate_credential(&credential(None, Some("secret")))
            .is_err());
    }

    #[test]
    fn unknown_mechanism_enumerates_accepted() {
        let err = AuthMechanism::from_str("SCRAM-SHA-512").unwrap_err();
        let message = err.message().unwrap();
        assert!(message.contains("SCRAM-SHA-1"));
        assert!(message.contains("MONGODB-OIDC"));
    }
}
