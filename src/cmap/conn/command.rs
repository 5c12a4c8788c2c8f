use bson::{Bson, Document};

use super::wire::Message;
use crate::{
    client::ClusterTime,
    error::{CommandError, Error, ErrorKind, Result},
    hello::{HelloReply, LEGACY_HELLO_COMMAND_NAME_LOWERCASE},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Commands that may carry credentials or that run before compression is negotiated; these are
/// never compressed.
const UNCOMPRESSED_COMMAND_NAMES: &[&str] = &[
    "hello",
    LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    "saslstart",
    "saslcontinue",
    "getnonce",
    "authenticate",
    "createuser",
    "updateuser",
    "copydbsaslstart",
    "copydbgetnonce",
    "copydb",
];

/// Driver-side model of a database command.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            exhaust_allowed: false,
        }
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.body.insert("$clusterTime", cluster_time.to_document());
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    /// Whether this command is eligible for OP_COMPRESSED framing.
    pub(crate) fn should_compress(&self) -> bool {
        !UNCOMPRESSED_COMMAND_NAMES.contains(&self.name.to_lowercase().as_str())
    }
}

/// A response to a command, as returned by the server.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    body: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Result<Self> {
        let body = message.single_document_response()?;
        Ok(Self { source, body })
    }

    pub(crate) fn body(&self) -> &Document {
        &self.body
    }

    pub(crate) fn into_body(self) -> Document {
        self.body
    }

    fn is_success(&self) -> bool {
        match self.body.get("ok") {
            Some(Bson::Int32(ok)) => *ok == 1,
            Some(Bson::Int64(ok)) => *ok == 1,
            Some(Bson::Double(ok)) => *ok == 1.0,
            Some(Bson::Boolean(ok)) => *ok,
            _ => false,
        }
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok())
    }

    /// Validates that the server reported success, returning the embedded command error
    /// otherwise.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }

        let command_error: CommandError =
            bson::from_document(self.body.clone()).map_err(|_| {
                Error::invalid_response("failed command response missing error fields")
            })?;

        let labels: Option<Vec<String>> = self
            .body
            .get_array("errorLabels")
            .ok()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| label.as_str().map(String::from))
                    .collect()
            });

        Err(Error::new(ErrorKind::Command(command_error), labels))
    }

    /// Interprets this response as a reply to a `hello` or legacy hello command.
    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        self.validate()?;

        let cluster_time = self.cluster_time();
        let command_response = bson::from_document(self.body.clone())
            .map_err(|e| Error::invalid_response(format!("invalid hello reply: {}", e)))?;

        Ok(HelloReply {
            server_address: self.source.clone(),
            command_response,
            raw_command_response: self.into_body(),
            cluster_time,
        })
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::cmap::conn::wire::MessageSection;

    fn response_with(body: Document) -> RawCommandResponse {
        RawCommandResponse {
            source: ServerAddress::default(),
            body,
        }
    }

    #[test]
    fn command_error_extracted() {
        let response = response_with(doc! {
            "ok": 0.0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not primary",
            "errorLabels": ["RetryableWriteError"],
        });

        let error = response.validate().unwrap_err();
        assert_eq!(error.sdam_code(), Some(10107));
        assert!(error.is_notwritableprimary());
        assert!(error.contains_label("RetryableWriteError"));
    }

    #[test]
    fn hello_reply_parsed() {
        let response = response_with(doc! {
            "ok": 1.0,
            "isWritablePrimary": true,
            "maxWireVersion": 21,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27017"],
        });

        let reply = response.into_hello_reply().unwrap();
        assert_eq!(reply.command_response.max_wire_version, Some(21));
        assert_eq!(reply.command_response.set_name.as_deref(), Some("rs0"));
    }

    #[test]
    fn handshake_commands_not_compressed() {
        assert!(!Command::new("hello", "admin", doc! { "hello": 1 }).should_compress());
        assert!(!Command::new("isMaster", "admin", doc! { "isMaster": 1 }).should_compress());
        assert!(Command::new("ping", "admin", doc! { "ping": 1 }).should_compress());
    }

    #[test]
    fn multiple_sections_flattened_for_single_response() {
        let message = Message {
            response_to: 0,
            flags: Default::default(),
            sections: vec![MessageSection::Sequence {
                identifier: "documents".to_string(),
                documents: vec![doc! { "x": 1 }],
            }],
            checksum: None,
            request_id: None,
        };
        let response = RawCommandResponse::new(ServerAddress::default(), message).unwrap();
        assert_eq!(response.body().get_i32("x").unwrap(), 1);
    }
}
