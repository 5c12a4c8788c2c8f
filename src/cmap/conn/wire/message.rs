use std::io::Cursor;

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson_util,
    cmap::conn::command::Command,
    compression::{self, Compressor},
    error::{Error, ErrorKind, Result},
};

/// Maximum size in bytes this crate will accept for a reply before the stream description is
/// known.
const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1000 * 1000;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from a given `Command`.
    pub(crate) fn with_command(mut command: Command, request_id: Option<i32>) -> Self {
        command.body.insert("$db", command.target_db);

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Self {
            response_to: 0,
            flags,
            sections: vec![MessageSection::Document(command.body)],
            checksum: None,
            request_id,
        }
    }

    /// Gets the first document contained in this Message.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .next()
            .and_then(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { documents, .. } => documents.into_iter().next(),
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no response received from server".into(),
                }
                .into()
            })
    }

    /// Whether the server will stream further replies on this request id without additional
    /// requests.
    pub(crate) fn more_to_come(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Reads bytes from `reader` and deserializes them into a Message, transparently
    /// decompressing OP_COMPRESSED frames and converting OP_REPLY frames from legacy
    /// handshakes.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        let body_len = header.length - Header::LENGTH as i32;
        if !(0..=DEFAULT_MAX_MESSAGE_SIZE_BYTES).contains(&body_len) {
            return Err(ErrorKind::InvalidResponse {
                message: format!("server response header specified length {}", header.length),
            }
            .into());
        }

        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body).await?;

        match header.op_code {
            OpCode::Message => Self::parse_op_msg_body(header.response_to, &body),
            OpCode::Reply => Self::parse_op_reply_body(header.response_to, &body),
            OpCode::Compressed => {
                let (original_op_code, decompressed) = decompress_body(&body)?;
                match original_op_code {
                    OpCode::Message => Self::parse_op_msg_body(header.response_to, &decompressed),
                    OpCode::Reply => Self::parse_op_reply_body(header.response_to, &decompressed),
                    other => Err(ErrorKind::InvalidResponse {
                        message: format!(
                            "expected OP_MSG or OP_REPLY inside OP_COMPRESSED, got {:?}",
                            other
                        ),
                    }
                    .into()),
                }
            }
            other => Err(ErrorKind::InvalidResponse {
                message: format!("expected OP_MSG or OP_REPLY from server, got {:?}", other),
            }
            .into()),
        }
    }

    fn parse_op_msg_body(response_to: i32, body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);

        let mut flag_bytes = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut flag_bytes)?;
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(flag_bytes));

        let mut sections = Vec::new();
        let mut checksum = None;

        loop {
            let remaining = body.len() as u64 - cursor.position();
            if remaining == 0 {
                break;
            }

            if remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
                let mut checksum_bytes = [0u8; 4];
                std::io::Read::read_exact(&mut cursor, &mut checksum_bytes)?;
                checksum = Some(u32::from_le_bytes(checksum_bytes));
                break;
            }

            if remaining < 5 {
                return Err(ErrorKind::InvalidResponse {
                    message: format!("{} trailing bytes in OP_MSG", remaining),
                }
                .into());
            }

            sections.push(MessageSection::read(&mut cursor)?);
        }

        Ok(Self {
            response_to,
            flags,
            sections,
            checksum,
            request_id: None,
        })
    }

    /// Parses the body of a legacy OP_REPLY, as sent in response to the OP_QUERY handshake.
    fn parse_op_reply_body(response_to: i32, body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);

        let mut int_bytes = [0u8; 4];

        // response flags; bit 1 indicates QueryFailure.
        std::io::Read::read_exact(&mut cursor, &mut int_bytes)?;
        let response_flags = i32::from_le_bytes(int_bytes);

        // cursor id
        let mut long_bytes = [0u8; 8];
        std::io::Read::read_exact(&mut cursor, &mut long_bytes)?;

        // starting from
        std::io::Read::read_exact(&mut cursor, &mut int_bytes)?;

        // number returned
        std::io::Read::read_exact(&mut cursor, &mut int_bytes)?;
        let number_returned = i32::from_le_bytes(int_bytes);

        let mut documents = Vec::new();
        for _ in 0..number_returned {
            documents.push(bson_util::read_document_from_cursor(&mut cursor)?);
        }

        if response_flags & 0b10 != 0 {
            let message = documents
                .first()
                .and_then(|doc| doc.get_str("$err").ok())
                .unwrap_or("query failure");
            return Err(ErrorKind::InvalidResponse {
                message: format!("legacy handshake failed: {}", message),
            }
            .into());
        }

        Ok(Self {
            response_to,
            flags: MessageFlags::empty(),
            sections: documents.into_iter().map(MessageSection::Document).collect(),
            checksum: None,
            request_id: None,
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        let sections_bytes = self.sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections_bytes.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections_bytes).await?;

        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    /// Serializes the Message, compresses the body with the given compressor, and writes the
    /// resulting OP_COMPRESSED frame to `writer`.
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<()> {
        let mut uncompressed = self.flags.bits().to_le_bytes().to_vec();
        uncompressed.extend(self.sections_bytes()?);
        if let Some(checksum) = self.checksum {
            uncompressed.extend(checksum.to_le_bytes());
        }

        let compressed = compressor.compress(&uncompressed)?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<u8>()
            + compressed.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer
            .write_all(&(uncompressed.len() as i32).to_le_bytes())
            .await?;
        writer.write_all(&[compressor.id()]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Writes this message as a legacy OP_QUERY against `admin.$cmd`, the framing used for the
    /// first handshake on a fresh stream.
    pub(crate) async fn write_op_query_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<()> {
        let query = match self.sections.first() {
            Some(MessageSection::Document(doc)) => doc,
            _ => {
                return Err(Error::internal(
                    "OP_QUERY messages must contain exactly one document",
                ))
            }
        };

        let mut body = Vec::new();
        body.extend(0i32.to_le_bytes()); // flags
        util::write_cstring(&mut body, "admin.$cmd");
        body.extend(0i32.to_le_bytes()); // number to skip
        body.extend((-1i32).to_le_bytes()); // number to return
        body.extend(bson_util::serialize_document(query)?);

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Query,
        };

        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(())
    }

    fn sections_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for section in &self.sections {
            section.write(&mut out)?;
        }
        Ok(out)
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    /// Reads bytes from `cursor` and deserializes them into a MessageSection.
    fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut payload_type = [0u8; 1];
        std::io::Read::read_exact(cursor, &mut payload_type)?;

        if payload_type[0] == 0 {
            return Ok(MessageSection::Document(
                bson_util::read_document_from_cursor(cursor)?,
            ));
        }

        let mut size_bytes = [0u8; 4];
        std::io::Read::read_exact(cursor, &mut size_bytes)?;
        let size = i32::from_le_bytes(size_bytes);
        let end = cursor.position() - std::mem::size_of::<i32>() as u64 + size as u64;

        let identifier = util::read_cstring(cursor)?;

        let mut documents = Vec::new();
        while cursor.position() < end {
            documents.push(bson_util::read_document_from_cursor(cursor)?);
        }

        if cursor.position() != end {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the server indicated that the document sequence would be {} bytes long, but \
                     it instead was {}",
                    size,
                    cursor.position(),
                ),
            }
            .into());
        }

        Ok(MessageSection::Sequence {
            identifier,
            documents,
        })
    }

    /// Serializes the MessageSection and appends the bytes to `buffer`.
    fn write(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                // Write payload type.
                buffer.push(0);
                buffer.extend(bson_util::serialize_document(doc)?);
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                // Write payload type.
                buffer.push(1);

                let mut section = Vec::new();
                util::write_cstring(&mut section, identifier);
                for doc in documents {
                    section.extend(bson_util::serialize_document(doc)?);
                }

                let size = (section.len() + std::mem::size_of::<i32>()) as i32;
                buffer.extend(size.to_le_bytes());
                buffer.extend(section);
            }
        }

        Ok(())
    }
}

/// Splits an OP_COMPRESSED body into its original opcode and decompressed payload.
fn decompress_body(body: &[u8]) -> Result<(OpCode, Vec<u8>)> {
    if body.len() < 9 {
        return Err(ErrorKind::InvalidResponse {
            message: "OP_COMPRESSED body too short".to_string(),
        }
        .into());
    }

    let original_op_code = OpCode::from_i32(i32::from_le_bytes(body[0..4].try_into().unwrap()))?;
    let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().unwrap());
    let compressor_id = body[8];

    let decompressed = compression::decompress(compressor_id, &body[9..])?;

    if decompressed.len() as i32 != uncompressed_size {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "OP_COMPRESSED declared an uncompressed size of {} but yielded {}",
                uncompressed_size,
                decompressed.len()
            ),
        }
        .into());
    }

    Ok((original_op_code, decompressed))
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::cmap::conn::command::Command;

    #[tokio::test]
    async fn op_msg_round_trip() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::with_command(command, Some(42));

        let mut bytes = Vec::new();
        message.write_to(&mut bytes).await.unwrap();

        let mut reader = &bytes[..];
        let parsed = Message::read_from(&mut reader).await.unwrap();
        let doc = parsed.single_document_response().unwrap();
        assert_eq!(doc.get_i32("ping").unwrap(), 1);
        assert_eq!(doc.get_str("$db").unwrap(), "admin");
    }

    #[tokio::test]
    async fn exhaust_flag_set_for_awaitable_commands() {
        let mut command = Command::new("hello", "admin", doc! { "hello": 1 });
        command.exhaust_allowed = true;
        let message = Message::with_command(command, None);
        assert!(message.flags.contains(MessageFlags::EXHAUST_ALLOWED));
    }

    #[tokio::test]
    async fn op_query_header_uses_legacy_opcode() {
        let command = Command::new("isMaster", "admin", doc! { "isMaster": 1 });
        let message = Message::with_command(command, Some(7));

        let mut bytes = Vec::new();
        message.write_op_query_to(&mut bytes).await.unwrap();

        let op_code = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(op_code, 2004);

        // number_to_return follows the collection name cstring and number_to_skip.
        let name_end = 16 + 4 + "admin.$cmd".len() + 1;
        let n_return = i32::from_le_bytes(bytes[name_end + 4..name_end + 8].try_into().unwrap());
        assert_eq!(n_return, -1);
    }
}
