use std::io::Cursor;

use bson::Document;
use serde::Deserialize;

use crate::error::Result;

pub(crate) fn serialize_document(doc: &Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    doc.to_writer(&mut out)?;
    Ok(out)
}

/// Reads a single length-prefixed BSON document from an in-memory buffer, advancing the
/// cursor past it.
pub(crate) fn read_document_from_cursor(cursor: &mut Cursor<&[u8]>) -> Result<Document> {
    Ok(Document::from_reader(cursor)?)
}

pub(crate) fn doc_size_bytes(doc: &Document) -> Result<usize> {
    Ok(serialize_document(doc)?.len())
}

pub(crate) fn serialize_duration_option_as_int_millis<S: serde::Serializer>(
    val: &Option<std::time::Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => {
            serializer.serialize_i64(duration.as_millis().try_into().unwrap_or(i64::MAX))
        }
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<std::time::Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(std::time::Duration::from_millis))
}

pub(crate) fn deserialize_duration_option_from_u64_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<std::time::Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let seconds = Option::<u64>::deserialize(deserializer)?;
    Ok(seconds.map(std::time::Duration::from_secs))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use bson::doc;

    use super::*;

    #[test]
    fn document_roundtrip() {
        let first = doc! { "hello": 1, "client": { "driver": "x" } };
        let second = doc! { "ok": 1 };

        let mut bytes = serialize_document(&first).unwrap();
        bytes.extend(serialize_document(&second).unwrap());

        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(read_document_from_cursor(&mut cursor).unwrap(), first);
        assert_eq!(read_document_from_cursor(&mut cursor).unwrap(), second);
        assert_eq!(cursor.position(), bytes.len() as u64);
    }

    #[test]
    fn size_matches_serialized_length() {
        let doc = doc! { "a": 1, "b": "two" };
        assert_eq!(
            doc_size_bytes(&doc).unwrap(),
            serialize_document(&doc).unwrap().len()
        );
    }
}
