use serde::Serializer;

use crate::error::{Error, Result};

pub(crate) fn serialize_error_as_string<S: Serializer>(
    val: &Error,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&val.to_string())
}

pub(crate) fn serialize_result_error_as_string<S: Serializer, T: serde::Serialize>(
    val: &Result<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Ok(t) => t.serialize(serializer),
        Err(e) => serialize_error_as_string(e, serializer),
    }
}
