use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;
pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;

/// Enum representing supported compressor algorithms.
///
/// Compressors are negotiated during the handshake: the client sends the names
/// it was configured with and uses the first one the server also supports for
/// all subsequent messages on that stream.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compressor. Requires the `zstd-compression` feature flag.
    Zstd {
        /// The compression level, if set. Defaults to the zstd crate default.
        level: Option<i32>,
    },

    /// Zlib compressor. Requires the `zlib-compression` feature flag.
    Zlib {
        /// The compression level, in the range [-1, 9]. -1 selects the zlib default.
        level: Option<i32>,
    },

    /// Snappy compressor. Requires the `snappy-compression` feature flag.
    Snappy,
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zstd" => Ok(Compressor::Zstd { level: None }),
            "zlib" => Ok(Compressor::Zlib { level: None }),
            "snappy" => Ok(Compressor::Snappy),
            other => Err(ErrorKind::InvalidArgument {
                message: format!("unsupported compressor: \"{}\"", other),
            }
            .into()),
        }
    }
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Compressor::Zstd { .. } => "zstd",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> u8 {
        match self {
            Compressor::Zstd { .. } => ZSTD_COMPRESSOR_ID,
            Compressor::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            Compressor::Snappy => SNAPPY_COMPRESSOR_ID,
        }
    }

    pub(crate) fn write_zlib_level(&mut self, level: i32) {
        if let Compressor::Zlib { level: l } = self {
            *l = if level == -1 { None } else { Some(level) };
        }
    }

    /// Ensures the corresponding feature flag is enabled, so a misconfigured
    /// compressor fails at client construction rather than on the wire.
    pub(crate) fn validate(&self) -> Result<()> {
        #[allow(dead_code)]
        fn unsupported(name: &str, feature: &str) -> Error {
            ErrorKind::InvalidArgument {
                message: format!(
                    "enabling {} compression requires the `{}` feature flag",
                    name, feature
                ),
            }
            .into()
        }

        #[cfg(not(feature = "zstd-compression"))]
        if matches!(self, Compressor::Zstd { .. }) {
            return Err(unsupported("zstd", "zstd-compression"));
        }

        #[cfg(not(feature = "zlib-compression"))]
        if matches!(self, Compressor::Zlib { .. }) {
            return Err(unsupported("zlib", "zlib-compression"));
        }

        #[cfg(not(feature = "snappy-compression"))]
        if matches!(self, Compressor::Snappy) {
            return Err(unsupported("snappy", "snappy-compression"));
        }

        if let Compressor::Zlib { level: Some(level) } = self {
            if !(-1..=9).contains(level) {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid zlib compression level: {}", level),
                }
                .into());
            }
        }

        Ok(())
    }

    #[allow(unused_variables)]
    pub(crate) fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                zstd::encode_all(bytes, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                    .map_err(|e| Error::from(ErrorKind::from(e)))
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                use std::io::Write;

                let compression = match level {
                    Some(level) => flate2::Compression::new(*level as u32),
                    None => flate2::Compression::default(),
                };
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), compression);
                encoder.write_all(bytes)?;
                encoder.finish().map_err(|e| Error::from(ErrorKind::from(e)))
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(bytes)
                .map_err(|e| Error::internal(format!("snappy compression failed: {}", e))),
            #[allow(unreachable_patterns)]
            other => Err(Error::internal(format!(
                "attempted to compress with unavailable compressor {}",
                other.name()
            ))),
        }
    }
}

/// Decompresses a message body given the compressor id from the OP_COMPRESSED
/// header. The noop id passes the bytes through unchanged.
#[allow(unused_variables)]
pub(crate) fn decompress(compressor_id: u8, source: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        NOOP_COMPRESSOR_ID => Ok(source.to_vec()),
        #[cfg(feature = "zstd-compression")]
        ZSTD_COMPRESSOR_ID => {
            zstd::decode_all(source).map_err(|e| Error::from(ErrorKind::from(e)))
        }
        #[cfg(feature = "zlib-compression")]
        ZLIB_COMPRESSOR_ID => {
            use std::io::Read;

            let mut decoder = flate2::read::ZlibDecoder::new(source);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "snappy-compression")]
        SNAPPY_COMPRESSOR_ID => snap::raw::Decoder::new()
            .decompress_vec(source)
            .map_err(|e| Error::invalid_response(format!("snappy decompression failed: {}", e))),
        other => Err(Error::invalid_response(format!(
            "message compressed with unsupported compressor id {}",
            other
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::Compressor;
    use std::str::FromStr;

    #[test]
    fn parse_compressor_names() {
        assert_eq!(
            Compressor::from_str("snappy").unwrap(),
            Compressor::Snappy
        );
        assert_eq!(
            Compressor::from_str("zlib").unwrap(),
            Compressor::Zlib { level: None }
        );
        assert!(Compressor::from_str("lz4").is_err());
    }

    #[test]
    fn zlib_level_written_into_variant() {
        let mut compressor = Compressor::from_str("zlib").unwrap();
        compressor.write_zlib_level(4);
        assert_eq!(compressor, Compressor::Zlib { level: Some(4) });

        compressor.write_zlib_level(-1);
        assert_eq!(compressor, Compressor::Zlib { level: None });
    }
}
