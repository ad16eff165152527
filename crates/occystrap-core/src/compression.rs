//! Layer compression handling.
//!
//! Layers arrive gzip compressed, zstd compressed, or raw. Detection uses
//! the manifest media type when one is available and falls back to magic
//! bytes; decompression is streamed so a layer is never held in memory.

use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use flate2::read::GzDecoder as GzReadDecoder;
use flate2::write::{GzDecoder, GzEncoder};
use tempfile::NamedTempFile;

use crate::digest::HashingWriter;
use crate::element::new_spool;
use crate::error::{ImageError, Result};

/// Gzip magic bytes.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Zstandard magic bytes.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Gzip compression level used on egress. Matches `docker push`.
const GZIP_LEVEL: u32 = 9;
/// Zstd compression level used on egress.
const ZSTD_LEVEL: i32 = 3;

/// A layer's compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    /// A plain tar stream.
    None,
    /// Could not be determined.
    Unknown,
}

impl FromStr for Compression {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(ImageError::UriParse(format!(
                "unknown compression type '{other}' (expected gzip or zstd)"
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::None => "none",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Detects compression from the first bytes of a blob.
///
/// With enough data to see tar's `ustar` magic at offset 257, an
/// uncompressed layer is positively identified; shorter prefixes that match
/// no magic report [`Compression::Unknown`].
#[must_use]
pub fn detect(prefix: &[u8]) -> Compression {
    if prefix.len() >= 2 && prefix[..2] == GZIP_MAGIC {
        return Compression::Gzip;
    }
    if prefix.len() >= 4 && prefix[..4] == ZSTD_MAGIC {
        return Compression::Zstd;
    }
    if prefix.len() >= 262 && &prefix[257..262] == b"ustar" {
        return Compression::None;
    }
    Compression::Unknown
}

/// Detects compression from an OCI/Docker layer media type.
#[must_use]
pub fn from_media_type(media_type: &str) -> Compression {
    if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
        Compression::Gzip
    } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
        Compression::Zstd
    } else if media_type.ends_with(".tar") {
        Compression::None
    } else {
        Compression::Unknown
    }
}

/// A writer that decompresses everything written through it.
///
/// Used to spool a compressed network stream straight to an uncompressed
/// scratch file: the download loop hashes the compressed chunks for digest
/// verification and writes them here.
pub enum DecompressWriter<W: Write> {
    Plain(W),
    Gzip(GzDecoder<W>),
    Zstd(zstd::stream::write::Decoder<'static, BufWriter<W>>),
}

impl<W: Write> DecompressWriter<W> {
    /// Wraps `writer` in a streaming decoder for `compression`.
    ///
    /// # Errors
    ///
    /// Returns an error for [`Compression::Unknown`], or if the zstd decoder
    /// cannot be created.
    pub fn new(compression: Compression, writer: W) -> Result<Self> {
        match compression {
            Compression::None => Ok(Self::Plain(writer)),
            Compression::Gzip => Ok(Self::Gzip(GzDecoder::new(writer))),
            Compression::Zstd => Ok(Self::Zstd(zstd::stream::write::Decoder::new(
                BufWriter::new(writer),
            )?)),
            Compression::Unknown => Err(ImageError::Registry(
                "cannot decompress blob with unknown compression".to_string(),
            )),
        }
    }

    /// Flushes trailing decoder state and returns the inner writer.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(d) => Ok(d.finish()?),
            Self::Zstd(mut d) => {
                d.flush()?;
                d.into_inner()
                    .into_inner()
                    .map_err(|e| ImageError::Io(e.into_error()))
            }
        }
    }
}

impl<W: Write> Write for DecompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(d) => d.write(buf),
            Self::Zstd(d) => d.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(d) => d.flush(),
            Self::Zstd(d) => d.flush(),
        }
    }
}

/// Copies `reader` into a scratch file, decompressing according to the
/// magic bytes of the stream. Returns the scratch file.
pub fn decompress_to_spool<R: Read>(
    mut reader: R,
    temp_dir: Option<&Path>,
) -> Result<NamedTempFile> {
    let spool = new_spool(temp_dir)?;

    // Sniff enough of the stream to classify it before committing to a
    // decoder.
    let mut prefix = [0u8; 262];
    let mut have = 0;
    while have < prefix.len() {
        let n = reader.read(&mut prefix[have..])?;
        if n == 0 {
            break;
        }
        have += n;
    }
    let compression = match detect(&prefix[..have]) {
        Compression::Unknown => Compression::None,
        c => c,
    };

    let mut writer = DecompressWriter::new(compression, spool)?;
    writer.write_all(&prefix[..have])?;
    std::io::copy(&mut reader, &mut writer)?;
    let mut spool = writer.finish()?;
    spool.flush()?;
    Ok(spool)
}

/// Compresses `reader` into a scratch file, hashing the compressed output.
///
/// Returns the scratch file, the hex digest of the compressed bytes and
/// their size. Gzip output is deterministic (zeroed header timestamp), so
/// identical input always produces an identical blob digest.
pub fn compress_to_spool<R: Read>(
    mut reader: R,
    compression: Compression,
    temp_dir: Option<&Path>,
) -> Result<(NamedTempFile, String, u64)> {
    let spool = new_spool(temp_dir)?;
    let hashing = HashingWriter::new(spool);

    let hashing = match compression {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(hashing, flate2::Compression::new(GZIP_LEVEL));
            std::io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(hashing, ZSTD_LEVEL)?;
            std::io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?
        }
        other => {
            return Err(ImageError::Sink(format!(
                "cannot compress layer with {other}"
            )))
        }
    };

    let (mut spool, digest, size) = hashing.finish();
    spool.flush()?;
    Ok((spool, digest, size))
}

/// Decompresses a byte slice in one shot. Used for small blobs from saved
/// tarballs where the data is already in memory.
pub fn decompress_bytes(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match compression {
        Compression::None | Compression::Unknown => out.extend_from_slice(data),
        Compression::Gzip => {
            GzReadDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::new(data)?.read_to_end(&mut out)?;
        }
    }
    Ok(out)
}
