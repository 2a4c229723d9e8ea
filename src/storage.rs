//! Model file loading.
//!
//! sklearn models travel as plain pickle streams or as whole-file gzip
//! (`.pkl.gz`) and zlib (joblib `compress=N`) blobs. The container is
//! sniffed from the leading bytes; a stream that announces compression
//! but fails to inflate is an error, never decoded as raw pickle.

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::debug;

use crate::error::UnpickleError;

/// A pickle stream loaded into memory, transparently decompressed.
pub struct Storage {
    bytes: Vec<u8>,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UnpickleError> {
        let raw = fs::read(path.as_ref())?;
        Self::from_bytes(raw)
    }

    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, UnpickleError> {
        let bytes = decompress(raw)?;
        Ok(Self { bytes })
    }

    /// The decompressed pickle stream.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn decompress(raw: Vec<u8>) -> Result<Vec<u8>, UnpickleError> {
    if raw.starts_with(&[0x1f, 0x8b]) {
        debug!(bytes = raw.len(), "Inflating gzip container");
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        return Ok(out);
    }
    if is_zlib(&raw) {
        debug!(bytes = raw.len(), "Inflating zlib container");
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        return Ok(out);
    }
    Ok(raw)
}

/// RFC 1950 header: 0x78 CMF (deflate, 32K window, what zlib emits)
/// with a valid header checksum. Pickle streams never start with 0x78.
fn is_zlib(raw: &[u8]) -> bool {
    raw.len() >= 2 && raw[0] == 0x78 && (256 * raw[0] as u16 + raw[1] as u16) % 31 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_raw_passthrough() {
        let storage = Storage::from_bytes(b"\x80\x02N.".to_vec()).unwrap();
        assert_eq!(storage.bytes(), b"\x80\x02N.");

        // text pickles start with '(' and must not sniff as compressed
        let storage = Storage::from_bytes(b"(K\x01K\x02l.".to_vec()).unwrap();
        assert_eq!(storage.bytes(), b"(K\x01K\x02l.");
    }

    #[test]
    fn test_gzip_inflates() {
        let storage = Storage::from_bytes(gzip(b"\x80\x02K\x2a.")).unwrap();
        assert_eq!(storage.bytes(), b"\x80\x02K\x2a.");
    }

    #[test]
    fn test_zlib_inflates() {
        let storage = Storage::from_bytes(zlib(b"\x80\x02K\x2a.")).unwrap();
        assert_eq!(storage.bytes(), b"\x80\x02K\x2a.");
    }

    #[test]
    fn test_corrupt_gzip_is_an_error() {
        let mut blob = gzip(b"\x80\x02N.");
        let n = blob.len();
        blob.truncate(n - 4);
        assert!(matches!(
            Storage::from_bytes(blob),
            Err(UnpickleError::Storage(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            Storage::open("/nonexistent/model.pkl"),
            Err(UnpickleError::Storage(_))
        ));
    }

    #[test]
    fn test_open_reads_from_disk() {
        let path = std::env::temp_dir().join("unpickle-storage-test.pkl.gz");
        std::fs::write(&path, gzip(b"\x80\x02\x88.")).unwrap();
        let storage = Storage::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(storage.bytes(), b"\x80\x02\x88.");
    }

    #[test]
    fn test_gzipped_pickle_decodes_end_to_end() {
        use crate::known_types::sklearn_registry;
        use crate::types::Value;

        let storage = Storage::from_bytes(gzip(b"\x80\x02\x88.")).unwrap();
        let result = crate::unpickle(&storage, &sklearn_registry()).unwrap();
        assert_eq!(result.root, Value::Bool(true));
    }
}
