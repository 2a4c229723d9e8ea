//! Decoder for pickled scikit-learn / joblib model files.
//!
//! The pickle stack machine runs over a closed registry of known
//! sklearn types, so models decode without a Python runtime. joblib's
//! out-of-band numpy payloads are read from the same stream and
//! materialized as typed arrays.

mod decode;
mod error;
mod json;
mod known_types;
mod npy;
mod opcodes;
mod registry;
mod storage;
mod types;

pub use decode::decode_pickle;
pub use error::UnpickleError;
pub use json::to_json;
pub use known_types::sklearn_registry;
pub use npy::{ByteOrder, DType, NdArray};
pub use registry::{Strategy, StrategyKind, TypeRegistry};
pub use storage::Storage;
pub use types::{ClassRef, Node, ObjectGraph, ObjectId, ObjectNode, TypeKey, Unpickled, Value};

/// Decode a loaded model file into an object graph.
pub fn unpickle(
    storage: &Storage,
    registry: &TypeRegistry,
) -> Result<Unpickled, UnpickleError> {
    decode_pickle(storage.bytes(), registry)
}
