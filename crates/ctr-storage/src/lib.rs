//! Durable storage (pipeline state, raw documents) and HTTP fetch utilities.

mod atomic;
pub mod content;
pub mod http;
pub mod state;

use sha2::{Digest, Sha256};

pub use content::{ContentStore, LocalContentStore, S3ContentStore, S3Location, StoreError};
pub use http::{
    classify_reqwest_error, classify_status, FetchError, HttpClientConfig, HttpFetcher,
    RetryDisposition, RetryPolicy,
};
pub use state::{PipelineState, StateStore};

pub const CRATE_NAME: &str = "ctr-storage";

/// Lower-case hex SHA-256 of the given bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
