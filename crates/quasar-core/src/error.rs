//! Error Types for Quasar
//!
//! This module defines the error taxonomy surfaced by the storage engine.
//!
//! ## Error Categories
//!
//! ### Stream Catalog Errors
//! - `NoSuchStream`: Operated on a stream that was never created
//! - `StreamExists` / `SameStream` / `AmbiguousStream`: Creation conflicts
//! - `AmbiguousTags`: Tags match more than one stream on lookup
//!
//! ### Validation Errors
//! - `InvalidCollection` / `InvalidTagKey` / `InvalidTagValue`: Name rules
//! - `InvalidLimit`: Listing limit must be positive
//! - `InvalidArgument`: Protocol misuse (e.g. non-sequential segment write)
//!
//! ### Storage Errors
//! - `NoSpace`: The address space could not be extended
//! - `Corrupt`: A decoded blob violated the on-wire bounds
//! - `ObjectStore`: A fault from the object-store adapter
//! - `HandleTimeout`: No pooled connection became available in time
//! - `Unrecoverable`: A persisted-state write failed; continuing would
//!   risk silent corruption, so the caller must terminate
//!
//! ## Usage
//!
//! All fallible functions return `Result<T>` which is aliased to
//! `Result<T, Error>`, so errors propagate with `?`. Adapter faults
//! convert automatically via `#[from]`.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Result alias for the object-store adapter layer.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Fault classification for the object-store adapter.
///
/// Every adapter operation fails with exactly one of these. `NotFound`
/// is recovered locally where the semantics demand it (listings become
/// empty, a missing version xattr reads as 0); `Transient` faults on the
/// hot path are fatal to the request and retried at a higher level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient object store fault: {0}")]
    Transient(String),

    #[error("fatal object store fault: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("stream does not exist")]
    NoSuchStream,

    #[error("stream already exists")]
    StreamExists,

    #[error("a stream exists with the same uuid and tags")]
    SameStream,

    #[error("a stream exists with intersecting tags")]
    AmbiguousStream,

    #[error("tags do not uniquely identify a stream")]
    AmbiguousTags,

    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid tag key: {0:?}")]
    InvalidTagKey(String),

    #[error("invalid tag value: {0:?}")]
    InvalidTagValue(String),

    #[error("limit must be greater than zero")]
    InvalidLimit,

    #[error("annotation is {size} bytes, limit is {max}")]
    AnnotationTooBig { size: usize, max: usize },

    #[error("stream annotation version is {current}, not {expected}")]
    AnnotationVersionMismatch { expected: u64, current: u64 },

    #[error("wrong endpoint for this stream")]
    WrongEndpoint,

    #[error("address space exhausted")]
    NoSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt blob: {0}")]
    Corrupt(String),

    #[error("no object handle available after {waited:?} ({provided} provided so far)")]
    HandleTimeout { waited: Duration, provided: i64 },

    #[error("object store error: {0}")]
    ObjectStore(#[from] AdapterError),

    #[error("unrecoverable storage fault: {0}")]
    Unrecoverable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_converts() {
        fn inner() -> Result<()> {
            Err(AdapterError::Transient("connection reset".into()))?;
            Ok(())
        }
        match inner() {
            Err(Error::ObjectStore(AdapterError::Transient(msg))) => {
                assert_eq!(msg, "connection reset");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_annotation_mismatch_display() {
        let err = Error::AnnotationVersionMismatch {
            expected: 5,
            current: 7,
        };
        assert_eq!(err.to_string(), "stream annotation version is 7, not 5");
    }

    #[test]
    fn test_handle_timeout_carries_diagnostics() {
        let err = Error::HandleTimeout {
            waited: Duration::from_secs(10),
            provided: 42,
        };
        let msg = err.to_string();
        assert!(msg.contains("10s"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_errors_are_comparable() {
        assert_eq!(Error::NoSuchStream, Error::NoSuchStream);
        assert_ne!(Error::NoSuchStream, Error::StreamExists);
    }
}
