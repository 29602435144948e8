//! Quasar Core Types
//!
//! This crate holds the vocabulary shared by every layer of the quasar
//! storage engine:
//!
//! - **Errors**: the full error taxonomy surfaced to callers, plus the
//!   three-way object-store fault classification
//! - **Records**: the `(time, value)` point handed to the ingest path
//! - **Streams**: stream descriptors, tag validation and the canonical
//!   tag string used as the collection-map key
//! - **Configuration**: storage/coalescer settings and the cluster
//!   ownership predicate
//!
//! Everything here is plain data and pure functions; no I/O happens in
//! this crate.

pub mod config;
pub mod error;
pub mod record;
pub mod stream;

pub use config::{ClusterState, SoloCluster, StorageConfig};
pub use error::{AdapterError, AdapterResult, Error, Result};
pub use record::{Record, MAX_TIME, MIN_TIME};
pub use stream::{
    canonical_tag_string, is_valid_collection, is_valid_tag_key, is_valid_tag_value,
    parse_stream_entry, parse_tag_string, validate_tags, StreamInfo,
};
