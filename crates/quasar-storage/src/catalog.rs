//! Stream Catalog
//!
//! The catalog layers stream identity onto the object store:
//!
//! - Per-stream metadata lives in extended attributes of the `meta…`
//!   object (`version`, `stream`).
//! - Each collection owns an ordered map (`col.<name>`) from canonical
//!   tag string to stream UUID, which makes (collection, tags) lookups
//!   a prefix scan.
//! - Collection names are indexed across 256 ordered-map partitions
//!   (`index.<hh>`), keyed by the top byte of the murmur3 hash of the
//!   name. The hash function is part of the persisted layout.
//! - Annotations live in `ann…` objects: an 8-byte version prefix
//!   followed by opaque bytes, updated with compare-and-swap semantics
//!   under a process-wide mutex (cross-node exclusion comes from
//!   stream ownership).

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use quasar_core::{
    canonical_tag_string, is_valid_collection, parse_stream_entry, parse_tag_string,
    validate_tags, AdapterError, Error, Result, StreamInfo,
};
use tracing::info;
use uuid::Uuid;

use crate::adapter::ObjectHandle;
use crate::api::StreamCatalog;
use crate::provider::ObjectStorageProvider;
use crate::{oid, MAX_ANNOTATION_SIZE, SPECIAL_VERSION_CREATED};

/// Annotations are read in slices of this size until a short read.
const ANNOTATION_READ_CHUNK: usize = 128 * 1024;

/// Sentinel value stored for a collection in its index partition.
const COLLECTION_SENTINEL: u8 = 46;

/// Index partition for a collection name. murmur3_32 with seed 0 is
/// pinned: changing it orphans every existing `index.<hh>` entry.
pub fn collection_partition(collection: &str) -> u8 {
    let hash = murmur3::murmur3_32(&mut Cursor::new(collection.as_bytes()), 0)
        .expect("reading from memory cannot fail");
    (hash >> 24) as u8
}

/// Parse one collection-map entry (canonical tag key, raw UUID value).
fn parse_collection_entry(
    collection: &str,
    key: &str,
    value: &[u8],
) -> Result<StreamInfo> {
    let tags = parse_tag_string(key)?;
    if value.len() < 16 {
        return Err(Error::Corrupt(format!(
            "collection entry {key:?} holds a {}-byte uuid",
            value.len()
        )));
    }
    let uuid = Uuid::from_slice(&value[..16]).expect("length checked");
    Ok(StreamInfo::new(uuid, collection, tags))
}

fn empty_on_not_found<T>(
    result: std::result::Result<Vec<T>, AdapterError>,
) -> Result<Vec<T>> {
    match result {
        Ok(v) => Ok(v),
        Err(AdapterError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StreamCatalog for ObjectStorageProvider {
    async fn create_stream(
        &self,
        uuid: Uuid,
        collection: &str,
        tags: &HashMap<String, String>,
        annotation: &[u8],
    ) -> Result<()> {
        if !is_valid_collection(collection) {
            return Err(Error::InvalidCollection(collection.to_string()));
        }
        validate_tags(tags)?;
        if !self.cluster.we_hold_write_lock_for(&uuid) {
            return Err(Error::WrongEndpoint);
        }
        if annotation.len() > MAX_ANNOTATION_SIZE {
            return Err(Error::AnnotationTooBig {
                size: annotation.len(),
                max: MAX_ANNOTATION_SIZE,
            });
        }

        let _ann_guard = self.annotation_mu.lock().await;
        let guard = self.read_pool.acquire().await?;
        let h = guard.handle();
        let moid = oid::metadata(&uuid);

        match h.get_xattr(&moid, "version").await {
            Ok(_) => return Err(Error::StreamExists),
            Err(AdapterError::NotFound(_)) => {}
            Err(e) => {
                return Err(Error::Unrecoverable(format!(
                    "could not check stream existence for {uuid}: {e}"
                )))
            }
        }

        let tlkey = canonical_tag_string(tags);
        let cmap = oid::collection_map(collection);

        // Any existing entry whose canonical string begins with ours
        // intersects: identical tags collide outright, a superset of
        // them is ambiguous on lookup.
        let hits = empty_on_not_found(h.get_omap_range(&cmap, "", &tlkey, 10).await)?;
        if !hits.is_empty() {
            let same = hits
                .iter()
                .any(|(_, v)| v.as_ref() == uuid.as_bytes().as_slice());
            return Err(if same {
                Error::SameStream
            } else {
                Error::AmbiguousStream
            });
        }

        h.set_omap(
            &cmap,
            vec![(tlkey.clone(), Bytes::copy_from_slice(uuid.as_bytes()))],
        )
        .await
        .map_err(|e| Error::Unrecoverable(format!("collection map write failed: {e}")))?;

        let mut payload = BytesMut::with_capacity(annotation.len() + 8);
        payload.put_u64_le(1);
        payload.put_slice(annotation);
        h.write_full(&oid::annotation(&uuid), payload.freeze())
            .await
            .map_err(|e| Error::Unrecoverable(format!("annotation write failed: {e}")))?;

        let partition = collection_partition(collection);
        h.set_omap(
            &oid::index_partition(partition),
            vec![(
                collection.to_string(),
                Bytes::from_static(&[COLLECTION_SENTINEL]),
            )],
        )
        .await
        .map_err(|e| Error::Unrecoverable(format!("collection index write failed: {e}")))?;

        h.set_xattr(&moid, "stream", Bytes::from(format!("{collection};{tlkey}")))
            .await
            .map_err(|e| Error::Unrecoverable(format!("stream attribute write failed: {e}")))?;

        // Setting the version attribute last makes the stream visible
        // atomically: every earlier structure is already in place.
        h.set_xattr(
            &moid,
            "version",
            Bytes::copy_from_slice(&SPECIAL_VERSION_CREATED.to_le_bytes()),
        )
        .await
        .map_err(|e| Error::Unrecoverable(format!("version attribute write failed: {e}")))?;

        info!(%uuid, collection, "stream created");
        Ok(())
    }

    async fn get_stream_info(&self, uuid: Uuid) -> Result<(StreamInfo, u64)> {
        let guard = self.read_pool.acquire().await?;
        let moid = oid::metadata(&uuid);
        let xattrs = match guard.handle().list_xattrs(&moid).await {
            Ok(x) => x,
            Err(AdapterError::NotFound(_)) => return Err(Error::NoSuchStream),
            Err(e) => return Err(e.into()),
        };
        let vdata = xattrs
            .get("version")
            .filter(|v| v.len() == 8)
            .ok_or_else(|| Error::Corrupt(format!("stream {uuid} has no version attribute")))?;
        let version = u64::from_le_bytes(vdata[..8].try_into().expect("8 bytes"));

        let sdata = xattrs
            .get("stream")
            .ok_or_else(|| Error::Corrupt(format!("stream {uuid} has no stream attribute")))?;
        let entry = std::str::from_utf8(sdata)
            .map_err(|_| Error::Corrupt(format!("stream attribute of {uuid} is not UTF-8")))?;
        let (collection, tags) = parse_stream_entry(entry)?;

        Ok((StreamInfo::new(uuid, collection, tags), version))
    }

    async fn list_streams(
        &self,
        collection: &str,
        partial: bool,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<StreamInfo>> {
        if !is_valid_collection(collection) {
            return Err(Error::InvalidCollection(collection.to_string()));
        }
        validate_tags(tags)?;

        let guard = self.read_pool.acquire().await?;
        let h = guard.handle();
        let cmap = oid::collection_map(collection);

        if partial {
            let entries = match h.get_omap_range(&cmap, "", "", 1_000_000).await {
                Ok(v) => v,
                Err(AdapterError::NotFound(_)) => return Err(Error::NoSuchStream),
                Err(e) => return Err(e.into()),
            };
            return entries
                .iter()
                .map(|(k, v)| parse_collection_entry(collection, k, v))
                .collect();
        }

        let tlkey = canonical_tag_string(tags);
        let hits = empty_on_not_found(h.get_omap_range(&cmap, "", &tlkey, 10).await)?;
        match hits.len() {
            0 => Err(Error::NoSuchStream),
            1 => Ok(vec![parse_collection_entry(
                collection, &hits[0].0, &hits[0].1,
            )?]),
            _ => Err(Error::AmbiguousTags),
        }
    }

    async fn list_collections(
        &self,
        prefix: &str,
        start_from: &str,
        limit: u64,
    ) -> Result<Vec<String>> {
        if (!prefix.is_empty() && !is_valid_collection(prefix))
            || (!start_from.is_empty() && !is_valid_collection(start_from))
        {
            return Err(Error::InvalidCollection(if prefix.is_empty() {
                start_from.to_string()
            } else {
                prefix.to_string()
            }));
        }
        if limit < 1 {
            return Err(Error::InvalidLimit);
        }

        let guard = self.read_pool.acquire().await?;
        let h = guard.handle();

        let mut partition = if start_from.is_empty() {
            0u16
        } else {
            collection_partition(start_from) as u16
        };
        let mut start = start_from;
        let mut remaining = limit;
        let mut collections = Vec::new();

        // Walk partitions in order, concatenating each one's ordered
        // listing. The start marker only applies inside its own
        // partition; later partitions begin from their first key.
        while partition <= 0xFF && remaining > 0 {
            let entries = empty_on_not_found(
                h.get_omap_range(&oid::index_partition(partition as u8), start, prefix, remaining)
                    .await,
            )?;
            for (name, _) in entries {
                collections.push(name);
                remaining -= 1;
            }
            start = "";
            partition += 1;
        }
        Ok(collections)
    }

    async fn get_stream_annotation(&self, uuid: Uuid) -> Result<(Bytes, u64)> {
        let _ann_guard = self.annotation_mu.lock().await;
        let guard = self.read_pool.acquire().await?;
        let aoid = oid::annotation(&uuid);

        let mut buf = BytesMut::new();
        let mut offset = 0u64;
        loop {
            match guard.handle().read(&aoid, offset, ANNOTATION_READ_CHUNK).await {
                Ok(part) => {
                    buf.put_slice(&part);
                    offset += part.len() as u64;
                    if part.len() < ANNOTATION_READ_CHUNK {
                        break;
                    }
                }
                Err(AdapterError::NotFound(_)) if offset == 0 => {
                    return Err(Error::NoSuchStream)
                }
                Err(e) => return Err(e.into()),
            }
        }
        if buf.len() < 8 {
            return Err(Error::Corrupt(format!(
                "annotation object of {uuid} is {} bytes",
                buf.len()
            )));
        }
        let version = u64::from_le_bytes(buf[..8].try_into().expect("8 bytes"));
        Ok((buf.freeze().slice(8..), version))
    }

    async fn set_stream_annotation(
        &self,
        uuid: Uuid,
        expected_version: u64,
        annotation: &[u8],
    ) -> Result<()> {
        if annotation.len() > MAX_ANNOTATION_SIZE {
            return Err(Error::AnnotationTooBig {
                size: annotation.len(),
                max: MAX_ANNOTATION_SIZE,
            });
        }

        let _ann_guard = self.annotation_mu.lock().await;
        let guard = self.read_pool.acquire().await?;
        let h = guard.handle();
        let aoid = oid::annotation(&uuid);

        let header = match h.read(&aoid, 0, 8).await {
            Ok(data) => data,
            Err(AdapterError::NotFound(_)) => return Err(Error::NoSuchStream),
            Err(e) => return Err(e.into()),
        };
        if header.len() != 8 {
            return Err(Error::Unrecoverable(format!(
                "annotation header of {uuid} is {} bytes",
                header.len()
            )));
        }
        let current = u64::from_le_bytes(header[..8].try_into().expect("8 bytes"));

        if expected_version != current && expected_version != 0 {
            return Err(Error::AnnotationVersionMismatch {
                expected: expected_version,
                current,
            });
        }

        let mut payload = BytesMut::with_capacity(annotation.len() + 8);
        payload.put_u64_le(current + 1);
        payload.put_slice(annotation);
        h.write_full(&aoid, payload.freeze())
            .await
            .map_err(|e| Error::Unrecoverable(format!("annotation write failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_deterministic() {
        assert_eq!(collection_partition("phasor"), collection_partition("phasor"));
    }

    #[test]
    fn test_partition_spreads_names() {
        // Not a distribution test, just a sanity check that the hash
        // actually varies with its input.
        let partitions: std::collections::HashSet<u8> = (0..64)
            .map(|i| collection_partition(&format!("collection_{i}")))
            .collect();
        assert!(partitions.len() > 8);
    }

    #[test]
    fn test_parse_collection_entry() {
        let uuid = Uuid::from_u128(42);
        let info =
            parse_collection_entry("phasor", "chan@A@", uuid.as_bytes()).expect("parse");
        assert_eq!(info.uuid, uuid);
        assert_eq!(info.collection, "phasor");
        assert_eq!(info.tags.get("chan").map(String::as_str), Some("A"));
    }

    #[test]
    fn test_parse_collection_entry_short_uuid() {
        assert!(matches!(
            parse_collection_entry("phasor", "chan@A@", &[1, 2, 3]),
            Err(Error::Corrupt(_))
        ));
    }
}
