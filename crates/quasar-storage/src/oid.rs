//! Object Name Formats
//!
//! Every persisted object is named by one of the formats below. The
//! formats are part of the on-disk layout: changing any of them
//! orphans existing data.
//!
//! | object | format | example |
//! |---|---|---|
//! | data | `<uuid:32 hex><object id:10 hex>` | `4f…a21c0000000001` |
//! | superblock | `sb<uuid:32 hex><chunk:11 hex>` | `sb4f…a21c00000000000` |
//! | annotation | `ann<uuid:32 hex>` | `ann4f…a21c` |
//! | metadata | `meta<uuid:32 hex>` | `meta4f…a21c` |
//! | collection map | `col.<collection>` | `col.phasor` |
//! | collection index | `index.<hh:2 hex>` | `index.3f` |
//! | allocator | `allocator` | |

use uuid::Uuid;

/// The allocator counter object.
pub const ALLOCATOR: &str = "allocator";

/// Advisory lock name guarding the allocator counter.
pub const ALLOC_LOCK_NAME: &str = "alloc_lock";
pub const ALLOC_LOCK_COOKIE: &str = "main";
pub const ALLOC_LOCK_OWNER: &str = "alloc";

/// Name of a data object: stream UUID plus object id.
pub fn data(uuid: &Uuid, object_id: u64) -> String {
    format!("{}{:010x}", uuid.simple(), object_id)
}

/// Name of a superblock object for a chunk of 2^20 versions.
pub fn superblock(uuid: &Uuid, chunk: u64) -> String {
    format!("sb{}{:011x}", uuid.simple(), chunk)
}

/// Name of the annotation object for a stream.
pub fn annotation(uuid: &Uuid) -> String {
    format!("ann{}", uuid.simple())
}

/// Name of the metadata (xattr holder) object for a stream.
pub fn metadata(uuid: &Uuid) -> String {
    format!("meta{}", uuid.simple())
}

/// Name of the ordered map holding a collection's streams.
pub fn collection_map(collection: &str) -> String {
    format!("col.{collection}")
}

/// Name of a collection index partition.
pub fn index_partition(partition: u8) -> String {
    format!("index.{partition:02x}")
}
