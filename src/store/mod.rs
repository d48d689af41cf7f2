//! Storage abstractions: chunk bytes live in an object store, job records
//! in a TTL'd key/value store. Both are single-key atomic; nothing in the
//! engine needs cross-key transactions.

mod kv;
mod object;

pub use kv::{KvStore, MemoryKvStore};
pub use object::{LocalObjectStore, MemoryObjectStore, ObjectStore};

use crate::jobs::models::ParentId;

/// Storage key for a chunk's bytes.
pub fn chunk_key(parent_id: &ParentId, chunk_index: usize, ext: &str) -> String {
    format!("uploads/{}/chunk.{}.{}", parent_id, chunk_index, ext)
}

/// Debug mirror key used when `debug_save_chunks` is on.
pub fn debug_chunk_key(parent_id: &ParentId, chunk_index: usize, ext: &str) -> String {
    format!("debug/{}/chunk.{}.{}", parent_id, chunk_index, ext)
}

/// Key of a parent job record in the key/value store.
pub fn parent_key(parent_id: &str) -> String {
    format!("parent/{}", parent_id)
}

/// Key of a sub-job record in the key/value store.
pub fn sub_job_key(sub_job_id: &str) -> String {
    format!("sub/{}", sub_job_id)
}
