#![forbid(unsafe_code)]

pub mod repository;
pub mod sqlite;

pub use repository::{
    CachedProgress, InMemoryProgressCache, ProgressCache, ProgressSnapshot, Storage, StorageError,
};
