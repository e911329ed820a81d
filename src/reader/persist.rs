//! Decoded chunks stored on disk in a [sled](http://sled.rs/) database, so that they survive
//! the reader.
//!
//! Records are keyed by a 64 bit hash of (origin, dataset, coordinate). The record repeats the
//! full key and is only returned when it matches. Every failure is logged and treated as a miss.
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::format::checksum::lookup3_64;
use crate::idx::TypedArray;

#[derive(Serialize)]
struct RecordRef<'a> {
    origin: &'a str,
    dataset: &'a str,
    coord: &'a [u64],
    data: &'a TypedArray,
}

#[derive(Deserialize)]
struct Record {
    origin: String,
    dataset: String,
    coord: Vec<u64>,
    data: TypedArray,
}

fn db_error(e: sled::Error) -> Error {
    Error::from(io::Error::other(e))
}

/// Handles are cheap to clone and share the database.
#[derive(Clone)]
pub struct PersistentCache {
    db: sled::Db,
}

impl PersistentCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<PersistentCache> {
        let db = sled::open(path.as_ref()).map_err(db_error)?;
        log::debug!(
            "persistent chunk cache at {}: {} records",
            path.as_ref().display(),
            db.len()
        );
        Ok(PersistentCache { db })
    }

    /// As [`PersistentCache::open`], on the blocking pool.
    pub async fn open_async(path: PathBuf) -> Result<PersistentCache> {
        tokio::task::spawn_blocking(move || PersistentCache::open(path))
            .await
            .map_err(|e| Error::from(io::Error::other(e)))?
    }

    /// A cache removed when dropped.
    pub fn temporary() -> Result<PersistentCache> {
        let db = sled::Config::default()
            .temporary(true)
            .open()
            .map_err(db_error)?;
        Ok(PersistentCache { db })
    }

    pub fn key(origin: &str, dataset: &str, coord: &[u64]) -> u64 {
        let mut b = Vec::with_capacity(origin.len() + dataset.len() + 2 + 8 * coord.len());
        b.extend_from_slice(origin.as_bytes());
        b.push(0);
        b.extend_from_slice(dataset.as_bytes());
        b.push(0);
        for c in coord {
            b.extend_from_slice(&c.to_le_bytes());
        }
        lookup3_64(&b)
    }

    pub fn get(&self, origin: &str, dataset: &str, coord: &[u64]) -> Option<TypedArray> {
        let key = PersistentCache::key(origin, dataset, coord);

        let raw = match self.db.get(key.to_be_bytes()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("persistent chunk cache: {e}");
                return None;
            }
        };

        match bincode::deserialize::<Record>(&raw) {
            Ok(r) if r.origin == origin && r.dataset == dataset && r.coord == coord => Some(r.data),
            Ok(r) => {
                log::warn!(
                    "persistent chunk cache: key {:#x} holds {}:{}{:?}, wanted {}:{}{:?}",
                    key,
                    r.origin,
                    r.dataset,
                    r.coord,
                    origin,
                    dataset,
                    coord
                );
                None
            }
            Err(e) => {
                log::warn!("persistent chunk cache: corrupt record {key:#x}: {e}");
                None
            }
        }
    }

    pub fn insert(&self, origin: &str, dataset: &str, coord: &[u64], data: &TypedArray) {
        let key = PersistentCache::key(origin, dataset, coord);
        let record = RecordRef {
            origin,
            dataset,
            coord,
            data,
        };

        let r = bincode::serialize(&record)
            .map_err(|e| e.to_string())
            .and_then(|b| {
                self.db
                    .insert(key.to_be_bytes(), b)
                    .map_err(|e| e.to_string())
            });

        if let Err(e) = r {
            log::warn!("persistent chunk cache: could not store {dataset}{coord:?}: {e}");
        }
    }

    /// Run `f` on the blocking pool, since sled reads and writes block on disk.
    async fn blocking<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&PersistentCache) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        let c = self.clone();
        match tokio::task::spawn_blocking(move || f(&c)).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("persistent chunk cache: {e}");
                None
            }
        }
    }

    /// As [`PersistentCache::get`], on the blocking pool.
    pub async fn load(&self, origin: &str, dataset: &str, coord: &[u64]) -> Option<TypedArray> {
        let (o, d, c) = (origin.to_string(), dataset.to_string(), coord.to_vec());
        self.blocking(move |p| p.get(&o, &d, &c)).await
    }

    /// As [`PersistentCache::insert`], on the blocking pool.
    pub async fn store(&self, origin: &str, dataset: &str, coord: &[u64], data: Arc<TypedArray>) {
        let (o, d, c) = (origin.to_string(), dataset.to_string(), coord.to_vec());
        self.blocking(move |p| {
            p.insert(&o, &d, &c, &data);
            Some(())
        })
        .await;
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) {
        if let Err(e) = self.db.flush() {
            log::warn!("persistent chunk cache: flush failed: {e}");
        }
    }
}
