//! Prefixed storage views.
//!
//! Every store in the engine persists through a [`StorageView`]: a handle on
//! the shared [`StorageBackend`] that transparently prepends a key prefix.
//! A namespace gets `ns/<id>/`, a mount inside it gets
//! `ns/<id>/logical/<uuid>/`, and so on. Dropping a namespace or a mount is
//! then a matter of clearing its view.
//!
//! Values are JSON documents; the `*_json` helpers do the encoding and report
//! codec failures with the offending key.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use nsvault_storage::StorageBackend;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// A key-prefixed window onto the storage backend.
#[derive(Clone)]
pub struct StorageView {
    storage: Arc<dyn StorageBackend>,
    prefix: String,
}

impl StorageView {
    /// Create a view rooted at `prefix` (usually ending in `/`).
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    /// A nested view whose prefix extends this one.
    #[must_use]
    pub fn sub_view(&self, prefix: &str) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: format!("{}{prefix}", self.prefix),
        }
    }

    /// The absolute key prefix of this view.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Read raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.storage.get(&self.full_key(key)).await?)
    }

    /// Write raw bytes, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.storage.put(&self.full_key(key), value).await?;
        Ok(())
    }

    /// Delete a key. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.storage.delete(&self.full_key(key)).await?;
        Ok(())
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.storage.exists(&self.full_key(key)).await?)
    }

    /// List every key below `prefix`, relative to `prefix`.
    ///
    /// A view on `ns/a/` holding `ns/a/role/x` and `ns/a/role/y/z` returns
    /// `["x", "y/z"]` for `list("role/")`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let absolute = self.full_key(prefix);
        let keys = self.storage.list(&absolute).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(absolute.as_str()))
            .map(String::from)
            .collect())
    }

    /// Read and decode a JSON document.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Storage`] if the backend fails.
    /// - [`StoreError::Codec`] if the stored bytes are not valid for `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Codec {
                    key: self.full_key(key),
                    reason: format!("deserialization failed: {e}"),
                }),
        }
    }

    /// Encode and write a JSON document.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Codec`] if `value` cannot be serialized.
    /// - [`StoreError::Storage`] if the backend fails.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Codec {
            key: self.full_key(key),
            reason: format!("serialization failed: {e}"),
        })?;
        self.put(key, &bytes).await
    }

    /// Delete every key under this view. Returns how many keys were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let keys = self.storage.list(&self.prefix).await?;
        for key in &keys {
            self.storage.delete(key).await?;
        }
        Ok(keys.len())
    }
}

impl fmt::Debug for StorageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Collapse relative keys into directory-style entries.
///
/// `["a", "b/c", "b/d"]` becomes `["a", "b/"]`, sorted and de-duplicated.
#[must_use]
pub fn immediate_children<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out = BTreeSet::new();
    for key in keys {
        match key.split_once('/') {
            Some((head, _)) if !head.is_empty() => {
                out.insert(format!("{head}/"));
            }
            Some(_) => {}
            None if !key.is_empty() => {
                out.insert(key.to_owned());
            }
            None => {}
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nsvault_storage::{MemoryBackend, StorageError};
    use serde::Deserialize;

    fn make_view(prefix: &str) -> (MemoryBackend, StorageView) {
        let backend = MemoryBackend::new();
        let view = StorageView::new(Arc::new(backend.clone()), prefix);
        (backend, view)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
    }

    #[tokio::test]
    async fn keys_are_prefixed_in_the_backend() {
        let (backend, view) = make_view("ns/abc/");
        view.put("core/mounts", b"x").await.unwrap();
        assert!(backend.exists("ns/abc/core/mounts").await.unwrap());
        assert_eq!(view.get("core/mounts").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn list_is_relative_to_requested_prefix() {
        let (_, view) = make_view("ns/a/");
        view.put("role/x", b"1").await.unwrap();
        view.put("role/y/z", b"2").await.unwrap();
        view.put("other", b"3").await.unwrap();
        assert_eq!(view.list("role/").await.unwrap(), vec!["x", "y/z"]);
    }

    #[tokio::test]
    async fn sub_views_nest() {
        let (backend, view) = make_view("ns/a/");
        let mount = view.sub_view("logical/u1/");
        mount.put("data/k", b"v").await.unwrap();
        assert!(backend.exists("ns/a/logical/u1/data/k").await.unwrap());
        assert_eq!(mount.prefix(), "ns/a/logical/u1/");
    }

    #[tokio::test]
    async fn json_round_trip_and_codec_error() {
        let (_, view) = make_view("p/");
        let doc = Doc {
            name: "default".to_owned(),
        };
        view.put_json("doc", &doc).await.unwrap();
        assert_eq!(view.get_json::<Doc>("doc").await.unwrap(), Some(doc));

        view.put("bad", b"not json").await.unwrap();
        let result = view.get_json::<Doc>("bad").await;
        assert!(matches!(result, Err(StoreError::Codec { ref key, .. }) if key == "p/bad"));
    }

    #[tokio::test]
    async fn clear_only_touches_the_view() {
        let (backend, view) = make_view("ns/a/");
        view.put("x", b"1").await.unwrap();
        view.put("y/z", b"2").await.unwrap();
        backend.put("ns/ab/x", b"3").await.unwrap();
        backend.put("ns/b/x", b"4").await.unwrap();

        // `ns/ab/` shares the textual prefix `ns/a` but not `ns/a/`.
        assert_eq!(view.clear().await.unwrap(), 2);
        assert_eq!(backend.len().await, 2);
    }

    #[test]
    fn immediate_children_folds_directories() {
        let keys = ["b/d", "a", "b/c", "c/"];
        assert_eq!(immediate_children(keys), vec!["a", "b/", "c/"]);
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl StorageBackend for FailingBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Read {
                key: key.to_owned(),
                reason: "disk gone".to_owned(),
            })
        }
        async fn put(&self, key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Write {
                key: key.to_owned(),
                reason: "disk gone".to_owned(),
            })
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            Err(StorageError::Delete {
                key: key.to_owned(),
                reason: "disk gone".to_owned(),
            })
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            Err(StorageError::List {
                prefix: prefix.to_owned(),
                reason: "disk gone".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn backend_failures_surface_with_full_key() {
        let view = StorageView::new(Arc::new(FailingBackend), "ns/a/");
        let err = view.get("k").await.unwrap_err();
        assert!(err.to_string().contains("ns/a/k"));
        assert!(view.list("").await.is_err());
    }
}
