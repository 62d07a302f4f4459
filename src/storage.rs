//! Object storage adapter.
//!
//! Input payloads and job output archives live in a single GCS bucket; keys
//! embed the cluster-unique job name so concurrent jobs cannot collide.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as StorePath;
use object_store::{ClientOptions, ObjectStore, PutPayload};

use crate::config::GoogleCloudSettings;
use crate::error::{Error, Result};

/// Capability surface the lifecycle code needs from the bucket.
///
/// No retries happen in here; retry policy belongs to the caller.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing object.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Remove `key`; deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Public read URL for `key`.
    fn url_for(&self, key: &str) -> String;
}

/// GCS-backed implementation.
pub struct GcsStorage {
    store: object_store::gcp::GoogleCloudStorage,
    bucket_name: String,
}

impl GcsStorage {
    pub fn new(settings: &GoogleCloudSettings, timeout: std::time::Duration) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(&settings.bucket_name)
            .with_service_account_path(&settings.credentials_file_path)
            .with_client_options(ClientOptions::new().with_timeout(timeout))
            .build()
            .map_err(|e| Error::Storage(format!("failed to initialize GCS client: {e}")))?;
        Ok(Self {
            store,
            bucket_name: settings.bucket_name.clone(),
        })
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = StorePath::from(key);
        self.store
            .put(&path, PutPayload::from(Bytes::from(bytes)))
            .await
            .map_err(|e| Error::Storage(format!("failed to upload {key}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = StorePath::from(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to delete {key}: {e}"))),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("https://storage.googleapis.com/{}/{}", self.bucket_name, key)
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory double for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryStorage {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub fail_uploads: std::sync::atomic::AtomicBool,
    }

    impl MemoryStorage {
        pub fn contains(&self, key: &str) -> bool {
            self.objects.lock().unwrap().contains_key(key)
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            if self.fail_uploads.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage(format!("failed to upload {key}: injected")));
            }
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        fn url_for(&self, key: &str) -> String {
            format!("https://storage.googleapis.com/test-bucket/{key}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStorage;
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::default();
        storage.upload("demo-input.zip", b"hello".to_vec()).await.unwrap();
        assert!(storage.contains("demo-input.zip"));

        storage.delete("demo-input.zip").await.unwrap();
        assert!(!storage.contains("demo-input.zip"));

        // deleting again is fine
        storage.delete("demo-input.zip").await.unwrap();
    }

    #[test]
    fn public_url_shape() {
        let storage = MemoryStorage::default();
        assert_eq!(
            storage.url_for("demo-output.zip"),
            "https://storage.googleapis.com/test-bucket/demo-output.zip"
        );
    }
}
