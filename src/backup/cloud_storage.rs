use super::{artifact, BackupError, RemoteObject, Result, RetentionTier};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloudProvider {
    S3,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketLocation {
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudStorageConfig {
    pub enabled: bool,
    pub provider: CloudProvider,
    pub primary: BucketLocation,
    pub replica: Option<BucketLocation>,
    pub cross_region_enabled: bool,

    /// Custom S3 endpoint (MinIO, LocalStack)
    pub endpoint_url: Option<String>,

    /// Root directory for the filesystem provider
    pub filesystem_root: PathBuf,
}

impl Default for CloudStorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: CloudProvider::S3,
            primary: BucketLocation {
                bucket: "codex-backups".to_string(),
                region: "us-east-1".to_string(),
            },
            replica: None,
            cross_region_enabled: false,
            endpoint_url: None,
            filesystem_root: PathBuf::from("/var/lib/codex/object-store"),
        }
    }
}

impl CloudStorageConfig {
    pub fn replication_configured(&self) -> bool {
        self.cross_region_enabled && self.replica.is_some()
    }
}

/// Metadata attached to every uploaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub backup_id: Uuid,
    pub retention_tier: RetentionTier,
    pub uploaded_at: DateTime<Utc>,
    pub checksum_sha256: Option<String>,
    pub encrypted: bool,
    pub encryption_key_id: Option<String>,
}

impl ObjectMetadata {
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        pairs.insert("backup-id".to_string(), self.backup_id.to_string());
        pairs.insert("retention-tier".to_string(), self.retention_tier.to_string());
        pairs.insert("uploaded-at".to_string(), self.uploaded_at.to_rfc3339());
        pairs.insert("encrypted".to_string(), self.encrypted.to_string());
        if let Some(checksum) = &self.checksum_sha256 {
            pairs.insert("checksum-sha256".to_string(), checksum.clone());
        }
        if let Some(key_id) = &self.encryption_key_id {
            pairs.insert("encryption-key-id".to_string(), key_id.clone());
        }
        pairs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Minimal object-store client surface.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    /// Upload a file, returning its etag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
        server_side_encryption: bool,
    ) -> Result<Option<String>>;

    /// Download into `destination`, returning the byte count.
    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64>;

    /// Server-side copy into `dest_bucket/dest_key`, returning the new etag.
    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<Option<String>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationUsage {
    pub count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageUsage {
    pub primary: LocationUsage,
    pub replica: Option<LocationUsage>,
}

/// Uploads, replicates and removes backup artifacts across a primary bucket
/// and an optional replica bucket in another region.
#[derive(Debug, Clone)]
pub struct CloudStorageGateway {
    config: CloudStorageConfig,
    primary: Arc<dyn BlobStore>,
    replica: Option<Arc<dyn BlobStore>>,
}

impl CloudStorageGateway {
    pub fn new(
        config: CloudStorageConfig,
        primary: Arc<dyn BlobStore>,
        replica: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            config,
            primary,
            replica,
        }
    }

    /// Build the stores named by `config.provider`.
    pub async fn from_config(config: CloudStorageConfig) -> Result<Self> {
        let (primary, replica): (Arc<dyn BlobStore>, Option<Arc<dyn BlobStore>>) =
            match config.provider {
                CloudProvider::Filesystem => {
                    let store: Arc<dyn BlobStore> =
                        Arc::new(FilesystemBlobStore::new(&config.filesystem_root));
                    let replica = config.replica.as_ref().map(|_| Arc::clone(&store));
                    (store, replica)
                }
                #[cfg(feature = "s3")]
                CloudProvider::S3 => {
                    let primary: Arc<dyn BlobStore> = Arc::new(
                        s3::S3BlobStore::connect(
                            &config.primary.region,
                            config.endpoint_url.as_deref(),
                        )
                        .await,
                    );
                    let replica = match &config.replica {
                        Some(location) => Some(Arc::new(
                            s3::S3BlobStore::connect(
                                &location.region,
                                config.endpoint_url.as_deref(),
                            )
                            .await,
                        ) as Arc<dyn BlobStore>),
                        None => None,
                    };
                    (primary, replica)
                }
                #[cfg(not(feature = "s3"))]
                CloudProvider::S3 => {
                    return Err(BackupError::config(
                        "S3 provider requires building with the `s3` feature",
                    ))
                }
            };
        Ok(Self::new(config, primary, replica))
    }

    pub fn config(&self) -> &CloudStorageConfig {
        &self.config
    }

    /// `<tier>/<year>/<month>/<day>/backup-<id>.<ext>`, dated by creation time.
    pub fn object_key(
        tier: RetentionTier,
        created_at: DateTime<Utc>,
        backup_id: Uuid,
        extension: &str,
    ) -> String {
        format!(
            "{}/{:04}/{:02}/{:02}/backup-{}.{}",
            tier,
            created_at.year(),
            created_at.month(),
            created_at.day(),
            backup_id,
            extension
        )
    }

    #[instrument(skip(self, artifact_path, metadata), fields(backup_id = %metadata.backup_id))]
    pub async fn upload(
        &self,
        artifact_path: &Path,
        created_at: DateTime<Utc>,
        extension: &str,
        metadata: &ObjectMetadata,
    ) -> Result<RemoteObject> {
        self.ensure_enabled()?;

        let key = Self::object_key(metadata.retention_tier, created_at, metadata.backup_id, extension);
        let location = &self.config.primary;
        let etag = self
            .primary
            .put_object(&location.bucket, &key, artifact_path, &metadata.to_pairs(), true)
            .await?;

        info!("Uploaded backup to {}/{}", location.bucket, key);
        Ok(RemoteObject {
            bucket: location.bucket.clone(),
            key,
            region: location.region.clone(),
            etag,
        })
    }

    /// Server-side copy of `primary_key` into the replica bucket under the same key.
    #[instrument(skip(self))]
    pub async fn replicate(&self, primary_key: &str) -> Result<RemoteObject> {
        self.ensure_enabled()?;
        let (store, location) = self.replica_target()?;

        let etag = store
            .copy_object(&self.config.primary.bucket, primary_key, &location.bucket, primary_key)
            .await
            .map_err(|e| BackupError::ReplicationError {
                message: format!("Copy to {} failed: {e}", location.bucket),
            })?;

        info!(
            "Replicated {} to {} ({})",
            primary_key, location.bucket, location.region
        );
        Ok(RemoteObject {
            bucket: location.bucket.clone(),
            key: primary_key.to_string(),
            region: location.region.clone(),
            etag,
        })
    }

    pub async fn download(&self, key: &str, destination: &Path, from_replica: bool) -> Result<u64> {
        self.ensure_enabled()?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let result = if from_replica {
            let (store, location) = self.replica_target()?;
            store.get_object(&location.bucket, key, destination).await
        } else {
            self.primary
                .get_object(&self.config.primary.bucket, key, destination)
                .await
        };

        if result.is_err() {
            let _ = fs::remove_file(destination).await;
        }
        let bytes = result?;
        debug!("Downloaded {} ({} bytes)", key, bytes);
        Ok(bytes)
    }

    /// Delete the primary copy. Replica failures are logged only.
    pub async fn delete(&self, key: &str, also_delete_replica: bool) -> Result<()> {
        self.ensure_enabled()?;
        self.primary
            .delete_object(&self.config.primary.bucket, key)
            .await?;

        if also_delete_replica {
            match self.replica_target() {
                Ok((store, location)) => {
                    if let Err(e) = store.delete_object(&location.bucket, key).await {
                        warn!("Failed to delete replica copy {}/{}: {}", location.bucket, key, e);
                    }
                }
                Err(e) => warn!("Skipping replica delete for {}: {}", key, e),
            }
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_enabled()?;
        Ok(self
            .primary
            .head_object(&self.config.primary.bucket, key)
            .await?
            .is_some())
    }

    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        self.ensure_enabled()?;
        self.primary
            .list_objects(&self.config.primary.bucket, prefix)
            .await
    }

    /// Object count and bytes per bucket. Both buckets are listed concurrently.
    pub async fn usage(&self) -> Result<StorageUsage> {
        self.ensure_enabled()?;
        let primary = self.primary.list_objects(&self.config.primary.bucket, "");
        let replica = async {
            match (&self.replica, &self.config.replica) {
                (Some(store), Some(location)) => {
                    store.list_objects(&location.bucket, "").await.map(Some)
                }
                _ => Ok(None),
            }
        };
        let (primary, replica) = futures::future::try_join(primary, replica).await?;
        Ok(StorageUsage {
            primary: summarize(&primary),
            replica: replica.as_deref().map(summarize),
        })
    }

    fn ensure_enabled(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(BackupError::config("Cloud storage is not enabled"));
        }
        Ok(())
    }

    fn replica_target(&self) -> Result<(&Arc<dyn BlobStore>, &BucketLocation)> {
        if !self.config.cross_region_enabled {
            return Err(BackupError::config("Cross-region replication is not enabled"));
        }
        match (&self.replica, &self.config.replica) {
            (Some(store), Some(location)) => Ok((store, location)),
            _ => Err(BackupError::config(
                "Cross-region replication has no replica bucket configured",
            )),
        }
    }
}

fn summarize(objects: &[StoredObject]) -> LocationUsage {
    LocationUsage {
        count: objects.len() as u64,
        total_bytes: objects.iter().map(|o| o.size_bytes).sum(),
    }
}

/// Object store backed by a directory tree: `<root>/<bucket>/<key>`, with
/// metadata in a `<key>.meta.json` sidecar.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    metadata: BTreeMap<String, String>,
    server_side_encryption: bool,
    etag: String,
}

const SIDECAR_SUFFIX: &str = ".meta.json";

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(BackupError::StorageError {
                message: format!("Invalid bucket name {bucket:?}"),
            });
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && !key.ends_with(SIDECAR_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BackupError::StorageError {
                message: format!("Invalid object location {bucket}/{key}"),
            });
        }
        Ok(self.bucket_path(bucket)?.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_sidecar(path: &Path) -> Option<Sidecar> {
        let bytes = fs::read(Self::sidecar_path(path)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn stored_object(&self, path: &Path, key: String) -> Result<StoredObject> {
        let metadata = fs::metadata(path).await?;
        Ok(StoredObject {
            key,
            size_bytes: metadata.len(),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            etag: Self::read_sidecar(path).await.map(|s| s.etag),
        })
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
        server_side_encryption: bool,
    ) -> Result<Option<String>> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(source, &path).await?;

        let etag = artifact::sha256_file(&path).await?;
        let sidecar = Sidecar {
            metadata: metadata.clone(),
            server_side_encryption,
            etag: etag.clone(),
        };
        fs::write(Self::sidecar_path(&path), serde_json::to_vec_pretty(&sidecar)?).await?;
        Ok(Some(etag))
    }

    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64> {
        let path = self.object_path(bucket, key)?;
        match fs::copy(&path, destination).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::not_found(format!("object {bucket}/{key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<Option<String>> {
        let source = self.object_path(source_bucket, source_key)?;
        if !fs::try_exists(&source).await? {
            return Err(BackupError::not_found(format!(
                "object {source_bucket}/{source_key}"
            )));
        }
        let sidecar = Self::read_sidecar(&source).await;
        let metadata = sidecar.as_ref().map(|s| s.metadata.clone()).unwrap_or_default();
        let sse = sidecar.map(|s| s.server_side_encryption).unwrap_or(false);
        self.put_object(dest_bucket, dest_key, &source, &metadata, sse)
            .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        for target in [path.clone(), Self::sidecar_path(&path)] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let path = self.object_path(bucket, key)?;
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(self.stored_object(&path, key.to_string()).await?))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
        let bucket_root = self.bucket_path(bucket)?;
        let mut objects = Vec::new();
        let mut pending = vec![bucket_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(SIDECAR_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                objects.push(self.stored_object(&path, key).await?);
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(feature = "s3")]
pub mod s3 {
    use super::{BlobStore, StoredObject};
    use crate::backup::{BackupError, Result};
    use async_trait::async_trait;
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::error::DisplayErrorContext;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::types::{MetadataDirective, ServerSideEncryption};
    use aws_sdk_s3::Client;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tokio::io::AsyncWriteExt;

    /// One S3 client per region.
    #[derive(Debug, Clone)]
    pub struct S3BlobStore {
        client: Client,
    }

    fn storage_error(context: &str, err: impl std::error::Error) -> BackupError {
        BackupError::StorageError {
            message: format!("{context}: {}", DisplayErrorContext(err)),
        }
    }

    fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
    }

    impl S3BlobStore {
        pub async fn connect(region: &str, endpoint_url: Option<&str>) -> Self {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()));
            if let Some(endpoint) = endpoint_url {
                loader = loader.endpoint_url(endpoint);
            }
            let shared = loader.load().await;

            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if endpoint_url.is_some() {
                builder = builder.force_path_style(true);
            }
            Self {
                client: Client::from_conf(builder.build()),
            }
        }
    }

    #[async_trait]
    impl BlobStore for S3BlobStore {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            source: &Path,
            metadata: &BTreeMap<String, String>,
            server_side_encryption: bool,
        ) -> Result<Option<String>> {
            let body = ByteStream::from_path(source)
                .await
                .map_err(|e| storage_error("Failed to open upload body", e))?;

            let mut request = self.client.put_object().bucket(bucket).key(key).body(body);
            for (name, value) in metadata {
                request = request.metadata(name, value);
            }
            if server_side_encryption {
                request = request.server_side_encryption(ServerSideEncryption::Aes256);
            }

            let output = request
                .send()
                .await
                .map_err(|e| storage_error("PutObject failed", e))?;
            Ok(output.e_tag().map(|s| s.to_string()))
        }

        async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64> {
            let output = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        BackupError::not_found(format!("object {bucket}/{key}"))
                    } else {
                        storage_error("GetObject failed", service)
                    }
                })?;

            let mut reader = output.body.into_async_read();
            let mut file = tokio::fs::File::create(destination).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok(bytes)
        }

        async fn copy_object(
            &self,
            source_bucket: &str,
            source_key: &str,
            dest_bucket: &str,
            dest_key: &str,
        ) -> Result<Option<String>> {
            let output = self
                .client
                .copy_object()
                .copy_source(format!("{source_bucket}/{source_key}"))
                .bucket(dest_bucket)
                .key(dest_key)
                .metadata_directive(MetadataDirective::Copy)
                .server_side_encryption(ServerSideEncryption::Aes256)
                .send()
                .await
                .map_err(|e| storage_error("CopyObject failed", e))?;
            Ok(output
                .copy_object_result()
                .and_then(|r| r.e_tag())
                .map(|s| s.to_string()))
        }

        async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| storage_error("DeleteObject failed", e))?;
            Ok(())
        }

        async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
            match self.client.head_object().bucket(bucket).key(key).send().await {
                Ok(output) => Ok(Some(StoredObject {
                    key: key.to_string(),
                    size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
                    last_modified: output.last_modified().and_then(to_chrono),
                    etag: output.e_tag().map(|s| s.to_string()),
                })),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_not_found() {
                        Ok(None)
                    } else {
                        Err(storage_error("HeadObject failed", service))
                    }
                }
            }
        }

        async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
            let mut objects = Vec::new();
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| storage_error("ListObjectsV2 failed", e))?;
                for object in page.contents() {
                    objects.push(StoredObject {
                        key: object.key().unwrap_or_default().to_string(),
                        size_bytes: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: object.last_modified().and_then(to_chrono),
                        etag: object.e_tag().map(|s| s.to_string()),
                    });
                }
            }
            Ok(objects)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn gateway(root: &Path, cross_region: bool) -> CloudStorageGateway {
        let config = CloudStorageConfig {
            enabled: true,
            provider: CloudProvider::Filesystem,
            primary: BucketLocation {
                bucket: "primary".to_string(),
                region: "us-east-1".to_string(),
            },
            replica: Some(BucketLocation {
                bucket: "replica".to_string(),
                region: "eu-west-1".to_string(),
            }),
            cross_region_enabled: cross_region,
            endpoint_url: None,
            filesystem_root: root.to_path_buf(),
        };
        let store: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(root));
        CloudStorageGateway::new(config, Arc::clone(&store), Some(store))
    }

    fn metadata(id: Uuid) -> ObjectMetadata {
        ObjectMetadata {
            backup_id: id,
            retention_tier: RetentionTier::Monthly,
            uploaded_at: Utc::now(),
            checksum_sha256: Some("abc".to_string()),
            encrypted: true,
            encryption_key_id: Some("0011223344556677".to_string()),
        }
    }

    #[test]
    fn test_object_key_layout() {
        let id = Uuid::nil();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(
            CloudStorageGateway::object_key(RetentionTier::Monthly, created, id, "sql.gz.enc"),
            "monthly/2024/03/01/backup-00000000-0000-0000-0000-000000000000.sql.gz.enc"
        );
    }

    #[tokio::test]
    async fn test_upload_replicate_download_delete() {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("store");
        let gateway = gateway(&store_root, true);
        let artifact = dir.path().join("artifact.bin");
        std::fs::write(&artifact, b"ciphertext").unwrap();

        let id = Uuid::new_v4();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let uploaded = gateway
            .upload(&artifact, created, "sql.gz.enc", &metadata(id))
            .await
            .unwrap();
        assert_eq!(uploaded.bucket, "primary");
        assert!(uploaded.key.starts_with("monthly/2024/03/01/"));
        assert!(gateway.exists(&uploaded.key).await.unwrap());

        let replica = gateway.replicate(&uploaded.key).await.unwrap();
        assert_eq!(replica.key, uploaded.key);
        assert_eq!(replica.bucket, "replica");
        assert_eq!(replica.region, "eu-west-1");

        let sidecar = std::fs::read_to_string(FilesystemBlobStore::sidecar_path(
            &store_root.join("replica").join(&uploaded.key),
        ))
        .unwrap();
        assert!(sidecar.contains(&id.to_string()));

        let restored = dir.path().join("restore/from-replica.bin");
        gateway.download(&uploaded.key, &restored, true).await.unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"ciphertext");

        let usage = gateway.usage().await.unwrap();
        assert_eq!(usage.primary.count, 1);
        assert_eq!(usage.primary.total_bytes, 10);
        assert_eq!(usage.replica.unwrap().count, 1);

        gateway.delete(&uploaded.key, true).await.unwrap();
        assert!(!gateway.exists(&uploaded.key).await.unwrap());
        assert!(gateway.list_objects("monthly/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replication_requires_configuration() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(dir.path(), false);
        let err = gateway.replicate("daily/2024/01/02/backup-x.sql").await.unwrap_err();
        assert!(matches!(err, BackupError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn test_disabled_gateway_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(dir.path()));
        let gateway = CloudStorageGateway::new(CloudStorageConfig::default(), store, None);
        let err = gateway.exists("anything").await.unwrap_err();
        assert!(matches!(err, BackupError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn test_filesystem_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        assert!(store.head_object("bucket", "../outside").await.is_err());
        assert!(store.head_object("bucket", "/etc/passwd").await.is_err());
        assert!(store.head_object("../x", "key").await.is_err());
        assert!(store.head_object("bucket", "daily/ok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filesystem_listing_rejects_escaping_buckets() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        std::fs::create_dir_all(dir.path().join("x")).unwrap();
        std::fs::write(dir.path().join("x/secret"), b"outside the store").unwrap();
        let store = FilesystemBlobStore::new(&root);

        for bucket in ["../x", "..", ".", "", "a/b"] {
            let err = store.list_objects(bucket, "").await.unwrap_err();
            assert!(matches!(err, BackupError::StorageError { .. }), "{bucket}");
        }
        assert!(store.list_objects("bucket", "").await.unwrap().is_empty());
    }
}
