//! In-memory object store for development runs and tests

use crate::{
    multipart_etag, ByteRange, CompletePart, GetOptions, ListObjectsResult, Metadata,
    MultipartUploadInfo, ObjectBackend, ObjectEvent, ObjectInfo, ObjectReader, ObjectStoreError,
    PartInfo, PutOptions, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use federa_crypto::{md5_hash, sha256_hex, IntegrityError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// Receives change notifications from a [`MemoryObjectStore`].
///
/// Callbacks run synchronously on the writer's task after the change is
/// visible; they must not block.
pub trait ObjectObserver: Send + Sync {
    fn on_event(&self, event: &ObjectEvent);
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    info: ObjectInfo,
}

struct PendingUpload {
    bucket: String,
    key: String,
    opts: PutOptions,
    initiated: DateTime<Utc>,
    parts: BTreeMap<u32, (Bytes, PartInfo)>,
}

/// An in-memory object store. Buckets are created on first write.
#[derive(Clone)]
pub struct MemoryObjectStore {
    name: Arc<str>,
    objects: Arc<DashMap<(String, String), StoredObject>>,
    uploads: Arc<DashMap<String, PendingUpload>>,
    observers: Arc<RwLock<Vec<Arc<dyn ObjectObserver>>>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryObjectStore {
    /// Create a new empty memory store
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            objects: Arc::new(DashMap::new()),
            uploads: Arc::new(DashMap::new()),
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register an observer for put/remove events
    pub fn subscribe(&self, observer: Arc<dyn ObjectObserver>) {
        self.observers.write().push(observer);
    }

    /// Get the number of objects stored, across buckets
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Raw bytes of an object, if present
    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.data.clone())
    }

    /// Number of multipart uploads still pending
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    fn notify(&self, event: ObjectEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }

    async fn read_body(
        mut reader: ObjectReader,
        size: Option<u64>,
        opts: &PutOptions,
    ) -> Result<Bytes> {
        let mut data = Vec::with_capacity(size.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        reader.read_to_end(&mut data).await?;

        if let Some(expected) = size {
            if (data.len() as u64) < expected {
                return Err(IntegrityError::IncompleteBody {
                    expected,
                    actual: data.len() as u64,
                }
                .into_io()
                .into());
            }
        }
        if let Some(expected) = opts.md5.as_deref().filter(|s| !s.is_empty()) {
            let actual = md5_hash(&data);
            if actual != expected {
                return Err(IntegrityError::BadDigest {
                    expected: expected.to_string(),
                    actual,
                }
                .into_io()
                .into());
            }
        }
        if let Some(expected) = opts
            .sha256
            .as_deref()
            .filter(|s| !s.is_empty() && *s != "UNSIGNED-PAYLOAD")
        {
            let actual = sha256_hex(&data);
            if actual != expected {
                return Err(IntegrityError::Sha256Mismatch {
                    expected: expected.to_string(),
                    actual,
                }
                .into_io()
                .into());
            }
        }
        Ok(Bytes::from(data))
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes, etag: String, opts: PutOptions) -> ObjectInfo {
        let info = ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            etag,
            last_modified: Utc::now(),
            content_type: opts.content_type,
            metadata: opts.metadata,
        };
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                info: info.clone(),
            },
        );
        self.notify(ObjectEvent::Put {
            bucket: bucket.to_string(),
            info: info.clone(),
        });
        info
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ObjectStoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

fn slice_range(data: &Bytes, range: Option<ByteRange>) -> Result<Bytes> {
    let Some(range) = range else {
        return Ok(data.clone());
    };
    let size = data.len() as u64;
    if range.start >= size && !(range.start == 0 && size == 0) {
        return Err(ObjectStoreError::InvalidRange {
            start: range.start,
            size,
        });
    }
    let end = range.end.map(|e| e.min(size.saturating_sub(1))).unwrap_or(size.saturating_sub(1));
    if size == 0 {
        return Ok(Bytes::new());
    }
    Ok(data.slice(range.start as usize..=end as usize))
}

#[async_trait]
impl ObjectBackend for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, opts), fields(store = %self.name))]
    async fn get_object(&self, bucket: &str, key: &str, opts: GetOptions) -> Result<ObjectReader> {
        let stored = self.lookup(bucket, key)?;
        let body = slice_range(&stored.data, opts.range)?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        self.lookup(bucket, key).map(|stored| stored.info)
    }

    #[instrument(skip(self, reader, opts), fields(store = %self.name))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<ObjectInfo> {
        let data = Self::read_body(reader, size, &opts).await?;
        let etag = md5_hash(&data);
        debug!(bytes = data.len(), %etag, "stored object");
        Ok(self.store(bucket, key, data, etag, opts))
    }

    #[instrument(skip(self, metadata), fields(store = %self.name))]
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<Metadata>,
    ) -> Result<ObjectInfo> {
        let source = self.lookup(src_bucket, src_key)?;
        let opts = PutOptions {
            content_type: source.info.content_type.clone(),
            metadata: metadata.unwrap_or(source.info.metadata),
            ..Default::default()
        };
        Ok(self.store(dst_bucket, dst_key, source.data, source.info.etag, opts))
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        if self
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some()
        {
            self.notify(ObjectEvent::Removed {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<ListObjectsResult> {
        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut prefixes = BTreeSet::new();
        for entry in self.objects.iter() {
            let (b, key) = entry.key();
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                Some(idx) if !recursive => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..=idx]));
                }
                _ => objects.push(entry.value().info.clone()),
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ListObjectsResult {
            objects,
            common_prefixes: prefixes.into_iter().collect(),
        })
    }

    async fn new_multipart_upload(&self, bucket: &str, key: &str, opts: PutOptions) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                opts,
                initiated: Utc::now(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<MultipartUploadInfo>> {
        let mut uploads: Vec<MultipartUploadInfo> = self
            .uploads
            .iter()
            .filter(|entry| entry.bucket == bucket && entry.key.starts_with(prefix))
            .map(|entry| MultipartUploadInfo {
                key: entry.key.clone(),
                upload_id: entry.key().clone(),
                initiated: entry.initiated,
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        Ok(uploads)
    }

    async fn list_object_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartInfo>> {
        let upload = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
        Ok(upload.parts.values().map(|(_, info)| info.clone()).collect())
    }

    async fn put_object_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<PartInfo> {
        if !self.uploads.contains_key(upload_id) {
            return Err(ObjectStoreError::NoSuchUpload(upload_id.to_string()));
        }
        let data = Self::read_body(reader, size, &opts).await?;
        let info = PartInfo {
            part_number,
            etag: md5_hash(&data),
            size: data.len() as u64,
            last_modified: Utc::now(),
        };
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
        upload.parts.insert(part_number, (data, info.clone()));
        Ok(info)
    }

    #[instrument(skip(self, parts), fields(store = %self.name))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        let (body, etags) = {
            let upload = self
                .uploads
                .get(upload_id)
                .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
            let mut body = Vec::new();
            let mut etags = Vec::with_capacity(parts.len());
            for part in &parts {
                let Some((data, info)) = upload.parts.get(&part.part_number) else {
                    return Err(ObjectStoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".to_string(),
                    });
                };
                if info.etag != part.etag.trim_matches('"') {
                    return Err(ObjectStoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: format!("etag mismatch, stored {}", info.etag),
                    });
                }
                body.extend_from_slice(data);
                etags.push(info.etag.clone());
            }
            (body, etags)
        };
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;

        let etag = multipart_etag(&etags);
        debug!(parts = parts.len(), %etag, upload_key = %upload.key, "completed multipart upload");
        Ok(self.store(bucket, key, Bytes::from(body), etag, upload.opts))
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_crypto::find_integrity_error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn body(data: &'static [u8]) -> ObjectReader {
        Box::pin(data)
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_get_stat() {
        let store = MemoryObjectStore::new("ds1");
        let info = store
            .put_object("data", "a/b.txt", body(b"hello"), Some(5), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(info.etag, md5_hash(b"hello"));
        assert_eq!(info.size, 5);

        let read = read_all(store.get_object("data", "a/b.txt", GetOptions::default()).await.unwrap()).await;
        assert_eq!(read, b"hello");
        assert_eq!(store.stat_object("data", "a/b.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_range_get() {
        let store = MemoryObjectStore::new("ds1");
        store
            .put_object("b", "k", body(b"0123456789"), None, PutOptions::default())
            .await
            .unwrap();
        let opts = GetOptions {
            range: Some(ByteRange::from_offset(2, 3)),
            ..Default::default()
        };
        assert_eq!(read_all(store.get_object("b", "k", opts).await.unwrap()).await, b"234");

        let past_end = GetOptions {
            range: Some(ByteRange::from_offset(10, 1)),
            ..Default::default()
        };
        assert!(matches!(
            store.get_object("b", "k", past_end).await,
            Err(ObjectStoreError::InvalidRange { start: 10, size: 10 })
        ));
    }

    #[tokio::test]
    async fn test_bad_digest_is_not_stored() {
        let store = MemoryObjectStore::new("ds1");
        let opts = PutOptions {
            md5: Some(md5_hash(b"other")),
            ..Default::default()
        };
        let err = store
            .put_object("b", "k", body(b"payload"), None, opts)
            .await
            .unwrap_err();
        match err {
            ObjectStoreError::Io(io) => assert!(matches!(
                find_integrity_error(&io),
                Some(IntegrityError::BadDigest { .. })
            )),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryObjectStore::new("ds1");
        let err = store.stat_object("b", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_objects_folds_prefixes() {
        let store = MemoryObjectStore::new("ds1");
        for key in ["root/a.txt", "root/sub/b.txt", "root/sub/c/d.txt", "other/x"] {
            store
                .put_object("b", key, body(b"x"), None, PutOptions::default())
                .await
                .unwrap();
        }
        let flat = store.list_objects("b", "root/", false).await.unwrap();
        assert_eq!(flat.objects.len(), 1);
        assert_eq!(flat.common_prefixes, vec!["root/sub/".to_string()]);

        let deep = store.list_objects("b", "root/", true).await.unwrap();
        let keys: Vec<_> = deep.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["root/a.txt", "root/sub/b.txt", "root/sub/c/d.txt"]);
    }

    #[tokio::test]
    async fn test_copy_replaces_metadata() {
        let store = MemoryObjectStore::new("ds1");
        let mut meta = Metadata::new();
        meta.insert("X-Amz-Meta-A".into(), "1".into());
        store
            .put_object(
                "b",
                "src",
                body(b"data"),
                None,
                PutOptions {
                    metadata: meta,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let kept = store.copy_object("b", "src", "b", "dst1", None).await.unwrap();
        assert_eq!(kept.metadata.get("X-Amz-Meta-A").map(String::as_str), Some("1"));

        let replaced = store
            .copy_object("b", "src", "b", "dst2", Some(Metadata::new()))
            .await
            .unwrap();
        assert!(replaced.metadata.is_empty());
        assert_eq!(store.object_bytes("b", "dst2").unwrap(), Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let store = MemoryObjectStore::new("ds1");
        let id = store
            .new_multipart_upload("b", "big.bin", PutOptions::default())
            .await
            .unwrap();
        assert_eq!(store.list_multipart_uploads("b", "big").await.unwrap().len(), 1);

        let p1 = store
            .put_object_part("b", "big.bin", &id, 1, body(b"hello "), None, PutOptions::default())
            .await
            .unwrap();
        let p2 = store
            .put_object_part("b", "big.bin", &id, 2, body(b"world"), None, PutOptions::default())
            .await
            .unwrap();
        assert_eq!(store.list_object_parts("b", "big.bin", &id).await.unwrap().len(), 2);

        let info = store
            .complete_multipart_upload(
                "b",
                "big.bin",
                &id,
                vec![
                    CompletePart { part_number: 1, etag: p1.etag.clone() },
                    CompletePart { part_number: 2, etag: p2.etag.clone() },
                ],
            )
            .await
            .unwrap();
        assert!(info.etag.ends_with("-2"));
        assert_eq!(store.object_bytes("b", "big.bin").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_abort_unknown_upload() {
        let store = MemoryObjectStore::new("ds1");
        assert!(matches!(
            store.abort_multipart_upload("b", "k", "missing").await,
            Err(ObjectStoreError::NoSuchUpload(_))
        ));
    }

    struct Counter(AtomicUsize, AtomicUsize);

    impl ObjectObserver for Counter {
        fn on_event(&self, event: &ObjectEvent) {
            match event {
                ObjectEvent::Put { .. } => self.0.fetch_add(1, Ordering::SeqCst),
                ObjectEvent::Removed { .. } => self.1.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    #[tokio::test]
    async fn test_observers_see_changes() {
        let store = MemoryObjectStore::new("ds1");
        let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
        store.subscribe(counter.clone());

        store
            .put_object("b", "k", body(b"x"), None, PutOptions::default())
            .await
            .unwrap();
        store.remove_object("b", "k").await.unwrap();
        // removing twice does not emit again
        store.remove_object("b", "k").await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter.1.load(Ordering::SeqCst), 1);
    }
}
