use super::{join_error, zip_error, ArchiveFormat, PIPE_CAPACITY};
use crate::handler::{GetRequest, Handler, PutRequest};
use async_compression::tokio::bufread::GzipDecoder;
use federa_core::node::{join_path, parent_path, trim_path};
use federa_core::{pipe, CoreError, Node, NodeAttr, PipeWriter, RequestContext, Result};
use federa_objects::ObjectReader;
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, instrument};
use zip::ZipArchive;

type TarArchive = tokio_tar::Archive<Box<dyn AsyncRead + Send + Unpin>>;

/// One entry of an archive, path relative to the archive root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
}

impl ArchiveEntry {
    fn implicit_dir(path: impl Into<String>, mtime: i64) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: 0,
            mtime,
        }
    }

    /// Node under `archive_path`; unknown sizes are reported as -1
    pub fn to_node(&self, archive_path: &str) -> Node {
        let path = join_path(archive_path, &self.path);
        if self.is_dir {
            Node::collection(path).mtime(self.mtime)
        } else {
            let size = if self.size == 0 { -1 } else { self.size as i64 };
            Node::leaf(path).size(size).mtime(self.mtime)
        }
    }
}

/// Seconds since the epoch of a ZIP timestamp, read as UTC
fn zip_epoch(time: Option<zip::DateTime>) -> Option<i64> {
    let time = time?;
    let date = chrono::NaiveDate::from_ymd_opt(i32::from(time.year()), u32::from(time.month()), u32::from(time.day()))?;
    let at = date.and_hms_opt(u32::from(time.hour()), u32::from(time.minute()), u32::from(time.second()))?;
    Some(at.and_utc().timestamp())
}

/// Reads a stored archive through a handler
///
/// ZIP needs random access, so the archive is first copied into an anonymous
/// temporary file released when the read completes. TAR is read as a stream.
pub struct ArchiveReader {
    handler: Arc<dyn Handler>,
    ctx: RequestContext,
    archive: Node,
    format: ArchiveFormat,
}

impl ArchiveReader {
    pub fn new(handler: Arc<dyn Handler>, ctx: RequestContext, archive: Node, format: ArchiveFormat) -> Self {
        Self {
            handler,
            ctx,
            archive,
            format,
        }
    }

    async fn open(&self) -> Result<ObjectReader> {
        self.handler
            .get_object(self.ctx.clone(), self.archive.clone(), GetRequest::default())
            .await
    }

    async fn materialize(&self) -> Result<std::fs::File> {
        let mut reader = self.open().await?;
        let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
        let copied = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        debug!(path = %self.archive.path, bytes = copied, "Archive spooled to temporary file");
        Ok(file.into_std().await)
    }

    async fn tar(&self) -> Result<TarArchive> {
        let reader = self.open().await?;
        let reader: Box<dyn AsyncRead + Send + Unpin> = match self.format {
            ArchiveFormat::TarGz => Box::new(GzipDecoder::new(BufReader::new(reader))),
            _ => Box::new(reader),
        };
        Ok(tokio_tar::Archive::new(reader))
    }

    async fn zip(&self) -> Result<ZipArchive<std::fs::File>> {
        let file = self.materialize().await?;
        tokio::task::spawn_blocking(move || ZipArchive::new(file).map_err(zip_error))
            .await
            .map_err(join_error)?
    }

    /// Entries in archive order. TAR scanning stops at `stop_at` when given.
    async fn scan(&self, stop_at: Option<&str>) -> Result<Vec<ArchiveEntry>> {
        let fallback_mtime = self.archive.mtime;
        match self.format {
            ArchiveFormat::Zip => {
                let mut archive = self.zip().await?;
                tokio::task::spawn_blocking(move || -> Result<Vec<ArchiveEntry>> {
                    let mut entries = Vec::with_capacity(archive.len());
                    for i in 0..archive.len() {
                        let file = archive.by_index(i).map_err(zip_error)?;
                        entries.push(ArchiveEntry {
                            path: trim_path(file.name()).to_string(),
                            is_dir: file.is_dir(),
                            size: file.size(),
                            mtime: zip_epoch(file.last_modified()).unwrap_or(fallback_mtime),
                        });
                    }
                    Ok(entries)
                })
                .await
                .map_err(join_error)?
            }
            ArchiveFormat::Tar | ArchiveFormat::TarGz => {
                let mut archive = self.tar().await?;
                let mut stream = archive.entries()?;
                let mut entries = Vec::new();
                while let Some(entry) = stream.next().await {
                    let entry = entry?;
                    let header = entry.header();
                    let kind = header.entry_type();
                    if !kind.is_file() && !kind.is_dir() {
                        debug!(kind = ?kind, "Skipping tar entry");
                        continue;
                    }
                    let path = trim_path(&entry.path()?.to_string_lossy()).to_string();
                    let found = stop_at == Some(path.as_str());
                    entries.push(ArchiveEntry {
                        path,
                        is_dir: kind.is_dir(),
                        size: header.size()?,
                        mtime: header.mtime().map(|t| t as i64).unwrap_or(fallback_mtime),
                    });
                    if found {
                        break;
                    }
                }
                Ok(entries)
            }
        }
    }

    /// Direct children of `parent`. Directories never stored explicitly are
    /// synthesised from their descendants; directories without any file
    /// beneath them are left out.
    #[instrument(skip(self), fields(archive = %self.archive.path))]
    pub async fn list_children(&self, parent: &str) -> Result<Vec<ArchiveEntry>> {
        let parent = trim_path(parent);
        let entries = self.scan(None).await?;
        let prefix = if parent.is_empty() {
            String::new()
        } else {
            format!("{}/", parent)
        };
        let files: Vec<&str> = entries.iter().filter(|e| !e.is_dir).map(|e| e.path.as_str()).collect();
        let populated = |dir: &str| {
            let dir = format!("{}/", dir);
            files.iter().any(|f| f.starts_with(&dir))
        };

        if !parent.is_empty() && !entries.iter().any(|e| e.path.starts_with(&prefix)) {
            return Err(CoreError::ArchiveMemberNotFound(parent.to_string()));
        }

        let mut children = BTreeMap::new();
        for entry in &entries {
            let Some(rest) = entry.path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => {
                    if entry.is_dir && !populated(&entry.path) {
                        continue;
                    }
                    children.insert(entry.path.clone(), entry.clone());
                }
                Some((first, _)) => {
                    let dir = format!("{}{}", prefix, first);
                    if populated(&dir) {
                        children
                            .entry(dir.clone())
                            .or_insert_with(|| ArchiveEntry::implicit_dir(dir, entry.mtime));
                    }
                }
            }
        }
        Ok(children.into_values().collect())
    }

    /// Entry at `inner`, possibly an implicit directory
    #[instrument(skip(self), fields(archive = %self.archive.path))]
    pub async fn stat_child(&self, inner: &str) -> Result<ArchiveEntry> {
        let inner = trim_path(inner);
        let entries = self.scan(Some(inner)).await?;
        if let Some(entry) = entries.iter().find(|e| e.path == inner) {
            return Ok(entry.clone());
        }
        let prefix = format!("{}/", inner);
        entries
            .iter()
            .find(|e| e.path.starts_with(&prefix))
            .map(|e| ArchiveEntry::implicit_dir(inner, e.mtime))
            .ok_or_else(|| CoreError::ArchiveMemberNotFound(inner.to_string()))
    }

    /// Body of the file at `inner`
    #[instrument(skip(self), fields(archive = %self.archive.path))]
    pub async fn read_child(&self, inner: &str) -> Result<ObjectReader> {
        let inner = trim_path(inner).to_string();
        match self.format {
            ArchiveFormat::Zip => {
                let archive = self.zip().await?;
                let Some(index) = archive.index_for_name(&inner) else {
                    return Err(CoreError::ArchiveMemberNotFound(inner));
                };
                let (writer, reader) = pipe(PIPE_CAPACITY);
                let failer = writer.failer();
                let sink = SyncIoBridge::new(writer);
                let runtime = tokio::runtime::Handle::current();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) = copy_zip_entry(archive, index, sink) {
                        runtime.block_on(failer.fail(err));
                    }
                });
                Ok(Box::pin(reader))
            }
            ArchiveFormat::Tar | ArchiveFormat::TarGz => {
                let mut archive = self.tar().await?;
                let mut stream = archive.entries()?;
                while let Some(entry) = stream.next().await {
                    let entry = entry?;
                    if entry.header().entry_type().is_file() && trim_path(&entry.path()?.to_string_lossy()) == inner {
                        return Ok(Box::pin(entry));
                    }
                }
                Err(CoreError::ArchiveMemberNotFound(inner))
            }
        }
    }

    /// Unpack every entry under `target` through `handler`, creating
    /// collections for directories and their implicit parents.
    /// Returns the number of files written.
    #[instrument(skip_all, fields(archive = %self.archive.path, target = %target.path))]
    pub async fn extract_all(&self, handler: &dyn Handler, ctx: RequestContext, target: &Node) -> Result<usize> {
        let mut created = HashSet::new();
        let mut files = 0;
        let fallback_mtime = self.archive.mtime;
        match self.format {
            ArchiveFormat::Zip => {
                let mut archive = self.zip().await?;
                for index in 0..archive.len() {
                    ctx.check_cancelled()?;
                    let (archive_back, meta) = tokio::task::spawn_blocking(move || {
                        let meta = archive
                            .by_index(index)
                            .map(|f| {
                                let mtime = zip_epoch(f.last_modified()).unwrap_or(fallback_mtime);
                                (trim_path(f.name()).to_string(), f.is_dir(), f.size(), mtime)
                            })
                            .map_err(zip_error);
                        (archive, meta)
                    })
                    .await
                    .map_err(join_error)?;
                    archive = archive_back;
                    let (path, is_dir, size, mtime) = meta?;
                    if path.is_empty() {
                        continue;
                    }
                    ensure_dirs(handler, &ctx, target, &path, is_dir, &mut created).await?;
                    if is_dir {
                        continue;
                    }

                    let (writer, reader) = pipe(PIPE_CAPACITY);
                    let sink = SyncIoBridge::new(writer);
                    let producer = tokio::task::spawn_blocking(move || {
                        let copied = copy_zip_entry_ref(&mut archive, index, sink);
                        (archive, copied)
                    });
                    let node = child_of(target, &path, false).mtime(mtime);
                    let put = handler
                        .put_object(ctx.clone(), node, PutRequest::new(Box::pin(reader), size as i64))
                        .await;
                    let (archive_back, copied) = producer.await.map_err(join_error)?;
                    archive = archive_back;
                    put?;
                    copied?;
                    files += 1;
                }
            }
            ArchiveFormat::Tar | ArchiveFormat::TarGz => {
                let mut archive = self.tar().await?;
                let mut stream = archive.entries()?;
                while let Some(entry) = stream.next().await {
                    ctx.check_cancelled()?;
                    let entry = entry?;
                    let kind = entry.header().entry_type();
                    if !kind.is_file() && !kind.is_dir() {
                        continue;
                    }
                    let path = trim_path(&entry.path()?.to_string_lossy()).to_string();
                    if path.is_empty() {
                        continue;
                    }
                    ensure_dirs(handler, &ctx, target, &path, kind.is_dir(), &mut created).await?;
                    if kind.is_dir() {
                        continue;
                    }
                    let size = entry.header().size()? as i64;
                    let mtime = entry.header().mtime().map(|t| t as i64).unwrap_or(fallback_mtime);
                    let node = child_of(target, &path, false).mtime(mtime);
                    handler
                        .put_object(ctx.clone(), node, PutRequest::new(Box::pin(entry), size))
                        .await?;
                    files += 1;
                }
            }
        }
        debug!(files, collections = created.len(), "Archive extracted");
        Ok(files)
    }
}

/// Node at `rel` under `target`, inheriting its data-source placement
fn child_of(target: &Node, rel: &str, collection: bool) -> Node {
    let path = join_path(&target.path, rel);
    let mut node = if collection {
        Node::collection(path)
    } else {
        Node::leaf(path)
    };
    if let Some(ds) = target.attr(NodeAttr::DataSourceName) {
        node.set_attr(NodeAttr::DataSourceName, ds);
    }
    if let Some(base) = target.attr(NodeAttr::DataSourcePath) {
        node.set_attr(NodeAttr::DataSourcePath, join_path(base, rel));
    }
    node
}

/// Create the collections leading to `path` (and `path` itself for a directory)
async fn ensure_dirs(
    handler: &dyn Handler,
    ctx: &RequestContext,
    target: &Node,
    path: &str,
    is_dir: bool,
    created: &mut HashSet<String>,
) -> Result<()> {
    let mut dirs = Vec::new();
    let mut current = if is_dir { path } else { parent_path(path) };
    while !current.is_empty() && !created.contains(current) {
        dirs.push(current.to_string());
        current = parent_path(current);
    }
    for dir in dirs.into_iter().rev() {
        let node = child_of(target, &dir, true);
        match handler.create_node(ctx.clone(), node).await {
            Ok(_) => {}
            Err(CoreError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
        created.insert(dir);
    }
    Ok(())
}

fn copy_zip_entry(mut archive: ZipArchive<std::fs::File>, index: usize, sink: SyncIoBridge<PipeWriter>) -> io::Result<()> {
    copy_zip_entry_ref(&mut archive, index, sink)
}

fn copy_zip_entry_ref(
    archive: &mut ZipArchive<std::fs::File>,
    index: usize,
    mut sink: SyncIoBridge<PipeWriter>,
) -> io::Result<()> {
    let mut entry = archive.by_index(index).map_err(io::Error::other)?;
    io::copy(&mut entry, &mut sink)?;
    sink.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::filter::Chain;
    use crate::filters::put::PutFilter;
    use crate::testing::{ds_node, env};
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use zip::write::SimpleFileOptions;

    fn zip_bytes(files: &[(&str, &[u8])], dirs: &[&str]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for dir in dirs {
            zip.add_directory(*dir, SimpleFileOptions::default()).unwrap();
        }
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    async fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tokio_tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, name, *data).await.unwrap();
        }
        builder.into_inner().await.unwrap()
    }

    async fn gzip(data: Vec<u8>) -> Vec<u8> {
        let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
        encoder.write_all(&data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn reader_for(data: Vec<u8>, name: &str, format: ArchiveFormat) -> (crate::testing::Env, ArchiveReader) {
        let env = env(&[("ds1", false)]).await;
        let size = data.len() as i64;
        Executor
            .put_object(env.bound_ctx("ds1"), ds_node("ds1", name), PutRequest::from_bytes(data))
            .await
            .unwrap();
        let node = ds_node("ds1", name).size(size);
        let reader = ArchiveReader::new(Arc::new(Executor::new()), env.bound_ctx("ds1"), node, format);
        (env, reader)
    }

    #[tokio::test]
    async fn test_zip_listing_synthesises_parents() {
        let data = zip_bytes(&[("inner/a.txt", b"alpha"), ("top.txt", b"")], &["empty/"]);
        let (_env, reader) = reader_for(data, "a.zip", ArchiveFormat::Zip).await;

        let root = reader.list_children("").await.unwrap();
        let paths: Vec<_> = root.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(paths, vec![("inner", true), ("top.txt", false)]);

        let inner = reader.list_children("inner").await.unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].to_node("ds1/a.zip").path, "ds1/a.zip/inner/a.txt");
        assert_eq!(inner[0].to_node("ds1/a.zip").size, 5);

        let empty = reader.stat_child("top.txt").await.unwrap();
        assert_eq!(empty.to_node("ds1/a.zip").size, -1);
        assert!(reader.stat_child("inner").await.unwrap().is_dir);
        assert!(matches!(
            reader.stat_child("missing").await,
            Err(CoreError::ArchiveMemberNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zip_member_body() {
        let data = zip_bytes(&[("inner/a.txt", b"alpha")], &[]);
        let (_env, reader) = reader_for(data, "a.zip", ArchiveFormat::Zip).await;
        let body = read_all(reader.read_child("inner/a.txt").await.unwrap()).await;
        assert_eq!(body, b"alpha");
        assert!(reader.read_child("inner/b.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_tar_member_body_and_stat() {
        let data = tar_bytes(&[("docs/readme.md", b"# hello"), ("docs/deep/x.bin", b"xx")]).await;
        let (_env, reader) = reader_for(data, "b.tar", ArchiveFormat::Tar).await;

        let entry = reader.stat_child("docs/readme.md").await.unwrap();
        assert_eq!(entry.size, 7);
        assert_eq!(entry.mtime, 1_700_000_000);

        let docs = reader.list_children("docs").await.unwrap();
        let names: Vec<_> = docs.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["docs/deep", "docs/readme.md"]);

        let body = read_all(reader.read_child("docs/deep/x.bin").await.unwrap()).await;
        assert_eq!(body, b"xx");
    }

    #[tokio::test]
    async fn test_extract_all_creates_parents() {
        let data = zip_bytes(&[("a/b/c.txt", b"deep"), ("root.txt", b"top")], &[]);
        let (env, reader) = reader_for(data, "pack.zip", ArchiveFormat::Zip).await;
        let target = Node::collection("ds1/out")
            .with_attr(NodeAttr::DataSourceName, "ds1")
            .with_attr(NodeAttr::DataSourcePath, "out");
        let written = reader
            .extract_all(&Executor, env.bound_ctx("ds1"), &target)
            .await
            .unwrap();
        assert_eq!(written, 2);

        let store = env.store("ds1");
        assert!(store.object_bytes("ds1", "out/a/.__pydio").is_some());
        assert!(store.object_bytes("ds1", "out/a/b/.__pydio").is_some());
        assert_eq!(store.object_bytes("ds1", "out/a/b/c.txt").unwrap(), &b"deep"[..]);
        assert_eq!(store.object_bytes("ds1", "out/root.txt").unwrap(), &b"top"[..]);
        assert!(env.tree.get("ds1/out/a/b").unwrap().is_collection());
    }

    #[tokio::test]
    async fn test_zip_entries_keep_their_own_timestamp() {
        let stamp = zip::DateTime::from_date_and_time(2020, 1, 2, 3, 4, 6).unwrap();
        let mut zip = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        zip.start_file("stamped.txt", SimpleFileOptions::default().last_modified_time(stamp))
            .unwrap();
        zip.write_all(b"dated").unwrap();
        let data = zip.finish().unwrap().into_inner();
        let (env, reader) = reader_for(data, "dated.zip", ArchiveFormat::Zip).await;

        assert_eq!(reader.stat_child("stamped.txt").await.unwrap().mtime, 1_577_934_246);
        let listed = reader.list_children("").await.unwrap();
        assert_eq!(listed[0].to_node("ds1/dated.zip").mtime, 1_577_934_246);

        let chain = Chain::new(vec![Arc::new(PutFilter)], Arc::new(Executor)).head();
        let target = Node::collection("ds1/out")
            .with_attr(NodeAttr::DataSourceName, "ds1")
            .with_attr(NodeAttr::DataSourcePath, "out");
        reader.extract_all(&chain, env.bound_ctx("ds1"), &target).await.unwrap();
        assert_eq!(env.tree.get("ds1/out/stamped.txt").unwrap().mtime, 1_577_934_246);
    }

    #[test]
    fn test_zip_epoch_reads_dos_time_as_utc() {
        assert_eq!(zip_epoch(None), None);
        let stamp = zip::DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(zip_epoch(Some(stamp)), Some(315_532_800));
    }

    #[tokio::test]
    async fn test_tar_gz_members_and_nested_extraction() {
        let files: &[(&str, &[u8])] = &[
            ("site/index.html", b"<html></html>"),
            ("site/css/main.css", b"body{}"),
            ("site/img/icons/logo.svg", b"<svg/>"),
        ];
        let data = gzip(tar_bytes(files).await).await;
        let (env, reader) = reader_for(data, "site.tar.gz", ArchiveFormat::TarGz).await;

        let body = read_all(reader.read_child("site/css/main.css").await.unwrap()).await;
        assert_eq!(body, b"body{}");
        assert!(matches!(
            reader.read_child("site/missing.txt").await,
            Err(CoreError::ArchiveMemberNotFound(_))
        ));
        let site = reader.list_children("site").await.unwrap();
        let names: Vec<_> = site.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(
            names,
            vec![("site/css", true), ("site/img", true), ("site/index.html", false)]
        );

        let target = Node::collection("ds1/out")
            .with_attr(NodeAttr::DataSourceName, "ds1")
            .with_attr(NodeAttr::DataSourcePath, "out");
        let written = reader
            .extract_all(&Executor, env.bound_ctx("ds1"), &target)
            .await
            .unwrap();
        assert_eq!(written, 3);

        let store = env.store("ds1");
        for (path, content) in files {
            let stored = store.object_bytes("ds1", &format!("out/{path}")).unwrap();
            assert_eq!(stored.len(), content.len(), "{path}");
            assert_eq!(&stored[..], *content, "{path}");
        }
        for dir in ["site", "site/css", "site/img", "site/img/icons"] {
            assert!(store.object_bytes("ds1", &format!("out/{dir}/.__pydio")).is_some(), "{dir}");
            assert!(env.tree.get(&format!("ds1/out/{dir}")).unwrap().is_collection(), "{dir}");
        }
    }
}
