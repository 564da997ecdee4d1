use super::{join_error, zip_error, ArchiveFormat};
use crate::handler::{GetRequest, Handler};
use async_compression::tokio::write::GzipEncoder;
use chrono::{Datelike, Timelike};
use federa_core::node::{parent_path, strip_prefix_path};
use federa_core::{ListNodesRequest, Node, RequestContext, Result};
use std::io::{self, Seek, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tar::{Builder, EntryType, Header};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Builds an archive out of nodes read through a handler
pub struct ArchiveWriter {
    handler: Arc<dyn Handler>,
    ctx: RequestContext,
}

/// Longest common directory of `paths`
fn common_parent<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut common: Option<Vec<&str>> = None;
    for path in paths {
        let segments: Vec<&str> = parent_path(path).split('/').filter(|s| !s.is_empty()).collect();
        common = Some(match common {
            None => segments,
            Some(prev) => prev
                .into_iter()
                .zip(segments)
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    common.unwrap_or_default().join("/")
}

fn zip_time(mtime: i64) -> Option<zip::DateTime> {
    let t = chrono::DateTime::from_timestamp(mtime, 0)?;
    zip::DateTime::from_date_and_time(
        u16::try_from(t.year()).ok()?,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    )
    .ok()
}

impl ArchiveWriter {
    pub fn new(handler: Arc<dyn Handler>, ctx: RequestContext) -> Self {
        Self { handler, ctx }
    }

    /// Expand collections into their subtrees; returns the root that entry
    /// names are relative to, with every node to archive
    async fn walk(&self, selection: &[Node]) -> Result<(String, Vec<Node>)> {
        let root = match selection {
            [single] if single.is_collection() => single.path.clone(),
            _ => common_parent(selection.iter().map(|n| n.path.as_str())),
        };
        let mut nodes = Vec::new();
        for node in selection {
            if node.is_leaf() {
                nodes.push(node.clone());
                continue;
            }
            nodes.push(node.clone());
            let children = self
                .handler
                .list_nodes(self.ctx.clone(), ListNodesRequest::new(node.clone()).recursive(true))
                .await?
                .collect_nodes()
                .await?;
            nodes.extend(children.into_iter().filter(|n| !n.is_marker()));
        }
        Ok((root, nodes))
    }

    /// Write `selection` to `out` in `format`; returns the number of files archived
    pub async fn write<W>(&self, format: ArchiveFormat, selection: &[Node], out: W) -> Result<usize>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match format {
            ArchiveFormat::Zip => self.write_zip(selection, out).await,
            ArchiveFormat::Tar => self.write_tar(selection, out, false).await,
            ArchiveFormat::TarGz => self.write_tar(selection, out, true).await,
        }
    }

    /// ZIP with one deflated entry per file. The archive is assembled in an
    /// anonymous temporary file, then streamed to `out`.
    #[instrument(skip_all, fields(nodes = selection.len()))]
    pub async fn write_zip<W>(&self, selection: &[Node], mut out: W) -> Result<usize>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (root, nodes) = self.walk(selection).await?;
        let mut zip = ZipWriter::new(tempfile::tempfile()?);
        let mut files = 0;

        for node in nodes.iter().filter(|n| n.is_leaf()) {
            self.ctx.check_cancelled()?;
            let Some(name) = strip_prefix_path(&node.path, &root).filter(|n| !n.is_empty()) else {
                continue;
            };
            let mut options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o777)
                .large_file(node.size >= i64::from(u32::MAX));
            if let Some(time) = zip_time(node.mtime) {
                options = options.last_modified_time(time);
            }

            let body = self
                .handler
                .get_object(self.ctx.clone(), node.clone(), GetRequest::default())
                .await?;
            let mut source = SyncIoBridge::new(body);
            let name = name.to_string();
            zip = tokio::task::spawn_blocking(move || -> io::Result<ZipWriter<std::fs::File>> {
                zip.start_file(name, options).map_err(io::Error::other)?;
                io::copy(&mut source, &mut zip)?;
                Ok(zip)
            })
            .await
            .map_err(join_error)??;
            files += 1;
        }

        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let mut file = zip.finish().map_err(zip_error)?;
            file.seek(SeekFrom::Start(0))?;
            Ok(file)
        })
        .await
        .map_err(join_error)??;
        let mut file = tokio::fs::File::from_std(file);
        let written = tokio::io::copy(&mut file, &mut out).await?;
        out.shutdown().await?;
        debug!(files, bytes = written, "ZIP archive written");
        Ok(files)
    }

    /// TAR, optionally gzip-compressed, streamed straight to `out`
    #[instrument(skip_all, fields(nodes = selection.len(), gzip))]
    pub async fn write_tar<W>(&self, selection: &[Node], out: W, gzip: bool) -> Result<usize>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let files = if gzip {
            let (mut encoder, files) = self.append_tar(selection, GzipEncoder::new(out)).await?;
            encoder.shutdown().await?;
            files
        } else {
            let (mut out, files) = self.append_tar(selection, out).await?;
            out.shutdown().await?;
            files
        };
        debug!(files, "TAR archive written");
        Ok(files)
    }

    async fn append_tar<W>(&self, selection: &[Node], out: W) -> Result<(W, usize)>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (root, nodes) = self.walk(selection).await?;
        let mut builder = Builder::new(out);
        let mut files = 0;

        for node in &nodes {
            self.ctx.check_cancelled()?;
            let Some(name) = strip_prefix_path(&node.path, &root).filter(|n| !n.is_empty()) else {
                continue;
            };
            let mut header = Header::new_gnu();
            header.set_mode(0o777);
            header.set_mtime(node.mtime.max(0) as u64);

            if node.is_collection() {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{}/", name), tokio::io::empty())
                    .await?;
                continue;
            }

            let mut body = self
                .handler
                .get_object(self.ctx.clone(), node.clone(), GetRequest::default())
                .await?;
            header.set_entry_type(EntryType::Regular);
            match u64::try_from(node.size) {
                Ok(size) => {
                    header.set_size(size);
                    builder.append_data(&mut header, name, body.take(size)).await?;
                }
                Err(_) => {
                    // size unknown to the index: buffer to learn it
                    let mut data = Vec::new();
                    body.read_to_end(&mut data).await?;
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, name, data.as_slice()).await?;
                }
            }
            files += 1;
        }
        Ok((builder.into_inner().await?, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_core::CoreError;
    use crate::executor::Executor;
    use crate::handler::PutRequest;
    use crate::testing::{ds_node, env};
    use futures::StreamExt;
    use std::io::{Cursor, Read};

    async fn archive_bytes(writer: ArchiveWriter, format: ArchiveFormat, folder: Node) -> (usize, Vec<u8>) {
        let (out, mut reader) = federa_core::pipe(4);
        let producer = tokio::spawn(async move { writer.write(format, &[folder], out).await.unwrap() });
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        (producer.await.unwrap(), data)
    }

    async fn photos() -> (crate::testing::Env, RequestContext, Node) {
        let env = env(&[("ds1", false)]).await;
        let ctx = env.bound_ctx("ds1");
        for (path, body) in [("photos/a.jpg", "AAAA"), ("photos/trip/b.jpg", "BB")] {
            Executor
                .put_object(ctx.clone(), ds_node("ds1", path), PutRequest::from_bytes(body))
                .await
                .unwrap();
            env.tree
                .upsert_leaf(&format!("ds1/{}", path), None, body.len() as i64, "etag", 1_700_000_000);
        }
        env.tree.upsert_leaf("ds1/photos/.__pydio", None, 36, "etag", 1_700_000_000);
        let folder = env.tree.get("ds1/photos").unwrap();
        (env, ctx, folder)
    }

    #[test]
    fn test_common_parent() {
        assert_eq!(common_parent(["a/b/c.txt", "a/b/d/e.txt"]), "a/b");
        assert_eq!(common_parent(["a/x", "b/y"]), "");
        assert_eq!(common_parent(["a/b/c.txt"]), "a/b");
    }

    #[tokio::test]
    async fn test_zip_of_folder_is_relative_to_it() {
        let (_env, ctx, folder) = photos().await;
        let writer = ArchiveWriter::new(Arc::new(Executor::new()), ctx);
        let (files, out) = archive_bytes(writer, ArchiveFormat::Zip, folder).await;
        assert_eq!(files, 2);

        let mut archive = zip::ZipArchive::new(Cursor::new(out)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["a.jpg", "trip/b.jpg"]);
        let mut body = String::new();
        archive.by_name("trip/b.jpg").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "BB");
    }

    #[tokio::test]
    async fn test_tar_gz_of_folder() {
        let (_env, ctx, folder) = photos().await;
        let writer = ArchiveWriter::new(Arc::new(Executor::new()), ctx);
        let (files, out) = archive_bytes(writer, ArchiveFormat::TarGz, folder).await;
        assert_eq!(files, 2);

        let decoder = async_compression::tokio::bufread::GzipDecoder::new(tokio::io::BufReader::new(out.as_slice()));
        let mut archive = tokio_tar::Archive::new(decoder);
        let mut entries = archive.entries().unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = entries.next().await {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).await.unwrap();
            seen.push((path, body.len()));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a.jpg".to_string(), 4),
                ("trip/".to_string(), 0),
                ("trip/b.jpg".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_writer_stops() {
        let (_env, ctx, folder) = photos().await;
        ctx.cancellation().cancel();
        let writer = ArchiveWriter::new(Arc::new(Executor::new()), ctx);
        let err = writer
            .write(ArchiveFormat::Tar, &[folder], tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
