//! Archives as folders and folders as archives
//!
//! `a.zip/inner/x.txt` reads a member of a stored archive; `photos.zip` reads
//! the `photos` collection packed on the fly when no such object exists.

use crate::archive::{ArchiveFormat, ArchivePath, ArchiveReader, ArchiveWriter, PIPE_CAPACITY};
use crate::executor::apply_range;
use crate::filter::{Filter, Next};
use crate::handler::{GetRequest, Handler};
use async_trait::async_trait;
use federa_core::node::join_path;
use federa_core::{
    pipe, BranchKey, CoreError, ListNodesRequest, Node, NodeAttr, NodeStream, RequestContext, Result,
};
use federa_objects::ObjectReader;
use std::io;
use tracing::{debug, instrument, warn};

enum Target {
    /// Path inside a stored archive
    Member {
        archive: Node,
        format: ArchiveFormat,
        inner: String,
    },
    /// Archive to synthesise from an existing collection
    Folder { folder: Node, format: ArchiveFormat },
    Plain,
}

/// Node at `path`, a prefix of `node.path`, with its data-source path cut
/// by the same suffix
fn rebase(node: &Node, path: &str, collection: bool) -> Node {
    let suffix = &node.path[path.len()..];
    let mut out = if collection {
        Node::collection(path)
    } else {
        Node::leaf(path)
    };
    if let Some(ds) = node.attr(NodeAttr::DataSourceName) {
        out.set_attr(NodeAttr::DataSourceName, ds);
    }
    if let Some(ds_path) = node.attr(NodeAttr::DataSourcePath) {
        let cut = ds_path.strip_suffix(suffix).unwrap_or(ds_path);
        out.set_attr(NodeAttr::DataSourcePath, cut.trim_end_matches('/'));
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveFilter;

impl ArchiveFilter {
    pub fn new() -> Self {
        Self
    }

    /// `listing` also treats the archive itself as a member (its root)
    async fn classify(&self, ctx: &RequestContext, node: &Node, next: &Next, listing: bool) -> Result<Target> {
        let resolved = ctx.branch(BranchKey::In).is_some_and(|b| b.is_resolved() && !b.binary);
        if !resolved {
            return Ok(Target::Plain);
        }
        let Some(parsed) = ArchivePath::parse(&node.path) else {
            return Ok(Target::Plain);
        };
        if !node.path.starts_with(&parsed.archive) {
            return Ok(Target::Plain);
        }

        let archive = rebase(node, &parsed.archive, false);
        match next.read_node(ctx.clone(), archive).await {
            Ok(found) if found.is_leaf() => {
                if parsed.inner.is_empty() && !listing {
                    return Ok(Target::Plain);
                }
                Ok(Target::Member {
                    archive: found,
                    format: parsed.format,
                    inner: parsed.inner,
                })
            }
            Ok(_) => Ok(Target::Plain),
            Err(err) if err.is_not_found() => {
                if !parsed.inner.is_empty() {
                    return Ok(Target::Plain);
                }
                let folder = rebase(node, parsed.folder(), true);
                match next.read_node(ctx.clone(), folder).await {
                    Ok(found) if found.is_collection() => Ok(Target::Folder {
                        folder: found,
                        format: parsed.format,
                    }),
                    Ok(_) => Ok(Target::Plain),
                    Err(err) if err.is_not_found() => Ok(Target::Plain),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Filter for ArchiveFilter {
    fn name(&self) -> &'static str {
        "archive"
    }

    #[instrument(skip_all, fields(path = %node.path))]
    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        match self.classify(&ctx, &node, &next, false).await? {
            Target::Member { archive, format, inner } => {
                let reader = ArchiveReader::new(next.into_handler(), ctx, archive, format);
                let entry = reader.stat_child(&inner).await?;
                let mut out = entry.to_node("");
                out.path = node.path;
                Ok(out)
            }
            Target::Folder { folder, format } => {
                let name = node.base_name().to_string();
                Ok(Node::leaf(node.path)
                    .size(-1)
                    .mtime(folder.mtime)
                    .with_attr(NodeAttr::Name, name)
                    .with_attr(NodeAttr::ContentType, format.content_type()))
            }
            Target::Plain => next.read_node(ctx, node).await,
        }
    }

    #[instrument(skip_all, fields(path = %req.node.path))]
    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        if req.versions {
            return next.list_nodes(ctx, req).await;
        }
        match self.classify(&ctx, &req.node, &next, true).await? {
            Target::Member { archive, format, inner } => {
                let archive_path = archive.path.clone();
                let reader = ArchiveReader::new(next.into_handler(), ctx, archive, format);
                let children = reader.list_children(&inner).await?;
                debug!(count = children.len(), "Listed archive members");
                Ok(NodeStream::from_nodes(
                    children.iter().map(|e| e.to_node(&archive_path)).collect(),
                ))
            }
            _ => next.list_nodes(ctx, req).await,
        }
    }

    #[instrument(skip_all, fields(path = %node.path))]
    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        if req.version_id.is_some() {
            return next.get_object(ctx, node, req).await;
        }
        match self.classify(&ctx, &node, &next, false).await? {
            Target::Member { archive, format, inner } => {
                let bucket = ctx
                    .ds(BranchKey::In)
                    .map(|ds| ds.bucket.clone())
                    .or_else(|| archive.attr(NodeAttr::DataSourceName).map(str::to_string))
                    .unwrap_or_default();
                let base = archive.attr(NodeAttr::DataSourcePath).unwrap_or(archive.path.as_str());
                let key = join_path(base, &inner);
                let reader = ArchiveReader::new(next.into_handler(), ctx, archive, format);
                let body = reader.read_child(&inner).await?;
                apply_range(body, req.offset, req.length, &bucket, &key).await
            }
            Target::Folder { folder, format } => {
                let (writer, reader) = pipe(PIPE_CAPACITY);
                let failer = writer.failer();
                let cancel = ctx.cancellation().clone();
                let path = folder.path.clone();
                let archive = ArchiveWriter::new(next.into_handler(), ctx);
                tokio::spawn(async move {
                    let selection = [folder];
                    let result = tokio::select! {
                        r = archive.write(format, &selection, writer) => r,
                        _ = cancel.cancelled() => Err(CoreError::Cancelled),
                    };
                    match result {
                        Ok(files) => debug!(path = %path, files, "Folder archive streamed"),
                        Err(err) => {
                            warn!(path = %path, error = %err, "Folder archive failed");
                            failer.fail(io::Error::other(err)).await;
                        }
                    }
                });
                Ok(Box::pin(reader))
            }
            Target::Plain => next.get_object(ctx, node, req).await,
        }
    }
}
