//! Archive synthesis and traversal over the gateway's own handler surface
//!
//! The writer walks a subtree through a [`Handler`](crate::Handler) and emits
//! ZIP, TAR or TAR+GZIP. The reader opens a stored archive through the same
//! surface and presents its entries as nodes.

mod reader;
mod writer;

pub use reader::{ArchiveEntry, ArchiveReader};
pub use writer::ArchiveWriter;

use federa_core::node::trim_path;
use federa_core::CoreError;
use std::io;

/// In-flight chunks between an archive producer and its consumer
pub(crate) const PIPE_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Longest suffix first, so `.tar.gz` wins over `.tar`
    const ALL: [ArchiveFormat; 3] = [ArchiveFormat::TarGz, ArchiveFormat::Zip, ArchiveFormat::Tar];

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => ".zip",
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Tar => "application/x-tar",
            Self::TarGz => "application/gzip",
        }
    }

    /// Format named by the last segment of `path`
    pub fn from_path(path: &str) -> Option<Self> {
        let name = federa_core::node::base_name(path);
        Self::ALL
            .into_iter()
            .find(|f| name.len() > f.extension().len() && name.ends_with(f.extension()))
    }
}

/// A path crossing an archive boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivePath {
    /// Path of the archive itself
    pub archive: String,
    pub format: ArchiveFormat,
    /// Path inside the archive; empty when the archive itself is addressed
    pub inner: String,
}

impl ArchivePath {
    /// Split at the first segment carrying an archive extension
    pub fn parse(path: &str) -> Option<Self> {
        let path = trim_path(path);
        let mut end = 0;
        for segment in path.split('/') {
            end += segment.len();
            if let Some(format) = ArchiveFormat::from_path(segment) {
                let inner = path[end..].trim_start_matches('/');
                return Some(Self {
                    archive: path[..end].to_string(),
                    format,
                    inner: inner.to_string(),
                });
            }
            end += 1;
        }
        None
    }

    /// Path of the collection an archive of that name would be built from
    pub fn folder(&self) -> &str {
        &self.archive[..self.archive.len() - self.format.extension().len()]
    }
}

fn join_error(err: tokio::task::JoinError) -> CoreError {
    CoreError::Internal(format!("archive task failed: {}", err))
}

fn zip_error(err: zip::result::ZipError) -> CoreError {
    CoreError::Io(io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_archive_paths() {
        let p = ArchivePath::parse("ds1/home/a.zip/inner/a.txt").unwrap();
        assert_eq!(p.archive, "ds1/home/a.zip");
        assert_eq!(p.format, ArchiveFormat::Zip);
        assert_eq!(p.inner, "inner/a.txt");

        let p = ArchivePath::parse("/photos.tar.gz").unwrap();
        assert_eq!(p.archive, "photos.tar.gz");
        assert_eq!(p.format, ArchiveFormat::TarGz);
        assert_eq!(p.inner, "");
        assert_eq!(p.folder(), "photos");

        let p = ArchivePath::parse("x/b.tar/c.zip/d").unwrap();
        assert_eq!(p.archive, "x/b.tar");
        assert_eq!(p.inner, "c.zip/d");

        assert!(ArchivePath::parse("ds1/notes.txt").is_none());
        assert!(ArchivePath::parse("ds1/.zip/x").is_none());
        assert!(ArchivePath::parse("ds1/zipper/x").is_none());
    }
}
