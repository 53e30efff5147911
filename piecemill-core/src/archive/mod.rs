//! Archive generation: file selection, manifests, and the streaming builder.

pub mod builder;
pub mod index;
pub mod manifest;

pub use builder::{
    ARCHIVE_EXTENSION, ArchiveBuilder, ArchiveEntry, BuiltArchive, PieceSizeTarget, TeeWriter,
    WRITE_BUFFER_SIZE, archive_file_name,
};
pub use index::index_directory;
pub use manifest::{ManifestEntry, SourceFile, build_manifest, resolve_manifest, select_files};
