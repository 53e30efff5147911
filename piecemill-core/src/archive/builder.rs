use crate::cid::{payload_cid, piece_cid};
use crate::commp::{Commitment, CommpDigest, CommpWriter, pad_commp, validate_piece_size};
use crate::error::{PieceError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub const ARCHIVE_EXTENSION: &str = "tar";

/// Buffer size for the archive stream; a multiple of the 127-byte Fr32 quad.
pub const WRITE_BUFFER_SIZE: usize = (4 << 20) / 128 * 127;

const STAGING_EXTENSION: &str = "partial";
const ENTRY_MODE: u32 = 0o644;

/// File name of an archive whose piece CID is `piece_cid`.
pub fn archive_file_name(piece_cid: &str) -> String {
    format!("{}.{}", piece_cid, ARCHIVE_EXTENSION)
}

/// One source file streamed into an archive under `relative_path`.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub relative_path: String,
}

/// How the recorded piece size is chosen once the stream is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSizeTarget {
    /// Keep the smallest piece size that bounds the archive.
    Minimal,
    /// Pad up to this size when it exceeds the minimal one.
    AtLeast(u64),
    /// Pad to exactly this size; smaller than minimal is an error.
    Exact(u64),
}

/// An archive written to its staging path, not yet published.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub staging_path: PathBuf,
    pub commitment: Commitment,
    pub piece_cid: String,
    pub piece_size: u64,
    pub minimal_piece_size: u64,
    pub payload_cid: String,
    pub archive_size: u64,
}

/// Fans every write out to two sinks, in order.
pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

struct HashingReader<'a, R> {
    inner: R,
    hasher: &'a mut Sha256,
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

/// Streams source files into a deterministic tar archive while committing
/// to the archive bytes.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    out_dir: PathBuf,
    scratch_dir: Option<PathBuf>,
}

impl ArchiveBuilder {
    pub fn new(out_dir: impl Into<PathBuf>, scratch_dir: Option<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            scratch_dir,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write `entries` to a staging file in the output directory. On any
    /// failure the staging file is removed before the error is returned.
    pub fn build(&self, entries: &[ArchiveEntry], target: PieceSizeTarget) -> Result<BuiltArchive> {
        match target {
            PieceSizeTarget::Minimal => {}
            PieceSizeTarget::AtLeast(size) | PieceSizeTarget::Exact(size) => {
                validate_piece_size(size)?
            }
        }

        fs::create_dir_all(&self.out_dir)?;
        if let Some(scratch_dir) = &self.scratch_dir {
            fs::create_dir_all(scratch_dir)?;
        }

        let staging_path = self
            .out_dir
            .join(format!("{}.{}", Ulid::new(), STAGING_EXTENSION));

        match self.build_at(&staging_path, entries, target) {
            Ok(built) => Ok(built),
            Err(error) => {
                remove_quietly(&staging_path);
                Err(error)
            }
        }
    }

    /// Move a built archive to `<out_dir>/<piece_cid>.tar`.
    pub fn publish(&self, built: &BuiltArchive) -> Result<PathBuf> {
        let final_path = self.out_dir.join(archive_file_name(&built.piece_cid));
        if let Err(error) = fs::rename(&built.staging_path, &final_path) {
            remove_quietly(&built.staging_path);
            return Err(error.into());
        }
        Ok(final_path)
    }

    pub fn discard(&self, built: &BuiltArchive) {
        remove_quietly(&built.staging_path);
    }

    fn build_at(
        &self,
        staging_path: &Path,
        entries: &[ArchiveEntry],
        target: PieceSizeTarget,
    ) -> Result<BuiltArchive> {
        let file = File::create(staging_path)?;
        let tee = TeeWriter::new(file, CommpWriter::new());
        let mut archive = tar::Builder::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, tee));
        let mut payload = Sha256::new();

        for entry in entries {
            self.append_entry(&mut archive, entry, &mut payload)?;
        }

        let buffered = archive.into_inner()?;
        let tee = buffered
            .into_inner()
            .map_err(|error| PieceError::Io(error.into_error()))?;
        let (file, commp) = tee.into_inner();
        file.sync_all()?;
        drop(file);

        let archive_size = commp.bytes_written();
        let digest = commp.finalize()?;
        let (commitment, piece_size) = apply_piece_size(&digest, target)?;
        tracing::debug!(
            "Committed {} bytes: raw={} padded={} piece_size={}",
            archive_size,
            hex::encode(digest.raw),
            hex::encode(commitment),
            piece_size
        );

        Ok(BuiltArchive {
            staging_path: staging_path.to_path_buf(),
            commitment,
            piece_cid: piece_cid(&commitment),
            piece_size,
            minimal_piece_size: digest.piece_size,
            payload_cid: payload_cid(&payload.finalize().into()),
            archive_size,
        })
    }

    fn append_entry<W: Write>(
        &self,
        archive: &mut tar::Builder<W>,
        entry: &ArchiveEntry,
        payload: &mut Sha256,
    ) -> Result<()> {
        let Some(scratch_dir) = &self.scratch_dir else {
            return append_file(archive, &entry.source, &entry.relative_path, payload);
        };

        let file_name = entry
            .source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let staged = scratch_dir.join(format!("{}-{}", Ulid::new(), file_name));

        copy_source(&entry.source, &staged)?;
        let result = append_file(archive, &staged, &entry.relative_path, payload);
        remove_quietly(&staged);
        result
    }
}

fn apply_piece_size(digest: &CommpDigest, target: PieceSizeTarget) -> Result<(Commitment, u64)> {
    match target {
        PieceSizeTarget::Minimal => Ok((digest.raw, digest.piece_size)),
        PieceSizeTarget::AtLeast(size) if size > digest.piece_size => {
            Ok((pad_commp(&digest.raw, digest.piece_size, size)?, size))
        }
        PieceSizeTarget::AtLeast(size) => {
            if size < digest.piece_size {
                tracing::warn!(
                    "Requested piece size {} is below the minimal size {}; keeping the minimal size",
                    size,
                    digest.piece_size
                );
            }
            Ok((digest.raw, digest.piece_size))
        }
        PieceSizeTarget::Exact(size) => Ok((pad_commp(&digest.raw, digest.piece_size, size)?, size)),
    }
}

fn append_file<W: Write>(
    archive: &mut tar::Builder<W>,
    source: &Path,
    relative_path: &str,
    payload: &mut Sha256,
) -> Result<()> {
    let file = open_source(source)?;
    let len = file.metadata()?.len();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(len);
    header.set_mode(ENTRY_MODE);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);

    let reader = HashingReader {
        inner: file.take(len),
        hasher: payload,
    };
    archive.append_data(&mut header, relative_path, reader)?;

    tracing::debug!("Archived {} ({} bytes)", relative_path, len);
    Ok(())
}

fn open_source(source: &Path) -> Result<File> {
    File::open(source).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => PieceError::MissingSourceFile(source.to_path_buf()),
        _ => PieceError::Io(error),
    })
}

fn copy_source(source: &Path, staged: &Path) -> Result<()> {
    match fs::copy(source, staged) {
        Ok(_) => Ok(()),
        Err(error) => {
            remove_quietly(staged);
            match error.kind() {
                io::ErrorKind::NotFound if !source.exists() => {
                    Err(PieceError::MissingSourceFile(source.to_path_buf()))
                }
                _ => Err(PieceError::Io(error)),
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_source(dir: &Path, name: &str, len: usize, seed: u8) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect();
        fs::write(&path, data).unwrap();
        path
    }

    fn entries(paths: &[(&PathBuf, &str)]) -> Vec<ArchiveEntry> {
        paths
            .iter()
            .map(|(source, relative)| ArchiveEntry {
                source: (*source).clone(),
                relative_path: relative.to_string(),
            })
            .collect()
    }

    fn staging_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.path().extension().and_then(|ext| ext.to_str()) == Some(STAGING_EXTENSION)
            })
            .count()
    }

    #[test]
    fn test_tee_writer_duplicates_bytes() {
        let mut tee = TeeWriter::new(Vec::new(), Vec::new());
        tee.write_all(b"hello ").unwrap();
        tee.write_all(b"world").unwrap();
        let (left, right) = tee.into_inner();
        assert_eq!(left, b"hello world");
        assert_eq!(left, right);
    }

    #[test]
    fn test_build_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        let a = write_source(src.path(), "a", 3_000, 3);
        let b = write_source(src.path(), "b", 500, 7);
        let entries = entries(&[(&a, "a"), (&b, "b"), (&a, "a")]);

        let out_one = tempfile::tempdir().unwrap();
        let out_two = tempfile::tempdir().unwrap();
        let first = ArchiveBuilder::new(out_one.path(), None)
            .build(&entries, PieceSizeTarget::Minimal)
            .unwrap();
        let second = ArchiveBuilder::new(out_two.path(), None)
            .build(&entries, PieceSizeTarget::Minimal)
            .unwrap();

        assert_eq!(first.piece_cid, second.piece_cid);
        assert_eq!(first.payload_cid, second.payload_cid);
        assert_eq!(
            fs::read(&first.staging_path).unwrap(),
            fs::read(&second.staging_path).unwrap()
        );
        assert_eq!(
            first.archive_size,
            fs::metadata(&first.staging_path).unwrap().len()
        );
        assert!(first.piece_size >= first.archive_size);
    }

    #[test]
    fn test_scratch_dir_does_not_change_archive() {
        let src = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let a = write_source(src.path(), "a", 2_000, 5);
        let entries = entries(&[(&a, "dir/a")]);

        let out = tempfile::tempdir().unwrap();
        let direct = ArchiveBuilder::new(out.path(), None)
            .build(&entries, PieceSizeTarget::Minimal)
            .unwrap();
        let staged = ArchiveBuilder::new(out.path(), Some(scratch.path().to_path_buf()))
            .build(&entries, PieceSizeTarget::Minimal)
            .unwrap();

        assert_eq!(direct.piece_cid, staged.piece_cid);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_piece_size_targets() {
        let src = tempfile::tempdir().unwrap();
        let a = write_source(src.path(), "a", 1_000, 9);
        let entries = entries(&[(&a, "a")]);
        let out = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(out.path(), None);

        let minimal = builder.build(&entries, PieceSizeTarget::Minimal).unwrap();
        let padded = builder
            .build(&entries, PieceSizeTarget::AtLeast(minimal.piece_size * 4))
            .unwrap();
        assert_eq!(padded.piece_size, minimal.piece_size * 4);
        assert_eq!(padded.minimal_piece_size, minimal.piece_size);
        assert_ne!(padded.piece_cid, minimal.piece_cid);

        let kept = builder.build(&entries, PieceSizeTarget::AtLeast(128)).unwrap();
        assert_eq!(kept.piece_size, minimal.piece_size);
        assert_eq!(kept.piece_cid, minimal.piece_cid);

        let exact = builder
            .build(&entries, PieceSizeTarget::Exact(minimal.piece_size * 4))
            .unwrap();
        assert_eq!(exact.piece_cid, padded.piece_cid);
    }

    #[test]
    fn test_failed_build_leaves_no_partial_file() {
        let src = tempfile::tempdir().unwrap();
        let a = write_source(src.path(), "a", 1_000, 9);
        let missing = src.path().join("missing");
        let out = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(out.path(), None);

        let result = builder.build(
            &entries(&[(&a, "a"), (&missing, "missing")]),
            PieceSizeTarget::Minimal,
        );
        assert!(matches!(result, Err(PieceError::MissingSourceFile(_))));
        assert_eq!(staging_files(out.path()), 0);

        let result = builder.build(&entries(&[(&a, "a")]), PieceSizeTarget::Exact(128));
        assert!(matches!(result, Err(PieceError::InvalidPieceSize(_))));
        assert_eq!(staging_files(out.path()), 0);

        let result = builder.build(&entries(&[(&a, "a")]), PieceSizeTarget::AtLeast(1000));
        assert!(matches!(result, Err(PieceError::InvalidPieceSize(_))));
    }

    #[test]
    fn test_publish_renames_to_piece_cid() {
        let src = tempfile::tempdir().unwrap();
        let a = write_source(src.path(), "a", 1_000, 9);
        let out = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(out.path(), None);

        let built = builder
            .build(&entries(&[(&a, "a")]), PieceSizeTarget::Minimal)
            .unwrap();
        let path = builder.publish(&built).unwrap();

        assert_eq!(path, out.path().join(format!("{}.tar", built.piece_cid)));
        assert!(path.exists());
        assert!(!built.staging_path.exists());
    }
}
