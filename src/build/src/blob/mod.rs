//! Blob sources for buildpacks and lifecycles.
//!
//! A [`Blob`] is anything that can be read as a tar stream: a directory
//! tree, a (possibly gzipped) tarball, or a single blob inside an OCI
//! image layout. Directory sources are tarred deterministically so a
//! blob's digest is stable across runs.

mod tar;

pub use self::tar::{
    retar_under_prefix, sha256_bytes, sha256_file, write_dir_layer, write_file_layer, DigestReader,
    LayerTar, LAYER_GID, LAYER_MTIME, LAYER_UID,
};

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_core::error::{KilnError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where a blob's bytes come from.
#[derive(Debug, Clone)]
enum Source {
    /// A directory tree, tarred on demand
    Dir(PathBuf),
    /// A tarball on disk, gzipped or plain
    Archive(PathBuf),
    /// One blob inside an OCI image layout
    OciBlob { layout: PathBuf, digest: String },
}

/// A byte source readable as a tar stream.
#[derive(Debug, Clone)]
pub struct Blob {
    source: Source,
}

impl Blob {
    /// Blob over a directory tree.
    pub fn from_dir(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(KilnError::UnreadableSource {
                path: path.display().to_string(),
                message: "not a directory".to_string(),
            });
        }
        Ok(Self {
            source: Source::Dir(path),
        })
    }

    /// Blob over a tarball (`.tgz`, `.tar.gz`, or plain `.tar`).
    pub fn from_archive(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(KilnError::UnreadableSource {
                path: path.display().to_string(),
                message: "not a file".to_string(),
            });
        }
        Ok(Self {
            source: Source::Archive(path),
        })
    }

    /// Blob addressing one layer inside an OCI image layout.
    pub fn from_oci_blob(layout: impl Into<PathBuf>, digest: impl Into<String>) -> Result<Self> {
        let layout = layout.into();
        let digest = digest.into();
        validate_oci_layout(&layout)?;
        let blob_path = oci_blob_path(&layout, &digest);
        if !blob_path.is_file() {
            return Err(KilnError::BadOciLayout(format!(
                "missing blob {} in {}",
                digest,
                layout.display()
            )));
        }
        Ok(Self {
            source: Source::OciBlob { layout, digest },
        })
    }

    /// Open the blob as a tar stream.
    ///
    /// Directory sources are tarred into a temp file first; archive and
    /// OCI-blob sources are decompressed on the fly when gzipped.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::Dir(path) => {
                let tmp = tempfile::NamedTempFile::new().map_err(|e| KilnError::UnreadableSource {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                write_dir_layer(path, Path::new(""), tmp.path())?;
                let file = tmp.reopen().map_err(|e| KilnError::UnreadableSource {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                // `tmp` is dropped here; the open handle keeps the bytes alive
                Ok(Box::new(file))
            }
            Source::Archive(path) => open_maybe_gzip(path),
            Source::OciBlob { layout, digest } => {
                let path = oci_blob_path(layout, digest);
                open_maybe_gzip(&path)
            }
        }
    }

    /// SHA-256 of the raw stored bytes (hex, unprefixed).
    ///
    /// For archives this hashes the compressed file as stored, which is
    /// what cache keys and download dedup want.
    pub fn raw_digest(&self) -> Result<String> {
        match &self.source {
            Source::Dir(path) => {
                // Deterministic tar makes this stable for directories too.
                let mut reader = DigestReader::new(self.open()?);
                std::io::copy(&mut reader, &mut std::io::sink()).map_err(|e| {
                    KilnError::UnreadableSource {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                })?;
                Ok(reader.digest())
            }
            Source::Archive(path) => sha256_file(path),
            Source::OciBlob { layout, digest } => {
                let _ = layout;
                Ok(digest.trim_start_matches("sha256:").to_string())
            }
        }
    }

    /// The on-disk path backing this blob, if it is a plain file or dir.
    pub fn path(&self) -> &Path {
        match &self.source {
            Source::Dir(path) | Source::Archive(path) => path,
            Source::OciBlob { layout, .. } => layout,
        }
    }
}

/// Open a file as a tar stream, stripping gzip if the magic matches.
/// Files that are neither gzip nor tar fail with `NotArchive`.
fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read + Send>> {
    let mut file = std::fs::File::open(path).map_err(|e| KilnError::UnreadableSource {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| KilnError::UnreadableSource {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    use std::io::Seek;
    file.rewind().map_err(|e| KilnError::UnreadableSource {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    if n == 2 && magic == GZIP_MAGIC {
        return Ok(Box::new(GzDecoder::new(file)));
    }

    // Plain tar: check for the ustar magic at offset 257.
    let mut header = [0u8; 262];
    let read = file.read(&mut header).unwrap_or(0);
    file.rewind().map_err(|e| KilnError::UnreadableSource {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if read >= 262 && &header[257..262] == b"ustar" {
        return Ok(Box::new(file));
    }

    Err(KilnError::NotArchive(path.display().to_string()))
}

/// Path of a blob inside an OCI layout.
pub fn oci_blob_path(layout: &Path, digest: &str) -> PathBuf {
    let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
    layout.join("blobs").join(algorithm).join(hex)
}

/// Validate the minimal OCI layout markers.
pub fn validate_oci_layout(root: &Path) -> Result<()> {
    for marker in ["oci-layout", "index.json"] {
        if !root.join(marker).is_file() {
            return Err(KilnError::BadOciLayout(format!(
                "missing {} in {}",
                marker,
                root.display()
            )));
        }
    }
    if !root.join("blobs").is_dir() {
        return Err(KilnError::BadOciLayout(format!(
            "missing blobs directory in {}",
            root.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn read_tar_names(reader: Box<dyn Read + Send>) -> Vec<String> {
        let mut archive = ::tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    fn write_tgz(path: &Path, files: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = ::tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_dir_blob_yields_tar() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("buildpack.toml"), "api = \"0.6\"").unwrap();

        let blob = Blob::from_dir(dir.path()).unwrap();
        let names = read_tar_names(blob.open().unwrap());
        assert_eq!(names, vec!["buildpack.toml"]);
    }

    #[test]
    fn test_dir_blob_missing() {
        let err = Blob::from_dir("/nonexistent/dir").unwrap_err();
        assert!(matches!(err, KilnError::UnreadableSource { .. }));
    }

    #[test]
    fn test_archive_blob_gzip() {
        let dir = TempDir::new().unwrap();
        let tgz = dir.path().join("bp.tgz");
        write_tgz(&tgz, &[("buildpack.toml", "api = \"0.6\"")]);

        let blob = Blob::from_archive(&tgz).unwrap();
        let names = read_tar_names(blob.open().unwrap());
        assert_eq!(names, vec!["buildpack.toml"]);
    }

    #[test]
    fn test_archive_blob_plain_tar() {
        let dir = TempDir::new().unwrap();
        let tar_path = dir.path().join("bp.tar");
        {
            let file = fs::File::create(&tar_path).unwrap();
            let mut builder = ::tar::Builder::new(file);
            let mut header = ::tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "f.txt", b"hi" as &[u8]).unwrap();
            builder.finish().unwrap();
        }

        let blob = Blob::from_archive(&tar_path).unwrap();
        let names = read_tar_names(blob.open().unwrap());
        assert_eq!(names, vec!["f.txt"]);
    }

    #[test]
    fn test_archive_blob_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not.tgz");
        fs::write(&path, "plain text, neither gzip nor tar").unwrap();

        let blob = Blob::from_archive(&path).unwrap();
        let err = match blob.open() {
            Ok(_) => panic!("expected open() to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, KilnError::NotArchive(_)));
    }

    #[test]
    fn test_oci_blob() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("blobs/sha256")).unwrap();
        fs::write(dir.path().join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        fs::write(dir.path().join("index.json"), "{}").unwrap();

        let tgz = dir.path().join("blobs/sha256/abc123");
        write_tgz(&tgz, &[("layer.txt", "content")]);

        let blob = Blob::from_oci_blob(dir.path(), "sha256:abc123").unwrap();
        let names = read_tar_names(blob.open().unwrap());
        assert_eq!(names, vec!["layer.txt"]);
        assert_eq!(blob.raw_digest().unwrap(), "abc123");
    }

    #[test]
    fn test_oci_blob_bad_layout() {
        let dir = TempDir::new().unwrap();
        let err = Blob::from_oci_blob(dir.path(), "sha256:abc").unwrap_err();
        assert!(matches!(err, KilnError::BadOciLayout(_)));
    }

    #[test]
    fn test_oci_blob_missing_blob() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("blobs/sha256")).unwrap();
        fs::write(dir.path().join("oci-layout"), "{}").unwrap();
        fs::write(dir.path().join("index.json"), "{}").unwrap();

        let err = Blob::from_oci_blob(dir.path(), "sha256:missing").unwrap_err();
        assert!(matches!(err, KilnError::BadOciLayout(_)));
    }

    #[test]
    fn test_dir_blob_raw_digest_stable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "aaa").unwrap();

        let blob = Blob::from_dir(dir.path()).unwrap();
        assert_eq!(blob.raw_digest().unwrap(), blob.raw_digest().unwrap());
    }

    #[test]
    fn test_archive_raw_digest_is_file_digest() {
        let dir = TempDir::new().unwrap();
        let tgz = dir.path().join("bp.tgz");
        write_tgz(&tgz, &[("x", "y")]);

        let blob = Blob::from_archive(&tgz).unwrap();
        assert_eq!(blob.raw_digest().unwrap(), sha256_file(&tgz).unwrap());
    }

    #[test]
    fn test_gz_magic_not_misread_on_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&[0x00]).unwrap();
        drop(f);

        let blob = Blob::from_archive(&path).unwrap();
        assert!(blob.open().is_err());
    }
}
