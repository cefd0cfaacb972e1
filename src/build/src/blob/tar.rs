//! Deterministic tar writing for image layers.
//!
//! Layer tars must hash identically across machines and runs: every entry
//! gets a fixed owner and modification time, paths are sorted, and each
//! directory entry precedes its contents. Layer digests double as DiffIDs
//! because layer tars are written uncompressed.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};
use sha2::{Digest, Sha256};

/// Owner applied to every entry.
pub const LAYER_UID: u64 = 0;
pub const LAYER_GID: u64 = 0;

/// Modification time applied to every entry: 1980-01-01T00:00:01Z.
/// Old enough to be obviously synthetic, new enough for zip-era tooling.
pub const LAYER_MTIME: u64 = 315_532_801;

/// A finished layer tar on disk.
#[derive(Debug, Clone)]
pub struct LayerTar {
    /// Path to the uncompressed tar file
    pub path: PathBuf,
    /// `sha256:`-prefixed digest of the tar bytes (also the DiffID)
    pub diff_id: String,
    /// Size in bytes
    pub size: u64,
}

/// Write a deterministic tar of `src_dir`, rooted at `dest_prefix` inside
/// the archive, to `out_path`.
///
/// Parent directories of `dest_prefix` are emitted first, then entries in
/// sorted path order with directories preceding their contents.
pub fn write_dir_layer(src_dir: &Path, dest_prefix: &Path, out_path: &Path) -> Result<LayerTar> {
    let file = std::fs::File::create(out_path).map_err(|e| {
        KilnError::Runtime(format!(
            "failed to create layer file {}: {}",
            out_path.display(),
            e
        ))
    })?;
    let mut builder = tar::Builder::new(file);

    append_prefix_dirs(&mut builder, dest_prefix)?;
    append_dir_sorted(&mut builder, src_dir, dest_prefix)?;

    builder
        .into_inner()
        .map_err(|e| KilnError::Runtime(format!("failed to finalize layer: {}", e)))?;

    finish_layer(out_path)
}

/// Write a deterministic single-file layer containing `content` at
/// `dest_path` inside the archive.
pub fn write_file_layer(content: &[u8], dest_path: &Path, out_path: &Path) -> Result<LayerTar> {
    let file = std::fs::File::create(out_path).map_err(|e| {
        KilnError::Runtime(format!(
            "failed to create layer file {}: {}",
            out_path.display(),
            e
        ))
    })?;
    let mut builder = tar::Builder::new(file);

    if let Some(parent) = dest_path.parent() {
        append_prefix_dirs(&mut builder, parent)?;
    }

    let mut header = file_header(content.len() as u64, 0o644);
    builder
        .append_data(&mut header, dest_path, content)
        .map_err(|e| KilnError::Runtime(format!("failed to append file to layer: {}", e)))?;

    builder
        .into_inner()
        .map_err(|e| KilnError::Runtime(format!("failed to finalize layer: {}", e)))?;

    finish_layer(out_path)
}

/// Compute size and digest of a written layer tar.
fn finish_layer(path: &Path) -> Result<LayerTar> {
    let size = std::fs::metadata(path)
        .map_err(|e| KilnError::Runtime(format!("failed to stat layer {}: {}", path.display(), e)))?
        .len();
    let diff_id = sha256_file(path)?;
    Ok(LayerTar {
        path: path.to_path_buf(),
        diff_id: format!("sha256:{}", diff_id),
        size,
    })
}

/// Emit directory entries for every component of `prefix`, outermost first.
fn append_prefix_dirs<W: Write>(builder: &mut tar::Builder<W>, prefix: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in prefix.components() {
        current.push(component);
        let mut header = dir_header();
        // tar directory names carry a trailing slash
        let name = format!("{}/", current.display());
        builder
            .append_data(&mut header, &name, std::io::empty())
            .map_err(|e| KilnError::Runtime(format!("failed to append directory: {}", e)))?;
    }
    Ok(())
}

/// Recursively append `dir` under `prefix`, entries sorted by name,
/// directories before their contents.
fn append_dir_sorted<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| KilnError::UnreadableSource {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?
        .collect::<std::io::Result<_>>()
        .map_err(|e| KilnError::UnreadableSource {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let tar_path = prefix.join(entry.file_name());
        let metadata = entry.metadata().map_err(|e| KilnError::UnreadableSource {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if metadata.is_dir() {
            let mut header = dir_header();
            let name = format!("{}/", tar_path.display());
            builder
                .append_data(&mut header, &name, std::io::empty())
                .map_err(|e| KilnError::Runtime(format!("failed to append directory: {}", e)))?;
            append_dir_sorted(builder, &path, &tar_path)?;
        } else {
            let mode = entry_mode(&metadata);
            let mut header = file_header(metadata.len(), mode);
            let file = std::fs::File::open(&path).map_err(|e| KilnError::UnreadableSource {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            builder
                .append_data(&mut header, &tar_path, file)
                .map_err(|e| KilnError::Runtime(format!("failed to append file to layer: {}", e)))?;
        }
    }

    Ok(())
}

/// Preserve only the executable bit; everything else is normalized.
fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 != 0 {
            return 0o755;
        }
    }
    let _ = metadata;
    0o644
}

fn dir_header() -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_uid(LAYER_UID);
    header.set_gid(LAYER_GID);
    header.set_mtime(LAYER_MTIME);
    header
}

fn file_header(size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(LAYER_UID);
    header.set_gid(LAYER_GID);
    header.set_mtime(LAYER_MTIME);
    header
}

/// Re-root a tar stream: every entry of `input` under `strip_prefix` is
/// rewritten under `dest_prefix` with normalized ownership and mtime,
/// preserving entry type, mode bits (via the executable-bit rule), and
/// content. Entries outside `strip_prefix` are dropped.
pub fn retar_under_prefix<R: Read>(
    input: R,
    strip_prefix: Option<&Path>,
    dest_prefix: &Path,
    out_path: &Path,
) -> Result<LayerTar> {
    let file = std::fs::File::create(out_path).map_err(|e| {
        KilnError::Runtime(format!(
            "failed to create layer file {}: {}",
            out_path.display(),
            e
        ))
    })?;
    let mut builder = tar::Builder::new(file);
    append_prefix_dirs(&mut builder, dest_prefix)?;

    let mut archive = tar::Archive::new(input);
    for entry in archive
        .entries()
        .map_err(|e| KilnError::NotArchive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| KilnError::NotArchive(e.to_string()))?;
        let raw = entry
            .path()
            .map_err(|e| KilnError::NotArchive(e.to_string()))?
            .into_owned();
        let rel = match strip_prefix {
            Some(prefix) => match raw.strip_prefix(prefix) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            },
            None => raw,
        };
        if rel.as_os_str().is_empty() || rel == Path::new(".") {
            continue;
        }
        let tar_path = dest_prefix.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                let mut header = dir_header();
                let name = format!("{}/", tar_path.display());
                builder
                    .append_data(&mut header, &name, std::io::empty())
                    .map_err(|e| KilnError::Runtime(format!("failed to append directory: {}", e)))?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| KilnError::NotArchive(e.to_string()))?
                    .ok_or_else(|| KilnError::NotArchive("link entry without target".to_string()))?;
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(entry.header().entry_type());
                header.set_size(0);
                header.set_mode(0o777);
                header.set_uid(LAYER_UID);
                header.set_gid(LAYER_GID);
                header.set_mtime(LAYER_MTIME);
                builder
                    .append_link(&mut header, &tar_path, &target)
                    .map_err(|e| KilnError::Runtime(format!("failed to append link: {}", e)))?;
            }
            _ => {
                let mode = entry.header().mode().unwrap_or(0o644);
                let normalized = if mode & 0o111 != 0 { 0o755 } else { 0o644 };
                let size = entry.header().size().unwrap_or(0);
                let mut header = file_header(size, normalized);
                let mut content = Vec::with_capacity(size as usize);
                entry
                    .read_to_end(&mut content)
                    .map_err(|e| KilnError::NotArchive(e.to_string()))?;
                builder
                    .append_data(&mut header, &tar_path, content.as_slice())
                    .map_err(|e| KilnError::Runtime(format!("failed to append file: {}", e)))?;
            }
        }
    }

    builder
        .into_inner()
        .map_err(|e| KilnError::Runtime(format!("failed to finalize layer: {}", e)))?;

    finish_layer(out_path)
}

/// A reader wrapper that computes the SHA-256 of everything read through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Finish and return the hex digest of the bytes read so far.
    pub fn digest(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Compute the SHA-256 digest of a file (hex, unprefixed).
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        KilnError::Runtime(format!(
            "failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| KilnError::Runtime(format!("failed to hash {}: {}", path.display(), e)))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 digest of raw bytes (hex, unprefixed).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn list_entries(path: &Path) -> Vec<(String, u64, u64, u64)> {
        let file = fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    e.header().uid().unwrap(),
                    e.header().gid().unwrap(),
                    e.header().mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_write_dir_layer_deterministic() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("b.txt"), "bee").unwrap();
        fs::write(src.path().join("a.txt"), "ay").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/c.txt"), "sea").unwrap();

        let out = TempDir::new().unwrap();
        let first = write_dir_layer(src.path(), Path::new("cnb/buildpacks"), &out.path().join("1.tar"))
            .unwrap();
        let second =
            write_dir_layer(src.path(), Path::new("cnb/buildpacks"), &out.path().join("2.tar"))
                .unwrap();

        assert_eq!(first.diff_id, second.diff_id);
        assert!(first.diff_id.starts_with("sha256:"));
    }

    #[test]
    fn test_write_dir_layer_fixed_ownership_and_mtime() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("file.txt"), "data").unwrap();

        let out = TempDir::new().unwrap();
        let layer =
            write_dir_layer(src.path(), Path::new("root"), &out.path().join("layer.tar")).unwrap();

        for (_, uid, gid, mtime) in list_entries(&layer.path) {
            assert_eq!(uid, LAYER_UID);
            assert_eq!(gid, LAYER_GID);
            assert_eq!(mtime, LAYER_MTIME);
        }
    }

    #[test]
    fn test_write_dir_layer_sorted_dirs_first() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("z.txt"), "z").unwrap();
        fs::create_dir(src.path().join("alpha")).unwrap();
        fs::write(src.path().join("alpha/inner.txt"), "i").unwrap();

        let out = TempDir::new().unwrap();
        let layer =
            write_dir_layer(src.path(), Path::new("p"), &out.path().join("layer.tar")).unwrap();

        let names: Vec<String> = list_entries(&layer.path).into_iter().map(|e| e.0).collect();
        assert_eq!(names, vec!["p/", "p/alpha/", "p/alpha/inner.txt", "p/z.txt"]);
    }

    #[test]
    fn test_write_file_layer() {
        let out = TempDir::new().unwrap();
        let layer = write_file_layer(
            b"[stack]\nid = \"test.stack\"\n",
            Path::new("cnb/stack.toml"),
            &out.path().join("stack.tar"),
        )
        .unwrap();

        let names: Vec<String> = list_entries(&layer.path).into_iter().map(|e| e.0).collect();
        assert_eq!(names, vec!["cnb/", "cnb/stack.toml"]);
        assert!(layer.size > 0);
    }

    #[test]
    fn test_retar_under_prefix() {
        // Build a plain source tar with a nested file.
        let tmp = TempDir::new().unwrap();
        let src_tar = tmp.path().join("src.tar");
        {
            let file = fs::File::create(&src_tar).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "bin/detect", b"#!sh\n" as &[u8])
                .unwrap();
            builder.finish().unwrap();
        }

        let out = tmp.path().join("out.tar");
        let layer = retar_under_prefix(
            fs::File::open(&src_tar).unwrap(),
            None,
            Path::new("cnb/buildpacks/simple_layers/0.0.1"),
            &out,
        )
        .unwrap();

        let entries = list_entries(&layer.path);
        let names: Vec<&str> = entries.iter().map(|e| e.0.as_str()).collect();
        assert!(names.contains(&"cnb/buildpacks/simple_layers/0.0.1/bin/detect"));
        // normalized metadata on rewritten entries
        for (_, uid, _, mtime) in &entries {
            assert_eq!(*uid, LAYER_UID);
            assert_eq!(*mtime, LAYER_MTIME);
        }
    }

    #[test]
    fn test_retar_strips_source_prefix() {
        let tmp = TempDir::new().unwrap();
        let src_tar = tmp.path().join("src.tar");
        {
            let file = fs::File::create(&src_tar).unwrap();
            let mut builder = tar::Builder::new(file);
            for (name, content) in [
                ("nested/bp/buildpack.toml", "api = \"0.6\""),
                ("unrelated/file.txt", "skip me"),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, name, content.as_bytes())
                    .unwrap();
            }
            builder.finish().unwrap();
        }

        let layer = retar_under_prefix(
            fs::File::open(&src_tar).unwrap(),
            Some(Path::new("nested/bp")),
            Path::new("cnb/buildpacks/bp/1.0.0"),
            &tmp.path().join("out.tar"),
        )
        .unwrap();

        let names: Vec<String> = list_entries(&layer.path).into_iter().map(|e| e.0).collect();
        assert!(names.contains(&"cnb/buildpacks/bp/1.0.0/buildpack.toml".to_string()));
        assert!(!names.iter().any(|n| n.contains("unrelated")));
    }

    #[test]
    fn test_digest_reader_matches_sha256_bytes() {
        let data = b"the quick brown fox";
        let mut reader = DigestReader::new(&data[..]);
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(reader.digest(), sha256_bytes(data));
        assert_eq!(sink, data);
    }

    #[test]
    fn test_sha256_file_known_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, "hello").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
