//! Package archives: plain tar and gzip-compressed tar.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, HeaderMode};
use walkdir::WalkDir;

use crate::error::{RegistryError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn archive_err(path: &Path, detail: impl std::fmt::Display) -> RegistryError {
    RegistryError::Archive {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Unpack a plain tar archive into `dest`.
pub fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| archive_err(archive, e))?;
    unpack(Archive::new(BufReader::new(file)), archive, dest)
}

/// Unpack a gzip-compressed tar archive into `dest`.
pub fn extract_tgz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| archive_err(archive, e))?;
    unpack(Archive::new(GzDecoder::new(BufReader::new(file))), archive, dest)
}

/// Unpack either kind of archive, detecting gzip by its magic bytes.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    if is_gzip(archive)? {
        extract_tgz(archive, dest)
    } else {
        extract_tar(archive, dest)
    }
}

fn unpack<R: Read>(mut ar: Archive<R>, archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    ar.set_preserve_permissions(false);
    ar.unpack(dest)
        .map_err(|e| archive_err(archive, format!("extracting into {}: {e}", dest.display())))
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| archive_err(path, e))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(n == 2 && magic == GZIP_MAGIC)
}

/// Whether a downloaded file looks like an archive we know how to unpack.
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tgz") || name.ends_with(".tar.gz")
}

/// Pack `dir` into a tar archive at `out`. `.git` is left out.
///
/// Entries are added in sorted order with normalized headers, so packing
/// the same tree twice yields byte-identical archives.
pub fn pack_tar(dir: &Path, out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| archive_err(out, e))?;
    let mut builder = Builder::new(file);
    append_tree(&mut builder, dir, out)?;
    builder
        .into_inner()
        .map_err(|e| archive_err(out, format!("finishing archive: {e}")))?;
    Ok(())
}

/// Pack `dir` into a gzip-compressed tar archive at `out`.
pub fn pack_tar_gz(dir: &Path, out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| archive_err(out, e))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    append_tree(&mut builder, dir, out)?;
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .map_err(|e| archive_err(out, format!("finishing archive: {e}")))?;
    Ok(())
}

fn append_tree<W: std::io::Write>(builder: &mut Builder<W>, dir: &Path, out: &Path) -> Result<()> {
    builder.mode(HeaderMode::Deterministic);
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| archive_err(dir, e))?;
        let path = entry.path();
        // The archive may be written inside the tree being packed.
        if path == out {
            continue;
        }
        let rel: PathBuf = path.strip_prefix(dir).unwrap_or(path).to_path_buf();
        if entry.file_type().is_dir() {
            builder
                .append_dir(&rel, path)
                .map_err(|e| archive_err(out, format!("adding {}: {e}", rel.display())))?;
        } else if entry.file_type().is_file() {
            builder
                .append_path_with_name(path, &rel)
                .map_err(|e| archive_err(out, format!("adding {}: {e}", rel.display())))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join("kcl.mod"), "[package]\nname = \"x\"\n").unwrap();
        std::fs::write(dir.join("sub/main.k"), "a = 1").unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref: main").unwrap();
    }

    #[test]
    fn tgz_pack_then_extract() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("pkg.tgz");
        pack_tar_gz(src.path(), &archive).unwrap();

        let dest = out.path().join("extracted");
        extract(&archive, &dest).unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("sub/main.k")).unwrap(), "a = 1");
        assert!(dest.join("kcl.mod").is_file());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn plain_tar_detected_without_gzip_magic() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("pkg.tar");
        pack_tar(src.path(), &archive).unwrap();
        assert!(!is_gzip(&archive).unwrap());

        let dest = out.path().join("x");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("sub/main.k").is_file());
    }

    #[test]
    fn packing_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let out = tempfile::tempdir().unwrap();
        let a = out.path().join("a.tar");
        let b = out.path().join("b.tar");
        pack_tar(src.path(), &a).unwrap();
        pack_tar(src.path(), &b).unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[test]
    fn extracting_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tgz");
        std::fs::write(&bogus, [0x1f, 0x8b, 0, 1, 2, 3]).unwrap();
        let err = extract(&bogus, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, RegistryError::Archive { .. }));
    }

    #[test]
    fn archive_names() {
        assert!(is_archive(Path::new("/a/b.tar")));
        assert!(is_archive(Path::new("b.TGZ")));
        assert!(is_archive(Path::new("b.tar.gz")));
        assert!(!is_archive(Path::new("b.json")));
    }
}
