//! Tar packing and unpacking for sandbox file transfers.
//!
//! Uploads wrap a host file or directory in an archive whose top-level entry
//! is the source's base name. Downloads unpack an archive fetched from the
//! container using these rules, in order:
//!
//! 1. One entry, and `host_path` is not an existing directory: the entry is
//!    written to exactly `host_path`, taking its name. This also covers an
//!    empty directory, which becomes a directory at `host_path`.
//! 2. Otherwise every entry is unpacked into `host_path` when it is an
//!    existing directory, else into its parent (or `.` without one).

use std::io;
use std::path::{Path, PathBuf};

/// Where a downloaded archive ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The single entry was written to `target` under the caller's name.
    Renamed {
        /// Final path of the entry
        target: PathBuf,
    },
    /// All entries were unpacked below `dir`.
    Extracted {
        /// Directory the entries were unpacked into
        dir: PathBuf,
        /// Number of archive entries
        entries: usize,
    },
}

/// Name of the top-level archive entry for `path`.
fn entry_name(path: &Path) -> io::Result<PathBuf> {
    if let Some(name) = path.file_name() {
        return Ok(PathBuf::from(name));
    }
    // `.` or `dir/..` have no file name until resolved.
    path.canonicalize()?
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot derive an archive name from {}", path.display()),
            )
        })
}

/// Pack a host file or directory into an in-memory tar archive.
///
/// Symlinks are stored as links, not followed.
pub fn pack(path: &Path) -> io::Result<Vec<u8>> {
    let name = entry_name(path)?;
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if path.is_dir() {
        builder.append_dir_all(&name, path)?;
    } else {
        builder.append_path_with_name(path, &name)?;
    }

    builder.into_inner()
}

/// Total size in bytes of the regular files under `path`.
pub fn content_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Number of entries in a tar archive.
pub fn entry_count(archive: &[u8]) -> io::Result<usize> {
    let mut archive = tar::Archive::new(archive);
    let mut count = 0;
    for entry in archive.entries()? {
        entry?;
        count += 1;
    }
    Ok(count)
}

/// Unpack `archive` onto the host according to the download rules.
pub fn unpack(archive: &[u8], host_path: &Path) -> io::Result<Extraction> {
    let entries = entry_count(archive)?;

    if entries == 1 && !host_path.is_dir() {
        let mut reader = tar::Archive::new(archive);
        let mut entry = reader.entries()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "archive entry vanished")
        })??;
        entry.unpack(host_path)?;
        return Ok(Extraction::Renamed {
            target: host_path.to_path_buf(),
        });
    }

    let dir = if host_path.is_dir() {
        host_path.to_path_buf()
    } else {
        match host_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    };

    tar::Archive::new(archive).unpack(&dir)?;
    Ok(Extraction::Extracted { dir, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(archive: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(archive);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_pack_file_uses_base_name() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("notes.txt");
        fs::write(&file, "hello").unwrap();

        let archive = pack(&file).unwrap();
        assert_eq!(names(&archive), vec!["notes.txt"]);
        assert_eq!(content_size(&file), 5);
    }

    #[test]
    fn test_pack_dir_nests_under_base_name() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("project");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("README"), "r").unwrap();
        fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();

        let archive = pack(&dir).unwrap();
        assert_eq!(
            names(&archive),
            vec!["project", "project/README", "project/src", "project/src/main.rs"]
        );
        assert_eq!(entry_count(&archive).unwrap(), 4);
        assert_eq!(content_size(&dir), 13);
    }

    #[test]
    fn test_single_file_lands_at_host_path() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("remote.txt");
        fs::write(&src, "payload").unwrap();
        let archive = pack(&src).unwrap();

        let target = tmp.path().join("out/local.txt");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        let result = unpack(&archive, &target).unwrap();

        assert_eq!(result, Extraction::Renamed { target: target.clone() });
        assert!(target.is_file());
        assert_eq!(fs::read_to_string(&target).unwrap(), "payload");
        assert!(!tmp.path().join("out/remote.txt").exists());
    }

    #[test]
    fn test_single_file_into_existing_dir_keeps_name() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("remote.txt");
        fs::write(&src, "payload").unwrap();
        let archive = pack(&src).unwrap();

        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let result = unpack(&archive, &dest).unwrap();

        assert!(matches!(result, Extraction::Extracted { entries: 1, .. }));
        assert_eq!(fs::read_to_string(dest.join("remote.txt")).unwrap(), "payload");
    }

    #[test]
    fn test_single_file_overwrites_existing_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("remote.txt");
        fs::write(&src, "new").unwrap();
        let archive = pack(&src).unwrap();

        let target = tmp.path().join("local.txt");
        fs::write(&target, "old contents").unwrap();
        unpack(&archive, &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
    }

    #[test]
    fn test_multi_entry_into_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/c.txt"), "c").unwrap();
        fs::write(src.join("top.txt"), "t").unwrap();
        let archive = pack(&src).unwrap();

        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let result = unpack(&archive, &dest).unwrap();

        assert!(matches!(result, Extraction::Extracted { entries: 5, .. }));
        assert_eq!(fs::read_to_string(dest.join("tree/a/b/c.txt")).unwrap(), "c");
        assert_eq!(fs::read_to_string(dest.join("tree/top.txt")).unwrap(), "t");
    }

    #[test]
    fn test_multi_entry_into_missing_path_uses_parent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("x.txt"), "x").unwrap();
        let archive = pack(&src).unwrap();

        let out = tmp.path().join("out");
        fs::create_dir(&out).unwrap();
        let result = unpack(&archive, &out.join("renamed")).unwrap();

        assert_eq!(
            result,
            Extraction::Extracted {
                dir: out.clone(),
                entries: 2
            }
        );
        assert!(out.join("tree/x.txt").is_file());
        assert!(!out.join("renamed").exists());
    }

    #[test]
    fn test_single_empty_dir_becomes_dir_at_host_path() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("empty");
        fs::create_dir(&src).unwrap();
        let archive = pack(&src).unwrap();
        assert_eq!(entry_count(&archive).unwrap(), 1);

        let target = tmp.path().join("restored");
        let result = unpack(&archive, &target).unwrap();

        assert_eq!(result, Extraction::Renamed { target: target.clone() });
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_pack_dot_resolves_name() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("named");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("f"), "1").unwrap();

        let archive = pack(&dir.join(".")).unwrap();
        assert!(names(&archive).contains(&"named/f".to_string()));
    }

    #[test]
    fn test_garbage_archive_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(unpack(&[1u8; 1024], &tmp.path().join("x")).is_err());
    }
}
