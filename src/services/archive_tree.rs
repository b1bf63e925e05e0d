//! Listing zip archives and folding flat entry paths into a directory tree.

use crate::models::entry::{ArchiveEntry, ArchiveEntryNode};
use chrono::{DateTime, NaiveDate, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::BufReader,
    path::Path,
};
use zip::result::ZipResult;

/// Read entry metadata from the central directory of the zip at `path`.
/// Entry payloads are never decompressed. Blocking; call from
/// `spawn_blocking`.
pub fn list_zip_entries(path: &Path) -> ZipResult<Vec<ArchiveEntry>> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        entries.push(ArchiveEntry {
            path: normalize_path(entry.name(), entry.is_dir()),
            size: entry.size(),
            modified_on: entry.last_modified().and_then(zip_time_to_utc),
            is_directory: entry.is_dir(),
        });
    }
    Ok(entries)
}

fn zip_time_to_utc(time: zip::DateTime) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(time.year().into(), time.month().into(), time.day().into())?
        .and_hms_opt(time.hour().into(), time.minute().into(), time.second().into())
        .map(|naive| naive.and_utc())
}

/// Turn a stored entry name into a `/`-rooted posix path. Directories keep a
/// trailing `/`.
pub fn normalize_path(raw: &str, is_directory: bool) -> String {
    let segments: Vec<&str> = raw
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut path = format!("/{}", segments.join("/"));
    if is_directory {
        path.push('/');
    }
    path
}

/// Directory holding `path`, with its trailing `/`. The root is its own
/// parent.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..=idx],
        None => "/",
    }
}

fn entry_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Build the directory tree rooted at `/`.
///
/// Directories that only appear as a prefix of a file path are synthesized,
/// so archives written without explicit directory entries still nest
/// properly. Entries are grouped by parent once, so the cost stays linear
/// in the number of entries. Blocking for large archives; call from
/// `spawn_blocking`.
pub fn build_tree(entries: &[ArchiveEntry]) -> ArchiveEntryNode {
    let mut by_path: BTreeMap<String, ArchiveEntry> = BTreeMap::new();
    for entry in entries {
        let path = normalize_path(&entry.path, entry.is_directory);
        if path == "/" {
            continue;
        }

        let mut prefix = String::from("/");
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            prefix.push_str(segment);
            prefix.push('/');
            if !by_path.contains_key(&prefix) {
                by_path.insert(prefix.clone(), ArchiveEntry::directory(prefix.clone()));
            }
        }

        by_path.insert(
            path.clone(),
            ArchiveEntry {
                path,
                ..entry.clone()
            },
        );
    }

    // Sorted input keeps each sibling list in path order.
    let mut by_parent: HashMap<String, Vec<ArchiveEntry>> = HashMap::new();
    for entry in by_path.into_values() {
        by_parent
            .entry(parent_path(&entry.path).to_string())
            .or_default()
            .push(entry);
    }

    let mut root = ArchiveEntryNode::root();
    attach_children(&mut root, &mut by_parent);
    root
}

fn attach_children(node: &mut ArchiveEntryNode, by_parent: &mut HashMap<String, Vec<ArchiveEntry>>) {
    let Some(entries) = by_parent.remove(&node.path) else {
        return;
    };
    node.children.reserve(entries.len());
    for entry in entries {
        let mut child = ArchiveEntryNode {
            name: entry_name(&entry.path),
            size: entry.size,
            modified_on: entry.modified_on,
            created_on: entry.modified_on,
            is_directory: entry.is_directory,
            path: entry.path,
            children: Vec::new(),
        };
        if child.is_directory {
            attach_children(&mut child, by_parent);
        }
        node.children.push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn builds_nested_tree_from_flat_entries() {
        let entries = vec![
            ArchiveEntry::directory("/a/"),
            ArchiveEntry::file("/a/b.txt", 3),
            ArchiveEntry::directory("/a/c/"),
            ArchiveEntry::file("/a/c/d.txt", 5),
        ];
        let root = build_tree(&entries);

        assert_eq!(root.path, "/");
        assert_eq!(root.children.len(), 1);
        let a = &root.children[0];
        assert_eq!(a.name, "a");
        assert!(a.is_directory);
        assert_eq!(a.children.len(), 2);

        let b = a.children.iter().find(|c| c.name == "b.txt").unwrap();
        assert!(!b.is_directory);
        assert_eq!(b.size, 3);

        let c = a.children.iter().find(|c| c.name == "c").unwrap();
        assert!(c.is_directory);
        assert_eq!(c.children.len(), 1);
        assert_eq!(c.children[0].name, "d.txt");
        assert_eq!(c.children[0].path, "/a/c/d.txt");
    }

    #[test]
    fn synthesizes_missing_directories() {
        let entries = vec![ArchiveEntry::file("bin/win64/game.exe", 10)];
        let root = build_tree(&entries);
        let exe = root.find("/bin/win64/game.exe").unwrap();
        assert_eq!(exe.size, 10);
        assert!(root.find("/bin/").unwrap().is_directory);
        assert!(root.find("/bin/win64/").unwrap().is_directory);
    }

    #[test]
    fn parent_path_strips_one_segment() {
        assert_eq!(parent_path("/a/"), "/");
        assert_eq!(parent_path("/a/b.txt"), "/a/");
        assert_eq!(parent_path("/a/c/"), "/a/");
        assert_eq!(parent_path("/a/c/d.txt"), "/a/c/");
        assert_eq!(parent_path("/ab/x"), "/ab/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn builds_tree_for_many_entries() {
        let mut entries = Vec::new();
        for d in 0..5_000 {
            for f in 0..10 {
                entries.push(ArchiveEntry::file(format!("data/d{:04}/f{}.bin", d, f), f));
            }
        }
        let started = std::time::Instant::now();
        let root = build_tree(&entries);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));

        assert_eq!(root.children.len(), 1);
        let data = &root.children[0];
        assert_eq!(data.path, "/data/");
        assert_eq!(data.children.len(), 5_000);
        assert_eq!(data.children[0].path, "/data/d0000/");
        assert!(data.children.iter().all(|d| d.children.len() == 10));
        let last = &data.children[4_999].children[9];
        assert_eq!(last.path, "/data/d4999/f9.bin");
        assert_eq!(last.size, 9);
    }

    #[test]
    fn normalizes_windows_and_relative_names() {
        assert_eq!(normalize_path("a\\b.txt", false), "/a/b.txt");
        assert_eq!(normalize_path("./a/c", true), "/a/c/");
        assert_eq!(normalize_path("", true), "/");
    }

    #[test]
    fn lists_entries_from_zip_central_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.zip");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = SimpleFileOptions::default();
            writer.add_directory("data/", options).unwrap();
            writer.start_file("data/level1.pak", options).unwrap();
            writer.write_all(&[1u8; 300]).unwrap();
            writer.start_file("readme.txt", options).unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }

        let entries = list_zip_entries(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().any(|e| e.path == "/data/" && e.is_directory));
        let pak = entries.iter().find(|e| e.path == "/data/level1.pak").unwrap();
        assert_eq!(pak.size, 300);

        let root = build_tree(&entries);
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.find("/readme.txt").unwrap().size, 5);
    }
}
