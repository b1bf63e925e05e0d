//! Entries of a stored archive as presented to the file browser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry read from an archive's central directory.
///
/// `path` is posix-style and rooted at `/`; directories end with `/`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub modified_on: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            modified_on: None,
            is_directory: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified_on: None,
            is_directory: true,
        }
    }
}

/// A node of the reconstructed directory tree.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntryNode {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified_on: Option<DateTime<Utc>>,
    /// Zip containers carry no creation time; mirrors `modified_on`.
    pub created_on: Option<DateTime<Utc>>,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ArchiveEntryNode>,
}

impl ArchiveEntryNode {
    pub fn root() -> Self {
        Self {
            name: "/".into(),
            path: "/".into(),
            size: 0,
            modified_on: None,
            created_on: None,
            is_directory: true,
            children: Vec::new(),
        }
    }

    /// Find a descendant by its full path.
    pub fn find(&self, path: &str) -> Option<&ArchiveEntryNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }
}
