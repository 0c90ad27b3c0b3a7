use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::ObjectEntry;

/// Per-object facts recorded for leaf nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Store-assigned content tag.
    pub e_tag: String,
    /// Last write time as reported by the store.
    pub last_modified: DateTime<Utc>,
}

impl From<&ObjectEntry> for ObjectMetadata {
    fn from(entry: &ObjectEntry) -> Self {
        Self {
            size: entry.size,
            e_tag: entry.e_tag.clone(),
            last_modified: entry.last_modified,
        }
    }
}

/// One node of the mirrored key space. Intermediate segments are synthesized
/// folders and carry no metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexNode {
    /// Full key without a trailing `/`; empty for the root.
    pub path: String,
    /// Next-segment children keyed by name.
    pub children: BTreeMap<String, IndexNode>,
    /// Present only for files.
    pub metadata: Option<ObjectMetadata>,
}

impl IndexNode {
    fn folder(path: String) -> Self {
        Self {
            path,
            children: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// True for nodes backed by an object.
    pub fn is_file(&self) -> bool {
        self.metadata.is_some()
    }

    /// Direct child called `name`.
    pub fn child(&self, name: &str) -> Option<&IndexNode> {
        self.children.get(name)
    }

    /// Every file at or below this node, depth first.
    pub fn files(&self) -> Vec<&IndexNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_file() {
                out.push(node);
            }
            stack.extend(node.children.values().rev());
        }
        out
    }

    fn insert_path(&mut self, segments: &[&str], metadata: Option<ObjectMetadata>) {
        let mut node = self;
        for segment in segments {
            let path = join(&node.path, segment);
            node = node
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| IndexNode::folder(path));
        }
        if metadata.is_some() {
            node.metadata = metadata;
        }
    }
}

/// Immutable view of the index at one generation.
///
/// Consumers hold an `Arc<IndexSnapshot>`; refreshes build a new snapshot on
/// the side and swap it in, so a reader never sees a half-applied listing.
#[derive(Clone, Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    root: IndexNode,
    files: BTreeMap<String, ObjectMetadata>,
    folders: BTreeSet<String>,
}

impl IndexSnapshot {
    pub(crate) fn build(
        generation: u64,
        files: BTreeMap<String, ObjectMetadata>,
        folders: BTreeSet<String>,
    ) -> Self {
        let mut root = IndexNode::default();
        for folder in &folders {
            root.insert_path(&segments(folder), None);
        }
        for (key, metadata) in &files {
            root.insert_path(&segments(key), Some(metadata.clone()));
        }
        Self {
            generation,
            root,
            files,
            folders,
        }
    }

    /// Monotonic counter bumped by every swap.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Root of the tree view.
    pub fn root(&self) -> &IndexNode {
        &self.root
    }

    /// Flat `path -> metadata` map over every file.
    pub fn files(&self) -> &BTreeMap<String, ObjectMetadata> {
        &self.files
    }

    pub(crate) fn folders(&self) -> &BTreeSet<String> {
        &self.folders
    }

    /// Node at `path`, file or folder.
    pub fn node(&self, path: &str) -> Option<&IndexNode> {
        let mut node = &self.root;
        for segment in segments(path) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Metadata of the file at `path`.
    pub fn metadata(&self, path: &str) -> Option<&ObjectMetadata> {
        self.files.get(normalize(path))
    }

    /// True for files and folders alike.
    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// Names of the next path segment below `folder`. Empty when absent.
    pub fn immediate_children(&self, folder: &str) -> Vec<String> {
        self.node(folder)
            .map(|node| node.children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Same contents regardless of generation.
    pub fn same_contents(&self, other: &IndexSnapshot) -> bool {
        self.root == other.root && self.files == other.files && self.folders == other.folders
    }
}

pub(crate) fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// Join two key fragments with exactly one `/`.
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        parent.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> ObjectMetadata {
        ObjectMetadata {
            size,
            e_tag: format!("tag-{size}"),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn synthesizes_intermediate_folders() {
        let mut files = BTreeMap::new();
        files.insert("data/s1/_subject.json".to_string(), meta(2));
        files.insert("data/s1/trials/t1/markers.trc".to_string(), meta(10));
        let snapshot = IndexSnapshot::build(1, files, BTreeSet::from(["data/empty".to_string()]));

        let trial = snapshot.node("data/s1/trials/t1").expect("trial folder");
        assert!(trial.metadata.is_none());
        assert_eq!(trial.path, "data/s1/trials/t1");
        assert_eq!(trial.name(), "t1");

        assert_eq!(
            snapshot.immediate_children("data"),
            vec!["empty".to_string(), "s1".to_string()]
        );
        assert_eq!(snapshot.immediate_children("data/s1"), vec!["_subject.json", "trials"]);
        assert!(snapshot.immediate_children("missing").is_empty());
        assert_eq!(
            snapshot.metadata("/data/s1/_subject.json").map(|m| m.size),
            Some(2)
        );
        assert_eq!(snapshot.node("data/s1").unwrap().files().len(), 2);
    }

    #[test]
    fn join_never_doubles_separators() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/", "/b"), "a/b");
        assert_eq!(join("a", ""), "a");
    }
}
