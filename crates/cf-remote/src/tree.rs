//! Cached view of the remote file system.
//!
//! Nodes are addressed by [`NodeId`]s that are never reused, so a listener
//! holding the id of a removed node sees `None` instead of a dangling node.
//! Listeners register per node; every mutation returns the [`TreeNotice`]s the
//! caller must deliver.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cf_core::{CoreResult, IdAllocator, ListenerId, NodeId, RemotePath};

use crate::RemoteError;
use crate::interface::{EntryKind, RemoteEntry, RemoteEvent, RemoteReply};

#[derive(Debug, Clone)]
pub struct FileNode {
    pub id: NodeId,
    pub path: RemotePath,
    pub kind: EntryKind,
    pub size: Option<u64>,
    parent: Option<NodeId>,
    /// `None` until a listing of this folder has been applied.
    children: Option<BTreeMap<String, NodeId>>,
    buffer: Option<Vec<u8>>,
}

impl FileNode {
    pub fn name(&self) -> &str {
        self.path.file_name()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children_loaded(&self) -> bool {
        self.children.is_some()
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeNotice {
    /// A listing or buffer for `node` (or one of its children) was applied.
    /// `changed` is false when a listing matched what was cached.
    ChildrenChanged {
        listener: ListenerId,
        node: NodeId,
        changed: bool,
    },
    Removed {
        listener: ListenerId,
        node: NodeId,
    },
}

impl TreeNotice {
    pub fn listener(&self) -> ListenerId {
        match self {
            TreeNotice::ChildrenChanged { listener, .. } | TreeNotice::Removed { listener, .. } => {
                *listener
            }
        }
    }
}

#[derive(Debug)]
pub struct FileTree {
    nodes: HashMap<NodeId, FileNode>,
    by_path: HashMap<RemotePath, NodeId>,
    watchers: HashMap<NodeId, BTreeSet<ListenerId>>,
    ids: IdAllocator,
    root: NodeId,
}

impl FileTree {
    pub fn new() -> CoreResult<Self> {
        let mut ids = IdAllocator::new();
        let root = ids.next_node()?;
        let root_path = RemotePath::root();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            FileNode {
                id: root,
                path: root_path.clone(),
                kind: EntryKind::Folder,
                size: None,
                parent: None,
                children: None,
                buffer: None,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(root_path, root);
        Ok(Self {
            nodes,
            by_path,
            watchers: HashMap::new(),
            ids,
            root,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&FileNode> {
        self.nodes.get(&id)
    }

    pub fn lookup(&self, path: &RemotePath) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of a loaded folder, in name order.
    pub fn children(&self, id: NodeId) -> Option<Vec<&FileNode>> {
        let node = self.nodes.get(&id)?;
        let children = node.children.as_ref()?;
        Some(
            children
                .values()
                .filter_map(|child| self.nodes.get(child))
                .collect(),
        )
    }

    pub fn child_named(&self, id: NodeId, name: &str) -> Option<&FileNode> {
        let child = self.nodes.get(&id)?.children.as_ref()?.get(name)?;
        self.nodes.get(child)
    }

    /// Resolve a slash-separated path relative to `id` through loaded folders.
    pub fn descendant(&self, id: NodeId, relative: &str) -> Option<&FileNode> {
        let mut current = self.nodes.get(&id)?;
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            current = self.child_named(current.id, part)?;
        }
        Some(current)
    }

    /// Make sure a folder node exists for `path`, creating unloaded
    /// intermediate folders as needed.
    pub fn ensure_folder(&mut self, path: &RemotePath) -> CoreResult<NodeId> {
        if let Some(id) = self.by_path.get(path) {
            return Ok(*id);
        }
        let mut current = self.root;
        let mut current_path = RemotePath::root();
        for part in path.components() {
            current_path = current_path.join(part)?;
            current = match self.by_path.get(&current_path) {
                Some(id) => *id,
                None => self.insert_child(current, part, EntryKind::Folder, None)?,
            };
        }
        Ok(current)
    }

    pub fn watch(&mut self, node: NodeId, listener: ListenerId) {
        self.watchers.entry(node).or_default().insert(listener);
    }

    pub fn unwatch(&mut self, node: NodeId, listener: ListenerId) {
        if let Some(set) = self.watchers.get_mut(&node) {
            set.remove(&listener);
            if set.is_empty() {
                self.watchers.remove(&node);
            }
        }
    }

    pub fn unwatch_all(&mut self, listener: ListenerId) {
        self.watchers.retain(|_, set| {
            set.remove(&listener);
            !set.is_empty()
        });
    }

    pub fn watchers_of(&self, node: NodeId) -> impl Iterator<Item = ListenerId> + '_ {
        self.watchers.get(&node).into_iter().flatten().copied()
    }

    /// Replace the cached children of `path` with a fresh listing.
    pub fn apply_listing(
        &mut self,
        path: &RemotePath,
        entries: &[RemoteEntry],
    ) -> CoreResult<Vec<TreeNotice>> {
        let folder = self.ensure_folder(path)?;
        let mut notices = Vec::new();

        let (mut old_children, was_loaded) = match self.nodes.get_mut(&folder) {
            Some(node) => {
                node.kind = EntryKind::Folder;
                node.buffer = None;
                let loaded = node.children.is_some();
                (node.children.take().unwrap_or_default(), loaded)
            }
            None => (BTreeMap::new(), false),
        };
        if !was_loaded {
            // Nodes created ahead of the first listing (see `ensure_folder`)
            // are adopted if the listing confirms them, dropped otherwise.
            for node in self.nodes.values() {
                if node.parent == Some(folder) {
                    old_children.insert(node.name().to_string(), node.id);
                }
            }
        }

        let mut changed = !was_loaded;
        let mut kept = BTreeMap::new();
        let incoming: BTreeMap<&str, &RemoteEntry> =
            entries.iter().map(|e| (e.name.as_str(), e)).collect();

        for (name, child) in old_children {
            let keep = match (incoming.get(name.as_str()), self.nodes.get(&child)) {
                (Some(entry), Some(node)) => entry.kind == node.kind,
                _ => false,
            };
            if keep {
                kept.insert(name, child);
            } else {
                changed = true;
                self.remove_subtree(child, &mut notices);
            }
        }

        // Restore the surviving children before inserting new ones so that
        // `insert_child` can register against a loaded map.
        if let Some(node) = self.nodes.get_mut(&folder) {
            node.children = Some(kept);
        }

        for entry in entries {
            let existing = self
                .nodes
                .get(&folder)
                .and_then(|n| n.children.as_ref())
                .and_then(|c| c.get(&entry.name))
                .copied();
            match existing {
                Some(child) => {
                    if let Some(node) = self.nodes.get_mut(&child)
                        && node.size != entry.size
                    {
                        node.size = entry.size;
                        node.buffer = None;
                        changed = true;
                    }
                }
                None => {
                    self.insert_child(folder, &entry.name, entry.kind, entry.size)?;
                    changed = true;
                }
            }
        }

        for listener in self.watchers_of(folder).collect::<Vec<_>>() {
            notices.push(TreeNotice::ChildrenChanged {
                listener,
                node: folder,
                changed,
            });
        }
        Ok(notices)
    }

    /// Store downloaded file content.
    pub fn apply_buffer(&mut self, path: &RemotePath, data: Vec<u8>) -> CoreResult<Vec<TreeNotice>> {
        let id = match self.by_path.get(path) {
            Some(id) => *id,
            None => {
                let parent_path = path.parent().unwrap_or_else(RemotePath::root);
                let parent = self.ensure_folder(&parent_path)?;
                self.insert_child(parent, path.file_name(), EntryKind::File, None)?
            }
        };
        let parent = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.size = Some(data.len() as u64);
                node.buffer = Some(data);
                node.parent
            }
            None => None,
        };

        let mut notices = Vec::new();
        for node in [Some(id), parent].into_iter().flatten() {
            for listener in self.watchers_of(node).collect::<Vec<_>>() {
                notices.push(TreeNotice::ChildrenChanged {
                    listener,
                    node,
                    changed: true,
                });
            }
        }
        Ok(notices)
    }

    /// Drop `path` and everything beneath it, e.g. after the remote reported
    /// that it no longer exists.
    pub fn remove_path(&mut self, path: &RemotePath) -> Vec<TreeNotice> {
        let Some(id) = self.by_path.get(path).copied() else {
            return Vec::new();
        };
        if id == self.root {
            return Vec::new();
        }
        let mut notices = Vec::new();
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        self.remove_subtree(id, &mut notices);
        if let Some(parent) = parent {
            if let Some(children) = self.nodes.get_mut(&parent).and_then(|n| n.children.as_mut()) {
                children.retain(|_, child| *child != id);
            }
            for listener in self.watchers_of(parent).collect::<Vec<_>>() {
                notices.push(TreeNotice::ChildrenChanged {
                    listener,
                    node: parent,
                    changed: true,
                });
            }
        }
        notices
    }

    /// Fold a backend event into the cache: listings and buffers are stored,
    /// a `NotFound` drops the path. Other events leave the tree alone.
    pub fn apply_event(&mut self, event: &RemoteEvent) -> CoreResult<Vec<TreeNotice>> {
        let RemoteEvent::Completed { outcome, .. } = event else {
            return Ok(Vec::new());
        };
        match outcome {
            Ok(RemoteReply::Listing { path, entries }) => self.apply_listing(path, entries),
            Ok(RemoteReply::Buffer { path, data }) => self.apply_buffer(path, data.clone()),
            Err(RemoteError::NotFound { path }) => Ok(self.remove_path(&RemotePath::parse(path)?)),
            _ => Ok(Vec::new()),
        }
    }

    fn insert_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: EntryKind,
        size: Option<u64>,
    ) -> CoreResult<NodeId> {
        let parent_path = match self.nodes.get(&parent) {
            Some(node) => node.path.clone(),
            None => RemotePath::root(),
        };
        let path = parent_path.join(name)?;
        let id = self.ids.next_node()?;
        self.nodes.insert(
            id,
            FileNode {
                id,
                path: path.clone(),
                kind,
                size,
                parent: Some(parent),
                children: None,
                buffer: None,
            },
        );
        self.by_path.insert(path, id);
        // An unloaded parent stays unloaded; the child is reachable by path
        // until a listing of the parent adopts or drops it.
        if let Some(children) = self.nodes.get_mut(&parent).and_then(|n| n.children.as_mut()) {
            children.insert(name.to_string(), id);
        }
        Ok(id)
    }

    fn remove_subtree(&mut self, id: NodeId, notices: &mut Vec<TreeNotice>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            self.by_path.remove(&node.path);
            if let Some(children) = node.children {
                stack.extend(children.into_values());
            }
            if let Some(listeners) = self.watchers.remove(&current) {
                for listener in listeners {
                    notices.push(TreeNotice::Removed {
                        listener,
                        node: current,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RemotePath {
        RemotePath::parse(s).unwrap()
    }

    fn listener(i: u64) -> ListenerId {
        ListenerId::from_index(i).unwrap()
    }

    #[test]
    fn not_found_completion_drops_the_path() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/a"), &[RemoteEntry::folder("b")])
            .unwrap();
        let b = tree.lookup(&path("/a/b")).unwrap();
        tree.watch(b, listener(4));
        let event = RemoteEvent::Completed {
            request: cf_core::RequestId::from_index(1).unwrap(),
            outcome: Err(RemoteError::NotFound {
                path: "/a/b".to_string(),
            }),
        };
        let notices = tree.apply_event(&event).unwrap();
        assert!(tree.node(b).is_none());
        assert!(notices.contains(&TreeNotice::Removed {
            listener: listener(4),
            node: b
        }));
    }

    #[test]
    fn listing_populates_children() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(
            &path("/cases"),
            &[RemoteEntry::folder("run1"), RemoteEntry::file("notes.txt", 3)],
        )
        .unwrap();

        let cases = tree.lookup(&path("/cases")).unwrap();
        let names: Vec<_> = tree
            .children(cases)
            .unwrap()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, vec!["notes.txt", "run1"]);
        assert!(!tree.child_named(cases, "run1").unwrap().children_loaded());
    }

    #[test]
    fn unchanged_listing_still_notifies() {
        let mut tree = FileTree::new().unwrap();
        let entries = [RemoteEntry::folder("run1")];
        let cases = tree.ensure_folder(&path("/cases")).unwrap();
        tree.watch(cases, listener(1));

        let first = tree.apply_listing(&path("/cases"), &entries).unwrap();
        assert_eq!(
            first,
            vec![TreeNotice::ChildrenChanged {
                listener: listener(1),
                node: cases,
                changed: true
            }]
        );

        let second = tree.apply_listing(&path("/cases"), &entries).unwrap();
        assert_eq!(
            second,
            vec![TreeNotice::ChildrenChanged {
                listener: listener(1),
                node: cases,
                changed: false
            }]
        );
    }

    #[test]
    fn vanished_child_notifies_its_watchers() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/cases"), &[RemoteEntry::folder("run1")])
            .unwrap();
        let run1 = tree.lookup(&path("/cases/run1")).unwrap();
        tree.apply_listing(&path("/cases/run1"), &[RemoteEntry::folder("constant")])
            .unwrap();
        let constant = tree.lookup(&path("/cases/run1/constant")).unwrap();
        tree.watch(run1, listener(7));

        let notices = tree.apply_listing(&path("/cases"), &[]).unwrap();
        assert!(notices.contains(&TreeNotice::Removed {
            listener: listener(7),
            node: run1
        }));
        assert!(tree.node(run1).is_none());
        assert!(tree.node(constant).is_none());
        assert!(tree.lookup(&path("/cases/run1")).is_none());
    }

    #[test]
    fn folder_known_before_parent_listing_keeps_its_id() {
        let mut tree = FileTree::new().unwrap();
        let run1 = tree.ensure_folder(&path("/cases/run1")).unwrap();
        let cases = tree.lookup(&path("/cases")).unwrap();
        assert!(!tree.node(cases).unwrap().children_loaded());

        tree.apply_listing(&path("/cases"), &[RemoteEntry::folder("run1")])
            .unwrap();
        assert_eq!(tree.lookup(&path("/cases/run1")), Some(run1));
        assert_eq!(tree.child_named(cases, "run1").map(|n| n.id), Some(run1));
    }

    #[test]
    fn folder_known_before_parent_listing_is_dropped_if_absent() {
        let mut tree = FileTree::new().unwrap();
        let run1 = tree.ensure_folder(&path("/cases/run1")).unwrap();
        tree.watch(run1, listener(4));
        let notices = tree.apply_listing(&path("/cases"), &[]).unwrap();
        assert_eq!(
            notices,
            vec![TreeNotice::Removed {
                listener: listener(4),
                node: run1
            }]
        );
    }

    #[test]
    fn recreated_path_gets_a_fresh_id() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/c"), &[RemoteEntry::folder("a")]).unwrap();
        let first = tree.lookup(&path("/c/a")).unwrap();
        tree.apply_listing(&path("/c"), &[]).unwrap();
        tree.apply_listing(&path("/c"), &[RemoteEntry::folder("a")]).unwrap();
        let second = tree.lookup(&path("/c/a")).unwrap();
        assert_ne!(first, second);
        assert!(tree.node(first).is_none());
    }

    #[test]
    fn size_change_drops_stale_buffer() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/c"), &[RemoteEntry::file("p", 2)]).unwrap();
        tree.apply_buffer(&path("/c/p"), b"{}".to_vec()).unwrap();
        let p = tree.lookup(&path("/c/p")).unwrap();
        assert!(tree.node(p).unwrap().buffer().is_some());

        tree.apply_listing(&path("/c"), &[RemoteEntry::file("p", 2)]).unwrap();
        assert!(tree.node(p).unwrap().buffer().is_some());

        tree.apply_listing(&path("/c"), &[RemoteEntry::file("p", 9)]).unwrap();
        assert!(tree.node(p).unwrap().buffer().is_none());
    }

    #[test]
    fn buffer_notifies_parent_watchers() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/c"), &[RemoteEntry::file("p", 2)]).unwrap();
        let c = tree.lookup(&path("/c")).unwrap();
        tree.watch(c, listener(3));
        let notices = tree.apply_buffer(&path("/c/p"), b"{}".to_vec()).unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].listener(), listener(3));
    }

    #[test]
    fn remove_path_notifies_and_unlinks() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/c"), &[RemoteEntry::folder("a")]).unwrap();
        let a = tree.lookup(&path("/c/a")).unwrap();
        let c = tree.lookup(&path("/c")).unwrap();
        tree.watch(a, listener(1));
        tree.watch(c, listener(2));

        let notices = tree.remove_path(&path("/c/a"));
        assert!(notices.contains(&TreeNotice::Removed {
            listener: listener(1),
            node: a
        }));
        assert!(notices.iter().any(|n| n.listener() == listener(2)));
        assert!(tree.child_named(c, "a").is_none());
    }

    #[test]
    fn unwatch_all_clears_every_subscription() {
        let mut tree = FileTree::new().unwrap();
        let a = tree.ensure_folder(&path("/a")).unwrap();
        let b = tree.ensure_folder(&path("/b")).unwrap();
        tree.watch(a, listener(1));
        tree.watch(b, listener(1));
        tree.watch(b, listener(2));
        tree.unwatch_all(listener(1));
        assert_eq!(tree.watchers_of(a).count(), 0);
        assert_eq!(tree.watchers_of(b).collect::<Vec<_>>(), vec![listener(2)]);
    }

    #[test]
    fn descendant_walks_loaded_folders() {
        let mut tree = FileTree::new().unwrap();
        tree.apply_listing(&path("/r"), &[RemoteEntry::folder("constant")]).unwrap();
        tree.apply_listing(&path("/r/constant"), &[RemoteEntry::folder("polyMesh")])
            .unwrap();
        let r = tree.lookup(&path("/r")).unwrap();
        assert!(tree.descendant(r, "constant/polyMesh").is_some());
        assert!(tree.descendant(r, "constant/missing").is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn relisting_keeps_exactly_the_listed_children(
            first in proptest::collection::btree_set("[a-e]", 0..5),
            second in proptest::collection::btree_set("[a-e]", 0..5),
        ) {
            let folder = RemotePath::parse("/case").unwrap();
            let mut tree = FileTree::new().unwrap();
            let entries = |names: &BTreeSet<String>| -> Vec<RemoteEntry> {
                names.iter().map(|n| RemoteEntry::file(n.clone(), 1)).collect()
            };
            tree.apply_listing(&folder, &entries(&first)).unwrap();
            let kept: BTreeMap<String, NodeId> = first
                .iter()
                .map(|n| (n.clone(), tree.lookup(&folder.join(n).unwrap()).unwrap()))
                .collect();
            tree.apply_listing(&folder, &entries(&second)).unwrap();

            let node = tree.lookup(&folder).unwrap();
            let names: BTreeSet<String> = tree
                .children(node)
                .unwrap()
                .into_iter()
                .map(|c| c.name().to_string())
                .collect();
            prop_assert_eq!(&names, &second);
            for name in first.intersection(&second) {
                prop_assert_eq!(tree.lookup(&folder.join(name).unwrap()), Some(kept[name]));
            }
        }
    }
}
