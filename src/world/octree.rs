//! Spatial octree over the region volume.
//!
//! Fixed depth 6: leaves cover 4×4 m horizontally and 64 m vertically. Each
//! leaf holds the objects inside it plus a channel → chat-listener multimap;
//! interior nodes keep the union of the channels present below them so chat
//! broadcast can prune whole subtrees early.

use std::collections::BTreeSet;

use glam::Vec3;
use uuid::Uuid;

pub const OCTREE_DEPTH: usize = 6;
const OCTREE_WIDTH: i32 = 1 << OCTREE_DEPTH;
const HORIZ_SCALE: i32 = 4;
const VERT_SCALE: i32 = 64;

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Where a heard chat message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatTarget {
    /// A user session, addressed by agent id.
    Session(Uuid),
    /// A script, addressed by the host's script id.
    Script(u32),
}

/// A listener installed into the leaf containing `obj`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatListener {
    /// The object whose position gates range checks.
    pub obj: Uuid,
    pub target: ChatTarget,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

enum Slot {
    Node(Box<Node>),
    Leaf(Box<Leaf>),
}

#[derive(Default)]
struct Node {
    chat_mask: BTreeSet<i32>,
    children: [Option<Slot>; 8],
}

#[derive(Default)]
struct Leaf {
    objects: BTreeSet<Uuid>,
    listeners: Vec<(i32, ChatListener)>,
}

pub struct Octree {
    root: Node,
}

/// Cell coordinates of the leaf covering a world position.
fn cell_of(pos: Vec3) -> (i32, i32, i32) {
    let clamp = |v: i32| v.clamp(0, OCTREE_WIDTH - 1);
    (
        clamp(pos.x as i32 / HORIZ_SCALE),
        clamp(pos.y as i32 / HORIZ_SCALE),
        clamp(pos.z as i32 / VERT_SCALE),
    )
}

fn child_index(x: i32, y: i32, z: i32, level: usize) -> usize {
    (((x >> level) & 1) << 2 | ((y >> level) & 1) << 1 | ((z >> level) & 1)) as usize
}

impl Octree {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    pub fn insert_object(&mut self, pos: Vec3, id: Uuid) {
        let (x, y, z) = cell_of(pos);
        let leaf = find_leaf_mut(&mut self.root, x, y, z, OCTREE_DEPTH - 1, true);
        if let Some(leaf) = leaf {
            leaf.objects.insert(id);
        }
    }

    pub fn remove_object(&mut self, pos: Vec3, id: Uuid) {
        let (x, y, z) = cell_of(pos);
        if let Some(leaf) = find_leaf_mut(&mut self.root, x, y, z, OCTREE_DEPTH - 1, false) {
            leaf.objects.remove(&id);
        }
    }

    /// Relocate an object and every listener attached to it. O(depth).
    pub fn move_object(&mut self, old_pos: Vec3, new_pos: Vec3, id: Uuid) {
        let old_cell = cell_of(old_pos);
        let new_cell = cell_of(new_pos);
        if old_cell == new_cell {
            return;
        }

        let mut moved = Vec::new();
        if let Some(leaf) = find_leaf_mut(
            &mut self.root,
            old_cell.0,
            old_cell.1,
            old_cell.2,
            OCTREE_DEPTH - 1,
            false,
        ) {
            leaf.objects.remove(&id);
            let mut i = 0;
            while i < leaf.listeners.len() {
                if leaf.listeners[i].1.obj == id {
                    moved.push(leaf.listeners.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for (channel, _) in &moved {
            rebuild_masks(&mut self.root, old_cell, *channel);
        }

        self.insert_object(new_pos, id);
        for (channel, listener) in moved {
            self.add_listener(new_pos, channel, listener);
        }
    }

    /// The leaf cell an object at `pos` belongs to (for invariant checks).
    pub fn cell_for(&self, pos: Vec3) -> (i32, i32, i32) {
        cell_of(pos)
    }

    pub fn leaf_contains(&mut self, pos: Vec3, id: Uuid) -> bool {
        let (x, y, z) = cell_of(pos);
        find_leaf_mut(&mut self.root, x, y, z, OCTREE_DEPTH - 1, false)
            .map(|leaf| leaf.objects.contains(&id))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Chat listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&mut self, pos: Vec3, channel: i32, listener: ChatListener) {
        let (x, y, z) = cell_of(pos);
        add_listener_rec(&mut self.root, x, y, z, OCTREE_DEPTH - 1, channel, listener);
    }

    /// Remove one listener registration. Node masks are fully rebuilt along
    /// the path so the mask invariant stays exact.
    pub fn remove_listener(&mut self, pos: Vec3, channel: i32, listener: ChatListener) {
        let cell = cell_of(pos);
        if let Some(leaf) = find_leaf_mut(
            &mut self.root,
            cell.0,
            cell.1,
            cell.2,
            OCTREE_DEPTH - 1,
            false,
        ) {
            leaf.listeners
                .retain(|(ch, l)| !(*ch == channel && *l == listener));
        }
        rebuild_masks(&mut self.root, cell, channel);
    }

    /// Collect every listener on `channel`, pruning subtrees whose chat mask
    /// lacks the channel. Range filtering is the caller's business.
    pub fn listeners_on(&self, channel: i32) -> Vec<ChatListener> {
        let mut out = Vec::new();
        collect_rec(&self.root, channel, &mut out);
        out
    }

    /// True when every interior node's chat mask equals the union of the
    /// channels present in its subtree. Used by the consistency tests.
    pub fn masks_consistent(&self) -> bool {
        node_mask_check(&self.root).is_some()
    }
}

impl Default for Octree {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Recursive helpers
// ---------------------------------------------------------------------------

fn find_leaf_mut<'a>(
    node: &'a mut Node,
    x: i32,
    y: i32,
    z: i32,
    level: usize,
    create: bool,
) -> Option<&'a mut Leaf> {
    let idx = child_index(x, y, z, level);
    if node.children[idx].is_none() {
        if !create {
            return None;
        }
        node.children[idx] = Some(if level == 0 {
            Slot::Leaf(Box::default())
        } else {
            Slot::Node(Box::default())
        });
    }
    match node.children[idx].as_mut() {
        Some(Slot::Leaf(leaf)) => Some(leaf),
        Some(Slot::Node(child)) => find_leaf_mut(child, x, y, z, level - 1, create),
        None => None,
    }
}

fn add_listener_rec(
    node: &mut Node,
    x: i32,
    y: i32,
    z: i32,
    level: usize,
    channel: i32,
    listener: ChatListener,
) {
    node.chat_mask.insert(channel);
    let idx = child_index(x, y, z, level);
    if node.children[idx].is_none() {
        node.children[idx] = Some(if level == 0 {
            Slot::Leaf(Box::default())
        } else {
            Slot::Node(Box::default())
        });
    }
    match node.children[idx].as_mut() {
        Some(Slot::Leaf(leaf)) => leaf.listeners.push((channel, listener)),
        Some(Slot::Node(child)) => {
            add_listener_rec(child, x, y, z, level - 1, channel, listener)
        }
        None => unreachable!(),
    }
}

/// Recompute `channel` membership in every node mask on the path to `cell`,
/// bottom-up: a node keeps the channel only if some child still carries it.
fn rebuild_masks(root: &mut Node, cell: (i32, i32, i32), channel: i32) {
    fn subtree_has(slot: &Slot, channel: i32) -> bool {
        match slot {
            Slot::Leaf(leaf) => leaf.listeners.iter().any(|(ch, _)| *ch == channel),
            Slot::Node(node) => node.chat_mask.contains(&channel),
        }
    }

    fn walk(node: &mut Node, cell: (i32, i32, i32), level: usize, channel: i32) {
        let idx = child_index(cell.0, cell.1, cell.2, level);
        if level > 0 {
            if let Some(Slot::Node(child)) = node.children[idx].as_mut() {
                walk(child, cell, level - 1, channel);
            }
        }
        let still_there = node
            .children
            .iter()
            .flatten()
            .any(|slot| subtree_has(slot, channel));
        if still_there {
            node.chat_mask.insert(channel);
        } else {
            node.chat_mask.remove(&channel);
        }
    }

    walk(root, cell, OCTREE_DEPTH - 1, channel);
}

fn collect_rec(node: &Node, channel: i32, out: &mut Vec<ChatListener>) {
    if !node.chat_mask.contains(&channel) {
        return;
    }
    for slot in node.children.iter().flatten() {
        match slot {
            Slot::Node(child) => collect_rec(child, channel, out),
            Slot::Leaf(leaf) => {
                out.extend(
                    leaf.listeners
                        .iter()
                        .filter(|(ch, _)| *ch == channel)
                        .map(|(_, l)| *l),
                );
            }
        }
    }
}

/// Returns the set of channels in the subtree, or None if some node's mask
/// disagrees with it.
fn node_mask_check(node: &Node) -> Option<BTreeSet<i32>> {
    let mut union = BTreeSet::new();
    for slot in node.children.iter().flatten() {
        match slot {
            Slot::Leaf(leaf) => union.extend(leaf.listeners.iter().map(|(ch, _)| *ch)),
            Slot::Node(child) => union.extend(node_mask_check(child)?),
        }
    }
    if union == node.chat_mask {
        Some(union)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(obj: Uuid) -> ChatListener {
        ChatListener {
            obj,
            target: ChatTarget::Session(obj),
        }
    }

    #[test]
    fn insert_then_move_relocates_leaf() {
        let mut tree = Octree::new();
        let id = Uuid::new_v4();
        let a = Vec3::new(10.0, 10.0, 30.0);
        let b = Vec3::new(200.0, 10.0, 30.0);
        tree.insert_object(a, id);
        assert!(tree.leaf_contains(a, id));
        tree.move_object(a, b, id);
        assert!(!tree.leaf_contains(a, id));
        assert!(tree.leaf_contains(b, id));
    }

    #[test]
    fn listener_masks_follow_add_and_remove() {
        let mut tree = Octree::new();
        let id = Uuid::new_v4();
        let pos = Vec3::new(128.0, 128.0, 30.0);
        tree.insert_object(pos, id);
        tree.add_listener(pos, 0, listener(id));
        tree.add_listener(pos, 42, listener(id));
        assert_eq!(tree.listeners_on(42).len(), 1);
        assert!(tree.masks_consistent());

        tree.remove_listener(pos, 42, listener(id));
        assert!(tree.listeners_on(42).is_empty());
        assert!(tree.masks_consistent());
        // channel 0 listener survives
        assert_eq!(tree.listeners_on(0).len(), 1);
    }

    #[test]
    fn moving_object_carries_listeners() {
        let mut tree = Octree::new();
        let id = Uuid::new_v4();
        let a = Vec3::new(10.0, 10.0, 30.0);
        let b = Vec3::new(250.0, 250.0, 30.0);
        tree.insert_object(a, id);
        tree.add_listener(a, 7, listener(id));
        tree.move_object(a, b, id);
        assert_eq!(tree.listeners_on(7).len(), 1);
        assert!(tree.masks_consistent());
    }
}
