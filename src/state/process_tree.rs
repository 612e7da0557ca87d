//! This module contains the process tree: the binary tree whose leaves are
//! exactly the live (and suspended) states of a worker.
//!
//! Nodes live in an arena indexed by [`NodeId`], sidestepping the ownership
//! cycles a pointer-based tree would create between states and nodes.

use crate::state::StateId;

/// A handle to a node of the process tree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeId(pub u32);

/// The content of a process-tree node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeContent {
    /// An exterior node carrying a state.
    Leaf(StateId),

    /// An interior node created by a fork.
    Interior { left: NodeId, right: NodeId },

    /// A freed slot, threaded onto the free list.
    Free { next: Option<u32> },
}

#[derive(Clone, Debug)]
struct Node {
    parent:  Option<NodeId>,
    content: NodeContent,
}

/// The process tree of one worker.
#[derive(Clone, Debug, Default)]
pub struct ProcessTree {
    nodes:     Vec<Node>,
    root:      Option<NodeId>,
    free_head: Option<u32>,
}

impl ProcessTree {
    /// Constructs an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plants the tree with a single leaf carrying `state`, returning that
    /// leaf.
    ///
    /// # Panics
    ///
    /// Panics if the tree is not empty; a worker seeds its tree exactly
    /// once, so this is a programmer bug.
    pub fn plant(&mut self, state: StateId) -> NodeId {
        assert!(self.root.is_none(), "process tree was already planted");
        let id = self.fresh(None, NodeContent::Leaf(state));
        self.root = Some(id);
        id
    }

    /// Gets the root of the tree.
    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Gets the content of `node`.
    ///
    /// # Panics
    ///
    /// Panics if `node` was freed; handles are only held for live nodes, so
    /// this is a programmer bug.
    #[must_use]
    pub fn content(&self, node: NodeId) -> &NodeContent {
        let content = &self.nodes[node.0 as usize].content;
        assert!(
            !matches!(content, NodeContent::Free { .. }),
            "accessed a freed process tree node"
        );
        content
    }

    /// Splits `leaf` into an interior node whose children are two new
    /// leaves carrying `left_state` and `right_state`, returning the new
    /// leaf pair as `(left, right)`.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is not an exterior node.
    pub fn split(
        &mut self,
        leaf: NodeId,
        left_state: StateId,
        right_state: StateId,
    ) -> (NodeId, NodeId) {
        assert!(
            matches!(self.content(leaf), NodeContent::Leaf(_)),
            "split target must be an exterior node"
        );
        let left = self.fresh(Some(leaf), NodeContent::Leaf(left_state));
        let right = self.fresh(Some(leaf), NodeContent::Leaf(right_state));
        self.nodes[leaf.0 as usize].content = NodeContent::Interior { left, right };
        (left, right)
    }

    /// Removes `leaf`, contracting the unary interior node this leaves
    /// behind by hoisting the sibling subtree into the parent's place.
    ///
    /// The handles of all surviving nodes are unchanged, so the states
    /// carried by other leaves keep valid back-references.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is not an exterior node.
    pub fn remove(&mut self, leaf: NodeId) {
        assert!(
            matches!(self.content(leaf), NodeContent::Leaf(_)),
            "remove target must be an exterior node"
        );

        let Some(parent) = self.nodes[leaf.0 as usize].parent else {
            self.root = None;
            self.release(leaf);
            return;
        };

        let NodeContent::Interior { left, right } = *self.content(parent) else {
            unreachable!("parent of a leaf is always interior");
        };
        let sibling = if left == leaf { right } else { left };

        let grandparent = self.nodes[parent.0 as usize].parent;
        self.nodes[sibling.0 as usize].parent = grandparent;
        match grandparent {
            None => self.root = Some(sibling),
            Some(gp) => {
                let NodeContent::Interior { left, right } = *self.content(gp) else {
                    unreachable!("parent of an interior node is always interior");
                };
                self.nodes[gp.0 as usize].content = NodeContent::Interior {
                    left:  if left == parent { sibling } else { left },
                    right: if right == parent { sibling } else { right },
                };
            }
        }

        self.release(parent);
        self.release(leaf);
    }

    /// Replaces the state carried by `leaf`.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is not an exterior node.
    pub fn set_leaf_state(&mut self, leaf: NodeId, state: StateId) {
        assert!(
            matches!(self.content(leaf), NodeContent::Leaf(_)),
            "only exterior nodes carry states"
        );
        self.nodes[leaf.0 as usize].content = NodeContent::Leaf(state);
    }

    /// Collects the states carried by all leaves of the tree.
    #[must_use]
    pub fn leaf_states(&self) -> Vec<StateId> {
        let mut result = vec![];
        let Some(root) = self.root else {
            return result;
        };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            match self.content(node) {
                NodeContent::Leaf(state) => result.push(*state),
                NodeContent::Interior { left, right } => {
                    stack.push(*left);
                    stack.push(*right);
                }
                NodeContent::Free { .. } => unreachable!("content() rejects freed nodes"),
            }
        }
        result
    }

    fn fresh(&mut self, parent: Option<NodeId>, content: NodeContent) -> NodeId {
        if let Some(slot) = self.free_head {
            let NodeContent::Free { next } = self.nodes[slot as usize].content else {
                unreachable!("free list points at a live node");
            };
            self.free_head = next;
            self.nodes[slot as usize] = Node { parent, content };
            NodeId(slot)
        } else {
            let id = NodeId(u32::try_from(self.nodes.len()).expect("node count exceeds u32"));
            self.nodes.push(Node { parent, content });
            id
        }
    }

    fn release(&mut self, node: NodeId) {
        self.nodes[node.0 as usize].content = NodeContent::Free {
            next: self.free_head,
        };
        self.free_head = Some(node.0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_replaces_leaf_with_two_children() {
        let mut tree = ProcessTree::new();
        let root = tree.plant(StateId(1));
        let (left, right) = tree.split(root, StateId(2), StateId(1));

        assert_eq!(*tree.content(left), NodeContent::Leaf(StateId(2)));
        assert_eq!(*tree.content(right), NodeContent::Leaf(StateId(1)));
        let mut leaves = tree.leaf_states();
        leaves.sort();
        assert_eq!(leaves, vec![StateId(1), StateId(2)]);
    }

    #[test]
    fn remove_contracts_unary_interior_nodes() {
        let mut tree = ProcessTree::new();
        let root = tree.plant(StateId(1));
        let (left, right) = tree.split(root, StateId(2), StateId(1));
        let (right_left, _) = tree.split(right, StateId(3), StateId(1));

        tree.remove(left);
        let mut leaves = tree.leaf_states();
        leaves.sort();
        assert_eq!(leaves, vec![StateId(1), StateId(3)]);

        tree.remove(right_left);
        assert_eq!(tree.leaf_states(), vec![StateId(1)]);
    }

    #[test]
    fn removing_the_last_leaf_empties_the_tree() {
        let mut tree = ProcessTree::new();
        let root = tree.plant(StateId(1));
        tree.remove(root);
        assert!(tree.root().is_none());
        assert!(tree.leaf_states().is_empty());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut tree = ProcessTree::new();
        let root = tree.plant(StateId(1));
        let (left, _) = tree.split(root, StateId(2), StateId(1));
        tree.remove(left);
        let before = tree.nodes.len();
        let root = tree.root().expect("tree is non-empty");
        tree.split(root, StateId(4), StateId(1));
        assert_eq!(tree.nodes.len(), before);
    }
}
