//! This module contains the binary radix tree indexing suspended ranging
//! states by their canonical branch history.
//!
//! A node is *occupied* while a suspended state is parked at its path;
//! resuming the state vacates the node but keeps the structure, so later
//! lookups can still walk through it to deeper occupants.

/// A handle to a node of the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct NodeIndex(u32);

#[derive(Clone, Debug, Default)]
struct Node {
    children: [Option<NodeIndex>; 2],
    occupied: bool,
}

/// The radix tree over canonical `{0,1}` histories.
#[derive(Clone, Debug)]
pub struct PrefixTree {
    nodes: Vec<Node>,
}

impl PrefixTree {
    /// Constructs a tree holding only the (vacant) root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    /// Inserts `path` and marks its final node occupied.
    ///
    /// # Panics
    ///
    /// Panics if a digit is not canonical; paths come from the ingress
    /// canonicalizer, so this is a programmer bug.
    pub fn insert(&mut self, path: &[u8]) {
        let mut current = NodeIndex(0);
        for digit in path {
            let slot = Self::slot(*digit);
            current = match self.nodes[current.0 as usize].children[slot] {
                Some(child) => child,
                None => {
                    let child = NodeIndex(
                        u32::try_from(self.nodes.len()).expect("node count exceeds u32"),
                    );
                    self.nodes.push(Node::default());
                    self.nodes[current.0 as usize].children[slot] = Some(child);
                    child
                }
            };
        }
        self.nodes[current.0 as usize].occupied = true;
    }

    /// Walks `path` as far as the tree extends and returns the longest
    /// traversed prefix whose node is occupied.
    #[must_use]
    pub fn longest_occupied_prefix(&self, path: &[u8]) -> Option<Vec<u8>> {
        let mut current = NodeIndex(0);
        let mut best: Option<usize> = self.nodes[0].occupied.then_some(0);
        for (walked, digit) in path.iter().enumerate() {
            let slot = Self::slot(*digit);
            match self.nodes[current.0 as usize].children[slot] {
                Some(child) => {
                    current = child;
                    if self.nodes[child.0 as usize].occupied {
                        best = Some(walked + 1);
                    }
                }
                None => break,
            }
        }
        best.map(|len| path[..len].to_vec())
    }

    /// Vacates the node at `path`, keeping the structure for deeper
    /// occupants.
    pub fn release(&mut self, path: &[u8]) {
        let mut current = NodeIndex(0);
        for digit in path {
            let slot = Self::slot(*digit);
            match self.nodes[current.0 as usize].children[slot] {
                Some(child) => current = child,
                None => return,
            }
        }
        self.nodes[current.0 as usize].occupied = false;
    }

    fn slot(digit: u8) -> usize {
        match digit {
            b'0' => 0,
            b'1' => 1,
            _ => panic!("non-canonical digit in prefix tree path"),
        }
    }
}

impl Default for PrefixTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_the_longest_occupied_ancestor() {
        let mut tree = PrefixTree::new();
        tree.insert(b"00");
        tree.insert(b"0011");

        assert_eq!(
            tree.longest_occupied_prefix(b"001101"),
            Some(b"0011".to_vec())
        );
        assert_eq!(tree.longest_occupied_prefix(b"0010"), Some(b"00".to_vec()));
        assert_eq!(tree.longest_occupied_prefix(b"10"), None);
    }

    #[test]
    fn released_nodes_stop_matching_but_stay_walkable() {
        let mut tree = PrefixTree::new();
        tree.insert(b"00");
        tree.insert(b"0011");

        tree.release(b"0011");
        assert_eq!(
            tree.longest_occupied_prefix(b"001101"),
            Some(b"00".to_vec())
        );

        tree.release(b"00");
        assert_eq!(tree.longest_occupied_prefix(b"001101"), None);
    }
}
