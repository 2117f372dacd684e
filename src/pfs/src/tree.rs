use std::collections::VecDeque;

/// Name of the user-visible root directory under the super-root.
pub const UROOT: &str = "uroot";

/// Name of the path-lookup accelerator under the super-root.
pub const FLAT_PATH_TABLE: &str = "flat_path_table";

/// Name of the optional collision resolver under the super-root.
pub const COLLISION_RESOLVER: &str = "cr";

/// The directory tree of a PFS image.
///
/// Nodes live in a flat arena; parents and children refer to each other by
/// index so the tree owns no references into the image.
pub struct Tree {
    nodes: Vec<Node>,
    superroot: usize,
    uroot: usize,
}

impl Tree {
    pub(crate) fn new(nodes: Vec<Node>, superroot: usize, uroot: usize) -> Self {
        Self {
            nodes,
            superroot,
            uroot,
        }
    }

    pub fn superroot(&self) -> usize {
        self.superroot
    }

    pub fn uroot(&self) -> usize {
        self.uroot
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Finds a direct child by name.
    pub fn child(&self, dir: usize, name: &str) -> Option<usize> {
        self.nodes[dir]
            .children()
            .iter()
            .copied()
            .find(|&i| self.nodes[i].name == name)
    }

    /// Resolves a `/`-separated path relative to uroot.
    pub fn resolve(&self, path: &str) -> Option<usize> {
        let mut current = self.uroot;

        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.child(current, part)?;
        }

        Some(current)
    }

    /// Full uroot-relative path of a node, with a leading `/`.
    pub fn path(&self, index: usize) -> String {
        let mut parts = Vec::new();
        let mut current = index;

        while current != self.uroot && current != self.superroot {
            let node = &self.nodes[current];

            parts.push(node.name.as_str());

            match node.parent {
                Some(v) => current = v,
                None => break,
            }
        }

        let mut path = String::new();

        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }

        if path.is_empty() {
            path.push('/');
        }

        path
    }

    /// Node indices in breadth-first order starting at `from`, children in
    /// on-disk dirent order. The starting node itself is not included.
    pub fn walk_breadth_first(&self, from: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([from]);

        while let Some(dir) = queue.pop_front() {
            for &child in self.nodes[dir].children() {
                order.push(child);

                if self.nodes[child].is_directory() {
                    queue.push_back(child);
                }
            }
        }

        order
    }
}

/// One file or directory in a [`Tree`].
pub struct Node {
    pub(crate) name: String,
    pub(crate) ino: usize,
    pub(crate) parent: Option<usize>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> usize {
        self.ino
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            NodeKind::Directory { children } => children,
            NodeKind::File { .. } => &[],
        }
    }

    /// Logical size for files, zero for directories.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { size, .. } => *size,
            NodeKind::Directory { .. } => 0,
        }
    }
}

pub enum NodeKind {
    Directory {
        children: Vec<usize>,
    },
    File {
        size: u64,
        compressed_size: u64,
        /// Byte offset of the first data block in the image.
        offset: u64,
    },
}
