//! Access to directory entries from probe code.

/// The subset of `struct dentry` the path writer and the exit probes read.
pub trait DentryTree {
    type Dentry: Copy + PartialEq;

    /// Component name, `/` for the root of a mount.
    fn name(&self, dentry: Self::Dentry) -> &[u8];
    /// Parent directory. The root is its own parent.
    fn parent(&self, dentry: Self::Dentry) -> Self::Dentry;
    fn inode(&self, dentry: Self::Dentry) -> u64;
    fn mount_id(&self, dentry: Self::Dentry) -> u32;
}

/// A dentry hierarchy kept in memory. Dentries are indexes; `0` is the root.
#[derive(Debug, Clone)]
pub struct MemoryDentryTree {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
struct Node {
    name: Vec<u8>,
    parent: usize,
    inode: u64,
    mount_id: u32,
}

const ROOT_INODE: u64 = 2;

impl MemoryDentryTree {
    pub fn new(root_mount_id: u32) -> Self {
        Self {
            nodes: vec![Node {
                name: b"/".to_vec(),
                parent: 0,
                inode: ROOT_INODE,
                mount_id: root_mount_id,
            }],
        }
    }

    pub fn root(&self) -> usize {
        0
    }

    /// Add a child of `parent`, inheriting its mount.
    pub fn add(&mut self, parent: usize, name: &[u8]) -> usize {
        let mount_id = self.nodes[parent].mount_id;
        self.push(parent, name, mount_id)
    }

    /// Add the root of a new mount below `parent`.
    pub fn add_mount(&mut self, parent: usize, mount_id: u32) -> usize {
        self.push(parent, b"/", mount_id)
    }

    /// Create every missing component of an absolute path and return the last one.
    pub fn add_path(&mut self, path: &str) -> usize {
        path.split('/')
            .filter(|component| !component.is_empty())
            .fold(self.root(), |parent, component| {
                match self.child(parent, component.as_bytes()) {
                    Some(existing) => existing,
                    None => self.add(parent, component.as_bytes()),
                }
            })
    }

    fn child(&self, parent: usize, name: &[u8]) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, node)| node.parent == parent && node.name == name)
            .map(|(index, _)| index)
    }

    fn push(&mut self, parent: usize, name: &[u8], mount_id: u32) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_vec(),
            parent,
            inode: ROOT_INODE + index as u64,
            mount_id,
        });
        index
    }
}

impl DentryTree for MemoryDentryTree {
    type Dentry = usize;

    fn name(&self, dentry: usize) -> &[u8] {
        &self.nodes[dentry].name
    }

    fn parent(&self, dentry: usize) -> usize {
        self.nodes[dentry].parent
    }

    fn inode(&self, dentry: usize) -> u64 {
        self.nodes[dentry].inode
    }

    fn mount_id(&self, dentry: usize) -> u32 {
        self.nodes[dentry].mount_id
    }
}
