//! A disk-resident B+ tree whose nodes are fixed-size records read and
//! written through a [`BufferManager`], addressed at
//! `base_address + id * node_size(order)`.

use tracing::debug;

use crate::common::{AddressId, NodeId, NULL_NODE};
use crate::error::{DbError, Result};
use crate::index::{FixedWidth, SharedBuffer};

const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;

/// Header fields common to every node: a one-byte kind tag, two node-id
/// slots (`parent_id`, `next_leaf_id`), and three length fields (key
/// count, child count, value count) so a partially filled node still
/// occupies the full fixed record.
const HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 4;

pub fn node_size<K: FixedWidth, V: FixedWidth>(order: usize) -> usize {
    HEADER_SIZE + order * K::ENCODED_SIZE + order * V::ENCODED_SIZE + (order + 1) * 8
}

#[derive(Debug, Clone)]
enum Node<K, V> {
    Internal {
        parent_id: NodeId,
        keys: Vec<K>,
        children: Vec<NodeId>,
    },
    Leaf {
        parent_id: NodeId,
        next_leaf_id: NodeId,
        keys: Vec<K>,
        values: Vec<V>,
    },
}

impl<K: FixedWidth, V: FixedWidth> Node<K, V> {
    fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    fn keys(&self) -> &[K] {
        match self {
            Node::Internal { keys, .. } => keys,
            Node::Leaf { keys, .. } => keys,
        }
    }

    fn parent_id(&self) -> NodeId {
        match self {
            Node::Internal { parent_id, .. } => *parent_id,
            Node::Leaf { parent_id, .. } => *parent_id,
        }
    }

    fn set_parent_id(&mut self, id: NodeId) {
        match self {
            Node::Internal { parent_id, .. } => *parent_id = id,
            Node::Leaf { parent_id, .. } => *parent_id = id,
        }
    }

    fn encode(&self, order: usize) -> Vec<u8> {
        let mut buf = vec![0u8; node_size::<K, V>(order)];
        let keys_region = HEADER_SIZE;
        let values_region = HEADER_SIZE + order * K::ENCODED_SIZE;
        let children_region = values_region + order * V::ENCODED_SIZE;

        match self {
            Node::Leaf {
                parent_id,
                next_leaf_id,
                keys,
                values,
            } => {
                buf[0] = KIND_LEAF;
                buf[1..9].copy_from_slice(&parent_id.to_le_bytes());
                buf[9..17].copy_from_slice(&next_leaf_id.to_le_bytes());
                buf[17..21].copy_from_slice(&(keys.len() as u32).to_le_bytes());
                buf[21..25].copy_from_slice(&0u32.to_le_bytes());
                buf[25..29].copy_from_slice(&(values.len() as u32).to_le_bytes());
                for (i, k) in keys.iter().enumerate() {
                    let off = keys_region + i * K::ENCODED_SIZE;
                    k.encode(&mut buf[off..off + K::ENCODED_SIZE]);
                }
                for (i, v) in values.iter().enumerate() {
                    let off = values_region + i * V::ENCODED_SIZE;
                    v.encode(&mut buf[off..off + V::ENCODED_SIZE]);
                }
            }
            Node::Internal {
                parent_id,
                keys,
                children,
            } => {
                buf[0] = KIND_INTERNAL;
                buf[1..9].copy_from_slice(&parent_id.to_le_bytes());
                buf[9..17].copy_from_slice(&NULL_NODE.to_le_bytes());
                buf[17..21].copy_from_slice(&(keys.len() as u32).to_le_bytes());
                buf[21..25].copy_from_slice(&(children.len() as u32).to_le_bytes());
                buf[25..29].copy_from_slice(&0u32.to_le_bytes());
                for (i, k) in keys.iter().enumerate() {
                    let off = keys_region + i * K::ENCODED_SIZE;
                    k.encode(&mut buf[off..off + K::ENCODED_SIZE]);
                }
                for (i, c) in children.iter().enumerate() {
                    let off = children_region + i * 8;
                    buf[off..off + 8].copy_from_slice(&c.to_le_bytes());
                }
            }
        }
        buf
    }

    fn decode(buf: &[u8], order: usize) -> Self {
        let keys_region = HEADER_SIZE;
        let values_region = HEADER_SIZE + order * K::ENCODED_SIZE;
        let children_region = values_region + order * V::ENCODED_SIZE;

        let kind = buf[0];
        let parent_id = NodeId::from_le_bytes(buf[1..9].try_into().unwrap());
        let next_leaf_id = NodeId::from_le_bytes(buf[9..17].try_into().unwrap());
        let num_keys = u32::from_le_bytes(buf[17..21].try_into().unwrap()) as usize;
        let num_children = u32::from_le_bytes(buf[21..25].try_into().unwrap()) as usize;
        let num_values = u32::from_le_bytes(buf[25..29].try_into().unwrap()) as usize;

        let mut keys = Vec::with_capacity(num_keys);
        for i in 0..num_keys {
            let off = keys_region + i * K::ENCODED_SIZE;
            keys.push(K::decode(&buf[off..off + K::ENCODED_SIZE]));
        }

        if kind == KIND_LEAF {
            let mut values = Vec::with_capacity(num_values);
            for i in 0..num_values {
                let off = values_region + i * V::ENCODED_SIZE;
                values.push(V::decode(&buf[off..off + V::ENCODED_SIZE]));
            }
            Node::Leaf {
                parent_id,
                next_leaf_id,
                keys,
                values,
            }
        } else {
            let mut children = Vec::with_capacity(num_children);
            for i in 0..num_children {
                let off = children_region + i * 8;
                children.push(NodeId::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            }
            Node::Internal {
                parent_id,
                keys,
                children,
            }
        }
    }
}

fn upper_bound<K: Ord>(keys: &[K], search: &K) -> usize {
    keys.partition_point(|k| k <= search)
}

fn lower_bound<K: Ord>(keys: &[K], search: &K) -> usize {
    keys.partition_point(|k| k < search)
}

/// A disk-resident order-`m` B+ tree (`m >= 3`) mapping `K` to `V`,
/// threading an auxiliary next-leaf chain through its leaves for ordered
/// iteration and range scans.
pub struct BPlusTreeIndex<K, V> {
    buffer: SharedBuffer,
    order: usize,
    base_address: AddressId,
    root_id: NodeId,
    last_id: NodeId,
    free_ids: Vec<NodeId>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> BPlusTreeIndex<K, V>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
{
    pub fn new(buffer: SharedBuffer, order: usize, base_address: AddressId) -> Result<Self> {
        if order < 3 {
            return Err(DbError::InvalidArgument(
                "B+ tree order must be at least 3".into(),
            ));
        }
        Ok(Self {
            buffer,
            order,
            base_address,
            root_id: NULL_NODE,
            last_id: 0,
            free_ids: Vec::new(),
            _marker: std::marker::PhantomData,
        })
    }

    fn node_address(&self, id: NodeId) -> AddressId {
        self.base_address + id as u64 * node_size::<K, V>(self.order) as u64
    }

    fn load_node(&self, id: NodeId) -> Result<Node<K, V>> {
        let addr = self.node_address(id);
        let size = node_size::<K, V>(self.order);
        let bytes = self.buffer.borrow_mut().read_address(addr, size as u64)?;
        Ok(Node::decode(&bytes, self.order))
    }

    fn save_node(&self, id: NodeId, node: &Node<K, V>) -> Result<()> {
        let addr = self.node_address(id);
        let bytes = node.encode(self.order);
        self.buffer.borrow_mut().write_address(addr, &bytes)
    }

    fn create_node(&mut self, node: &Node<K, V>) -> Result<NodeId> {
        let id = if let Some(id) = self.free_ids.pop() {
            id
        } else {
            let id = self.last_id;
            self.last_id += 1;
            id
        };
        self.save_node(id, node)?;
        Ok(id)
    }

    fn destroy_node(&mut self, id: NodeId) {
        self.free_ids.push(id);
    }

    /// Exclusive upper bound of the address range this tree currently
    /// occupies; callers reserve space for further structures starting
    /// there.
    pub fn get_address_range(&self) -> (AddressId, AddressId) {
        (
            self.base_address,
            self.base_address + self.last_id as u64 * node_size::<K, V>(self.order) as u64,
        )
    }

    pub fn search(&self, key: &K) -> Result<Option<V>> {
        if self.root_id == NULL_NODE {
            return Ok(None);
        }
        let mut current = self.root_id;
        loop {
            match self.load_node(current)? {
                Node::Internal { keys, children, .. } => {
                    let idx = upper_bound(&keys, key);
                    current = children[idx];
                }
                Node::Leaf { keys, values, .. } => {
                    let idx = lower_bound(&keys, key);
                    return Ok(if idx < keys.len() && &keys[idx] == key {
                        Some(values[idx].clone())
                    } else {
                        None
                    });
                }
            }
        }
    }

    /// Collects every `(key, value)` with `start <= key <= end`, walking
    /// the next-leaf chain from the leaf that would hold `start`.
    pub fn range_search(&self, start: &K, end: &K) -> Result<Vec<(K, V)>> {
        if self.root_id == NULL_NODE {
            return Ok(Vec::new());
        }
        let mut current = self.root_id;
        loop {
            match self.load_node(current)? {
                Node::Internal { keys, children, .. } => {
                    let idx = upper_bound(&keys, start);
                    current = children[idx];
                }
                Node::Leaf { .. } => break,
            }
        }

        let mut out = Vec::new();
        let mut leaf_id = current;
        'outer: loop {
            let node = self.load_node(leaf_id)?;
            if let Node::Leaf {
                keys,
                values,
                next_leaf_id,
                ..
            } = node
            {
                for (k, v) in keys.iter().zip(values.iter()) {
                    if k > end {
                        break 'outer;
                    }
                    if k >= start {
                        out.push((k.clone(), v.clone()));
                    }
                }
                if next_leaf_id == NULL_NODE {
                    break;
                }
                leaf_id = next_leaf_id;
            } else {
                unreachable!("leaf chain must only contain leaves");
            }
        }
        Ok(out)
    }

    /// Returns every `(key, value)` pair in ascending key order.
    pub fn iter_all(&self) -> Result<Vec<(K, V)>> {
        if self.root_id == NULL_NODE {
            return Ok(Vec::new());
        }
        let mut leaf_id = self.leftmost_leaf(self.root_id)?;
        let mut out = Vec::new();
        loop {
            match self.load_node(leaf_id)? {
                Node::Leaf {
                    keys,
                    values,
                    next_leaf_id,
                    ..
                } => {
                    for (k, v) in keys.into_iter().zip(values.into_iter()) {
                        out.push((k, v));
                    }
                    if next_leaf_id == NULL_NODE {
                        break;
                    }
                    leaf_id = next_leaf_id;
                }
                Node::Internal { .. } => unreachable!(),
            }
        }
        Ok(out)
    }

    fn leftmost_leaf(&self, mut current: NodeId) -> Result<NodeId> {
        loop {
            match self.load_node(current)? {
                Node::Internal { children, .. } => current = children[0],
                Node::Leaf { .. } => return Ok(current),
            }
        }
    }

    /// Inserts `key -> value`. An existing `key` has its value replaced
    /// (duplicate keys are not rejected; see the crate-level note on
    /// duplicate-key policy).
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        if self.root_id == NULL_NODE {
            let leaf = Node::Leaf {
                parent_id: NULL_NODE,
                next_leaf_id: NULL_NODE,
                keys: vec![key],
                values: vec![value],
            };
            self.root_id = self.create_node(&leaf)?;
            return Ok(true);
        }

        // Descend, remembering the path of internal node ids visited so
        // overflow can propagate back up without relying on a stored
        // parent pointer.
        let mut stack: Vec<NodeId> = Vec::new();
        let mut current = self.root_id;
        let leaf_id = loop {
            match self.load_node(current)? {
                Node::Internal { keys, children, .. } => {
                    let idx = upper_bound(&keys, &key);
                    stack.push(current);
                    current = children[idx];
                }
                Node::Leaf { .. } => break current,
            }
        };

        let (mut keys, mut values, next_leaf_id, parent_id) = match self.load_node(leaf_id)? {
            Node::Leaf {
                keys,
                values,
                next_leaf_id,
                parent_id,
            } => (keys, values, next_leaf_id, parent_id),
            Node::Internal { .. } => unreachable!(),
        };

        let idx = lower_bound(&keys, &key);
        if idx < keys.len() && keys[idx] == key {
            values[idx] = value;
            self.save_node(
                leaf_id,
                &Node::Leaf {
                    parent_id,
                    next_leaf_id,
                    keys,
                    values,
                },
            )?;
            return Ok(true);
        }
        keys.insert(idx, key);
        values.insert(idx, value);

        if keys.len() < self.order {
            self.save_node(
                leaf_id,
                &Node::Leaf {
                    parent_id,
                    next_leaf_id,
                    keys,
                    values,
                },
            )?;
            return Ok(true);
        }

        // Overflow: split the leaf at the midpoint.
        let mid = self.order / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let separator = right_keys[0].clone();

        let new_leaf = Node::Leaf {
            parent_id: NULL_NODE,
            next_leaf_id,
            keys: right_keys,
            values: right_values,
        };
        let new_leaf_id = self.create_node(&new_leaf)?;
        self.save_node(
            leaf_id,
            &Node::Leaf {
                parent_id,
                next_leaf_id: new_leaf_id,
                keys,
                values,
            },
        )?;
        debug!(leaf_id, new_leaf_id, "leaf split");

        self.insert_into_parent(stack, leaf_id, separator, new_leaf_id)
    }

    /// Propagates a separator key / right-child pair up the tree,
    /// splitting internal nodes as needed and creating a new root when
    /// the current root overflows.
    fn insert_into_parent(
        &mut self,
        mut stack: Vec<NodeId>,
        left_id: NodeId,
        mut separator: K,
        mut right_id: NodeId,
    ) -> Result<bool> {
        loop {
            let Some(parent_id) = stack.pop() else {
                // left_id was the root; install a fresh internal root.
                let new_root = Node::Internal {
                    parent_id: NULL_NODE,
                    keys: vec![separator],
                    children: vec![left_id, right_id],
                };
                let new_root_id = self.create_node(&new_root)?;
                self.set_parent(left_id, new_root_id)?;
                self.set_parent(right_id, new_root_id)?;
                self.root_id = new_root_id;
                return Ok(true);
            };

            let (parent_parent_id, mut keys, mut children) = match self.load_node(parent_id)? {
                Node::Internal {
                    parent_id: pp,
                    keys,
                    children,
                } => (pp, keys, children),
                Node::Leaf { .. } => unreachable!(),
            };

            let pos = children
                .iter()
                .position(|&c| c == left_id)
                .expect("left child must be present in its recorded parent");
            keys.insert(pos, separator.clone());
            children.insert(pos + 1, right_id);
            self.set_parent(right_id, parent_id)?;

            if children.len() <= self.order {
                self.save_node(
                    parent_id,
                    &Node::Internal {
                        parent_id: parent_parent_id,
                        keys,
                        children,
                    },
                )?;
                return Ok(true);
            }

            // Overflow: split the internal node, promoting the median key.
            let mid = self.order / 2;
            let promoted = keys[mid].clone();
            let right_keys = keys.split_off(mid + 1);
            keys.truncate(mid);
            let right_children = children.split_off(mid + 1);

            let new_internal = Node::Internal {
                parent_id: NULL_NODE,
                keys: right_keys,
                children: right_children.clone(),
            };
            let new_internal_id = self.create_node(&new_internal)?;
            for child in &right_children {
                self.set_parent(*child, new_internal_id)?;
            }

            self.save_node(
                parent_id,
                &Node::Internal {
                    parent_id: parent_parent_id,
                    keys,
                    children,
                },
            )?;
            debug!(parent_id, new_internal_id, "internal node split");

            separator = promoted;
            right_id = new_internal_id;
            // left_id continues to be `parent_id` at the next level up.
            let _ = left_id;
            return self.insert_into_parent(stack, parent_id, separator, right_id);
        }
    }

    fn set_parent(&self, id: NodeId, parent_id: NodeId) -> Result<()> {
        let mut node = self.load_node(id)?;
        node.set_parent_id(parent_id);
        self.save_node(id, &node)
    }

    /// Removes `key`. Returns `false` if it was absent.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        if self.root_id == NULL_NODE {
            return Ok(false);
        }

        // path[i] = (node_id, child_index taken from that node)
        let mut path: Vec<(NodeId, usize)> = Vec::new();
        let mut current = self.root_id;
        let leaf_id = loop {
            match self.load_node(current)? {
                Node::Internal { keys, children, .. } => {
                    let idx = upper_bound(&keys, key);
                    path.push((current, idx));
                    current = children[idx];
                }
                Node::Leaf { .. } => break current,
            }
        };

        let (parent_id, next_leaf_id, mut keys, mut values) = match self.load_node(leaf_id)? {
            Node::Leaf {
                parent_id,
                next_leaf_id,
                keys,
                values,
            } => (parent_id, next_leaf_id, keys, values),
            Node::Internal { .. } => unreachable!(),
        };

        let idx = lower_bound(&keys, key);
        if idx >= keys.len() || &keys[idx] != key {
            return Ok(false);
        }
        keys.remove(idx);
        values.remove(idx);

        if path.is_empty() {
            // leaf is the root; exempt from the minimum-occupancy rule.
            if keys.is_empty() {
                self.destroy_node(leaf_id);
                self.root_id = NULL_NODE;
            } else {
                self.save_node(
                    leaf_id,
                    &Node::Leaf {
                        parent_id,
                        next_leaf_id,
                        keys,
                        values,
                    },
                )?;
            }
            return Ok(true);
        }

        let min_keys = self.order / 2;
        if keys.len() >= min_keys {
            self.save_node(
                leaf_id,
                &Node::Leaf {
                    parent_id,
                    next_leaf_id,
                    keys,
                    values,
                },
            )?;
            return Ok(true);
        }

        self.rebalance_leaf(leaf_id, keys, values, next_leaf_id, path)?;
        Ok(true)
    }

    fn rebalance_leaf(
        &mut self,
        leaf_id: NodeId,
        mut keys: Vec<K>,
        mut values: Vec<V>,
        next_leaf_id: NodeId,
        mut path: Vec<(NodeId, usize)>,
    ) -> Result<()> {
        let (parent_id, child_index) = path.pop().expect("underflowing leaf has a parent");
        let (parent_parent, mut parent_keys, mut parent_children) = match self.load_node(parent_id)? {
            Node::Internal {
                parent_id: pp,
                keys,
                children,
            } => (pp, keys, children),
            Node::Leaf { .. } => unreachable!(),
        };

        let has_right = child_index + 1 < parent_children.len();
        if has_right {
            let right_id = parent_children[child_index + 1];
            let (right_parent, right_next, right_keys, right_values) = match self.load_node(right_id)? {
                Node::Leaf {
                    parent_id,
                    next_leaf_id,
                    keys,
                    values,
                } => (parent_id, next_leaf_id, keys, values),
                Node::Internal { .. } => unreachable!(),
            };

            if keys.len() + right_keys.len() < self.order {
                // Merge right sibling into this leaf.
                keys.extend(right_keys);
                values.extend(right_values);
                self.save_node(
                    leaf_id,
                    &Node::Leaf {
                        parent_id,
                        next_leaf_id: right_next,
                        keys,
                        values,
                    },
                )?;
                self.destroy_node(right_id);
                parent_keys.remove(child_index);
                parent_children.remove(child_index + 1);
                return self.rebalance_internal(parent_id, parent_parent, parent_keys, parent_children, path);
            } else {
                // Borrow the right sibling's first entry.
                let mut right_keys = right_keys;
                let mut right_values = right_values;
                keys.push(right_keys.remove(0));
                values.push(right_values.remove(0));
                parent_keys[child_index] = right_keys[0].clone();
                self.save_node(
                    leaf_id,
                    &Node::Leaf {
                        parent_id,
                        next_leaf_id,
                        keys,
                        values,
                    },
                )?;
                self.save_node(
                    right_id,
                    &Node::Leaf {
                        parent_id: right_parent,
                        next_leaf_id: right_next,
                        keys: right_keys,
                        values: right_values,
                    },
                )?;
                self.save_node(
                    parent_id,
                    &Node::Internal {
                        parent_id: parent_parent,
                        keys: parent_keys,
                        children: parent_children,
                    },
                )?;
                return Ok(());
            }
        }

        // No right sibling: use the left sibling instead.
        let left_id = parent_children[child_index - 1];
        let (left_parent, left_next, left_keys, left_values) = match self.load_node(left_id)? {
            Node::Leaf {
                parent_id,
                next_leaf_id,
                keys,
                values,
            } => (parent_id, next_leaf_id, keys, values),
            Node::Internal { .. } => unreachable!(),
        };

        if left_keys.len() + keys.len() < self.order {
            let mut merged_keys = left_keys;
            let mut merged_values = left_values;
            merged_keys.extend(keys);
            merged_values.extend(values);
            self.save_node(
                left_id,
                &Node::Leaf {
                    parent_id: left_parent,
                    next_leaf_id,
                    keys: merged_keys,
                    values: merged_values,
                },
            )?;
            self.destroy_node(leaf_id);
            parent_keys.remove(child_index - 1);
            parent_children.remove(child_index);
            self.rebalance_internal(parent_id, parent_parent, parent_keys, parent_children, path)
        } else {
            let mut left_keys = left_keys;
            let mut left_values = left_values;
            let borrowed_key = left_keys.pop().unwrap();
            let borrowed_value = left_values.pop().unwrap();
            keys.insert(0, borrowed_key.clone());
            values.insert(0, borrowed_value);
            parent_keys[child_index - 1] = keys[0].clone();
            self.save_node(
                left_id,
                &Node::Leaf {
                    parent_id: left_parent,
                    next_leaf_id: left_next,
                    keys: left_keys,
                    values: left_values,
                },
            )?;
            self.save_node(
                leaf_id,
                &Node::Leaf {
                    parent_id,
                    next_leaf_id,
                    keys,
                    values,
                },
            )?;
            self.save_node(
                parent_id,
                &Node::Internal {
                    parent_id: parent_parent,
                    keys: parent_keys,
                    children: parent_children,
                },
            )?;
            Ok(())
        }
    }

    fn rebalance_internal(
        &mut self,
        node_id: NodeId,
        parent_id: NodeId,
        mut keys: Vec<K>,
        mut children: Vec<NodeId>,
        mut path: Vec<(NodeId, usize)>,
    ) -> Result<()> {
        let min_children = self.order / 2 + 1;

        if path.is_empty() {
            // node_id is the root.
            if children.len() == 1 {
                let only_child = children[0];
                self.destroy_node(node_id);
                self.set_parent(only_child, NULL_NODE)?;
                self.root_id = only_child;
            } else {
                self.save_node(
                    node_id,
                    &Node::Internal {
                        parent_id,
                        keys,
                        children,
                    },
                )?;
            }
            return Ok(());
        }

        if children.len() >= min_children {
            self.save_node(
                node_id,
                &Node::Internal {
                    parent_id,
                    keys,
                    children,
                },
            )?;
            return Ok(());
        }

        let (grandparent_id, child_index) = path.pop().expect("underflowing internal node has a parent");
        let (grandparent_parent, mut gp_keys, mut gp_children) = match self.load_node(grandparent_id)? {
            Node::Internal {
                parent_id: pp,
                keys,
                children,
            } => (pp, keys, children),
            Node::Leaf { .. } => unreachable!(),
        };

        let has_right = child_index + 1 < gp_children.len();
        if has_right {
            let right_id = gp_children[child_index + 1];
            let (right_keys, right_children) = match self.load_node(right_id)? {
                Node::Internal { keys, children, .. } => (keys, children),
                Node::Leaf { .. } => unreachable!(),
            };
            let separator = gp_keys[child_index].clone();

            if children.len() + right_children.len() <= self.order {
                keys.push(separator);
                keys.extend(right_keys);
                children.extend(right_children.iter().copied());
                for child in &right_children {
                    self.set_parent(*child, node_id)?;
                }
                self.save_node(
                    node_id,
                    &Node::Internal {
                        parent_id,
                        keys,
                        children,
                    },
                )?;
                self.destroy_node(right_id);
                gp_keys.remove(child_index);
                gp_children.remove(child_index + 1);
                self.rebalance_internal(grandparent_id, grandparent_parent, gp_keys, gp_children, path)
            } else {
                let mut right_keys = right_keys;
                let mut right_children = right_children;
                keys.push(separator);
                let moved_child = right_children.remove(0);
                self.set_parent(moved_child, node_id)?;
                children.push(moved_child);
                gp_keys[child_index] = right_keys.remove(0);

                self.save_node(
                    node_id,
                    &Node::Internal {
                        parent_id,
                        keys,
                        children,
                    },
                )?;
                self.save_node(
                    right_id,
                    &Node::Internal {
                        parent_id: grandparent_id,
                        keys: right_keys,
                        children: right_children,
                    },
                )?;
                self.save_node(
                    grandparent_id,
                    &Node::Internal {
                        parent_id: grandparent_parent,
                        keys: gp_keys,
                        children: gp_children,
                    },
                )?;
                Ok(())
            }
        } else {
            let left_id = gp_children[child_index - 1];
            let (left_keys, left_children) = match self.load_node(left_id)? {
                Node::Internal { keys, children, .. } => (keys, children),
                Node::Leaf { .. } => unreachable!(),
            };
            let separator = gp_keys[child_index - 1].clone();

            if left_children.len() + children.len() <= self.order {
                let mut merged_keys = left_keys;
                merged_keys.push(separator);
                merged_keys.extend(keys);
                let mut merged_children = left_children;
                for child in &children {
                    self.set_parent(*child, left_id)?;
                }
                merged_children.extend(children.iter().copied());

                self.save_node(
                    left_id,
                    &Node::Internal {
                        parent_id: grandparent_id,
                        keys: merged_keys,
                        children: merged_children,
                    },
                )?;
                self.destroy_node(node_id);
                gp_keys.remove(child_index - 1);
                gp_children.remove(child_index);
                self.rebalance_internal(grandparent_id, grandparent_parent, gp_keys, gp_children, path)
            } else {
                let mut left_keys = left_keys;
                let mut left_children = left_children;
                keys.insert(0, separator);
                let moved_child = left_children.pop().unwrap();
                self.set_parent(moved_child, node_id)?;
                children.insert(0, moved_child);
                gp_keys[child_index - 1] = left_keys.pop().unwrap();

                self.save_node(
                    node_id,
                    &Node::Internal {
                        parent_id,
                        keys,
                        children,
                    },
                )?;
                self.save_node(
                    left_id,
                    &Node::Internal {
                        parent_id: grandparent_id,
                        keys: left_keys,
                        children: left_children,
                    },
                )?;
                self.save_node(
                    grandparent_id,
                    &Node::Internal {
                        parent_id: grandparent_parent,
                        keys: gp_keys,
                        children: gp_children,
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Walks every node from the root, checking the order's occupancy and
    /// depth invariants. Intended for tests, not hot-path use.
    pub fn check_invariants(&self) -> Result<()> {
        if self.root_id == NULL_NODE {
            return Ok(());
        }
        let mut leaf_depth: Option<usize> = None;
        self.check_node(self.root_id, true, 0, &mut leaf_depth)
    }

    fn check_node(
        &self,
        id: NodeId,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        match self.load_node(id)? {
            Node::Leaf { keys, values, .. } => {
                assert_eq!(keys.len(), values.len());
                if !is_root {
                    assert!(keys.len() >= self.order / 2, "leaf underflow");
                }
                match leaf_depth {
                    Some(d) => assert_eq!(*d, depth, "uneven leaf depth"),
                    None => *leaf_depth = Some(depth),
                }
                Ok(())
            }
            Node::Internal { keys, children, .. } => {
                assert_eq!(children.len(), keys.len() + 1);
                if !is_root {
                    assert!(children.len() >= self.order / 2 + 1, "internal underflow");
                }
                for child in &children {
                    self.check_node(*child, false, depth + 1, leaf_depth)?;
                }
                Ok(())
            }
        }
    }
}

/// Indentation-based tree dump: one line per node, children nested under
/// their parent. Best-effort — a load failure mid-walk prints an inline
/// marker instead of aborting the whole `Display::fmt` call, since `fmt`
/// cannot propagate a [`crate::error::DbError`].
impl<K, V> std::fmt::Display for BPlusTreeIndex<K, V>
where
    K: FixedWidth + Ord + std::fmt::Debug,
    V: FixedWidth + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.root_id == NULL_NODE {
            return writeln!(f, "<empty tree>");
        }
        self.fmt_node(f, self.root_id, 0)
    }
}

impl<K, V> BPlusTreeIndex<K, V>
where
    K: FixedWidth + Ord + std::fmt::Debug,
    V: FixedWidth + std::fmt::Debug,
{
    fn fmt_node(&self, f: &mut std::fmt::Formatter<'_>, id: NodeId, depth: usize) -> std::fmt::Result {
        let indent = "  ".repeat(depth);
        match self.load_node(id) {
            Err(e) => writeln!(f, "{indent}<node {id} failed to load: {e}>"),
            Ok(Node::Leaf { keys, values, next_leaf_id, .. }) => {
                writeln!(
                    f,
                    "{indent}leaf#{id} keys={keys:?} values={values:?} next={next_leaf_id}"
                )
            }
            Ok(Node::Internal { keys, children, .. }) => {
                writeln!(f, "{indent}internal#{id} keys={keys:?}")?;
                for child in children {
                    self.fmt_node(f, child, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AccessType;
    use crate::storage::buffer::BufferManager;
    use crate::storage::disk::Disk;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fresh_buffer(block_count: u64) -> (SharedBuffer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::new(AccessType::Random, 256, block_count, dir.path().join("disk.dat")).unwrap();
        let bm = BufferManager::new(disk, crate::common::ReplacementStrategy::Lru, 256 * 4).unwrap();
        (Rc::new(RefCell::new(bm)), dir)
    }

    #[test]
    fn insert_and_search_basic() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        tree.insert(10, 100)?;
        tree.insert(20, 200)?;
        tree.insert(5, 50)?;
        tree.insert(6, 60)?;
        assert_eq!(tree.search(&10)?, Some(100));
        assert_eq!(tree.search(&99)?, None);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn splitting_a_full_leaf_builds_a_three_node_tree() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        tree.insert(10, 1)?; // a
        tree.insert(20, 2)?; // b
        tree.insert(5, 3)?; // c
        tree.insert(6, 4)?; // d -- forces the first split

        assert_eq!(tree.search(&10)?, Some(1));
        let range = tree.range_search(&6, &15)?;
        assert_eq!(range, vec![(6, 4), (10, 1)]);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn leaf_underflow_redistributes_from_sibling() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        tree.insert(10, 1)?;
        tree.insert(20, 2)?;
        tree.insert(5, 3)?;
        tree.insert(6, 4)?;

        assert!(tree.remove(&5)?);
        assert_eq!(tree.search(&5)?, None);
        assert_eq!(tree.search(&6)?, Some(4));
        assert_eq!(tree.search(&10)?, Some(1));
        assert_eq!(tree.search(&20)?, Some(2));
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn iteration_yields_ascending_order() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(128);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        for k in [50, 10, 40, 20, 30, 5, 45, 25] {
            tree.insert(k, k * 10)?;
        }
        let all = tree.iter_all()?;
        let keys: Vec<i32> = all.iter().map(|(k, _)| *k).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        tree.check_invariants()?;
        Ok(())
    }

    #[test]
    fn insert_then_remove_all_empties_the_tree() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(128);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        let keys: Vec<i32> = (0..30).collect();
        for &k in &keys {
            tree.insert(k, k)?;
        }
        tree.check_invariants()?;
        for &k in &keys {
            assert!(tree.remove(&k)?);
        }
        assert_eq!(tree.iter_all()?, Vec::new());
        assert_eq!(tree.root_id, NULL_NODE);
        Ok(())
    }

    #[test]
    fn duplicate_insert_overwrites_value() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        tree.insert(1, 100)?;
        tree.insert(1, 200)?;
        assert_eq!(tree.search(&1)?, Some(200));
        Ok(())
    }

    #[test]
    fn display_dumps_one_line_per_node() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        tree.insert(10, 1)?;
        tree.insert(20, 2)?;
        tree.insert(5, 3)?;
        tree.insert(6, 4)?;
        let dump = format!("{tree}");
        assert!(dump.contains("internal#"));
        assert!(dump.contains("leaf#"));
        Ok(())
    }

    #[test]
    fn display_on_empty_tree_says_so() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let tree: BPlusTreeIndex<i32, i32> = BPlusTreeIndex::new(buffer, 4, 0)?;
        assert_eq!(format!("{tree}"), "<empty tree>\n");
        Ok(())
    }
}
