//! Hierarchical directory layer
//!
//! A directory maps a named path (`["schemaManager", "online", "3"]`) to a
//! stable allocated byte prefix. Data keys are built by packing tuples
//! onto the prefix; sibling prefixes never nest, so renaming a directory
//! re-points the path without touching data.
//!
//! Layout: node metadata lives under the reserved `0xFE` byte, keyed by
//! the packed path tuple, valued with the allocated data prefix. The
//! prefix allocator counter lives at the single-byte `0xFD` key. All
//! operations run inside a caller-supplied transaction.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::store::Transaction;
use crate::tuple::{self, Element};

const NODE_SUBSPACE: u8 = 0xFE;
const ALLOCATOR_KEY: [u8; 1] = [0xFD];

/// A handle to an opened directory: its path and data prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    path: Vec<String>,
    prefix: Vec<u8>,
}

impl Directory {
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Key for a tuple under this directory.
    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple::pack(elements));
        key
    }

    /// Key for a single element under this directory.
    pub fn pack_one(&self, element: impl Into<Element>) -> Vec<u8> {
        self.pack(&[element.into()])
    }

    /// The `(start, end)` range covering every key under this directory.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let end = tuple::strinc(&self.prefix).expect("directory prefix has an upper bound");
        (self.prefix.clone(), end)
    }

    /// Strip this directory's prefix from a key inside it.
    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>> {
        let suffix = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or_else(|| Error::Tuple("key not under directory prefix".to_string()))?;
        tuple::unpack(suffix)
    }
}

fn node_key(path: &[impl AsRef<str>]) -> Vec<u8> {
    let elements: Vec<Element> = path
        .iter()
        .map(|c| Element::Str(c.as_ref().to_string()))
        .collect();
    let mut key = vec![NODE_SUBSPACE];
    key.extend_from_slice(&tuple::pack(&elements));
    key
}

fn path_string(path: &[impl AsRef<str>]) -> String {
    path.iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

fn allocate_prefix(txn: &mut Transaction<'_>) -> Result<Vec<u8>> {
    let next = match txn.get(&ALLOCATOR_KEY)? {
        Some(raw) => tuple::unpack(&raw)?[0].as_int()? + 1,
        None => 1,
    };
    txn.set(&ALLOCATOR_KEY, &tuple::pack_one(next));
    Ok(tuple::pack_one(next))
}

/// Open an existing directory, failing if any path component is missing.
pub fn open(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<Directory> {
    if path.is_empty() {
        return Err(Error::NoSuchDirectory("<root>".to_string()));
    }
    match txn.get(&node_key(path))? {
        Some(prefix) => Ok(Directory {
            path: path.iter().map(|c| c.as_ref().to_string()).collect(),
            prefix,
        }),
        None => Err(Error::NoSuchDirectory(path_string(path))),
    }
}

/// Open a directory, creating it and any missing parents.
pub fn create_or_open(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<Directory> {
    if path.is_empty() {
        return Err(Error::NoSuchDirectory("<root>".to_string()));
    }
    let mut prefix = Vec::new();
    for depth in 1..=path.len() {
        let key = node_key(&path[..depth]);
        prefix = match txn.get(&key)? {
            Some(existing) => existing,
            None => {
                let allocated = allocate_prefix(txn)?;
                txn.set(&key, &allocated);
                allocated
            }
        };
    }
    Ok(Directory {
        path: path.iter().map(|c| c.as_ref().to_string()).collect(),
        prefix,
    })
}

/// Create a directory that must not already exist.
pub fn create(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<Directory> {
    if exists(txn, path)? {
        return Err(Error::DirectoryExists(path_string(path)));
    }
    create_or_open(txn, path)
}

pub fn exists(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<bool> {
    if path.is_empty() {
        return Ok(true);
    }
    Ok(txn.get(&node_key(path))?.is_some())
}

/// Immediate child names of `path`, sorted. The root path lists
/// top-level directories.
pub fn list(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<Vec<String>> {
    if !exists(txn, path)? {
        return Err(Error::NoSuchDirectory(path_string(path)));
    }
    let parent_len = path.len();
    let node = node_key(path);
    let mut start = node.clone();
    start.push(0x00);
    let end = tuple::strinc(&node)?;

    let mut children = BTreeSet::new();
    for (key, _) in txn.get_range(&start, &end)? {
        let components = tuple::unpack(&key[1..])?;
        if components.len() > parent_len {
            children.insert(components[parent_len].as_str()?.to_string());
        }
    }
    Ok(children.into_iter().collect())
}

/// Remove a directory: its node, all descendant nodes, and every node's
/// data range.
pub fn remove(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<()> {
    if !remove_if_exists(txn, path)? {
        return Err(Error::NoSuchDirectory(path_string(path)));
    }
    Ok(())
}

/// Remove a directory subtree if present, reporting whether it existed.
pub fn remove_if_exists(txn: &mut Transaction<'_>, path: &[impl AsRef<str>]) -> Result<bool> {
    if path.is_empty() || !exists(txn, path)? {
        return Ok(false);
    }
    let node = node_key(path);
    let end = tuple::strinc(&node)?;
    for (key, data_prefix) in txn.get_range(&node, &end)? {
        let data_end = tuple::strinc(&data_prefix)?;
        txn.clear_range(&data_prefix, &data_end);
        txn.clear(&key);
    }
    Ok(true)
}

/// Re-point `from` (and its whole subtree) to the path `to`. Allocated
/// prefixes move with the nodes, so data is untouched. The destination's
/// parent must already exist.
pub fn rename(
    txn: &mut Transaction<'_>,
    from: &[impl AsRef<str>],
    to: &[impl AsRef<str>],
) -> Result<()> {
    if from.is_empty() || to.is_empty() {
        return Err(Error::NoSuchDirectory("<root>".to_string()));
    }
    if !exists(txn, from)? {
        return Err(Error::NoSuchDirectory(path_string(from)));
    }
    if exists(txn, to)? {
        return Err(Error::DirectoryExists(path_string(to)));
    }
    if !exists(txn, &to[..to.len() - 1])? {
        return Err(Error::NoSuchDirectory(path_string(&to[..to.len() - 1])));
    }

    let to_components: Vec<String> = to.iter().map(|c| c.as_ref().to_string()).collect();
    let from_node = node_key(from);
    let end = tuple::strinc(&from_node)?;
    for (key, data_prefix) in txn.get_range(&from_node, &end)? {
        let components = tuple::unpack(&key[1..])?;
        let mut new_path = to_components.clone();
        for suffix in &components[from.len()..] {
            new_path.push(suffix.as_str()?.to_string());
        }
        txn.clear(&key);
        txn.set(&node_key(&new_path), &data_prefix);
    }
    Ok(())
}
