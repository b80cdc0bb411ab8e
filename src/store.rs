//! In-memory hierarchical metadata store.
//!
//! Nodes live in an arena and are addressed by normalised slash-separated
//! paths. Groups hold named children and attributes, datasets hold typed
//! arrays. A separate three-way index maps catalog `id`, human `name` and
//! `path` onto each other for everything the crawler registers.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::domain::{NodeKind, RemoteId};
use crate::error::SyncError;

pub const ROOT_PATH: &str = "/";
pub const ROOT_NAME: &str = "root";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Text(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(value) => Some(value),
            AttrValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            AttrValue::Text(value) => value.parse().ok(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<&RemoteId> for AttrValue {
    fn from(value: &RemoteId) -> Self {
        match value {
            RemoteId::Int(id) => AttrValue::Int(*id),
            RemoteId::Text(id) => AttrValue::Text(id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DatasetValues {
    Int(Vec<i64>),
    Text(Vec<String>),
}

impl DatasetValues {
    pub fn len(&self) -> usize {
        match self {
            DatasetValues::Int(values) => values.len(),
            DatasetValues::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every value rendered as text; integers are formatted.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            DatasetValues::Int(values) => values.iter().map(|value| value.to_string()).collect(),
            DatasetValues::Text(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub path: String,
    pub kind: NodeKind,
    pub children: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub path: String,
    pub values: DatasetValues,
}

#[derive(Debug, Clone, Serialize)]
pub enum Node {
    Group(Group),
    Dataset(Dataset),
}

/// One registered `(id, name, path)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub id: RemoteId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    nodes: Vec<Node>,
    paths: HashMap<String, usize>,
    entries: Vec<IndexEntry>,
    by_id: HashMap<RemoteId, usize>,
    by_name: HashMap<String, usize>,
    by_path: HashMap<String, usize>,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        let root = Group {
            path: ROOT_PATH.to_string(),
            kind: NodeKind::Root,
            children: Vec::new(),
            attrs: BTreeMap::new(),
        };
        let mut store = Self {
            nodes: vec![Node::Group(root)],
            paths: HashMap::from([(ROOT_PATH.to_string(), 0)]),
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_path: HashMap::new(),
        };
        store.insert_entry(IndexEntry {
            id: RemoteId::from(ROOT_PATH),
            name: ROOT_NAME.to_string(),
            path: ROOT_PATH.to_string(),
        });
        if let Some(Node::Group(root)) = store.nodes.first_mut() {
            root.attrs.insert("dbid".to_string(), AttrValue::from(ROOT_PATH));
            root.attrs.insert("name".to_string(), AttrValue::from(ROOT_NAME));
        }
        store
    }

    /// Create an empty group; intermediate segments become groups.
    pub fn create_group(&mut self, path: &str) -> Result<&mut Group, SyncError> {
        let path = normalize_path(path);
        if self.paths.contains_key(&path) {
            return Err(SyncError::AlreadyExists(path));
        }
        let index = self.insert_node(&path, |path| {
            Node::Group(Group {
                path: path.to_string(),
                kind: NodeKind::Resource,
                children: Vec::new(),
                attrs: BTreeMap::new(),
            })
        })?;
        self.group_at_mut(index, &path)
    }

    /// Like [`create_group`](Self::create_group) but returns an existing group untouched.
    pub fn ensure_group(&mut self, path: &str) -> Result<&mut Group, SyncError> {
        let normalized = normalize_path(path);
        match self.paths.get(&normalized).copied() {
            Some(index) => self.group_at_mut(index, &normalized),
            None => self.create_group(&normalized),
        }
    }

    pub fn create_dataset(&mut self, path: &str, values: DatasetValues) -> Result<(), SyncError> {
        let path = normalize_path(path);
        if path == ROOT_PATH || self.paths.contains_key(&path) {
            return Err(SyncError::AlreadyExists(path));
        }
        self.insert_node(&path, move |path| {
            Node::Dataset(Dataset {
                path: path.to_string(),
                values,
            })
        })?;
        Ok(())
    }

    /// Create or replace a dataset. Fails if `path` is a group.
    pub fn write_dataset(&mut self, path: &str, values: DatasetValues) -> Result<(), SyncError> {
        let normalized = normalize_path(path);
        match self.paths.get(&normalized).copied() {
            Some(index) => match &mut self.nodes[index] {
                Node::Dataset(dataset) => {
                    dataset.values = values;
                    Ok(())
                }
                Node::Group(_) => Err(SyncError::AlreadyExists(normalized)),
            },
            None => self.create_dataset(&normalized, values),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(&normalize_path(path))
    }

    pub fn group(&self, path: &str) -> Result<&Group, SyncError> {
        let path = normalize_path(path);
        match self.paths.get(&path).map(|index| &self.nodes[*index]) {
            Some(Node::Group(group)) => Ok(group),
            _ => Err(SyncError::NotFound(format!("group {path}"))),
        }
    }

    pub fn group_mut(&mut self, path: &str) -> Result<&mut Group, SyncError> {
        let path = normalize_path(path);
        let index = self
            .paths
            .get(&path)
            .copied()
            .ok_or_else(|| SyncError::NotFound(format!("group {path}")))?;
        self.group_at_mut(index, &path)
    }

    pub fn dataset(&self, path: &str) -> Result<&Dataset, SyncError> {
        let path = normalize_path(path);
        match self.paths.get(&path).map(|index| &self.nodes[*index]) {
            Some(Node::Dataset(dataset)) => Ok(dataset),
            _ => Err(SyncError::NotFound(format!("dataset {path}"))),
        }
    }

    pub fn text_values(&self, path: &str) -> Result<Vec<String>, SyncError> {
        Ok(self.dataset(path)?.values.to_strings())
    }

    pub fn int_values(&self, path: &str) -> Result<&[i64], SyncError> {
        match &self.dataset(path)?.values {
            DatasetValues::Int(values) => Ok(values),
            DatasetValues::Text(_) => Err(SyncError::NotFound(format!(
                "integer dataset {}",
                normalize_path(path)
            ))),
        }
    }

    /// Child names of a group. Only name-based lookup is order-sensitive.
    pub fn children(&self, path: &str) -> Result<&[String], SyncError> {
        Ok(&self.group(path)?.children)
    }

    pub fn set_attr(
        &mut self,
        path: &str,
        key: &str,
        value: impl Into<AttrValue>,
    ) -> Result<(), SyncError> {
        self.group_mut(path)?
            .attrs
            .insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn attr(&self, path: &str, key: &str) -> Option<&AttrValue> {
        self.group(path).ok().and_then(|group| group.attrs.get(key))
    }

    /// Catalog version stamp recorded by the crawler.
    pub fn catalog_version(&self) -> Option<String> {
        self.attr(ROOT_PATH, "version").map(|value| match value {
            AttrValue::Text(text) => text.clone(),
            AttrValue::Int(number) => number.to_string(),
        })
    }

    /// Register a triple in the three-way index.
    ///
    /// Re-registering an identical triple is a no-op; a triple that shares
    /// any key with a cached entry but differs elsewhere is an
    /// [`SyncError::IndexConflict`].
    pub fn add(&mut self, id: RemoteId, name: &str, path: &str) -> Result<(), SyncError> {
        let offered = IndexEntry {
            id,
            name: name.to_string(),
            path: normalize_path(path),
        };
        let cached = self
            .by_id
            .get(&offered.id)
            .map(|index| ("id", offered.id.to_string(), *index))
            .or_else(|| {
                self.by_name
                    .get(&offered.name)
                    .map(|index| ("name", offered.name.clone(), *index))
            })
            .or_else(|| {
                self.by_path
                    .get(&offered.path)
                    .map(|index| ("path", offered.path.clone(), *index))
            });

        match cached {
            Some((_, _, index)) if self.entries[index] == offered => Ok(()),
            Some((field, key, index)) => Err(SyncError::IndexConflict {
                key: format!("{field} {key}"),
                cached: describe(&self.entries[index]),
                offered: describe(&offered),
            }),
            None => {
                self.insert_entry(offered);
                Ok(())
            }
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<&IndexEntry, SyncError> {
        self.by_name
            .get(name)
            .map(|index| &self.entries[*index])
            .ok_or_else(|| SyncError::NotFound(format!("name {name}")))
    }

    pub fn lookup_by_path(&self, path: &str) -> Result<&IndexEntry, SyncError> {
        let path = normalize_path(path);
        self.by_path
            .get(&path)
            .map(|index| &self.entries[*index])
            .ok_or_else(|| SyncError::NotFound(format!("path {path}")))
    }

    pub fn lookup_by_id(&self, id: &RemoteId) -> Result<&IndexEntry, SyncError> {
        self.by_id
            .get(id)
            .map(|index| &self.entries[*index])
            .ok_or_else(|| SyncError::NotFound(format!("id {id}")))
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn insert_entry(&mut self, entry: IndexEntry) {
        let index = self.entries.len();
        self.by_id.insert(entry.id.clone(), index);
        self.by_name.insert(entry.name.clone(), index);
        self.by_path.insert(entry.path.clone(), index);
        self.entries.push(entry);
    }

    fn insert_node<F>(&mut self, path: &str, make: F) -> Result<usize, SyncError>
    where
        F: FnOnce(&str) -> Node,
    {
        let segments = path_segments(path);
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(SyncError::AlreadyExists(ROOT_PATH.to_string()));
        };

        let mut parent_path = ROOT_PATH.to_string();
        for segment in parents {
            let child_path = child_path(&parent_path, segment);
            match self.paths.get(&child_path).map(|index| &self.nodes[*index]) {
                Some(Node::Group(_)) => {}
                Some(Node::Dataset(_)) => return Err(SyncError::AlreadyExists(child_path)),
                None => {
                    let group = Node::Group(Group {
                        path: child_path.clone(),
                        kind: NodeKind::Resource,
                        children: Vec::new(),
                        attrs: BTreeMap::new(),
                    });
                    self.push_child(&parent_path, segment, &child_path, group)?;
                }
            }
            parent_path = child_path;
        }

        let leaf_path = child_path(&parent_path, leaf);
        let node = make(&leaf_path);
        self.push_child(&parent_path, leaf, &leaf_path, node)
    }

    fn push_child(
        &mut self,
        parent_path: &str,
        name: &str,
        path: &str,
        node: Node,
    ) -> Result<usize, SyncError> {
        let parent = self
            .paths
            .get(parent_path)
            .copied()
            .ok_or_else(|| SyncError::NotFound(format!("group {parent_path}")))?;
        match &mut self.nodes[parent] {
            Node::Group(group) => group.children.push(name.to_string()),
            Node::Dataset(_) => return Err(SyncError::AlreadyExists(parent_path.to_string())),
        }
        let index = self.nodes.len();
        self.nodes.push(node);
        self.paths.insert(path.to_string(), index);
        Ok(index)
    }

    fn group_at_mut(&mut self, index: usize, path: &str) -> Result<&mut Group, SyncError> {
        match &mut self.nodes[index] {
            Node::Group(group) => Ok(group),
            Node::Dataset(_) => Err(SyncError::AlreadyExists(path.to_string())),
        }
    }
}

fn describe(entry: &IndexEntry) -> String {
    format!("({}, {}, {})", entry.id, entry.name, entry.path)
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Collapse duplicate and trailing slashes into `/a/b` form.
pub fn normalize_path(path: &str) -> String {
    let segments = path_segments(path);
    if segments.is_empty() {
        ROOT_PATH.to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// POSIX-style join used for catalog paths.
pub fn join_path(base: &str, name: &str) -> String {
    normalize_path(&format!("{base}/{name}"))
}
