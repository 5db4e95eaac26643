use crate::core::{DType, Error, Result, Shape, Tensor};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum WeightNode<T> {
    Leaf(T),
    Group(BTreeMap<String, WeightNode<T>>),
}

/// Slash-separated hierarchy of named leaves, e.g. `model/h3/attn/c_attn/w`.
#[derive(Debug, Clone)]
pub struct WeightTree<T> {
    root: BTreeMap<String, WeightNode<T>>,
}

pub type WeightRegistry = WeightTree<Tensor>;
pub type ModelDesc = WeightTree<TensorDesc>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(dims: &[usize], dtype: DType) -> Self {
        Self {
            shape: Shape::from_slice(dims),
            dtype,
        }
    }

    pub fn of(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
        }
    }
}

impl<T> WeightTree<T> {
    pub fn new() -> Self {
        Self { root: BTreeMap::new() }
    }

    pub fn insert(&mut self, path: &str, value: T) -> Result<()> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::format(format!("Invalid weight path '{}'", path)));
        }

        let (leaf, groups) = parts.split_last().ok_or_else(|| Error::format("Empty weight path"))?;
        let mut current = &mut self.root;
        for part in groups {
            let node = current
                .entry(part.to_string())
                .or_insert_with(|| WeightNode::Group(BTreeMap::new()));
            current = match node {
                WeightNode::Group(children) => children,
                WeightNode::Leaf(_) => {
                    return Err(Error::format(format!("'{}' in path '{}' is a tensor, not a group", part, path)))
                }
            };
        }

        if let Some(WeightNode::Group(_)) = current.get(*leaf) {
            return Err(Error::format(format!("'{}' is a group, not a tensor", path)));
        }
        current.insert(leaf.to_string(), WeightNode::Leaf(value));
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<&T> {
        let mut current = &self.root;
        let mut parts = path.split('/').peekable();
        while let Some(part) = parts.next() {
            match (current.get(part), parts.peek()) {
                (Some(WeightNode::Leaf(value)), None) => return Ok(value),
                (Some(WeightNode::Group(children)), Some(_)) => current = children,
                _ => break,
            }
        }
        Err(Error::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Every leaf keyed by its full path. Ordering is lexicographic.
    pub fn flatten(&self) -> BTreeMap<String, &T> {
        fn walk<'a, T>(
            nodes: &'a BTreeMap<String, WeightNode<T>>,
            prefix: Option<&str>,
            out: &mut BTreeMap<String, &'a T>,
        ) {
            for (name, node) in nodes {
                let path = match prefix {
                    Some(p) => format!("{}/{}", p, name),
                    None => name.clone(),
                };
                match node {
                    WeightNode::Leaf(value) => {
                        out.insert(path, value);
                    }
                    WeightNode::Group(children) => walk(children, Some(&path), out),
                }
            }
        }

        let mut out = BTreeMap::new();
        walk(&self.root, None, &mut out);
        out
    }

    pub fn map<U, F>(&self, mut f: F) -> WeightTree<U>
    where
        F: FnMut(&str, &T) -> U,
    {
        let mut mapped = WeightTree::new();
        for (path, value) in self.flatten() {
            let leaf = f(&path, value);
            // paths come from an existing tree, so they cannot conflict
            let _ = mapped.insert(&path, leaf);
        }
        mapped
    }

    pub fn len(&self) -> usize {
        self.flatten().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<T> Default for WeightTree<T> {
    fn default() -> Self {
        Self::new()
    }
}
