use std::collections::{BTreeMap, VecDeque};
use std::{error, fmt};

use super::key::PathKey;

/// A radix-style map from [`PathKey`]s to values.
///
/// Each unique path prefix owns one node; a node carries at most one
/// non-wildcard binding (an exact match at that path) and at most one
/// wildcard binding (matching that path and anything deeper). Lookups
/// fall back to the longest-prefix wildcard binding.
pub struct TreePathMap<V> {
    root: Node<V>,
    size: usize,
}

struct Node<V> {
    children: BTreeMap<String, Node<V>>,
    exact: Option<Binding<V>>,
    wildcard: Option<Binding<V>>,
}

struct Binding<V> {
    key: PathKey,
    value: V,
}

/// A successful lookup: the winning binding's key, the searched path
/// beyond it, and the bound value.
#[derive(Debug)]
pub struct Found<'a, V> {
    pub key: &'a PathKey,
    pub key_remainder: PathKey,
    pub value: &'a V,
}

/// Rejected insertion of a `(path, wildcard)` pair that is already
/// bound.
#[derive(Debug)]
pub struct DuplicateKey {
    key: PathKey,
}

impl DuplicateKey {
    pub fn key(&self) -> &PathKey {
        &self.key
    }
}

impl fmt::Display for DuplicateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key already bound: {}", self.key)
    }
}

impl error::Error for DuplicateKey {}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            exact: None,
            wildcard: None,
        }
    }
}

impl<V> Default for TreePathMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for TreePathMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries().map(|(key, value)| (key.to_string(), value)))
            .finish()
    }
}

impl<V> TreePathMap<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bind `key` to `value`.
    ///
    /// A wildcard and a non-wildcard binding may coexist at the same
    /// path, but a given `(path, wildcard)` pair may be bound only once.
    pub fn add(&mut self, key: &PathKey, value: V) -> Result<(), DuplicateKey> {
        let mut node = &mut self.root;
        for component in key.components() {
            node = node.children.entry(component.clone()).or_default();
        }
        let slot = if key.is_wildcard() {
            &mut node.wildcard
        } else {
            &mut node.exact
        };
        if slot.is_some() {
            return Err(DuplicateKey { key: key.clone() });
        }
        *slot = Some(Binding {
            key: key.clone(),
            value,
        });
        self.size += 1;
        Ok(())
    }

    /// The value bound to exactly this `(path, wildcard)` pair, with no
    /// fallback.
    pub fn get(&self, key: &PathKey) -> Option<&V> {
        let mut node = &self.root;
        for component in key.components() {
            node = node.children.get(component)?;
        }
        let slot = if key.is_wildcard() {
            &node.wildcard
        } else {
            &node.exact
        };
        slot.as_ref().map(|binding| &binding.value)
    }

    /// Find the most specific binding matching `key`.
    ///
    /// A non-wildcard search prefers an exact binding at the full path,
    /// then the deepest wildcard binding along it. A wildcard search
    /// considers only wildcard bindings.
    pub fn find(&self, key: &PathKey) -> Option<Found<'_, V>> {
        let mut node = &self.root;
        let mut best = node.wildcard.as_ref().map(|binding| (binding, 0));
        let mut consumed = 0;

        for component in key.components() {
            let Some(child) = node.children.get(component) else {
                break;
            };
            node = child;
            consumed += 1;
            if let Some(binding) = &node.wildcard {
                best = Some((binding, consumed));
            }
        }

        if consumed == key.len() && !key.is_wildcard() {
            if let Some(binding) = &node.exact {
                return Some(self.found(binding, key, key.len()));
            }
        }
        best.map(|(binding, depth)| self.found(binding, key, depth))
    }

    /// Find the same winner as [`find`](Self::find), followed by every
    /// other wildcard binding on the traversal path in decreasing order
    /// of specificity.
    pub fn find_with_fallback(&self, key: &PathKey) -> impl Iterator<Item = Found<'_, V>> {
        let mut wildcards: Vec<(&Binding<V>, usize)> = Vec::new();
        let mut node = &self.root;
        if let Some(binding) = &node.wildcard {
            wildcards.push((binding, 0));
        }
        let mut consumed = 0;
        for component in key.components() {
            let Some(child) = node.children.get(component) else {
                break;
            };
            node = child;
            consumed += 1;
            if let Some(binding) = &node.wildcard {
                wildcards.push((binding, consumed));
            }
        }

        let mut results = Vec::with_capacity(wildcards.len() + 1);
        if consumed == key.len() && !key.is_wildcard() {
            if let Some(binding) = &node.exact {
                results.push(self.found(binding, key, key.len()));
            }
        }
        for (binding, depth) in wildcards.into_iter().rev() {
            results.push(self.found(binding, key, depth));
        }
        results.into_iter()
    }

    /// Extract the bindings matched by `key` into a fresh map.
    ///
    /// For a wildcard key this is every binding whose path starts with
    /// `key`'s path, under its original key. For a non-wildcard key it
    /// is the single binding a [`find`](Self::find) would return.
    pub fn find_subtree(&self, key: &PathKey) -> TreePathMap<V>
    where
        V: Clone,
    {
        let mut out = TreePathMap::new();
        if !key.is_wildcard() {
            if let Some(found) = self.find(key) {
                out.add(found.key, found.value.clone())
                    .expect("fresh map has no duplicates");
            }
            return out;
        }

        let mut node = &self.root;
        for component in key.components() {
            match node.children.get(component) {
                Some(child) => node = child,
                None => return out,
            }
        }
        collect_subtree(node, &mut out);
        out
    }

    /// Iterate over all bindings: shorter paths before longer,
    /// non-wildcard before wildcard at the same path, children in
    /// lexicographic order.
    pub fn entries(&self) -> Entries<'_, V> {
        let mut nodes = VecDeque::new();
        nodes.push_back(&self.root);
        Entries {
            nodes,
            pending: VecDeque::new(),
        }
    }

    fn found<'a>(&self, binding: &'a Binding<V>, key: &PathKey, depth: usize) -> Found<'a, V> {
        Found {
            key: &binding.key,
            key_remainder: key
                .slice(depth..key.len())
                .with_wildcard(key.is_wildcard()),
            value: &binding.value,
        }
    }
}

fn collect_subtree<'a, V: Clone>(node: &'a Node<V>, out: &mut TreePathMap<V>) {
    for binding in [&node.exact, &node.wildcard].into_iter().flatten() {
        out.add(&binding.key, binding.value.clone())
            .expect("source map has no duplicates");
    }
    for child in node.children.values() {
        collect_subtree(child, out);
    }
}

/// Breadth-first iterator over a map's bindings, in the documented
/// entry order.
pub struct Entries<'a, V> {
    nodes: VecDeque<&'a Node<V>>,
    pending: VecDeque<(&'a PathKey, &'a V)>,
}

impl<'a, V> Iterator for Entries<'a, V> {
    type Item = (&'a PathKey, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }
            let node = self.nodes.pop_front()?;
            for binding in [&node.exact, &node.wildcard].into_iter().flatten() {
                self.pending.push_back((&binding.key, &binding.value));
            }
            self.nodes.extend(node.children.values());
        }
    }
}

impl<'a, V> IntoIterator for &'a TreePathMap<V> {
    type Item = (&'a PathKey, &'a V);
    type IntoIter = Entries<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

impl<V: fmt::Debug> fmt::Debug for Entries<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entries").finish()
    }
}
