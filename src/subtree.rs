//! Topic-filter trie with wildcard matching.
//!
//! `SubTree<V>` maps topic filters to values of a mergeable type. The
//! subscription index instantiates it with a map of session id to
//! subscription options; duplicate inserts at the same filter merge instead
//! of replacing.

use ahash::AHashMap;

/// Values that can absorb a second value stored under the same filter.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

impl<K: std::hash::Hash + Eq, V> Merge for AHashMap<K, V> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

/// A node in the filter trie.
struct Node<V> {
    /// Value stored at this exact filter.
    value: Option<V>,
    /// Child nodes by topic level.
    children: AHashMap<String, Node<V>>,
    /// Single-level wildcard (+) child.
    single_wildcard: Option<Box<Node<V>>>,
    /// Multi-level wildcard (#) value; `#` is always terminal.
    multi_wildcard: Option<V>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }
}

impl<V: Merge> Node<V> {
    fn insert(&mut self, levels: &[&str], value: V) {
        let Some((level, remaining)) = levels.split_first() else {
            match self.value.as_mut() {
                Some(existing) => existing.merge(value),
                None => self.value = Some(value),
            }
            return;
        };

        match *level {
            "#" => match self.multi_wildcard.as_mut() {
                Some(existing) => existing.merge(value),
                None => self.multi_wildcard = Some(value),
            },
            "+" => {
                let child = self.single_wildcard.get_or_insert_with(Box::default);
                child.insert(remaining, value);
            }
            _ => {
                let child = self.children.entry(level.to_string()).or_default();
                child.insert(remaining, value);
            }
        }
    }
}

impl<V> Node<V> {
    /// Returns true when the node holds nothing and can be pruned.
    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }

    fn remove(&mut self, levels: &[&str]) -> Option<V> {
        let Some((level, remaining)) = levels.split_first() else {
            return self.value.take();
        };

        match *level {
            "#" => self.multi_wildcard.take(),
            "+" => {
                let child = self.single_wildcard.as_mut()?;
                let removed = child.remove(remaining);
                if child.is_empty() {
                    self.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = self.children.get_mut(*level)?;
                let removed = child.remove(remaining);
                if child.is_empty() {
                    self.children.remove(*level);
                }
                removed
            }
        }
    }

    fn modify(&mut self, levels: &[&str], f: impl FnOnce(&mut V) -> bool) -> bool {
        let Some((level, remaining)) = levels.split_first() else {
            if let Some(value) = self.value.as_mut() {
                if !f(value) {
                    self.value = None;
                }
                return true;
            }
            return false;
        };

        match *level {
            "#" => {
                if let Some(value) = self.multi_wildcard.as_mut() {
                    if !f(value) {
                        self.multi_wildcard = None;
                    }
                    return true;
                }
                false
            }
            "+" => {
                let Some(child) = self.single_wildcard.as_mut() else {
                    return false;
                };
                let found = child.modify(remaining, f);
                if child.is_empty() {
                    self.single_wildcard = None;
                }
                found
            }
            _ => {
                let Some(child) = self.children.get_mut(*level) else {
                    return false;
                };
                let found = child.modify(remaining, f);
                if child.is_empty() {
                    self.children.remove(*level);
                }
                found
            }
        }
    }

    fn collect<'a>(&'a self, levels: &[&str], is_root: bool, out: &mut Vec<&'a V>) {
        // MQTT-4.7.2-1: topics starting with $ are not matched by wildcards
        // at the root level.
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            // # matches the remainder, including zero levels.
            if let Some(value) = &self.multi_wildcard {
                out.push(value);
            }
        }

        let Some((level, remaining)) = levels.split_first() else {
            if let Some(value) = &self.value {
                out.push(value);
            }
            return;
        };

        if !skip_wildcards {
            if let Some(child) = &self.single_wildcard {
                child.collect(remaining, false, out);
            }
        }

        if let Some(child) = self.children.get(*level) {
            child.collect(remaining, false, out);
        }
    }
}

/// Topic-filter trie mapping filters to mergeable values.
pub struct SubTree<V> {
    root: Node<V>,
}

impl<V> Default for SubTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SubTree<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Remove the value stored at exactly this filter, pruning empty nodes.
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove(&levels)
    }

    /// Mutate the value at exactly this filter. `f` returns whether the
    /// value should be kept; returning false drops it and prunes the branch.
    /// Returns whether a value was found.
    pub fn modify(&mut self, filter: &str, f: impl FnOnce(&mut V) -> bool) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.modify(&levels, f)
    }

    /// Apply `f` to the value at every filter matching the concrete topic
    /// and concatenate the results. Sibling order is unspecified but stable
    /// for a fixed insertion history.
    pub fn find_map<R>(&self, topic: &str, mut f: impl FnMut(&V) -> Vec<R>) -> Vec<R> {
        let mut matched = Vec::new();
        let levels: Vec<&str> = topic.split('/').collect();
        self.root.collect(&levels, true, &mut matched);
        matched.into_iter().flat_map(|v| f(v)).collect()
    }
}

impl<V: Merge> SubTree<V> {
    /// Insert a value at a filter, merging with any existing value there.
    pub fn add(&mut self, filter: &str, value: V) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.insert(&levels, value);
    }
}

/// Check if a concrete topic matches a topic filter with `+`/`#` wildcards.
///
/// Used for retained-message lookup and ACL evaluation, where stored topics
/// are matched against a filter instead of the other way around.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        let Some(filter_level) = filter_levels.next() else {
            // Filter exhausted; match iff the topic is too.
            return topic_levels.next().is_none();
        };

        if filter_level == "#" {
            return true;
        }

        let Some(topic_level) = topic_levels.next() else {
            // Topic has fewer levels than the filter.
            return false;
        };

        if filter_level != "+" && filter_level != topic_level {
            return false;
        }
    }
}
