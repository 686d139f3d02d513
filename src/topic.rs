//! Wildcard-capable topic tree.
//!
//! A trie keyed by topic level. Each node stores an opaque value set, so the
//! same structure backs the live subscription queue (values are client
//! handles), the offline queue (values are sessions) and the retained store
//! (values are messages, one per concrete topic).

use ahash::AHashMap;
use parking_lot::Mutex;

/// A node in the topic trie.
struct Node<T> {
    /// Values stored at this level.
    values: Vec<T>,
    /// Child nodes by literal topic level.
    children: AHashMap<String, Node<T>>,
    /// Single-level wildcard (+) child.
    single_wildcard: Option<Box<Node<T>>>,
    /// Multi-level wildcard (#) values.
    multi_wildcard: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: Vec::new(),
        }
    }
}

impl<T: Clone + PartialEq> Node<T> {
    fn insert(&mut self, levels: &[&str], value: T) {
        let Some((level, remaining)) = levels.split_first() else {
            if !self.values.contains(&value) {
                self.values.push(value);
            }
            return;
        };

        match *level {
            // multi-level wildcard, must be last
            "#" => {
                if !self.multi_wildcard.contains(&value) {
                    self.multi_wildcard.push(value);
                }
            }
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

    fn remove(&mut self, levels: &[&str], value: &T) {
        let Some((level, remaining)) = levels.split_first() else {
            self.values.retain(|v| v != value);
            return;
        };

        match *level {
            "#" => self.multi_wildcard.retain(|v| v != value),
            "+" => {
                if let Some(child) = &mut self.single_wildcard {
                    child.remove(remaining, value);
                }
            }
            _ => {
                if let Some(child) = self.children.get_mut(*level) {
                    child.remove(remaining, value);
                }
            }
        }
    }

    fn remove_everywhere(&mut self, value: &T) {
        self.values.retain(|v| v != value);
        self.multi_wildcard.retain(|v| v != value);

        if let Some(child) = &mut self.single_wildcard {
            child.remove_everywhere(value);
        }

        for child in self.children.values_mut() {
            child.remove_everywhere(value);
        }
    }

    /// Resolve a concrete topic against the stored (possibly wildcarded)
    /// filters.
    fn collect_matches(&self, levels: &[&str], is_root: bool, result: &mut Vec<T>) {
        // MQTT-4.7.2-1: topics starting with $ are not matched by wildcards
        // at the root level
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            // multi-level wildcard matches zero or more remaining levels
            result.extend(self.multi_wildcard.iter().cloned());
        }

        let Some((level, remaining)) = levels.split_first() else {
            result.extend(self.values.iter().cloned());
            return;
        };

        if !skip_wildcards {
            if let Some(child) = &self.single_wildcard {
                child.collect_matches(remaining, false, result);
            }
        }

        if let Some(child) = self.children.get(*level) {
            child.collect_matches(remaining, false, result);
        }
    }

    /// Resolve a (possibly wildcarded) filter against the stored concrete
    /// topics. Wildcard entries stored in the tree are not expanded here.
    fn collect_search(&self, levels: &[&str], result: &mut Vec<T>) {
        let Some((level, remaining)) = levels.split_first() else {
            result.extend(self.values.iter().cloned());
            return;
        };

        match *level {
            "#" => self.collect_subtree(result),
            "+" => {
                for child in self.children.values() {
                    child.collect_search(remaining, result);
                }
            }
            _ => {
                if let Some(child) = self.children.get(*level) {
                    child.collect_search(remaining, result);
                }
            }
        }
    }

    /// Values at this node and every descendant.
    fn collect_subtree(&self, result: &mut Vec<T>) {
        result.extend(self.values.iter().cloned());
        for child in self.children.values() {
            child.collect_subtree(result);
        }
    }
}

/// Topic tree with a tree-scoped lock.
///
/// `matches` and `search` return snapshot copies so callers iterate without
/// holding the lock.
pub struct Tree<T> {
    root: Mutex<Node<T>>,
}

impl<T: Clone + PartialEq> Tree<T> {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Node::default()),
        }
    }

    /// Add a value under the given topic filter. Idempotent.
    pub fn add(&self, filter: &str, value: T) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.lock().insert(&levels, value);
    }

    /// Remove a value stored under the given topic filter.
    pub fn remove(&self, filter: &str, value: &T) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.lock().remove(&levels, value);
    }

    /// Remove a value from every node of the tree.
    pub fn clear(&self, value: &T) {
        self.root.lock().remove_everywhere(value);
    }

    /// Replace the value set at a concrete topic with a single value.
    pub fn set(&self, topic: &str, value: T) {
        let mut guard = self.root.lock();
        let mut node = &mut *guard;
        for level in topic.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.values.clear();
        node.values.push(value);
    }

    /// Clear the value set at a concrete topic.
    pub fn empty(&self, topic: &str) {
        let mut guard = self.root.lock();
        let mut node = &mut *guard;
        for level in topic.split('/') {
            match node.children.get_mut(level) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.values.clear();
    }

    /// All values whose stored filter matches the concrete topic. A value
    /// stored under several matching filters appears once.
    pub fn matches(&self, topic: &str) -> Vec<T> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut result = Vec::new();
        self.root.lock().collect_matches(&levels, true, &mut result);
        dedup(result)
    }

    /// All values stored under concrete topics that match the filter.
    pub fn search(&self, filter: &str) -> Vec<T> {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut result = Vec::new();
        self.root.lock().collect_search(&levels, &mut result);
        dedup(result)
    }
}

impl<T: Clone + PartialEq> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse duplicates while keeping collection order. Value sets are small
/// enough that a linear scan beats hashing.
fn dedup<T: PartialEq>(values: Vec<T>) -> Vec<T> {
    let mut unique: Vec<T> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

/// Check if a concrete topic matches a topic filter (which may contain
/// wildcards). Used for per-session subscription lookups.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            // matches everything from here, including the parent level
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}
