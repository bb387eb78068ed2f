//! Per-task option overlays applied at bind time.
//!
//! Maps are applied in configuration order. Within one map the `"*"` key
//! (or any glob) is applied before an exact-name key, so a specific
//! annotation always beats a wildcard from the same map.

use fahrplan_core::TaskOptions;
use indexmap::IndexMap;

/// Shell-style match supporting `*` only.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return true,
    };
    let Some(mut remaining) = name.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[derive(Debug, Clone, Default)]
pub struct Annotations {
    maps: Vec<IndexMap<String, TaskOptions>>,
}

impl Annotations {
    pub fn new(maps: Vec<IndexMap<String, TaskOptions>>) -> Self {
        Self { maps }
    }

    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(IndexMap::is_empty)
    }

    /// Combined overlay for `task`: every matching entry merged in order.
    pub fn resolve(&self, task: &str) -> TaskOptions {
        let mut out = TaskOptions::default();
        for map in &self.maps {
            for (pattern, opts) in map {
                if pattern != task && glob_match(pattern, task) {
                    out.apply(opts);
                }
            }
            if let Some(exact) = map.get(task) {
                out.apply(exact);
            }
        }
        out
    }

    /// Apply the overlay for `task` on top of `options`.
    pub fn annotate(&self, task: &str, options: &mut TaskOptions) {
        options.apply(&self.resolve(task));
    }
}
