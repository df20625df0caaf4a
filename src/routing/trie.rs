use crate::routing::matcher::CompiledRoute;
use std::collections::HashMap;
use std::sync::Arc;

/// Compressed radix tree for URI routing, organized by segment boundaries.
///
/// Exact routes attach to the node their full path lands on; prefix routes
/// attach to the node for their prefix and match everything at or below it.
///
/// Matching priority at each level:
/// 1. Exact match on the full path
/// 2. Prefix match — deepest prefix wins
#[derive(Debug, Default)]
pub struct PathTrie {
    /// Root node represents "/".
    root: Node,
}

/// A node in the compressed trie. Each node represents one or more URI
/// segments (e.g. "/v1/users" stored as segments ["v1", "users"]).
#[derive(Debug, Default)]
struct Node {
    segments: Vec<String>,
    children: HashMap<String, Node>,
    exact_routes: Vec<Arc<CompiledRoute>>,
    prefix_routes: Vec<Arc<CompiledRoute>>,
}

impl Node {
    fn new(segments: Vec<String>) -> Self {
        Self {
            segments,
            ..Self::default()
        }
    }
}

/// Result of a URI match against the trie.
pub enum TrieMatch<'a> {
    Exact {
        exact: &'a [Arc<CompiledRoute>],
        /// All prefix candidates from deepest to shallowest.
        prefix_fallbacks: Vec<&'a [Arc<CompiledRoute>]>,
    },
    /// All prefix candidates from deepest to shallowest.
    Prefix(Vec<&'a [Arc<CompiledRoute>]>),
    None,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a compiled route at `path`. `is_prefix` selects whether the
    /// route matches the path subtree or only the path itself.
    pub fn insert(&mut self, path: &str, is_prefix: bool, route: Arc<CompiledRoute>) {
        let segments = parse_pattern_segments(path);
        insert_recursive(&mut self.root, &segments, 0, route, is_prefix);
    }

    /// Match a request URI against the trie. Returns all candidate routes at
    /// the best matching level; the caller filters by method/header/query
    /// predicates and picks the highest priority.
    pub fn match_path<'a>(&'a self, path: &str) -> TrieMatch<'a> {
        let segments = split_path_segments(path);
        let mut prefix_stack: Vec<&[Arc<CompiledRoute>]> = Vec::new();
        match_recursive(&self.root, &segments, 0, &mut prefix_stack)
    }

    /// Collect all routes in the trie (for counting / diagnostics).
    pub fn all_routes(&self) -> Vec<&Arc<CompiledRoute>> {
        let mut result = Vec::new();
        collect_routes(&self.root, &mut result);
        result
    }
}

/// Parse a route path pattern into segments.
/// "/v1/users" -> ["v1", "users"], "/" -> [].
fn parse_pattern_segments(path: &str) -> Vec<String> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    trimmed.split('/').map(|s| s.to_string()).collect()
}

/// Split a request URI into segments, dropping any query string.
fn split_path_segments(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    trimmed.split('/').collect()
}

fn insert_recursive(
    node: &mut Node,
    segments: &[String],
    offset: usize,
    route: Arc<CompiledRoute>,
    is_prefix: bool,
) {
    let remaining = &segments[offset..];

    // No more segments to consume — attach route here.
    if remaining.is_empty() {
        if is_prefix {
            node.prefix_routes.push(route);
        } else {
            node.exact_routes.push(route);
        }
        return;
    }

    let first = &remaining[0];

    if let Some(child) = node.children.get_mut(first.as_str()) {
        let common = common_prefix_len(&child.segments, remaining);

        if common == child.segments.len() {
            // Child segments fully matched — descend.
            insert_recursive(child, segments, offset + common, route, is_prefix);
        } else {
            // Partial match — split the child node.
            split_and_insert(child, common, segments, offset, route, is_prefix);
        }
    } else {
        // No matching child — create one with all remaining segments compressed.
        let mut new_node = Node::new(remaining.to_vec());
        if is_prefix {
            new_node.prefix_routes.push(route);
        } else {
            new_node.exact_routes.push(route);
        }
        node.children.insert(first.clone(), new_node);
    }
}

/// Split an existing child node at the given prefix length, then insert the
/// new route below the split point.
fn split_and_insert(
    child: &mut Node,
    common_len: usize,
    segments: &[String],
    offset: usize,
    route: Arc<CompiledRoute>,
    is_prefix: bool,
) {
    let old_suffix: Vec<String> = child.segments[common_len..].to_vec();
    let old_children = std::mem::take(&mut child.children);
    let old_exact = std::mem::take(&mut child.exact_routes);
    let old_prefix = std::mem::take(&mut child.prefix_routes);

    let mut old_node = Node::new(old_suffix.clone());
    old_node.children = old_children;
    old_node.exact_routes = old_exact;
    old_node.prefix_routes = old_prefix;

    child.segments.truncate(common_len);
    child.children.clear();
    child.exact_routes.clear();
    child.prefix_routes.clear();

    let old_first = old_suffix[0].clone();
    child.children.insert(old_first, old_node);

    let new_remaining = &segments[offset + common_len..];
    if new_remaining.is_empty() {
        if is_prefix {
            child.prefix_routes.push(route);
        } else {
            child.exact_routes.push(route);
        }
    } else {
        let new_first = new_remaining[0].clone();
        if let Some(existing) = child.children.get_mut(&new_first) {
            insert_recursive(existing, segments, offset + common_len, route, is_prefix);
        } else {
            let mut new_node = Node::new(new_remaining.to_vec());
            if is_prefix {
                new_node.prefix_routes.push(route);
            } else {
                new_node.exact_routes.push(route);
            }
            child.children.insert(new_first, new_node);
        }
    }
}

fn common_prefix_len(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Descend the trie, collecting every prefix candidate on the way down so
/// the deepest one can be preferred on the way out.
fn match_recursive<'a>(
    node: &'a Node,
    segments: &[&str],
    offset: usize,
    prefix_stack: &mut Vec<&'a [Arc<CompiledRoute>]>,
) -> TrieMatch<'a> {
    if !node.prefix_routes.is_empty() {
        prefix_stack.push(&node.prefix_routes);
    }

    let remaining = &segments[offset..];

    if remaining.is_empty() {
        if !node.exact_routes.is_empty() {
            let mut fallbacks: Vec<&[Arc<CompiledRoute>]> = prefix_stack.clone();
            fallbacks.reverse();
            return TrieMatch::Exact {
                exact: &node.exact_routes,
                prefix_fallbacks: fallbacks,
            };
        }
        if prefix_stack.is_empty() {
            return TrieMatch::None;
        }
        let mut candidates: Vec<&[Arc<CompiledRoute>]> = prefix_stack.clone();
        candidates.reverse();
        return TrieMatch::Prefix(candidates);
    }

    let first = &remaining[0];

    if let Some(child) = node.children.get(*first) {
        let child_len = child.segments.len();
        if remaining.len() >= child_len {
            let matches = child
                .segments
                .iter()
                .zip(remaining.iter())
                .all(|(a, b)| a == *b);
            if matches {
                return match_recursive(child, segments, offset + child_len, prefix_stack);
            }
        }
    }

    // No child matched — fall back to collected prefixes.
    if prefix_stack.is_empty() {
        return TrieMatch::None;
    }
    let mut candidates: Vec<&[Arc<CompiledRoute>]> = prefix_stack.clone();
    candidates.reverse();
    TrieMatch::Prefix(candidates)
}

fn collect_routes<'a>(node: &'a Node, result: &mut Vec<&'a Arc<CompiledRoute>>) {
    for r in &node.exact_routes {
        result.push(r);
    }
    for r in &node.prefix_routes {
        result.push(r);
    }
    for child in node.children.values() {
        collect_routes(child, result);
    }
}
