//! File-tree walking and sanitization.

use std::collections::HashSet;

const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Replace any reserved filesystem character with `_`, trim, and fall back
/// to `untitled` if the result is empty.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if RESERVED.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One file-tree node as seen from the persistence layer.
pub struct TreeNode {
    pub name: String,
    pub parent_id: Option<String>,
}

/// Walk `nodes` from `file_id` up to a root (`parent_id == None`), collecting
/// sanitized names, then reverse and join with `/`.
///
/// Cycles are handled with a visited-set: a node id revisited mid-walk aborts
/// the walk and returns `None`. A lookup miss is graced by one step: if the
/// *parent* of an already-collected segment is absent from `nodes`, the walk
/// just stops there and the segments collected so far are returned (the
/// missing parent is treated as an implicit root); but a miss on `file_id`
/// itself, before any segment has been collected, yields `None`. This quirk
/// is called out as an open question in the contract and preserved deliberately;
/// see DESIGN.md.
pub fn build_file_path_from_tree(
    file_id: &str,
    nodes: &std::collections::HashMap<String, TreeNode>,
) -> Option<String> {
    let mut segments = Vec::new();
    let mut visited = HashSet::new();
    let mut current = file_id.to_string();

    loop {
        if !visited.insert(current.clone()) {
            return None;
        }

        let Some(node) = nodes.get(&current) else {
            return if segments.is_empty() {
                None
            } else {
                segments.reverse();
                Some(segments.join("/"))
            };
        };

        segments.push(sanitize_name(&node.name));

        match &node.parent_id {
            None => break,
            Some(parent) => current = parent.clone(),
        }
    }

    segments.reverse();
    Some(segments.join("/"))
}

/// Fallback path used by the persistence gateway when no path can be
/// derived (cyclic tree, or the file-id is absent from `file-tree:nodes`).
pub fn fallback_path(file_id: &str) -> String {
    format!("files/{}.txt", sanitize_name(file_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(name: &str, parent: Option<&str>) -> TreeNode {
        TreeNode {
            name: name.to_string(),
            parent_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_name("a/b"), "a_b");
        assert_eq!(sanitize_name("   "), "untitled");
        assert_eq!(sanitize_name("notes.md"), "notes.md");
    }

    #[test]
    fn derives_path_from_root_to_leaf() {
        let mut nodes = HashMap::new();
        nodes.insert("root".to_string(), node("src", None));
        nodes.insert("child".to_string(), node("main.rs", Some("root")));

        let path = build_file_path_from_tree("child", &nodes);
        assert_eq!(path, Some("src/main.rs".to_string()));
    }

    #[test]
    fn invariant_under_adding_unrelated_folders() {
        let mut nodes = HashMap::new();
        nodes.insert("root".to_string(), node("src", None));
        nodes.insert("child".to_string(), node("main.rs", Some("root")));
        nodes.insert("unrelated".to_string(), node("docs", None));

        let path = build_file_path_from_tree("child", &nodes);
        assert_eq!(path, Some("src/main.rs".to_string()));
    }

    #[test]
    fn cyclic_tree_yields_no_path() {
        let mut nodes = HashMap::new();
        nodes.insert("a".to_string(), node("a", Some("b")));
        nodes.insert("b".to_string(), node("b", Some("a")));

        assert_eq!(build_file_path_from_tree("a", &nodes), None);
        assert_eq!(fallback_path("a"), "files/a.txt");
    }

    #[test]
    fn missing_node_yields_no_path() {
        let nodes = HashMap::new();
        assert_eq!(build_file_path_from_tree("ghost", &nodes), None);
    }

    #[test]
    fn missing_parent_after_a_collected_segment_stops_there_instead_of_failing() {
        let mut nodes = HashMap::new();
        nodes.insert("child".to_string(), node("main.rs", Some("orphaned-parent")));

        let path = build_file_path_from_tree("child", &nodes);
        assert_eq!(path, Some("main.rs".to_string()));
    }
}
