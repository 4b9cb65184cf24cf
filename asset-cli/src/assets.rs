//! Asset hierarchy API.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use session_coordinator::{ApiRequest, ApiResponse, Coordinator};
use tracing::debug;

use crate::error::{CliError, Result};

/// One node of the asset hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub name: String,
    #[serde(default)]
    pub children: Vec<AssetNode>,
}

impl AssetNode {
    /// Number of nodes in this subtree, including this one.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(AssetNode::count).sum::<usize>()
    }

    /// Keep the branches that contain a name matching `term` (case-insensitive).
    pub fn filter(&self, term: &str) -> Option<AssetNode> {
        let term = term.to_lowercase();
        self.filter_lowercase(&term)
    }

    fn filter_lowercase(&self, term: &str) -> Option<AssetNode> {
        let children: Vec<_> = self
            .children
            .iter()
            .filter_map(|child| child.filter_lowercase(term))
            .collect();

        if self.name.to_lowercase().contains(term) || !children.is_empty() {
            Some(AssetNode {
                id: self.id.clone(),
                name: self.name.clone(),
                children,
            })
        } else {
            None
        }
    }
}

/// The service answers with either a single root or a list of roots.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HierarchyBody {
    Forest(Vec<AssetNode>),
    Root(AssetNode),
}

pub fn parse_hierarchy(body: &[u8]) -> Result<Vec<AssetNode>> {
    Ok(match serde_json::from_slice(body)? {
        HierarchyBody::Forest(roots) => roots,
        HierarchyBody::Root(root) => vec![root],
    })
}

/// Render roots as an indented tree.
pub fn render_tree(roots: &[AssetNode]) -> String {
    let mut out = String::new();
    for root in roots {
        let _ = writeln!(out, "{}", root.name);
        render_children(&root.children, "", &mut out);
    }
    out
}

fn render_children(children: &[AssetNode], prefix: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let (branch, indent) = if last { ("└── ", "    ") } else { ("├── ", "│   ") };
        let _ = writeln!(out, "{prefix}{branch}{}", child.name);
        render_children(&child.children, &format!("{prefix}{indent}"), out);
    }
}

/// Asset endpoints, called through the coordinator so expired sessions are
/// renewed transparently.
#[derive(Clone)]
pub struct AssetClient {
    coordinator: Arc<Coordinator>,
    base_path: String,
}

impl AssetClient {
    pub fn new(coordinator: Arc<Coordinator>, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into().trim_end_matches('/').to_string();
        Self {
            coordinator,
            base_path,
        }
    }

    fn path(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_path, endpoint)
    }

    pub async fn hierarchy(&self) -> Result<Vec<AssetNode>> {
        let response = self
            .coordinator
            .send(ApiRequest::get(self.path("hierarchy")))
            .await?;
        let response = ensure_success(response)?;
        parse_hierarchy(response.body())
    }

    pub async fn add(&self, name: &str, parent: &str) -> Result<String> {
        debug!(name, parent, "Adding asset");
        let request = ApiRequest::post(self.path("add"))
            .query("name", name)
            .query("parentName", parent);
        let response = ensure_success(self.coordinator.send(request).await?)?;
        Ok(response.text().into_owned())
    }

    pub async fn remove(&self, name: &str) -> Result<String> {
        debug!(name, "Removing asset");
        let request = ApiRequest::delete(self.path("remove")).query("name", name);
        let response = ensure_success(self.coordinator.send(request).await?)?;
        Ok(response.text().into_owned())
    }
}

fn ensure_success(response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let message = response.text().trim().to_string();
    let message = if message.is_empty() {
        response
            .status()
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        message
    };
    Err(CliError::Api {
        status: response.status().as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r#"{
        "id": 1, "name": "Plant",
        "children": [
            {"id": 2, "name": "Line A", "children": [
                {"id": 3, "name": "Pump 1", "children": []},
                {"id": 4, "name": "Valve", "children": []}
            ]},
            {"id": 5, "name": "Line B"}
        ]
    }"#;

    #[test]
    fn test_parse_single_root_and_forest() {
        let roots = parse_hierarchy(TREE.as_bytes()).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].count(), 5);

        let forest = parse_hierarchy(br#"[{"name":"A"},{"name":"B","children":[{"name":"C"}]}]"#)
            .unwrap();
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[1].children[0].name, "C");
    }

    #[test]
    fn test_filter_keeps_matching_branches() {
        let root = parse_hierarchy(TREE.as_bytes()).unwrap().remove(0);

        let filtered = root.filter("PUMP").unwrap();
        assert_eq!(filtered.count(), 3);
        assert_eq!(filtered.children[0].children[0].name, "Pump 1");

        assert!(root.filter("compressor").is_none());
    }

    #[test]
    fn test_render_tree() {
        let roots = parse_hierarchy(TREE.as_bytes()).unwrap();
        let expected = "\
Plant
├── Line A
│   ├── Pump 1
│   └── Valve
└── Line B
";
        assert_eq!(render_tree(&roots), expected);
    }

    #[test]
    fn test_ensure_success_uses_body_as_message() {
        let response = ApiResponse::new(
            reqwest::StatusCode::CONFLICT,
            Default::default(),
            "Asset already exists",
        );
        match ensure_success(response) {
            Err(CliError::Api { status, message }) => {
                assert_eq!(status, 409);
                assert_eq!(message, "Asset already exists");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
