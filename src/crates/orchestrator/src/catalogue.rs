//! Tool catalogue and per-request disclosure
//!
//! The full catalogue is loaded once from a YAML manifest grouped by server
//! and is immutable afterwards; reads are lock-free. Disclosure filters the
//! catalogue down to a small, deterministic, order-stable subset for one
//! request so downstream prompts stay bounded.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Relative cost of invoking a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Low,
    Medium,
    High,
}

impl Default for CostClass {
    fn default() -> Self {
        CostClass::Low
    }
}

/// One tool in the catalogue; immutable at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    /// Keyword set matched against request text by the `minimal` strategy
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub cost_class: CostClass,
    /// Opaque parameter schema forwarded to specialists
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDescriptor {
    /// Canonical `server/tool` identifier
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_name, self.tool_name)
    }
}

/// Disclosure strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureStrategy {
    /// Keyword match on the request text, capped
    Minimal,
    /// Intersect the agent's declared tool list with the catalogue
    AgentProfile,
    /// Union of minimal matches and the agent's top tools
    Progressive,
    /// The entire catalogue; diagnostic mode only
    Full,
}

impl FromStr for DisclosureStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(DisclosureStrategy::Minimal),
            "agent_profile" => Ok(DisclosureStrategy::AgentProfile),
            "progressive" => Ok(DisclosureStrategy::Progressive),
            "full" => Ok(DisclosureStrategy::Full),
            other => Err(OrchestratorError::Validation(format!(
                "unknown disclosure strategy '{other}'"
            ))),
        }
    }
}

/// Filter inputs for one disclosure call
#[derive(Debug, Clone)]
pub struct DisclosureRequest<'a> {
    /// Free-form request text
    pub text: &'a str,
    /// The agent's declared tool list (qualified or bare names)
    pub agent_tools: Option<&'a [String]>,
    pub strategy: DisclosureStrategy,
    /// Cap on returned tools
    pub max_tools: usize,
}

/// Manifest file shape: tools grouped by server
#[derive(Debug, Deserialize)]
struct Manifest {
    servers: Vec<ManifestServer>,
}

#[derive(Debug, Deserialize)]
struct ManifestServer {
    name: String,
    #[serde(default)]
    tools: Vec<ManifestTool>,
}

#[derive(Debug, Deserialize)]
struct ManifestTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    cost_class: CostClass,
    #[serde(default)]
    parameters: Value,
}

/// The immutable tool catalogue
pub struct ToolCatalogue {
    /// Sorted by `(server_name, tool_name)` for order-stable output
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalogue {
    /// Build from already-loaded descriptors
    pub fn new(mut tools: Vec<ToolDescriptor>) -> Self {
        tools.sort_by(|a, b| {
            (a.server_name.as_str(), a.tool_name.as_str())
                .cmp(&(b.server_name.as_str(), b.tool_name.as_str()))
        });
        Self { tools }
    }

    /// Parse a YAML manifest
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(raw)
            .map_err(|e| OrchestratorError::Validation(format!("invalid tool manifest: {e}")))?;
        let tools = manifest
            .servers
            .into_iter()
            .flat_map(|server| {
                let server_name = server.name;
                server.tools.into_iter().map(move |tool| ToolDescriptor {
                    server_name: server_name.clone(),
                    tool_name: tool.name,
                    description: tool.description,
                    keywords: tool.keywords.iter().map(|k| k.to_lowercase()).collect(),
                    cost_class: tool.cost_class,
                    parameters: tool.parameters,
                })
            })
            .collect();
        Ok(Self::new(tools))
    }

    /// The built-in development catalogue used when no manifest is configured
    pub fn builtin() -> Self {
        let raw = include_str!("../manifests/tools.yaml");
        Self::from_yaml(raw).expect("built-in tool manifest is valid")
    }

    /// Number of catalogued tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalogue is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tools in canonical order
    pub fn all(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Filter the catalogue for one request
    ///
    /// Deterministic and order-stable: the same input always yields the same
    /// list. Ordering is match score descending, then `(server, tool)`.
    pub fn disclose(&self, request: &DisclosureRequest<'_>) -> Vec<&ToolDescriptor> {
        fn capped<'a>(mut tools: Vec<&'a ToolDescriptor>, max_tools: usize) -> Vec<&'a ToolDescriptor> {
            tools.truncate(max_tools);
            tools
        }
        match request.strategy {
            DisclosureStrategy::Full => capped(self.tools.iter().collect(), request.max_tools),
            DisclosureStrategy::Minimal => capped(self.keyword_matches(request.text), request.max_tools),
            DisclosureStrategy::AgentProfile => {
                capped(self.profile_matches(request.agent_tools), request.max_tools)
            }
            DisclosureStrategy::Progressive => {
                let mut seen: HashSet<String> = HashSet::new();
                let mut merged = Vec::new();
                for tool in self
                    .keyword_matches(request.text)
                    .into_iter()
                    .chain(self.profile_matches(request.agent_tools))
                {
                    if seen.insert(tool.qualified_name()) {
                        merged.push(tool);
                    }
                }
                capped(merged, request.max_tools)
            }
        }
    }

    fn keyword_matches(&self, text: &str) -> Vec<&ToolDescriptor> {
        let words: HashSet<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();

        let mut scored: Vec<(usize, &ToolDescriptor)> = self
            .tools
            .iter()
            .filter_map(|tool| {
                let score = tool.keywords.iter().filter(|k| words.contains(*k)).count();
                (score > 0).then_some((score, tool))
            })
            .collect();
        // Stable: catalogue order already breaks ties by (server, tool).
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, tool)| tool).collect()
    }

    fn profile_matches(&self, agent_tools: Option<&[String]>) -> Vec<&ToolDescriptor> {
        let Some(declared) = agent_tools else {
            return Vec::new();
        };
        let declared: HashSet<&str> = declared.iter().map(String::as_str).collect();
        self.tools
            .iter()
            .filter(|tool| {
                declared.contains(tool.qualified_name().as_str())
                    || declared.contains(tool.tool_name.as_str())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> ToolCatalogue {
        ToolCatalogue::from_yaml(
            r#"
servers:
  - name: git
    tools:
      - name: commit
        keywords: [git, commit, change]
      - name: diff
        keywords: [git, diff, change, review]
  - name: fs
    tools:
      - name: read_file
        keywords: [read, file]
      - name: write_file
        keywords: [write, file]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_matches_keywords_and_caps() {
        let cat = catalogue();
        let tools = cat.disclose(&DisclosureRequest {
            text: "review the git change",
            agent_tools: None,
            strategy: DisclosureStrategy::Minimal,
            max_tools: 10,
        });
        let names: Vec<String> = tools.iter().map(|t| t.qualified_name()).collect();
        // diff matches 3 keywords, commit 2; file tools none.
        assert_eq!(names, vec!["git/diff", "git/commit"]);

        let capped = cat.disclose(&DisclosureRequest {
            text: "review the git change",
            agent_tools: None,
            strategy: DisclosureStrategy::Minimal,
            max_tools: 1,
        });
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_disclosure_is_deterministic() {
        let cat = catalogue();
        let request = DisclosureRequest {
            text: "change a file",
            agent_tools: None,
            strategy: DisclosureStrategy::Minimal,
            max_tools: 10,
        };
        let first: Vec<String> = cat.disclose(&request).iter().map(|t| t.qualified_name()).collect();
        for _ in 0..5 {
            let again: Vec<String> =
                cat.disclose(&request).iter().map(|t| t.qualified_name()).collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_agent_profile_intersects() {
        let cat = catalogue();
        let declared = vec!["git/commit".to_string(), "ghost/tool".to_string()];
        let tools = cat.disclose(&DisclosureRequest {
            text: "",
            agent_tools: Some(&declared),
            strategy: DisclosureStrategy::AgentProfile,
            max_tools: 10,
        });
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].qualified_name(), "git/commit");
    }

    #[test]
    fn test_progressive_unions_without_duplicates() {
        let cat = catalogue();
        let declared = vec!["git/diff".to_string(), "fs/read_file".to_string()];
        let tools = cat.disclose(&DisclosureRequest {
            text: "git diff",
            agent_tools: Some(&declared),
            strategy: DisclosureStrategy::Progressive,
            max_tools: 10,
        });
        let names: Vec<String> = tools.iter().map(|t| t.qualified_name()).collect();
        assert_eq!(names.iter().filter(|n| n.as_str() == "git/diff").count(), 1);
        assert!(names.contains(&"fs/read_file".to_string()));
    }

    #[test]
    fn test_full_returns_everything_in_order() {
        let cat = catalogue();
        let tools = cat.disclose(&DisclosureRequest {
            text: "",
            agent_tools: None,
            strategy: DisclosureStrategy::Full,
            max_tools: 100,
        });
        let names: Vec<String> = tools.iter().map(|t| t.qualified_name()).collect();
        assert_eq!(names, vec!["fs/read_file", "fs/write_file", "git/commit", "git/diff"]);
    }

    #[test]
    fn test_builtin_manifest_loads() {
        let cat = ToolCatalogue::builtin();
        assert!(!cat.is_empty());
    }
}
