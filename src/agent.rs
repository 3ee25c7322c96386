//! Per-agent activity aggregate
//!
//! Everything the state machine knows about one agent lives here and is
//! owned by that agent's worker. Nothing in this struct is shared.

use crate::event::{AgentId, AgentStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// An open tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTool {
    pub name: String,
    pub status: String,
}

/// Tool model and status flags for one agent
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    /// Top-level tools by invocation id
    tools: BTreeMap<String, ActiveTool>,
    /// Nested tools by delegation parent id, then invocation id
    subagent_tools: BTreeMap<String, BTreeMap<String, ActiveTool>>,
    pub turn_had_tools: bool,
    pub status: AgentStatus,
    pub permission_notified: bool,
}

impl Agent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            tools: BTreeMap::new(),
            subagent_tools: BTreeMap::new(),
            turn_had_tools: false,
            status: AgentStatus::Active,
            permission_notified: false,
        }
    }

    pub fn open_tool(&mut self, tool_id: &str, name: &str, status: String) {
        self.tools.insert(
            tool_id.to_string(),
            ActiveTool {
                name: name.to_string(),
                status,
            },
        );
    }

    /// Remove a top-level tool along with any nested tools it owns.
    pub fn close_tool(&mut self, tool_id: &str) -> Option<ActiveTool> {
        self.subagent_tools.remove(tool_id);
        self.tools.remove(tool_id)
    }

    pub fn open_subagent_tool(&mut self, parent_id: &str, tool_id: &str, name: &str, status: String) {
        self.subagent_tools
            .entry(parent_id.to_string())
            .or_default()
            .insert(
                tool_id.to_string(),
                ActiveTool {
                    name: name.to_string(),
                    status,
                },
            );
    }

    pub fn close_subagent_tool(&mut self, parent_id: &str, tool_id: &str) -> Option<ActiveTool> {
        self.subagent_tools
            .get_mut(parent_id)
            .and_then(|tools| tools.remove(tool_id))
    }

    /// Drop every open tool, nested ones included.
    pub fn clear_tools(&mut self) {
        self.tools.clear();
        self.subagent_tools.clear();
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn is_tool_active(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn tool_name(&self, tool_id: &str) -> Option<&str> {
        self.tools.get(tool_id).map(|t| t.name.as_str())
    }

    pub fn tools(&self) -> impl Iterator<Item = (&str, &ActiveTool)> {
        self.tools.iter().map(|(id, tool)| (id.as_str(), tool))
    }

    pub fn subagent_tools(&self, parent_id: &str) -> impl Iterator<Item = (&str, &ActiveTool)> {
        self.subagent_tools
            .get(parent_id)
            .into_iter()
            .flat_map(|tools| tools.iter().map(|(id, tool)| (id.as_str(), tool)))
    }

    pub fn subagent_parents(&self) -> impl Iterator<Item = &str> {
        self.subagent_tools.keys().map(String::as_str)
    }

    /// True when a top-level tool outside `exempt` is open.
    pub fn has_non_exempt_tool(&self, exempt: &HashSet<String>) -> bool {
        self.tools.values().any(|t| !exempt.contains(&t.name))
    }

    /// Delegation parents that still have a nested tool outside `exempt` open.
    pub fn stuck_subagent_parents(&self, exempt: &HashSet<String>) -> Vec<String> {
        self.subagent_tools
            .iter()
            .filter(|(_, tools)| tools.values().any(|t| !exempt.contains(&t.name)))
            .map(|(parent, _)| parent.clone())
            .collect()
    }
}
