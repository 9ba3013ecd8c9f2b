//! Projects and the sidebar tree.
//!
//! Tree nodes reference children and parents by id; ownership lives in the
//! `nodes` map (arena style), which keeps the structure serializable and
//! cycle-free. Each project owns exactly one root group; tabs are terminal
//! nodes directly under it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Initial working directory for terminals created in this project.
    pub cwd: String,
    pub root_group_id: String,
    pub expanded: bool,
}

/// Placement for reorder operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Before,
    After,
}

/// A sidebar tree node. Groups hold ordered children by id; terminal nodes
/// are tabs whose `terminal_id` names the tab root terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    #[serde(rename_all = "camelCase")]
    Group {
        id: String,
        name: String,
        children: Vec<String>,
        parent_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Terminal {
        id: String,
        name: String,
        terminal_id: String,
        parent_id: Option<String>,
    },
}

impl TreeNode {
    pub fn id(&self) -> &str {
        match self {
            TreeNode::Group { id, .. } | TreeNode::Terminal { id, .. } => id,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            TreeNode::Group { parent_id, .. } | TreeNode::Terminal { parent_id, .. } => {
                parent_id.as_deref()
            }
        }
    }

    fn set_parent_id(&mut self, new_parent: Option<String>) {
        match self {
            TreeNode::Group { parent_id, .. } | TreeNode::Terminal { parent_id, .. } => {
                *parent_id = new_parent
            }
        }
    }

    pub fn children(&self) -> Option<&[String]> {
        match self {
            TreeNode::Group { children, .. } => Some(children),
            TreeNode::Terminal { .. } => None,
        }
    }

    /// Tab root terminal id, for terminal nodes.
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            TreeNode::Terminal { terminal_id, .. } => Some(terminal_id),
            TreeNode::Group { .. } => None,
        }
    }
}

/// Project registry plus the node arena and display order.
#[derive(Default)]
pub struct ProjectStore {
    projects: HashMap<String, Project>,
    nodes: HashMap<String, TreeNode>,
    active_project_id: Option<String>,
    project_order: Vec<String>,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a project at the end of the display order. The first project
    /// added becomes active.
    pub fn add_project(&mut self, project: Project) -> bool {
        if self.projects.contains_key(&project.id) {
            return false;
        }
        let id = project.id.clone();
        self.projects.insert(id.clone(), project);
        self.project_order.push(id.clone());
        if self.active_project_id.is_none() {
            self.active_project_id = Some(id);
        }
        true
    }

    /// Removes a project. The active project falls back to the first
    /// remaining in display order, else none.
    pub fn remove_project(&mut self, id: &str) -> Option<Project> {
        let removed = self.projects.remove(id)?;
        self.project_order.retain(|p| p != id);
        if self.active_project_id.as_deref() == Some(id) {
            self.active_project_id = self.project_order.first().cloned();
        }
        Some(removed)
    }

    pub fn rename_project(&mut self, id: &str, name: &str) -> bool {
        if let Some(project) = self.projects.get_mut(id) {
            project.name = name.to_string();
            true
        } else {
            false
        }
    }

    /// Sets the active project. `Some(id)` for an unknown id is a no-op.
    pub fn set_active_project(&mut self, id: Option<&str>) -> bool {
        match id {
            None => {
                self.active_project_id = None;
                true
            }
            Some(id) if self.projects.contains_key(id) => {
                self.active_project_id = Some(id.to_string());
                true
            }
            Some(_) => false,
        }
    }

    pub fn toggle_project_expanded(&mut self, id: &str) -> bool {
        if let Some(project) = self.projects.get_mut(id) {
            project.expanded = !project.expanded;
            true
        } else {
            false
        }
    }

    /// Moves `id` before/after `target` in the display order. Self-targets
    /// and unknown ids are no-ops.
    pub fn reorder_project(&mut self, id: &str, target: &str, position: Position) -> bool {
        if id == target
            || !self.projects.contains_key(id)
            || !self.projects.contains_key(target)
        {
            return false;
        }
        self.project_order.retain(|p| p != id);
        let target_idx = self
            .project_order
            .iter()
            .position(|p| p == target)
            .expect("order is a permutation of the project keys");
        let insert_at = match position {
            Position::Before => target_idx,
            Position::After => target_idx + 1,
        };
        self.project_order.insert(insert_at, id.to_string());
        true
    }

    /// Repositions `child_id` relative to `target_child_id` within a group's
    /// children. Self-targets and unknown ids are no-ops.
    pub fn reorder_child(
        &mut self,
        parent_node_id: &str,
        child_id: &str,
        target_child_id: &str,
        position: Position,
    ) -> bool {
        if child_id == target_child_id {
            return false;
        }
        let Some(TreeNode::Group { children, .. }) = self.nodes.get_mut(parent_node_id) else {
            return false;
        };
        if !children.iter().any(|c| c == child_id)
            || !children.iter().any(|c| c == target_child_id)
        {
            return false;
        }
        children.retain(|c| c != child_id);
        let target_idx = children
            .iter()
            .position(|c| c == target_child_id)
            .expect("target checked above");
        let insert_at = match position {
            Position::Before => target_idx,
            Position::After => target_idx + 1,
        };
        children.insert(insert_at, child_id.to_string());
        true
    }

    /// Inserts a node into the arena. Does not touch any parent's child list.
    pub fn add_node(&mut self, node: TreeNode) -> bool {
        if self.nodes.contains_key(node.id()) {
            return false;
        }
        self.nodes.insert(node.id().to_string(), node);
        true
    }

    /// Removes a node from the arena and detaches it from its parent's
    /// children, keeping the child lists free of dangling ids.
    pub fn remove_node(&mut self, id: &str) -> Option<TreeNode> {
        let removed = self.nodes.remove(id)?;
        if let Some(parent_id) = removed.parent_id().map(str::to_string) {
            if let Some(TreeNode::Group { children, .. }) = self.nodes.get_mut(&parent_id) {
                children.retain(|c| c != id);
            }
        }
        Some(removed)
    }

    /// Appends `child_id` to the group's children and points the child's
    /// parent at the group. Idempotent: an already-present child is left
    /// in place.
    pub fn add_child_to_node(&mut self, parent_node_id: &str, child_id: &str) -> bool {
        if !self.nodes.contains_key(child_id) {
            return false;
        }
        match self.nodes.get_mut(parent_node_id) {
            Some(TreeNode::Group { children, .. }) => {
                if !children.iter().any(|c| c == child_id) {
                    children.push(child_id.to_string());
                }
            }
            _ => return false,
        }
        if let Some(child) = self.nodes.get_mut(child_id) {
            child.set_parent_id(Some(parent_node_id.to_string()));
        }
        true
    }

    pub fn remove_child_from_node(&mut self, parent_node_id: &str, child_id: &str) -> bool {
        match self.nodes.get_mut(parent_node_id) {
            Some(TreeNode::Group { children, .. }) => {
                let before = children.len();
                children.retain(|c| c != child_id);
                children.len() != before
            }
            _ => false,
        }
    }

    /// Detaches `id` from its current parent, appends it under
    /// `new_parent_id`, and updates its parent pointer — atomically: nothing
    /// changes unless both nodes exist and the target is a group.
    pub fn move_node(&mut self, id: &str, new_parent_id: &str) -> bool {
        if !self.nodes.contains_key(id) {
            return false;
        }
        if !matches!(self.nodes.get(new_parent_id), Some(TreeNode::Group { .. })) {
            return false;
        }
        let old_parent = self
            .nodes
            .get(id)
            .and_then(|n| n.parent_id())
            .map(str::to_string);
        if let Some(old_parent) = old_parent {
            if let Some(TreeNode::Group { children, .. }) = self.nodes.get_mut(&old_parent) {
                children.retain(|c| c != id);
            }
        }
        if let Some(TreeNode::Group { children, .. }) = self.nodes.get_mut(new_parent_id) {
            children.push(id.to_string());
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.set_parent_id(Some(new_parent_id.to_string()));
        }
        true
    }

    pub fn get_project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn set_node_terminal_id(&mut self, node_id: &str, terminal_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(TreeNode::Terminal { terminal_id: t, .. }) => {
                *t = terminal_id.to_string();
                true
            }
            _ => false,
        }
    }

    /// Finds the terminal node whose `terminal_id` equals the given id.
    pub fn find_node_for_terminal(&self, terminal_id: &str) -> Option<&TreeNode> {
        self.nodes
            .values()
            .find(|n| n.terminal_id() == Some(terminal_id))
    }

    /// Walks parent pointers up to a root group and returns the owning
    /// project.
    pub fn project_of_node(&self, node_id: &str) -> Option<&Project> {
        let mut current = node_id;
        loop {
            let node = self.nodes.get(current)?;
            match node.parent_id() {
                Some(parent) => current = parent,
                None => {
                    return self
                        .projects
                        .values()
                        .find(|p| p.root_group_id == current);
                }
            }
        }
    }

    pub fn active_project_id(&self) -> Option<&str> {
        self.active_project_id.as_deref()
    }

    pub fn project_order(&self) -> &[String] {
        &self.project_order
    }

    pub fn projects(&self) -> &HashMap<String, Project> {
        &self.projects
    }

    pub fn nodes(&self) -> &HashMap<String, TreeNode> {
        &self.nodes
    }

    /// Replaces the store contents from a persisted record. An empty order is
    /// backfilled from the project keys; stale ids are dropped from both the
    /// order and the active pointer.
    pub fn restore(
        &mut self,
        projects: HashMap<String, Project>,
        nodes: HashMap<String, TreeNode>,
        active: Option<String>,
        order: Vec<String>,
    ) {
        let mut order: Vec<String> = order
            .into_iter()
            .filter(|id| projects.contains_key(id))
            .collect();
        for id in projects.keys() {
            if !order.iter().any(|o| o == id) {
                order.push(id.clone());
            }
        }
        self.active_project_id = active.filter(|id| projects.contains_key(id));
        self.projects = projects;
        self.nodes = nodes;
        self.project_order = order;
    }
}
