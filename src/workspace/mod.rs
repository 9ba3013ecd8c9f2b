pub mod layout;
pub mod manager;
pub mod sessions;
pub mod tree;

pub use layout::{LayoutNode, LayoutStore, SplitDirection};
pub use manager::{CreatedTab, CycleDirection, WorkspaceManager, WorkspaceState};
pub use sessions::{SessionStatus, TerminalSession, TerminalStore};
pub use tree::{Position, Project, ProjectStore, TreeNode};
