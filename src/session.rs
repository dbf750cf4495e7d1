//! The caller-supplied session context (§5).
//!
//! The kernel holds no ambient "current branch" or "current workspace" —
//! every operation takes a `Session` explicitly, so concurrent callers on
//! different branches never stomp on each other's notion of "current."
use crate::ids::{Ulid, MAIN_BRANCH};

/// Which branch and (optionally) which tenancy scope a call operates in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub branch_id: String,
    pub workspace_id: Option<Ulid>,
}

impl Session {
    /// A session on `main`, with no workspace scoping.
    pub fn main() -> Self {
        Self {
            branch_id: MAIN_BRANCH.to_string(),
            workspace_id: None,
        }
    }

    /// A session on an arbitrary branch, with no workspace scoping.
    pub fn on_branch(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            workspace_id: None,
        }
    }

    /// This session scoped to a workspace.
    pub fn with_workspace(mut self, workspace_id: Ulid) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::main()
    }
}
