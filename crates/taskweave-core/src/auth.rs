// Security context threaded through engine operations.
//
// The engine never enforces access control itself; it carries the context so
// that storage can scope queries by project and so that delayed calls can be
// dispatched under the identity that scheduled them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub is_admin: bool,
    /// Delegation handle under which cron triggers fire workflows
    pub trust_id: Option<String>,
}

impl AuthContext {
    pub fn admin() -> Self {
        AuthContext {
            user_id: None,
            project_id: None,
            is_admin: true,
            trust_id: None,
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        AuthContext {
            project_id: Some(project_id.into()),
            ..Default::default()
        }
    }
}
