//! Write access rules.
//!
//! Reads are open. Writes:
//!
//! ```text
//! world/{owner}/{world}/...                     owner only
//! world/{owner}/{world}/users/{uid}/...         also user `uid`
//! anything else                                 denied
//! ```

use serde::{Deserialize, Serialize};
use tessera_core::{split_path, paths::WORLD_ROOT};

use super::{StoreError, StoreResult};

/// Identity a connection writes as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Auth {
    /// Read-only viewer.
    #[default]
    Anonymous,
    User(String),
    /// Trusted in-process writer (merge sweeps, recovery). Never granted to
    /// remote connections.
    Service,
}

impl Auth {
    pub fn user(uid: impl Into<String>) -> Self {
        Auth::User(uid.into())
    }

    pub fn uid(&self) -> Option<&str> {
        match self {
            Auth::User(uid) => Some(uid),
            _ => None,
        }
    }
}

/// Check a single write.
pub fn check_write(auth: &Auth, path: &str) -> StoreResult<()> {
    if allowed(auth, path) {
        Ok(())
    } else {
        Err(StoreError::PermissionDenied {
            path: path.trim_matches('/').to_string(),
        })
    }
}

fn allowed(auth: &Auth, path: &str) -> bool {
    let uid = match auth {
        Auth::Service => return true,
        Auth::Anonymous => return false,
        Auth::User(uid) => uid,
    };

    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return false;
    }
    let segments = split_path(trimmed);
    match segments.as_slice() {
        [root, owner, _world, rest @ ..] if root == WORLD_ROOT => {
            if owner == uid {
                return true;
            }
            matches!(rest, [users, session, ..] if users == "users" && session == uid)
        }
        _ => false,
    }
}
