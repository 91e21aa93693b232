//! Logical store paths for one world.
//!
//! ```text
//! world/{ownerId}/{worldId}/data                      canonical state
//! world/{ownerId}/{worldId}/users/{sessionId}/data    per-session channel
//! world/{ownerId}/{worldId}/settings                  theme settings
//! world/{ownerId}/{worldId}/clipboard                 clipboard
//! ```

use std::fmt;

use thiserror::Error;

use crate::diff::escape_segment;

/// Top-level namespace all worlds live under.
pub const WORLD_ROOT: &str = "world";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("{what} must not be empty")]
    Empty { what: &'static str },
    #[error("{what} must not contain '/': {value}")]
    Separator { what: &'static str, value: String },
}

/// Address of one world in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorldPath {
    owner_id: String,
    world_id: String,
}

impl WorldPath {
    pub fn new(owner_id: impl Into<String>, world_id: impl Into<String>) -> Result<Self, PathError> {
        let owner_id = owner_id.into();
        let world_id = world_id.into();
        validate_id("owner id", &owner_id)?;
        validate_id("world id", &world_id)?;
        Ok(Self { owner_id, world_id })
    }

    /// Recover the world a store path belongs to, if any.
    pub fn containing(path: &str) -> Option<Self> {
        let mut parts = path.trim_matches('/').split('/');
        if parts.next()? != WORLD_ROOT {
            return None;
        }
        let owner = parts.next()?;
        let world = parts.next()?;
        Self::new(owner, world).ok()
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    pub fn root(&self) -> String {
        format!("{WORLD_ROOT}/{}/{}", self.owner_id, self.world_id)
    }

    pub fn canonical(&self) -> String {
        format!("{}/data", self.root())
    }

    /// Parent of every session channel.
    pub fn users(&self) -> String {
        format!("{}/users", self.root())
    }

    /// Root of one session's channel. The id is escaped as a single path
    /// segment, matching the keys of a `users` snapshot.
    pub fn session_root(&self, session_id: &str) -> String {
        format!("{}/{}", self.users(), escape_segment(session_id))
    }

    pub fn channel(&self, session_id: &str) -> String {
        format!("{}/data", self.session_root(session_id))
    }

    pub fn settings(&self) -> String {
        format!("{}/settings", self.root())
    }

    pub fn clipboard(&self) -> String {
        format!("{}/clipboard", self.root())
    }
}

impl fmt::Display for WorldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.world_id)
    }
}

/// Ids become single path segments: non-empty, no separator.
pub fn validate_id(what: &'static str, value: &str) -> Result<(), PathError> {
    if value.is_empty() {
        return Err(PathError::Empty { what });
    }
    if value.contains('/') {
        return Err(PathError::Separator {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}
