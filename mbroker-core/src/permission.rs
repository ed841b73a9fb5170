//! Local projects and their user permissions, as synchronised to peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectRole {
    Admin,
    Manager,
    Member,
}

impl ProjectRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectRole::Admin => "admin",
            ProjectRole::Manager => "manager",
            ProjectRole::Member => "member",
        }
    }
}

impl fmt::Display for ProjectRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ProjectRole::Admin),
            "manager" => Ok(ProjectRole::Manager),
            "member" => Ok(ProjectRole::Member),
            other => Err(format!("unknown project role '{}'", other)),
        }
    }
}

/// A local project mirrored on a peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whether the project participates in peer synchronisation.
    #[serde(default)]
    pub linked: bool,
}

/// One user's role in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPermission {
    pub project_id: String,
    pub username: String,
    pub role: ProjectRole,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}
