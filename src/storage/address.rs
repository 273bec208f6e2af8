//! Tenant addressing
//!
//! Workspaces are encoded as signed decimal integers everywhere: on disk,
//! in logs and when parsed from request paths. No other encoding is
//! accepted, so one logical workspace always maps to one directory.

use super::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workspace inside an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(i64);

impl WorkspaceId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| StorageError::InvalidAddress(format!("unexpected workspace id: {}", s)))
    }
}

/// (application, workspace) pair scoping both storage and quota
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    application: String,
    workspace: WorkspaceId,
}

impl Address {
    /// Build an address, rejecting application names that would escape
    /// the storage root
    pub fn new(
        application: impl Into<String>,
        workspace: WorkspaceId,
    ) -> Result<Self, StorageError> {
        let application = application.into();

        if application.is_empty()
            || application == "."
            || application == ".."
            || application.contains(['/', '\\', '\0'])
        {
            return Err(StorageError::InvalidAddress(format!(
                "unexpected application: {:?}",
                application
            )));
        }

        Ok(Self {
            application,
            workspace,
        })
    }

    /// Parse the path form `{application}/{workspace}`
    pub fn parse(application: &str, workspace: &str) -> Result<Self, StorageError> {
        Self::new(application, workspace.parse()?)
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_workspace() {
        let addr = Address::parse("notes", "-17").unwrap();
        assert_eq!(addr.application(), "notes");
        assert_eq!(addr.workspace(), WorkspaceId::new(-17));
        assert_eq!(addr.to_string(), "notes/-17");
    }

    #[test]
    fn test_rejects_hex_workspace() {
        assert!(matches!(
            Address::parse("notes", "0x1f"),
            Err(StorageError::InvalidAddress(_))
        ));
        assert!(Address::parse("notes", "1f").is_err());
    }

    #[test]
    fn test_rejects_escaping_application() {
        for app in ["", ".", "..", "a/b", "a\\b"] {
            assert!(Address::new(app, WorkspaceId::new(1)).is_err(), "{:?}", app);
        }
    }
}
