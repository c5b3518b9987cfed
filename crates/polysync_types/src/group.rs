//! Sync group description.

use crate::error::GroupResult;
use crate::mapping::MemberId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the group description inside its configuration directory.
pub const GROUP_FILE: &str = "group.json";

/// A member of a sync group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member id, unique in the group.
    pub id: MemberId,
    /// Display name.
    pub name: String,
    /// Object types the member synchronizes. Empty means every type.
    #[serde(default)]
    pub objtypes: Vec<String>,
}

impl Member {
    /// Creates a member handling every object type.
    pub fn new(id: MemberId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            objtypes: Vec::new(),
        }
    }

    /// Restricts the member to `objtype` (may be called repeatedly).
    pub fn with_objtype(mut self, objtype: impl Into<String>) -> Self {
        self.objtypes.push(objtype.into());
        self
    }

    /// Returns true if the member has a sink for `objtype`.
    pub fn supports(&self, objtype: &str) -> bool {
        self.objtypes.is_empty() || self.objtypes.iter().any(|o| o == objtype)
    }
}

/// Whether an object type takes part in synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjTypeSetting {
    /// Object type name.
    pub name: String,
    /// Disabled types are skipped.
    pub enabled: bool,
}

/// A sync group: members and the object types they exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Directory holding the group file, the lock and the archive.
    #[serde(skip)]
    pub config_dir: Option<PathBuf>,
    /// Members in registration order.
    pub members: Vec<Member>,
    /// Object types.
    pub objtypes: Vec<ObjTypeSetting>,
}

impl Group {
    /// Creates an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the configuration directory.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Adds a member.
    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    /// Adds an enabled object type.
    pub fn with_objtype(mut self, name: impl Into<String>) -> Self {
        self.objtypes.push(ObjTypeSetting {
            name: name.into(),
            enabled: true,
        });
        self
    }

    /// Enables or disables an object type. Unknown names are ignored.
    pub fn set_objtype_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(setting) = self.objtypes.iter_mut().find(|o| o.name == name) {
            setting.enabled = enabled;
        }
    }

    /// Returns the names of enabled object types, in configuration order.
    pub fn enabled_objtypes(&self) -> impl Iterator<Item = &str> {
        self.objtypes
            .iter()
            .filter(|o| o.enabled)
            .map(|o| o.name.as_str())
    }

    /// Returns the member with `id`.
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Loads `group.json` from `dir`.
    pub fn load(dir: &Path) -> GroupResult<Self> {
        let raw = fs::read_to_string(dir.join(GROUP_FILE))?;
        let mut group: Group = serde_json::from_str(&raw)?;
        group.config_dir = Some(dir.to_path_buf());
        Ok(group)
    }

    /// Writes `group.json` into `dir`, creating the directory if needed.
    pub fn save(&self, dir: &Path) -> GroupResult<()> {
        fs::create_dir_all(dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(GROUP_FILE), raw)?;
        Ok(())
    }
}
