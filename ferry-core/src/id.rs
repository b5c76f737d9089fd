use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// The kind of background work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum TaskKind {
    /// Live migration of a whole VM to another host.
    Migration,
    /// Point-in-time or incremental copy of a single disk.
    DiskCopying,
}

impl TaskKind {
    /// Returns the stable string form used inside task identifiers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::DiskCopying => "disk-copying",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "migration" => Ok(Self::Migration),
            "disk-copying" => Ok(Self::DiskCopying),
            other => Err(CoreError::UnknownTaskKind(other.to_owned())),
        }
    }
}

/// Registry key of a task: `kind:object` or `kind:object@owner`.
///
/// For a migration the object is the VM name and there is no owner.
/// For a disk copy the object is the disk and the owner is the VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    kind: TaskKind,
    object: String,
    owner: Option<String>,
}

impl TaskId {
    /// Creates an identifier without an owner.
    pub fn new(kind: TaskKind, object: impl Into<String>) -> Self {
        Self { kind, object: object.into(), owner: None }
    }

    /// Creates an identifier whose object belongs to `owner`.
    pub fn with_owner(kind: TaskKind, object: impl Into<String>, owner: impl Into<String>) -> Self {
        Self { kind, object: object.into(), owner: Some(owner.into()) }
    }

    /// Identifier of the migration task for a VM.
    pub fn migration(vm_name: impl Into<String>) -> Self {
        Self::new(TaskKind::Migration, vm_name)
    }

    /// Identifier of the copying task for one disk of a VM.
    pub fn disk_copying(disk: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self::with_owner(TaskKind::DiskCopying, disk, vm_name)
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Returns `true` if `name` is either the object or the owner of this task.
    #[must_use]
    pub fn involves(&self, name: &str) -> bool {
        self.object == name || self.owner.as_deref() == Some(name)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.object)?;
        if let Some(owner) = &self.owner {
            write!(f, "@{owner}")?;
        }
        Ok(())
    }
}

impl FromStr for TaskId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidTaskId {
            value: s.to_owned(),
            reason: reason.to_owned(),
        };

        let (kind, rest) = s.split_once(':').ok_or_else(|| invalid("missing ':' separator"))?;
        let kind = kind.parse::<TaskKind>()?;

        let (object, owner) = match rest.rsplit_once('@') {
            Some((object, owner)) => {
                if owner.is_empty() {
                    return Err(invalid("empty owner"));
                }
                (object, Some(owner.to_owned()))
            }
            None => (rest, None),
        };

        if object.is_empty() {
            return Err(invalid("empty object"));
        }

        Ok(Self { kind, object: object.to_owned(), owner })
    }
}

impl TryFrom<String> for TaskId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}
