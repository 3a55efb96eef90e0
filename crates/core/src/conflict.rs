//! Conflict resolution strategies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a detected write conflict is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Replace the current version with the caller's content.
    Overwrite,
    /// Keep the current file and store the caller's content as a new file.
    CreateCopy,
    /// Store caller-supplied merged content as the next version.
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "OVERWRITE",
            Self::CreateCopy => "CREATE_COPY",
            Self::Merge => "MERGE",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OVERWRITE" => Ok(Self::Overwrite),
            "CREATE_COPY" => Ok(Self::CreateCopy),
            "MERGE" => Ok(Self::Merge),
            _ => Err(crate::Error::UnknownStrategy(s.to_string())),
        }
    }
}

/// Name for an automatically created conflict copy of `name`.
///
/// The `_conflict_<millis>` tag goes before the extension when the name has
/// one (a leading dot does not count as an extension).
pub fn conflict_copy_name(name: &str, unix_millis: i128) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            format!("{}_conflict_{}{}", &name[..dot], unix_millis, &name[dot..])
        }
        _ => format!("{name}_conflict_{unix_millis}"),
    }
}
