//! Update descriptions embedded in jars
//!
//! A jar may carry `update-description.txt` in its root. The first line is
//! the one-line summary; the remaining lines form the longer description.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ufx_protocol::UpdateDescription;
use zip::result::ZipError;
use zip::ZipArchive;

/// Entry name looked up inside every jar.
pub const DESCRIPTION_ENTRY: &str = "update-description.txt";

/// One-liner plus free text attached to an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub one_liner: String,
    pub body: String,
}

impl UpdateDescriptor {
    /// Parse description text; `None` if it has no lines at all.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let one_liner = lines.next()?.to_string();
        let body = lines.collect::<Vec<_>>().join("\n");
        Some(Self { one_liner, body })
    }

    pub fn to_wire(&self) -> UpdateDescription {
        UpdateDescription {
            one_liner: self.one_liner.clone(),
            description: self.body.clone(),
        }
    }
}

/// Non-fatal problems noticed while building an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildWarning {
    /// The jar has no description entry.
    MissingDescription { version: u32 },
    /// The description entry exists but is empty.
    EmptyDescription { version: u32 },
}

impl fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDescription { version } => {
                write!(f, "version {} has no {}", version, DESCRIPTION_ENTRY)
            }
            Self::EmptyDescription { version } => {
                write!(f, "version {} has an empty {}", version, DESCRIPTION_ENTRY)
            }
        }
    }
}

/// Read the description of the jar at `jar` for `version`.
///
/// Returns the descriptor if one is present and non-empty, otherwise the
/// warning to record. Invalid UTF-8 is replaced, not rejected.
pub fn read_description(jar: &Path, version: u32) -> Result<Result<UpdateDescriptor, BuildWarning>, ZipError> {
    let file = File::open(jar)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let mut entry = match archive.by_name(DESCRIPTION_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(Err(BuildWarning::MissingDescription { version })),
        Err(e) => return Err(e),
    };

    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);

    Ok(UpdateDescriptor::parse(&text).ok_or(BuildWarning::EmptyDescription { version }))
}
