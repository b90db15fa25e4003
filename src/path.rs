//! Distributed filesystem paths
//!
//! A [`Path`] is an immutable sequence of components. The string form is
//! `/`-delimited with the root written as `/`; redundant slashes collapse and
//! `:` is reserved. Equality, hashing and ordering are defined over the
//! component sequence, so `"//a///b/"` and `"/a/b"` name the same path.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SEPARATOR: char = '/';
const RESERVED: char = ':';

/// Path in the distributed filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    components: Vec<String>,
}

impl Path {
    /// The root directory.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path string.
    pub fn new(path: &str) -> Result<Self> {
        path.parse()
    }

    /// Build a path from a component sequence, validating each component.
    pub fn from_components<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components = components
            .into_iter()
            .map(|c| {
                let c = c.into();
                validate_component(&c)?;
                Ok(c)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { components })
    }

    /// Create a new path by appending one component.
    pub fn child(&self, component: &str) -> Result<Self> {
        validate_component(component)?;
        let mut components = self.components.clone();
        components.push(component.to_string());
        Ok(Self { components })
    }

    /// Parent of this path. The root has no parent.
    pub fn parent(&self) -> Result<Self> {
        match self.components.split_last() {
            Some((_, rest)) => Ok(Self {
                components: rest.to_vec(),
            }),
            None => Err(Error::InvalidArgument("root has no parent".to_string())),
        }
    }

    /// Last component of this path. The root has none.
    pub fn last(&self) -> Result<&str> {
        self.components
            .last()
            .map(String::as_str)
            .ok_or_else(|| Error::InvalidArgument("root has no last component".to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Iterate over the components from the root outward.
    pub fn components(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.iter().map(String::as_str)
    }

    /// True if `other` is a component-wise prefix of this path (a path is a
    /// subpath of itself, and every path is a subpath of the root).
    pub fn is_subpath(&self, other: &Path) -> bool {
        self.components.starts_with(&other.components)
    }

    /// Location of this path under a local directory.
    pub fn to_local(&self, root: &std::path::Path) -> PathBuf {
        let mut local = root.to_path_buf();
        local.extend(self.components.iter());
        local
    }
}

fn validate_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(Error::PathFormat("empty path component".to_string()));
    }
    if component.contains(SEPARATOR) || component.contains(RESERVED) {
        return Err(Error::PathFormat(format!(
            "component {:?} contains a reserved character",
            component
        )));
    }
    if component == "." || component == ".." {
        return Err(Error::PathFormat(format!(
            "component {:?} is not a name",
            component
        )));
    }
    Ok(())
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with(SEPARATOR) {
            return Err(Error::PathFormat(format!(
                "path {:?} must start with '{}'",
                s, SEPARATOR
            )));
        }
        if s.contains(RESERVED) {
            return Err(Error::PathFormat(format!(
                "path {:?} contains '{}'",
                s, RESERVED
            )));
        }
        Self::from_components(s.split(SEPARATOR).filter(|c| !c.is_empty()))
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for component in &self.components {
            write!(f, "{}{}", SEPARATOR, component)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
