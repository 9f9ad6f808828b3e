//! Maven-style artifact coordinates: `group:name:version[:classifier][@ext]`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::RuntimeError;

const DEFAULT_EXTENSION: &str = "jar";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Coordinate {
    pub group: String,
    pub name: String,
    pub version: String,
    pub classifier: Option<String>,
    pub extension: String,
}

impl Coordinate {
    pub fn new(group: &str, name: &str, version: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            classifier: None,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_classifier(mut self, classifier: &str) -> Self {
        self.classifier = Some(classifier.to_string()).filter(|c| !c.is_empty());
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn with_group(mut self, group: String) -> Self {
        self.group = group;
        self
    }

    /// `name-version[-classifier].ext`
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(c) => format!("{}-{}-{}.{}", self.name, self.version, c, self.extension),
            None => format!("{}-{}.{}", self.name, self.version, self.extension),
        }
    }

    /// Path of this artifact inside a maven repository.
    pub fn repository_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.group.split('.') {
            path.push(part);
        }
        path.push(&self.name);
        path.push(&self.version);
        path.push(self.file_name());
        path
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)?;
        if let Some(c) = &self.classifier {
            write!(f, ":{c}")?;
        }
        write!(f, "@{}", self.extension)
    }
}

impl FromStr for Coordinate {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (body, extension) = match raw.split_once('@') {
            Some((body, ext)) if !ext.is_empty() => (body, ext),
            Some(_) => return Err(invalid(raw, "empty extension")),
            None => (raw, DEFAULT_EXTENSION),
        };
        let parts: Vec<&str> = body.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid(raw, "empty segment"));
        }
        let coordinate = match parts.as_slice() {
            [group, name, version] => Coordinate::new(group, name, version),
            [group, name, version, classifier] => {
                Coordinate::new(group, name, version).with_classifier(classifier)
            }
            _ => return Err(invalid(raw, "expected group:name:version[:classifier][@ext]")),
        };
        Ok(coordinate.with_extension(extension))
    }
}

impl TryFrom<String> for Coordinate {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Coordinate> for String {
    fn from(value: Coordinate) -> Self {
        value.to_string()
    }
}

fn invalid(raw: &str, why: &str) -> anyhow::Error {
    RuntimeError::configuration(format!("invalid coordinate '{raw}': {why}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;

    #[test]
    fn parse_and_format() {
        let c: Coordinate = "org.vineflower:vineflower:1.10.1".parse().unwrap();
        assert_eq!(c.to_string(), "org.vineflower:vineflower:1.10.1@jar");
        assert_eq!(
            c.repository_path(),
            Path::new("org/vineflower/vineflower/1.10.1/vineflower-1.10.1.jar")
        );

        let c: Coordinate = "net.minecraft:client:1.20.4:mappings@txt".parse().unwrap();
        assert_eq!(c.classifier.as_deref(), Some("mappings"));
        assert_eq!(c.extension, "txt");
        assert_eq!(c.file_name(), "client-1.20.4-mappings.txt");
        assert_eq!(c.to_string(), "net.minecraft:client:1.20.4:mappings@txt");
    }

    #[test]
    fn rejects_malformed() {
        for raw in ["a:b", "a::c", "a:b:c:d:e", "a:b:c@"] {
            let err = raw.parse::<Coordinate>().unwrap_err();
            assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration), "{raw}");
        }
    }
}
