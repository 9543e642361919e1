//! Extension manifest (`manifest.json`) model and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExtensionError, Result};

/// Name of the manifest entry inside an archive.
pub const MANIFEST_FILE: &str = "manifest.json";

// ============================================================================
// Capabilities
// ============================================================================

/// Kind of operation an extension can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Embedding,
    Rerank,
    Chat,
    Tts,
    Stt,
    Image,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 6] = [
        CapabilityType::Embedding,
        CapabilityType::Rerank,
        CapabilityType::Chat,
        CapabilityType::Tts,
        CapabilityType::Stt,
        CapabilityType::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Embedding => "embedding",
            CapabilityType::Rerank => "rerank",
            CapabilityType::Chat => "chat",
            CapabilityType::Tts => "tts",
            CapabilityType::Stt => "stt",
            CapabilityType::Image => "image",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ExtensionError::Validation(format!("unknown capability type: {}", s)))
    }
}

/// Compact set of capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, capability: CapabilityType) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: CapabilityType) {
        self.0 |= capability.bit();
    }

    pub fn contains(&self, capability: CapabilityType) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CapabilityType> + '_ {
        CapabilityType::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<CapabilityType> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = CapabilityType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::empty(), |set, c| set.with(c))
    }
}

/// One declared capability with the models it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    #[serde(default)]
    pub models: Vec<String>,
}

impl Capability {
    pub fn new(capability_type: CapabilityType) -> Self {
        Self {
            capability_type,
            models: Vec::new(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// Config schema
// ============================================================================

/// Schema of a single settings key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The subset of JSON Schema that extension settings are checked against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

impl ConfigSchema {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.properties.is_empty()
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Declared identity and capabilities of an extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Semantic version of the extension
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    /// Upstream provider the extension talks to (e.g. "openai")
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Other extensions this one needs: id -> semver requirement
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Lowest host runtime version supported
    #[serde(default)]
    pub min_version: String,
    /// Highest host runtime version supported
    #[serde(default)]
    pub max_version: String,
    #[serde(default, skip_serializing_if = "ConfigSchema::is_empty")]
    pub config_schema: ConfigSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// SHA-256 hex digest of the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Manifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_config_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    /// Parse and validate manifest bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| ExtensionError::Validation(format!("failed to parse manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `manifest.json` from an extracted archive directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|e| {
            ExtensionError::Validation(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_slice(&bytes)
    }

    /// Check required fields and the format of version strings.
    ///
    /// Every missing required field is reported in a single error.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.version.trim().is_empty() {
            missing.push("version");
        }
        if self.capabilities.is_empty() {
            missing.push("capabilities");
        }
        if !missing.is_empty() {
            return Err(ExtensionError::Validation(format!(
                "manifest missing required fields: {}",
                missing.join(", ")
            )));
        }

        if !is_valid_id(&self.id) {
            return Err(ExtensionError::Validation(format!(
                "manifest id `{}` may only contain ASCII letters, digits, '.', '_' and '-'",
                self.id
            )));
        }

        self.semver()?;
        for (field, value) in [("min_version", &self.min_version), ("max_version", &self.max_version)] {
            if !value.is_empty() {
                parse_version(field, value)?;
            }
        }
        for (dep, range) in &self.dependencies {
            semver::VersionReq::parse(range).map_err(|e| {
                ExtensionError::Validation(format!(
                    "dependency {} has invalid version range `{}`: {}",
                    dep, range, e
                ))
            })?;
        }
        Ok(())
    }

    pub fn semver(&self) -> Result<semver::Version> {
        parse_version("version", &self.version)
    }

    /// Check `min_version`/`max_version` against the running host.
    pub fn check_host_compatibility(&self, host: &semver::Version) -> Result<()> {
        if !self.min_version.is_empty() {
            let min = parse_version("min_version", &self.min_version)?;
            if *host < min {
                return Err(ExtensionError::Validation(format!(
                    "extension {} requires host >= {}, running {}",
                    self.id, min, host
                )));
            }
        }
        if !self.max_version.is_empty() {
            let max = parse_version("max_version", &self.max_version)?;
            if *host > max {
                return Err(ExtensionError::Validation(format!(
                    "extension {} requires host <= {}, running {}",
                    self.id, max, host
                )));
            }
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: CapabilityType) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.capability_type == capability)
    }

    /// Models declared for a capability (empty when not declared).
    pub fn models(&self, capability: CapabilityType) -> &[String] {
        self.capabilities
            .iter()
            .find(|c| c.capability_type == capability)
            .map(|c| c.models.as_slice())
            .unwrap_or(&[])
    }

    pub fn supports_model(&self, capability: CapabilityType, model: &str) -> bool {
        self.models(capability).iter().any(|m| m == model)
    }

    pub fn capability_set(&self) -> CapabilitySet {
        self.capabilities.iter().map(|c| c.capability_type).collect()
    }
}

fn parse_version(field: &str, value: &str) -> Result<semver::Version> {
    semver::Version::parse(value).map_err(|e| {
        ExtensionError::Validation(format!("{} `{}` is not a valid semver version: {}", field, value, e))
    })
}

fn is_valid_id(id: &str) -> bool {
    !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_json() -> &'static str {
        r#"{"id":"demo","name":"Demo","version":"1.0.0","capabilities":[{"type":"embedding","models":["m1"]}]}"#
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = Manifest::from_slice(demo_json().as_bytes()).unwrap();
        assert_eq!(manifest.id, "demo");
        assert_eq!(manifest.semver().unwrap(), semver::Version::new(1, 0, 0));
        assert!(manifest.has_capability(CapabilityType::Embedding));
        assert!(manifest.supports_model(CapabilityType::Embedding, "m1"));
        assert!(!manifest.supports_model(CapabilityType::Embedding, "m2"));
        assert!(manifest.models(CapabilityType::Rerank).is_empty());
    }

    #[test]
    fn test_missing_fields_are_all_named() {
        let err = Manifest::from_slice(br#"{"description":"nothing else"}"#).unwrap_err();
        let msg = err.to_string();
        for field in ["id", "name", "version", "capabilities"] {
            assert!(msg.contains(field), "{} not named in: {}", field, msg);
        }
    }

    #[test]
    fn test_unknown_capability_type_rejected() {
        let json = r#"{"id":"x","name":"X","version":"1.0.0","capabilities":[{"type":"video"}]}"#;
        assert!(matches!(
            Manifest::from_slice(json.as_bytes()),
            Err(ExtensionError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_version_and_ranges() {
        let manifest = Manifest::new("x", "X", "one")
            .with_capability(Capability::new(CapabilityType::Chat));
        assert!(manifest.validate().is_err());

        let mut manifest = Manifest::new("x", "X", "1.0.0")
            .with_capability(Capability::new(CapabilityType::Chat));
        manifest
            .dependencies
            .insert("base".to_string(), "not a range".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_id_must_be_path_safe() {
        let manifest = Manifest::new("../evil", "X", "1.0.0")
            .with_capability(Capability::new(CapabilityType::Chat));
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_host_version_window() {
        let mut manifest = Manifest::new("x", "X", "1.0.0")
            .with_capability(Capability::new(CapabilityType::Chat));
        manifest.min_version = "0.5.0".to_string();
        manifest.max_version = "0.9.0".to_string();

        assert!(manifest
            .check_host_compatibility(&semver::Version::new(0, 6, 0))
            .is_ok());
        assert!(manifest
            .check_host_compatibility(&semver::Version::new(0, 4, 0))
            .is_err());
        assert!(manifest
            .check_host_compatibility(&semver::Version::new(1, 0, 0))
            .is_err());
    }

    #[test]
    fn test_capability_set() {
        let manifest = Manifest::new("x", "X", "1.0.0")
            .with_capability(Capability::new(CapabilityType::Embedding))
            .with_capability(Capability::new(CapabilityType::Rerank));
        let set = manifest.capability_set();
        assert!(set.contains(CapabilityType::Embedding));
        assert!(set.contains(CapabilityType::Rerank));
        assert!(!set.contains(CapabilityType::Chat));
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn test_config_schema_parsed() {
        let json = r#"{
            "id":"x","name":"X","version":"1.0.0",
            "capabilities":[{"type":"rerank","models":[]}],
            "config_schema":{"required":["api_key"],"properties":{"api_key":{"type":"string"},"top_n":{"type":"integer","default":5}}}
        }"#;
        let manifest = Manifest::from_slice(json.as_bytes()).unwrap();
        assert_eq!(manifest.config_schema.required, vec!["api_key".to_string()]);
        let top_n = &manifest.config_schema.properties["top_n"];
        assert_eq!(top_n.value_type.as_deref(), Some("integer"));
        assert_eq!(top_n.default, Some(serde_json::json!(5)));
    }
}
