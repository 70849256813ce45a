//! Declarative build manifests.
//!
//! A [`Manifest`] is an ordered list of entries declaring what the site
//! contains: artifacts to build, reusable parts and outputs, targets to
//! delete, and project properties. Entries are plain data; compiling them
//! into runnable chains is the job of [`crate::project::Site`].

mod pattern;

pub use pattern::{resolve_relative, Mask, UrlPattern};

use std::fmt;

use serde::{Deserialize, Serialize};

/// The role a stage plays in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageCategory {
    /// Byte producer reading the artifact's source verbatim.
    Source,
    /// Event producer reading and parsing the artifact's source.
    Read,
    /// Parses an upstream byte stream into events.
    Parse,
    /// Serializes an event stream into bytes.
    Format,
    /// Rewrites an event stream.
    Transform,
    /// Consumes an event stream with side outputs.
    Process,
}

impl StageCategory {
    /// The manifest spelling of this category.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Read => "read",
            Self::Parse => "parse",
            Self::Format => "format",
            Self::Transform => "transform",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named stage parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    /// Parameter name.
    pub name: String,
    /// Parameter value; may contain `${property}` references resolved at
    /// compile time.
    pub value: String,
}

/// One stage declaration inside a manifest entry.
///
/// Nesting expresses data flow: a declaration's nested stage consumes what
/// the declaring stage feeds it, so the innermost declaration is the chain's
/// root (the stage nearest the output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDecl {
    /// The stage category.
    pub category: StageCategory,
    /// The stage type within the category, when not the default.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Stage parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDecl>,
    /// Nested stages; at most one is allowed and compilation rejects more.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageDecl>,
}

impl StageDecl {
    /// Creates a declaration of the category's default type.
    #[must_use]
    pub fn new(category: StageCategory) -> Self {
        Self {
            category,
            type_name: None,
            params: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Sets the stage type.
    #[must_use]
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(ParamDecl {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Nests a child stage that consumes this stage's output.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDecl) -> Self {
        self.stages.push(stage);
        self
    }

    /// The display name used in diagnostics, `category` or `category:type`.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.type_name {
            Some(type_name) => format!("{}:{}", self.category, type_name),
            None => self.category.to_string(),
        }
    }
}

/// An artifact: a target URL built by a stage chain from an optional source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDecl {
    /// Target URL pattern, pseudo-absolute within the site.
    pub target: String,
    /// Source URL pattern; `*` expands against the source tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Named output whose tail serializes an event-producing root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// The stage chain, declared outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageDecl>,
}

impl FileDecl {
    /// Creates an artifact declaration for `target`.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: None,
            output: None,
            stages: Vec::new(),
        }
    }

    /// Sets the source pattern.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Routes the chain's event stream through a named output.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Adds a top-level stage declaration.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDecl) -> Self {
        self.stages.push(stage);
        self
    }
}

/// A named, reusable event-producing chain resolved through `part:` URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDecl {
    /// The part's name; referenced as `part:name`.
    pub name: String,
    /// Source URL for the part's chain, when it reads one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// The stage chain, declared outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageDecl>,
}

impl PartDecl {
    /// Creates a part declaration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            stages: Vec::new(),
        }
    }

    /// Sets the source URL.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a top-level stage declaration.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDecl) -> Self {
        self.stages.push(stage);
        self
    }
}

/// A named, reusable byte-producing tail shared by event-rooted artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    /// The output's name.
    pub name: String,
    /// The tail's stages: zero or more transforms around one serializer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageDecl>,
}

impl OutputDecl {
    /// Creates an output declaration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a top-level stage declaration.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDecl) -> Self {
        self.stages.push(stage);
        self
    }
}

/// A target to remove from storage on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDecl {
    /// Target URL to delete.
    pub target: String,
}

impl DeleteDecl {
    /// Creates a delete declaration.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// A project property available to `${name}` parameter interpolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDecl {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: String,
}

impl PropertyDecl {
    /// Creates a property declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ManifestEntry {
    /// An artifact to build.
    File(FileDecl),
    /// A reusable event-producing chain.
    Part(PartDecl),
    /// A reusable byte-producing tail.
    Output(OutputDecl),
    /// A target to delete.
    Delete(DeleteDecl),
    /// A project property.
    Property(PropertyDecl),
}

impl ManifestEntry {
    /// A short name for logs and diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::File(decl) => &decl.target,
            Self::Part(decl) => &decl.name,
            Self::Output(decl) => &decl.name,
            Self::Delete(decl) => &decl.target,
            Self::Property(decl) => &decl.name,
        }
    }
}

/// An ordered site manifest.
///
/// Declaration order is visible behavior: properties apply to later entries,
/// before and after hooks fire in order, and artifacts build in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries in declaration order.
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    #[must_use]
    pub fn with_entry(mut self, entry: ManifestEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Appends an artifact entry.
    #[must_use]
    pub fn with_file(self, decl: FileDecl) -> Self {
        self.with_entry(ManifestEntry::File(decl))
    }

    /// Appends a part entry.
    #[must_use]
    pub fn with_part(self, decl: PartDecl) -> Self {
        self.with_entry(ManifestEntry::Part(decl))
    }

    /// Appends an output entry.
    #[must_use]
    pub fn with_output(self, decl: OutputDecl) -> Self {
        self.with_entry(ManifestEntry::Output(decl))
    }

    /// Appends a delete entry.
    #[must_use]
    pub fn with_delete(self, decl: DeleteDecl) -> Self {
        self.with_entry(ManifestEntry::Delete(decl))
    }

    /// Appends a property entry.
    #[must_use]
    pub fn with_property(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_entry(ManifestEntry::Property(PropertyDecl::new(name, value)))
    }

    /// Serializes the manifest to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a manifest from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON does not describe a manifest.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_manifest() -> Manifest {
        Manifest::new()
            .with_property("site", "demo")
            .with_output(
                OutputDecl::new("serialize")
                    .with_stage(StageDecl::new(StageCategory::Format).with_type("xml")),
            )
            .with_file(
                FileDecl::new("/index.html")
                    .with_source("/src/index.xml")
                    .with_output("serialize")
                    .with_stage(StageDecl::new(StageCategory::Read)),
            )
            .with_delete(DeleteDecl::new("/old.html"))
    }

    #[test]
    fn test_stage_decl_nesting_builds_inward() {
        let decl = StageDecl::new(StageCategory::Read).with_stage(
            StageDecl::new(StageCategory::Transform)
                .with_type("identity")
                .with_stage(StageDecl::new(StageCategory::Format).with_type("text")),
        );
        assert_eq!(decl.stages.len(), 1);
        let inner = &decl.stages[0];
        assert_eq!(inner.label(), "transform:identity");
        assert_eq!(inner.stages[0].label(), "format:text");
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = sample_manifest();
        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn test_manifest_entry_kinds_tagged() {
        let json = sample_manifest().to_json().unwrap();
        assert!(json.contains("\"kind\": \"file\""));
        assert!(json.contains("\"kind\": \"delete\""));
        assert!(json.contains("\"kind\": \"property\""));
    }

    #[test]
    fn test_manifest_from_json_declaration() {
        let json = r#"{
            "entries": [
                {"kind": "property", "name": "lang", "value": "en"},
                {
                    "kind": "file",
                    "target": "/out/*.html",
                    "source": "/src/*.xml",
                    "stages": [
                        {"category": "read", "stages": [{"category": "format", "type": "xml"}]}
                    ]
                }
            ]
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        match &manifest.entries[1] {
            ManifestEntry::File(decl) => {
                assert_eq!(decl.target, "/out/*.html");
                assert_eq!(decl.stages[0].stages[0].type_name.as_deref(), Some("xml"));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_entry_labels() {
        let manifest = sample_manifest();
        let labels: Vec<&str> = manifest.entries.iter().map(ManifestEntry::label).collect();
        assert_eq!(labels, vec!["site", "serialize", "/index.html", "/old.html"]);
    }
}
