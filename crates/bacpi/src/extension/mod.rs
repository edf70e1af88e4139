//! Dynamic Extension Loader
//!
//! Reads declarative point definitions from a JSON array and inserts the valid
//! ones into the [`Registry`]. Each entry names a kind from a closed
//! constructor table plus its parameters:
//!
//! ```json
//! [
//!   {"kind": "analogValue", "params": {"objectIdentifier": ["analogValue", 5]}},
//!   {"module": "bacpypes.object", "class": "BinaryOutputObject", "params": {"objectIdentifier": ["binaryOutput", 2]}}
//! ]
//! ```
//!
//! Failures are per entry. A bad entry is logged and skipped; the rest of the
//! file is still processed.

mod constructors;
mod entry;

pub use constructors::{KINDS, KindEntry, resolve_kind};
pub use entry::{EntryParams, SensorRef, normalize_identifier};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::point::{Point, PointIdentifier};
use crate::registry::{Registry, RegistryError};

/// Error type for extension loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Extension file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to read extension file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse extension file: {0}")]
    ConfigParse(String),

    #[error("Cannot resolve kind: {0}")]
    Resolution(String),

    #[error("Malformed entry: {0}")]
    Malformed(String),

    #[error("Identifier already claimed: {0}")]
    Duplicate(PointIdentifier),

    #[error("Registration rejected: {0}")]
    Registration(#[from] RegistryError),
}

/// Hardware bindings an extension entry may refer to
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    /// Pins present in the channel map
    pub pins: BTreeSet<u8>,
    /// Names of configured environmental sensors
    pub sensors: BTreeSet<String>,
}

/// Outcome of one loader pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub added: Vec<PointIdentifier>,
    pub skipped: usize,
}

/// Extension loader
pub struct ExtensionLoader;

impl ExtensionLoader {
    /// Read the entry array from disk
    pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<Value>, LoadError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse_entries(&content)
    }

    pub fn parse_entries(content: &str) -> Result<Vec<Value>, LoadError> {
        match serde_json::from_str(content) {
            Ok(Value::Array(entries)) => Ok(entries),
            Ok(other) => Err(LoadError::ConfigParse(format!(
                "expected an array of entries, found {}",
                json_type(&other)
            ))),
            Err(e) => Err(LoadError::ConfigParse(e.to_string())),
        }
    }

    /// Build and register every entry, in order
    pub fn load_entries(entries: &[Value], registry: &mut Registry, ctx: &LoadContext) -> LoadReport {
        let mut report = LoadReport::default();

        for (index, entry) in entries.iter().enumerate() {
            let result = Self::build_point(entry, ctx).and_then(|point| {
                // Claimed by a bootstrap point or an earlier entry
                if registry.contains(&point.id) {
                    return Err(LoadError::Duplicate(point.id));
                }
                let id = point.id;
                registry.add(point)?;
                Ok(id)
            });

            match result {
                Ok(id) => {
                    debug!(entry = index, object = %id, "Loaded extension point");
                    report.added.push(id);
                }
                Err(e) => {
                    warn!(entry = index, "Skipping extension entry: {}", e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Extension pass complete: {} added, {} skipped",
            report.added.len(),
            report.skipped
        );
        report
    }

    /// Resolve, validate and construct the point described by one entry
    pub fn build_point(entry: &Value, ctx: &LoadContext) -> Result<Point, LoadError> {
        let fields = entry
            .as_object()
            .ok_or_else(|| LoadError::Malformed(format!("entry is {}", json_type(entry))))?;

        // Legacy entries name the kind through `class`
        let kind = fields
            .get("kind")
            .or_else(|| fields.get("class"))
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::Resolution("entry has no kind".into()))?;
        let constructor = resolve_kind(kind)
            .ok_or_else(|| LoadError::Resolution(format!("unknown kind '{kind}'")))?;

        let params: EntryParams = match fields.get("params") {
            Some(params) => serde_json::from_value(params.clone())
                .map_err(|e| LoadError::Malformed(e.to_string()))?,
            None => return Err(LoadError::Malformed("missing params".into())),
        };

        let id = params
            .object_identifier
            .as_ref()
            .ok_or_else(|| LoadError::Malformed("missing objectIdentifier".into()))
            .and_then(normalize_identifier)?;
        if id.object_type != constructor.object_type {
            return Err(LoadError::Malformed(format!(
                "identifier {id} does not match kind '{kind}'"
            )));
        }

        constructor.build(id, &params, ctx)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
