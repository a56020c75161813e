#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-schema** – JSON-schema contract registry for Cadre.
//!
//! Loads one envelope schema, zero or more shared object schemas, and one
//! payload schema per event type from a directory at start-up, compiles them
//! under JSON Schema draft 2020-12 with format assertions enabled, and
//! resolves validators by `event_type` at runtime. Cross-file `$ref`s resolve
//! against the loaded set; nothing is fetched over the network.
//!
//! A payload schema declares its event type with a top-level `x-event-type`
//! tag; the envelope schema is recognised by its `$id` (or file name) ending
//! in `envelope.schema.json`. Tag uniqueness is enforced at load time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use tracing::debug;

/// Suffix identifying the envelope schema among the loaded files.
const ENVELOPE_SUFFIX: &str = "envelope.schema.json";

/// Compile-time bound applied to every schema file.
const MAX_SCHEMA_BYTES: u64 = 65_536; // 64 KiB

//─────────────────────────────
//  Registry
//─────────────────────────────

#[derive(Debug)]
struct CompiledSchema {
    schema_id: String,
    compiled: JSONSchema,
}

/// Immutable set of compiled contract validators.
#[derive(Debug)]
pub struct SchemaRegistry {
    envelope: CompiledSchema,
    payloads: HashMap<String, CompiledSchema>,
}

impl SchemaRegistry {
    /// Load and compile every `*.json` schema under `base_dir`.
    ///
    /// Fails if a file is unparseable, if two payload schemas claim the same
    /// event type, or if the envelope schema is absent.
    pub fn load(base_dir: impl AsRef<Path>) -> Result<Self, SchemaLoadError> {
        let base_dir = base_dir.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(base_dir)
            .map_err(|e| SchemaLoadError::Io {
                path: base_dir.to_path_buf(),
                message: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut documents = Vec::new();
        for path in files {
            let size = fs::metadata(&path)
                .map_err(|e| SchemaLoadError::Io {
                    path: path.clone(),
                    message: e.to_string(),
                })?
                .len();
            if size > MAX_SCHEMA_BYTES {
                return Err(SchemaLoadError::Oversized { path, size });
            }
            let raw = fs::read_to_string(&path).map_err(|e| SchemaLoadError::Io {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let doc: Value = serde_json::from_str(&raw).map_err(|e| SchemaLoadError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let schema_id = doc
                .get("$id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| path.file_name().unwrap_or_default().to_string_lossy().into_owned());
            documents.push((path, schema_id, doc));
        }

        // Every loaded document is registered with the compiler so that
        // cross-file $refs resolve without network access.
        let compile = |schema_id: &str, doc: &Value| -> Result<JSONSchema, SchemaLoadError> {
            let mut options = JSONSchema::options();
            options
                .with_draft(Draft::Draft202012)
                .should_validate_formats(true);
            for (_, id, shared) in &documents {
                options.with_document(id.clone(), shared.clone());
            }
            options.compile(doc).map_err(|e| SchemaLoadError::Compile {
                schema_id: schema_id.to_string(),
                message: e.to_string(),
            })
        };

        let mut envelope = None;
        let mut payloads: HashMap<String, CompiledSchema> = HashMap::new();
        for (path, schema_id, doc) in &documents {
            let is_envelope = schema_id.ends_with(ENVELOPE_SUFFIX)
                || path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(ENVELOPE_SUFFIX));
            if is_envelope {
                envelope = Some(CompiledSchema {
                    schema_id: schema_id.clone(),
                    compiled: compile(schema_id, doc)?,
                });
                continue;
            }
            if let Some(event_type) = doc.get("x-event-type").and_then(Value::as_str) {
                if payloads.contains_key(event_type) {
                    return Err(SchemaLoadError::DuplicateEventType {
                        event_type: event_type.to_string(),
                        schema_id: schema_id.clone(),
                    });
                }
                payloads.insert(
                    event_type.to_string(),
                    CompiledSchema {
                        schema_id: schema_id.clone(),
                        compiled: compile(schema_id, doc)?,
                    },
                );
            }
            // Untagged non-envelope files are shared schemas: compiled only
            // as $ref targets of the ones above.
        }

        let envelope = envelope.ok_or(SchemaLoadError::MissingEnvelope)?;
        debug!(
            payload_schemas = payloads.len(),
            envelope = %envelope.schema_id,
            "schema registry loaded"
        );
        Ok(Self { envelope, payloads })
    }

    /// Validate a decoded envelope against the envelope schema.
    pub fn validate_envelope(&self, envelope: &Value) -> Result<(), ValidationFailure> {
        first_violation(&self.envelope, envelope)
    }

    /// Validate a payload against the schema for `event_type`.
    pub fn validate_payload(&self, event_type: &str, payload: &Value) -> Result<(), ValidationFailure> {
        let schema = self
            .payloads
            .get(event_type)
            .ok_or_else(|| ValidationFailure::UnknownType(event_type.to_string()))?;
        first_violation(schema, payload)
    }

    /// Event types with a registered payload schema, sorted.
    pub fn known_event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.payloads.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Schema id of the envelope schema.
    pub fn envelope_schema_id(&self) -> &str {
        &self.envelope.schema_id
    }
}

/// Report the first error in document order, as the contract requires.
fn first_violation(schema: &CompiledSchema, instance: &Value) -> Result<(), ValidationFailure> {
    match schema.compiled.validate(instance) {
        Ok(()) => Ok(()),
        Err(mut errors) => {
            let first = errors
                .next()
                .map(|e| format!("{} at {}", e, e.instance_path))
                .unwrap_or_else(|| "schema violation".to_string());
            Err(ValidationFailure::Violation {
                message: first,
                schema_id: schema.schema_id.clone(),
            })
        }
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum SchemaLoadError {
    /// A schema directory or file could not be read.
    #[error("cannot read {path}: {message}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O failure.
        message: String,
    },
    /// A schema file is not valid JSON.
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying parse failure.
        message: String,
    },
    /// A schema file exceeds the size bound.
    #[error("schema {path} exceeds {MAX_SCHEMA_BYTES} bytes ({size})")]
    Oversized {
        /// Offending path.
        path: PathBuf,
        /// Observed size.
        size: u64,
    },
    /// A schema does not compile under draft 2020-12.
    #[error("schema {schema_id} does not compile: {message}")]
    Compile {
        /// `$id` of the offending schema.
        schema_id: String,
        /// Compiler failure.
        message: String,
    },
    /// Two payload schemas claim the same event type.
    #[error("duplicate payload schema for event type {event_type} ({schema_id})")]
    DuplicateEventType {
        /// The doubly-claimed event type.
        event_type: String,
        /// `$id` of the second claimant.
        schema_id: String,
    },
    /// No envelope schema was found.
    #[error("no envelope schema in the schema directory")]
    MissingEnvelope,
}

/// A validation rejection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationFailure {
    /// The instance violates its schema.
    #[error("schema {schema_id} violated: {message}")]
    Violation {
        /// First error in document order.
        message: String,
        /// `$id` of the violated schema.
        schema_id: String,
    },
    /// No payload schema is registered for the event type.
    #[error("no payload schema for event type {0}")]
    UnknownType(String),
}

impl ValidationFailure {
    /// Schema id involved in the failure, when one exists.
    pub fn schema_id(&self) -> Option<&str> {
        match self {
            ValidationFailure::Violation { schema_id, .. } => Some(schema_id),
            ValidationFailure::UnknownType(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_schema(dir: &Path, name: &str, doc: &Value) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(serde_json::to_string_pretty(doc).unwrap().as_bytes())
            .unwrap();
    }

    fn seed_registry(dir: &Path) {
        write_schema(
            dir,
            "envelope.schema.json",
            &json!({
                "$id": "https://example.test/envelope.schema.json",
                "type": "object",
                "required": ["event_id", "event_type"],
                "properties": {
                    "event_id": {"type": "string", "minLength": 1},
                    "event_type": {"type": "string"},
                    "timestamp": {"type": "string", "format": "date-time"}
                }
            }),
        );
        write_schema(
            dir,
            "work.item_started.schema.json",
            &json!({
                "$id": "https://example.test/work.item_started.schema.json",
                "x-event-type": "WORK.ITEM_STARTED",
                "type": "object",
                "required": ["project_id", "backlog_item_id"],
                "properties": {
                    "project_id": {"$ref": "https://example.test/shared.schema.json#/$defs/identifier"},
                    "backlog_item_id": {"$ref": "https://example.test/shared.schema.json#/$defs/identifier"}
                }
            }),
        );
        write_schema(
            dir,
            "shared.schema.json",
            &json!({
                "$id": "https://example.test/shared.schema.json",
                "$defs": {
                    "identifier": {"type": "string", "minLength": 1}
                }
            }),
        );
    }

    #[test]
    fn loads_and_validates_with_shared_refs() {
        let dir = tempfile::tempdir().unwrap();
        seed_registry(dir.path());
        let registry = SchemaRegistry::load(dir.path()).unwrap();

        assert_eq!(registry.known_event_types(), vec!["WORK.ITEM_STARTED"]);

        registry
            .validate_payload(
                "WORK.ITEM_STARTED",
                &json!({"project_id": "P1", "backlog_item_id": "B1"}),
            )
            .unwrap();

        let failure = registry
            .validate_payload("WORK.ITEM_STARTED", &json!({"project_id": ""}))
            .unwrap_err();
        assert!(matches!(failure, ValidationFailure::Violation { .. }));
        assert!(failure.schema_id().unwrap().contains("item_started"));
    }

    #[test]
    fn unknown_event_type_is_distinct_from_violation() {
        let dir = tempfile::tempdir().unwrap();
        seed_registry(dir.path());
        let registry = SchemaRegistry::load(dir.path()).unwrap();

        let failure = registry.validate_payload("NOPE", &json!({})).unwrap_err();
        assert_eq!(failure, ValidationFailure::UnknownType("NOPE".to_string()));
    }

    #[test]
    fn format_assertions_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        seed_registry(dir.path());
        let registry = SchemaRegistry::load(dir.path()).unwrap();

        registry
            .validate_envelope(&json!({
                "event_id": "e1",
                "event_type": "X",
                "timestamp": "2026-01-05T12:00:00Z"
            }))
            .unwrap();
        assert!(registry
            .validate_envelope(&json!({
                "event_id": "e1",
                "event_type": "X",
                "timestamp": "yesterday-ish"
            }))
            .is_err());
    }

    #[test]
    fn duplicate_event_type_fails_loading() {
        let dir = tempfile::tempdir().unwrap();
        seed_registry(dir.path());
        write_schema(
            dir.path(),
            "zz-duplicate.schema.json",
            &json!({
                "$id": "https://example.test/zz-duplicate.schema.json",
                "x-event-type": "WORK.ITEM_STARTED",
                "type": "object"
            }),
        );

        let err = SchemaRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, SchemaLoadError::DuplicateEventType { .. }));
    }

    #[test]
    fn missing_envelope_fails_loading() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "only-payload.schema.json",
            &json!({"x-event-type": "A.B", "type": "object"}),
        );

        let err = SchemaRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, SchemaLoadError::MissingEnvelope));
    }

    #[test]
    fn unparseable_schema_fails_loading() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let err = SchemaRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, SchemaLoadError::Parse { .. }));
    }
}
