//! Versioned records and linear migration chains.
//!
//! Every persisted structure that may change shape is stored inside a
//! [`VersionedRecord`]. A [`VersionedSchema`] owns the chain of single-step
//! migrations that lifts old records to the current version. The chain is
//! validated once when the schema is built; parsing only walks it.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Versioning error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VersionError {
    #[error("migration chain is empty but records below version {0} are expected")]
    EmptyChain(u32),
    #[error("migration step {from} -> {to} must advance exactly one version")]
    NonContiguousStep { from: u32, to: u32 },
    #[error("migration chain has a gap between version {after} and {next}")]
    Gap { after: u32, next: u32 },
    #[error("migration chain ends at version {ends_at}, expected {expected}")]
    WrongEnd { ends_at: u32, expected: u32 },
    #[error("record version {version} is older than the oldest migration (version {oldest})")]
    Unsupported { version: u32, oldest: u32 },
    #[error("record version {version} is newer than the current version {current}")]
    FromFuture { version: u32, current: u32 },
    #[error("migration {from} -> {to} failed: {reason}")]
    StepFailed { from: u32, to: u32, reason: String },
    #[error("invalid data for version {version}: {reason}")]
    InvalidData { version: u32, reason: String },
}

/// Envelope stored around every evolvable structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRecord {
    pub version: u32,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_version: Option<u32>,
}

impl VersionedRecord {
    pub fn new(version: u32, data: Value) -> Self {
        Self {
            version,
            data,
            migrated_at: None,
            original_version: None,
        }
    }

    /// Wrap a serializable value at the given version.
    pub fn wrap<T: Serialize>(version: u32, value: &T) -> Result<Self, VersionError> {
        let data = serde_json::to_value(value).map_err(|e| VersionError::InvalidData {
            version,
            reason: e.to_string(),
        })?;
        Ok(Self::new(version, data))
    }
}

type MigrateFn = dyn Fn(Value) -> Result<Value, String> + Send + Sync;

/// One `from -> from + 1` transformation.
#[derive(Clone)]
pub struct MigrationStep {
    pub from_version: u32,
    pub to_version: u32,
    pub description: &'static str,
    migrate: Arc<MigrateFn>,
}

impl MigrationStep {
    pub fn new<F>(from_version: u32, to_version: u32, description: &'static str, migrate: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            from_version,
            to_version,
            description,
            migrate: Arc::new(migrate),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish()
    }
}

/// A validated migration chain ending at `current_version`.
#[derive(Debug, Clone)]
pub struct VersionedSchema {
    current_version: u32,
    steps: Vec<MigrationStep>,
}

impl VersionedSchema {
    /// A schema with no history: only `current_version` records parse.
    pub fn current(current_version: u32) -> Self {
        Self {
            current_version,
            steps: Vec::new(),
        }
    }

    /// Build a schema, validating that the steps form one contiguous chain
    /// that ends exactly at `current_version`.
    pub fn new(current_version: u32, mut steps: Vec<MigrationStep>) -> Result<Self, VersionError> {
        steps.sort_by_key(|s| s.from_version);

        for step in &steps {
            if step.to_version != step.from_version + 1 {
                return Err(VersionError::NonContiguousStep {
                    from: step.from_version,
                    to: step.to_version,
                });
            }
        }
        for pair in steps.windows(2) {
            if pair[0].to_version != pair[1].from_version {
                return Err(VersionError::Gap {
                    after: pair[0].to_version,
                    next: pair[1].from_version,
                });
            }
        }
        if let Some(last) = steps.last() {
            if last.to_version != current_version {
                return Err(VersionError::WrongEnd {
                    ends_at: last.to_version,
                    expected: current_version,
                });
            }
        }

        Ok(Self {
            current_version,
            steps,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    fn oldest_version(&self) -> u32 {
        self.steps
            .first()
            .map_or(self.current_version, |s| s.from_version)
    }

    /// Lift a record to the current version.
    ///
    /// Either every required step succeeds or the whole parse fails; no
    /// partially migrated data is returned.
    pub fn migrate(&self, record: VersionedRecord) -> Result<VersionedRecord, VersionError> {
        if record.version > self.current_version {
            return Err(VersionError::FromFuture {
                version: record.version,
                current: self.current_version,
            });
        }
        if record.version == self.current_version {
            return Ok(record);
        }
        if self.steps.is_empty() {
            return Err(VersionError::EmptyChain(self.current_version));
        }
        let oldest = self.oldest_version();
        if record.version < oldest {
            return Err(VersionError::Unsupported {
                version: record.version,
                oldest,
            });
        }

        let original_version = record.original_version.unwrap_or(record.version);
        let mut version = record.version;
        let mut data = record.data;
        for step in self.steps.iter().filter(|s| s.from_version >= record.version) {
            data = (step.migrate)(data).map_err(|reason| VersionError::StepFailed {
                from: step.from_version,
                to: step.to_version,
                reason,
            })?;
            version = step.to_version;
        }

        if version != self.current_version {
            return Err(VersionError::WrongEnd {
                ends_at: version,
                expected: self.current_version,
            });
        }

        Ok(VersionedRecord {
            version,
            data,
            migrated_at: Some(Utc::now()),
            original_version: Some(original_version),
        })
    }

    /// Migrate and deserialize the record's data.
    pub fn parse<T: DeserializeOwned>(&self, record: VersionedRecord) -> Result<T, VersionError> {
        let migrated = self.migrate(record)?;
        serde_json::from_value(migrated.data).map_err(|e| VersionError::InvalidData {
            version: migrated.version,
            reason: e.to_string(),
        })
    }

    /// Wrap a value at the current version.
    pub fn wrap<T: Serialize>(&self, value: &T) -> Result<VersionedRecord, VersionError> {
        VersionedRecord::wrap(self.current_version, value)
    }
}
