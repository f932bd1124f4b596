//! Persistent per-VM provisioning state.
//!
//! One JSON file per VM name under the state directory. A record is created
//! when a VM starts provisioning, moves strictly forward as steps complete,
//! flips to `failed` on a step error while keeping the last completed state,
//! and is removed when the VM is destroyed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use facet::Facet;

use crate::error::HerdError;
use crate::vm_state::{PipelineStep, ProvisioningState};

/// On-disk shape of a record.
#[derive(Debug, Clone, Facet)]
struct RecordFile {
    name: String,
    state: String,
    last_completed: String,
    failed_step: Option<String>,
    error: Option<String>,
    updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub name: String,
    pub state: ProvisioningState,
    /// Last state reached successfully; equals `state` unless `state` is Failed.
    pub last_completed: ProvisioningState,
    pub failed_step: Option<PipelineStep>,
    pub error: Option<String>,
    /// Unix seconds of the last write.
    pub updated_at: u64,
}

impl StateRecord {
    fn planned(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ProvisioningState::Planned,
            last_completed: ProvisioningState::Planned,
            failed_step: None,
            error: None,
            updated_at: now_secs(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ProvisioningState::Reachable
    }

    fn to_file(&self) -> RecordFile {
        RecordFile {
            name: self.name.clone(),
            state: self.state.as_str().to_string(),
            last_completed: self.last_completed.as_str().to_string(),
            failed_step: self.failed_step.map(|s| s.as_str().to_string()),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }

    fn from_file(file: RecordFile) -> Result<Self, String> {
        Ok(Self {
            state: file.state.parse()?,
            last_completed: file.last_completed.parse()?,
            failed_step: file.failed_step.as_deref().map(str::parse).transpose()?,
            name: file.name,
            error: file.error,
            updated_at: file.updated_at,
        })
    }
}

/// File-backed store keyed by VM name.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, HerdError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| HerdError::Io {
            context: format!("creating state directory {}", dir.display()),
            source: e,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub async fn get(&self, name: &str) -> Result<Option<StateRecord>, HerdError> {
        let path = self.record_path(name);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HerdError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };
        let file: RecordFile = facet_json::from_str(&contents).map_err(|e| HerdError::StateStore {
            name: name.to_string(),
            message: format!("corrupt record {}: {e}", path.display()),
        })?;
        StateRecord::from_file(file)
            .map(Some)
            .map_err(|message| HerdError::StateStore {
                name: name.to_string(),
                message,
            })
    }

    /// Return the existing record, or create a `planned` one.
    pub async fn begin(&self, name: &str) -> Result<StateRecord, HerdError> {
        if let Some(existing) = self.get(name).await? {
            return Ok(existing);
        }
        let record = StateRecord::planned(name);
        self.write(&record).await?;
        Ok(record)
    }

    /// Record that `state` was reached. States only move forward.
    pub async fn advance(&self, name: &str, state: ProvisioningState) -> Result<StateRecord, HerdError> {
        let mut record = self.get(name).await?.unwrap_or_else(|| StateRecord::planned(name));
        if state == ProvisioningState::Failed || state <= record.last_completed {
            return Err(HerdError::StateStore {
                name: name.to_string(),
                message: format!(
                    "cannot move from {} to {state}",
                    record.last_completed
                ),
            });
        }
        record.state = state;
        record.last_completed = state;
        record.failed_step = None;
        record.error = None;
        record.updated_at = now_secs();
        self.write(&record).await?;
        Ok(record)
    }

    /// Flip the record to `failed`, keeping the last completed state.
    pub async fn mark_failed(
        &self,
        name: &str,
        step: PipelineStep,
        error: &str,
    ) -> Result<StateRecord, HerdError> {
        let mut record = self.get(name).await?.unwrap_or_else(|| StateRecord::planned(name));
        record.state = ProvisioningState::Failed;
        record.failed_step = Some(step);
        record.error = Some(error.to_string());
        record.updated_at = now_secs();
        self.write(&record).await?;
        Ok(record)
    }

    /// Delete a VM's record. Returns whether one existed.
    pub async fn remove(&self, name: &str) -> Result<bool, HerdError> {
        let path = self.record_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HerdError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            }),
        }
    }

    /// Every record in the store, sorted by VM name.
    pub async fn list(&self) -> Result<Vec<StateRecord>, HerdError> {
        let list_err = |e| HerdError::Io {
            context: format!("listing {}", self.dir.display()),
            source: e,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(list_err)?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|f| f.strip_suffix(".json"))
            {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.get(&name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn write(&self, record: &StateRecord) -> Result<(), HerdError> {
        let json = facet_json::to_string(&record.to_file()).map_err(|e| HerdError::StateStore {
            name: record.name.clone(),
            message: format!("serializing record: {e}"),
        })?;
        let path = self.record_path(&record.name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| HerdError::Io {
            context: format!("writing {}", tmp.display()),
            source: e,
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| HerdError::Io {
            context: format!("replacing {}", path.display()),
            source: e,
        })?;
        tracing::debug!(vm = %record.name, state = %record.state, "state recorded");
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
