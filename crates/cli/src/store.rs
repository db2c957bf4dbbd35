//! One JSON file per thread under a store directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stepwise_agent::store::ThreadStore;
use stepwise_core::domain::state::ConversationState;
use stepwise_core::errors::ApplicationError;
use tokio::fs;

const ID_HASH_CHARS: usize = 16;

pub struct JsonFileThreadStore {
    dir: PathBuf,
}

impl JsonFileThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a thread: a readable `[A-Za-z0-9_-]` stem plus a short hash
    /// of the raw id, so ids that sanitize alike still get distinct files.
    pub fn path_for(&self, thread_id: &str) -> PathBuf {
        let stem = thread_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
            .collect::<String>();
        let digest = blake3::hash(thread_id.as_bytes()).to_hex();
        self.dir.join(format!("{stem}-{}.json", &digest.as_str()[..ID_HASH_CHARS]))
    }
}

#[async_trait]
impl ThreadStore for JsonFileThreadStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, ApplicationError> {
        let path = self.path_for(thread_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(ApplicationError::Persistence(format!(
                    "failed to read `{}`: {error}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&raw).map(Some).map_err(|error| {
            ApplicationError::Persistence(format!("failed to parse `{}`: {error}", path.display()))
        })
    }

    async fn save(
        &self,
        thread_id: &str,
        state: &ConversationState,
    ) -> Result<(), ApplicationError> {
        let persistence = |error: std::io::Error| ApplicationError::Persistence(error.to_string());
        fs::create_dir_all(&self.dir).await.map_err(persistence)?;

        let body = serde_json::to_string_pretty(state)
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        let path = self.path_for(thread_id);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body).await.map_err(persistence)?;
        fs::rename(&staging, &path).await.map_err(persistence)?;
        Ok(())
    }
}
