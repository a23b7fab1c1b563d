use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{QuizDefinition, QuizEventId, QuizStore};
use crate::error::{QuizError, Result};

/// Keeps each quiz definition as `<dir>/<event_id>.json`.
pub struct JsonFileQuizStore {
    dir: PathBuf,
}

impl JsonFileQuizStore {
    /// Creates the directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "Storing quiz definitions as JSON files");
        Ok(Self { dir })
    }

    fn path_for(&self, event_id: QuizEventId) -> PathBuf {
        self.dir.join(format!("{event_id}.json"))
    }
}

#[async_trait]
impl QuizStore for JsonFileQuizStore {
    async fn load(&self, event_id: QuizEventId) -> Result<QuizDefinition> {
        let path = self.path_for(event_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QuizError::QuizNotFound(event_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save(&self, event_id: QuizEventId, quiz: &QuizDefinition) -> Result<()> {
        let path = self.path_for(event_id);
        let data = serde_json::to_vec_pretty(quiz)?;

        // Write then rename so readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(quiz_event_id = event_id, file = %path.display(), "Saved quiz definition");
        Ok(())
    }
}
