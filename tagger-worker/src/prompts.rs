//! System prompts, one file per dimension, loaded once at startup so a
//! missing prompt fails the process instead of the first job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use tagger_common::task::{Dimension, DIMENSION_ORDER};

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("missing prompt file {path} for dimension {dimension}")]
    Missing { dimension: Dimension, path: PathBuf },
    #[error("failed to read prompt file {path}: {error}")]
    Unreadable {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("prompt file {path} is empty")]
    Empty { path: PathBuf },
}

#[derive(Debug)]
pub struct PromptStore {
    prompts: HashMap<Dimension, String>,
}

impl PromptStore {
    /// Load `{dir}/{dimension}.txt` for every configured dimension.
    pub fn load(dir: &Path) -> Result<Self, PromptError> {
        let mut prompts = HashMap::new();
        for dimension in DIMENSION_ORDER {
            let path = dir.join(format!("{}.txt", dimension));
            if !path.exists() {
                return Err(PromptError::Missing { dimension, path });
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|error| PromptError::Unreadable {
                    path: path.clone(),
                    error,
                })?;
            let text = text.trim().to_owned();
            if text.is_empty() {
                return Err(PromptError::Empty { path });
            }
            prompts.insert(dimension, text);
        }
        Ok(Self { prompts })
    }

    pub fn system_prompt(&self, dimension: Dimension) -> &str {
        // Every dimension was loaded in `load`, so this cannot miss.
        self.prompts
            .get(&dimension)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_prompts(dir: &Path, dimensions: &[&str]) {
        for dimension in dimensions {
            fs::write(
                dir.join(format!("{}.txt", dimension)),
                format!("tag the {} axis of the video", dimension),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_loads_all_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        write_prompts(dir.path(), &["vision", "audio", "content", "business"]);

        let store = PromptStore::load(dir.path()).unwrap();
        assert_eq!(
            store.system_prompt(Dimension::Audio),
            "tag the audio axis of the video"
        );
    }

    #[test]
    fn test_missing_prompt_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write_prompts(dir.path(), &["vision", "audio", "content"]);

        let err = PromptStore::load(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            PromptError::Missing {
                dimension: Dimension::Business,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_prompt_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write_prompts(dir.path(), &["vision", "audio", "content"]);
        fs::write(dir.path().join("business.txt"), "   \n").unwrap();

        let err = PromptStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, PromptError::Empty { .. }));
    }
}
