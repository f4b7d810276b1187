//! Persistent record of the last processed message.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::feed::MessageId;

/// Last processed message id, or nothing on a fresh install.
///
/// The cursor only moves forward: [`Cursor::advance`] never returns an
/// older position than the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor(Option<MessageId>);

impl Cursor {
    pub fn empty() -> Self {
        Cursor(None)
    }

    pub fn at(id: MessageId) -> Self {
        Cursor(Some(id))
    }

    pub fn last(&self) -> Option<MessageId> {
        self.0
    }

    pub fn advance(self, id: MessageId) -> Self {
        match self.0 {
            Some(current) if current >= id => self,
            _ => Cursor(Some(id)),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{}", id),
            None => f.write_str("none"),
        }
    }
}

/// Durable storage for the cursor.
pub trait CursorStore: Send {
    fn load(&self) -> Result<Cursor, StateError>;

    fn save(&mut self, id: MessageId) -> Result<(), StateError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    last_message_id: Option<MessageId>,
}

/// JSON state file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Cursor, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No state file at {}, starting fresh", self.path.display());
                return Ok(Cursor::empty());
            }
            Err(e) => return Err(StateError::io(&self.path, e)),
        };

        let state: StateFile =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Cursor(state.last_message_id))
    }

    fn save(&mut self, id: MessageId) -> Result<(), StateError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);

        if let Some(dir) = &parent {
            fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        }

        let state = StateFile {
            last_message_id: Some(id),
        };
        let json = serde_json::to_string_pretty(&state).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.tmp_path();
        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        };
        write_tmp().map_err(|e| StateError::io(&tmp, e))?;

        fs::rename(&tmp, &self.path).map_err(|e| StateError::io(&self.path, e))?;

        // Persist the rename itself; not every platform lets us open a directory.
        if let Some(dir) = parent {
            if let Ok(handle) = File::open(&dir) {
                handle.sync_all().ok();
            }
        }

        tracing::debug!("State saved to {} (last_message_id={})", self.path.display(), id);
        Ok(())
    }
}
