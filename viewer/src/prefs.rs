use crate::errors::Result;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LAST_USER_KEY: &str = "viewer_user";

/// Small key/value file that survives restarts. Only the last-used
/// username is stored.
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: Map<String, Value>,
}

impl Preferences {
    /// A missing or unreadable file yields empty preferences.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!("Ignoring unreadable preferences file {}", path.display());
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_user(&self) -> Option<&str> {
        self.values
            .get(LAST_USER_KEY)
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn set_last_user(&mut self, user: &str) -> Result<()> {
        if self.last_user() == Some(user) {
            return Ok(());
        }
        self.values
            .insert(LAST_USER_KEY.to_string(), Value::String(user.to_string()));
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, text)?;
        debug!("Preferences saved to {}", self.path.display());
        Ok(())
    }
}
