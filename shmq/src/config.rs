use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;

/// Ring size used when none is given: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1 << 20;
pub const DEFAULT_NAME: &str = "shmq";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: DEFAULT_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        QueueConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Load from a TOML file; a missing file is created with the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, QueueError> {
        Ok(confy::load_path(path)?)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn loads_toml() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("queue.toml");
        fs::write(&path, "name = \"orders\"\ncapacity = 4096\n")?;
        let cfg = QueueConfig::load(&path)?;
        assert_eq!(cfg, QueueConfig::new("orders").with_capacity(4096));
        Ok(())
    }

    #[test]
    fn missing_keys_use_defaults() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("queue.toml");
        fs::write(&path, "name = \"events\"\n")?;
        let cfg = QueueConfig::load(&path)?;
        assert_eq!(cfg.name, "events");
        assert_eq!(cfg.capacity, DEFAULT_CAPACITY);
        Ok(())
    }

    #[test]
    fn missing_file_is_written_with_defaults() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("fresh.toml");
        let cfg = QueueConfig::load(&path)?;
        assert_eq!(cfg, QueueConfig::default());
        assert!(path.exists());
        Ok(())
    }
}
