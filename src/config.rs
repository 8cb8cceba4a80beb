//! Bridge configuration
//!
//! Loaded from TOML. Each `[[directory]]` entry maps phase names to handler
//! chains for requests whose URI falls under `path`.
//!
//! ```toml
//! interpreter = "main"
//! read_chunk_size = 8192
//! log_level = "warning"
//!
//! [[directory]]
//! path = "/app"
//! authoritative = false
//! silent = ["maybe"]
//!
//! [directory.handlers]
//! AuthenHandler = ["auth"]
//! Handler = ["maybe", "app"]
//!
//! [directory.options]
//! mode = "production"
//! ```

use crate::error::{BridgeError, BridgeResult};
use crate::hlist::HandlerEntry;
use crate::phase::Phase;
use native_host::{HUGE_STRING_LEN, LogLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn default_interpreter() -> String {
    "main_interpreter".to_string()
}

fn default_read_chunk_size() -> usize {
    HUGE_STRING_LEN
}

fn default_authoritative() -> bool {
    true
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Name of the interpreter handlers run in
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Bytes pulled from the transport per line-read refill
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Level the host server filters its error log at
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, rename = "directory")]
    pub directories: Vec<DirectoryConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            read_chunk_size: default_read_chunk_size(),
            log_level: LogLevel::default(),
            directories: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        let config: BridgeConfig = toml::from_str(source)
            .map_err(|e| BridgeError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Check phase names and sizes
    pub fn validate(&self) -> BridgeResult<()> {
        if self.read_chunk_size == 0 {
            return Err(BridgeError::config("read_chunk_size must be positive"));
        }
        for dir in &self.directories {
            if !dir.path.starts_with('/') {
                return Err(BridgeError::config(format!(
                    "directory path must be absolute: {}",
                    dir.path
                )));
            }
            for phase in dir.handlers.keys() {
                phase.parse::<Phase>()?;
            }
        }
        Ok(())
    }

    pub fn with_interpreter(mut self, name: impl Into<String>) -> Self {
        self.interpreter = name.into();
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_directory(mut self, dir: DirectoryConfig) -> Self {
        self.directories.push(dir);
        self
    }

    /// Directories whose path covers `uri`, least specific first
    pub fn directories_for(&self, uri: &str) -> Vec<&DirectoryConfig> {
        let mut matches: Vec<&DirectoryConfig> =
            self.directories.iter().filter(|d| d.covers(uri)).collect();
        matches.sort_by_key(|d| d.path.trim_end_matches('/').len());
        matches
    }

    /// Most specific directory covering `uri`
    pub fn directory_for(&self, uri: &str) -> Option<&DirectoryConfig> {
        self.directories_for(uri).pop()
    }

    /// Options of every covering directory, more specific values winning
    pub fn options_for(&self, uri: &str) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        for dir in self.directories_for(uri) {
            options.extend(dir.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }
}

/// Per-directory handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub path: String,
    /// When false, a 401 from the authentication phases is downgraded to
    /// "declined" so other modules get a chance
    #[serde(default = "default_authoritative")]
    pub authoritative: bool,
    /// Phase name to handler chain
    #[serde(default)]
    pub handlers: BTreeMap<String, Vec<String>>,
    /// Handlers skipped quietly when not registered
    #[serde(default)]
    pub silent: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl DirectoryConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            authoritative: true,
            handlers: BTreeMap::new(),
            silent: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_handler(mut self, phase: Phase, handler: impl Into<String>) -> Self {
        self.handlers
            .entry(phase.name().to_string())
            .or_default()
            .push(handler.into());
        self
    }

    pub fn with_silent(mut self, handler: impl Into<String>) -> Self {
        self.silent.push(handler.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_authoritative(mut self, authoritative: bool) -> Self {
        self.authoritative = authoritative;
        self
    }

    /// Whether `uri` lies under this directory, on a segment boundary
    pub fn covers(&self, uri: &str) -> bool {
        let base = self.path.trim_end_matches('/');
        match uri.strip_prefix(base) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Fresh handler list for `phase`, `None` when nothing is configured
    pub fn handler_list(&self, phase: Phase) -> Option<HandlerEntry> {
        let (_, names) = self
            .handlers
            .iter()
            .find(|(name, _)| name.parse::<Phase>().ok() == Some(phase))?;
        HandlerEntry::from_handlers(
            names
                .iter()
                .map(|h| (h.as_str(), self.silent.iter().any(|s| s == h))),
            Some(&self.path),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
interpreter = "app"
read_chunk_size = 16
log_level = "debug"

[[directory]]
path = "/"

[directory.handlers]
Handler = ["root"]

[directory.options]
mode = "base"
theme = "dark"

[[directory]]
path = "/app/"
authoritative = false
silent = ["maybe"]

[directory.handlers]
PythonAuthenHandler = ["auth"]
Handler = ["maybe", "app"]

[directory.options]
mode = "app"
"#;

    #[test]
    fn test_parse_sample() {
        let config = BridgeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.interpreter, "app");
        assert_eq!(config.read_chunk_size, 16);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.directories.len(), 2);
        assert!(!config.directories[1].authoritative);
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config.read_chunk_size, HUGE_STRING_LEN);
        assert_eq!(config.log_level, LogLevel::Warning);
        assert!(config.directories.is_empty());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let config = BridgeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.directory_for("/app/x").unwrap().path, "/app/");
        assert_eq!(config.directory_for("/app").unwrap().path, "/app/");
        assert_eq!(config.directory_for("/apple").unwrap().path, "/");
        assert_eq!(config.directory_for("/").unwrap().path, "/");
    }

    #[test]
    fn test_options_merge_by_specificity() {
        let config = BridgeConfig::from_toml_str(SAMPLE).unwrap();
        let opts = config.options_for("/app/page");
        assert_eq!(opts.get("mode").map(String::as_str), Some("app"));
        assert_eq!(opts.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn test_handler_list_marks_silent_entries() {
        let config = BridgeConfig::from_toml_str(SAMPLE).unwrap();
        let dir = config.directory_for("/app/").unwrap();
        let list = dir.handler_list(Phase::Handler).unwrap();
        let entries: Vec<(&str, bool)> = list
            .iter()
            .map(|e| (e.handler.as_str(), e.silent))
            .collect();
        assert_eq!(entries, vec![("maybe", true), ("app", false)]);
        assert_eq!(list.directory.as_deref(), Some("/app/"));

        assert!(dir.handler_list(Phase::AuthenHandler).is_some());
        assert!(dir.handler_list(Phase::LogHandler).is_none());
    }

    #[test]
    fn test_unknown_phase_rejected() {
        let bad = "[[directory]]\npath = \"/\"\n[directory.handlers]\nBogusHandler = [\"x\"]\n";
        assert!(matches!(
            BridgeConfig::from_toml_str(bad),
            Err(BridgeError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.interpreter, "app");

        assert!(matches!(
            BridgeConfig::from_file("/no/such/config.toml"),
            Err(BridgeError::Config { .. })
        ));
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::default()
            .with_interpreter("x")
            .with_read_chunk_size(4)
            .with_directory(DirectoryConfig::new("/").with_handler(Phase::Handler, "h"));
        assert!(config.validate().is_ok());
        assert!(config.directory_for("/any").unwrap().handler_list(Phase::Handler).is_some());
    }
}
