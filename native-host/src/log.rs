use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use chrono::Utc;

use crate::record::NativeServer;

/// Error log severities, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Emerg,
	Alert,
	Crit,
	Error,
	Warning,
	Notice,
	Info,
	Debug,
}

impl LogLevel {
	/// Convert string to LogLevel
	pub fn from_str(s: &str) -> Option<Self> {
		match s.to_ascii_lowercase().as_str() {
			"emerg" => Some(LogLevel::Emerg),
			"alert" => Some(LogLevel::Alert),
			"crit" => Some(LogLevel::Crit),
			"error" | "err" => Some(LogLevel::Error),
			"warn" | "warning" => Some(LogLevel::Warning),
			"notice" => Some(LogLevel::Notice),
			"info" => Some(LogLevel::Info),
			"debug" => Some(LogLevel::Debug),
			_ => None,
		}
	}

	/// Convert to string representation
	pub fn as_str(&self) -> &'static str {
		match self {
			LogLevel::Emerg => "emerg",
			LogLevel::Alert => "alert",
			LogLevel::Crit => "crit",
			LogLevel::Error => "error",
			LogLevel::Warning => "warn",
			LogLevel::Notice => "notice",
			LogLevel::Info => "info",
			LogLevel::Debug => "debug",
		}
	}
}

impl Default for LogLevel {
	fn default() -> Self {
		LogLevel::Warning
	}
}

/// Log entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
	pub timestamp: String,
	pub level: LogLevel,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server: Option<String>,
}

impl LogEntry {
	/// Create a new log entry
	pub fn new(level: LogLevel, message: String, server: Option<String>) -> Self {
		Self {
			timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
			level,
			message,
			server,
		}
	}

	/// Convert to JSON value
	pub fn to_json(&self) -> Value {
		serde_json::to_value(self).unwrap_or_else(|_| {
			json!({
				"timestamp": self.timestamp,
				"level": self.level.as_str(),
				"message": self.message,
			})
		})
	}
}

/// Host error-log passthrough.
///
/// When a server is given its configured `loglevel` decides whether the entry
/// is emitted; without one every entry at `Warning` or above is kept. Returns
/// the entry that was written, or `None` when it was filtered out.
pub fn log_error(message: &str, level: LogLevel, server: Option<&NativeServer>) -> Option<LogEntry> {
	let threshold = server.map(|s| s.loglevel).unwrap_or_default();
	if level > threshold {
		return None;
	}

	let entry = LogEntry::new(
		level,
		message.to_owned(),
		server.map(|s| format!("{}:{}", s.server_hostname, s.port)),
	);
	let server_name = entry.server.as_deref().unwrap_or("-");

	match level {
		LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Error => {
			tracing::error!(server = server_name, level = level.as_str(), "{}", entry.message);
		}
		LogLevel::Warning => {
			tracing::warn!(server = server_name, "{}", entry.message);
		}
		LogLevel::Notice | LogLevel::Info => {
			tracing::info!(server = server_name, level = level.as_str(), "{}", entry.message);
		}
		LogLevel::Debug => {
			tracing::debug!(server = server_name, "{}", entry.message);
		}
	}

	Some(entry)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_level_parsing() {
		assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warning));
		assert_eq!(LogLevel::from_str("err"), Some(LogLevel::Error));
		assert_eq!(LogLevel::from_str("verbose"), None);
		assert!(LogLevel::Emerg < LogLevel::Debug);
	}

	#[test]
	fn test_default_threshold_filters_info() {
		assert!(log_error("quiet", LogLevel::Info, None).is_none());
		let entry = log_error("loud", LogLevel::Error, None).unwrap();
		assert_eq!(entry.level, LogLevel::Error);
		assert!(entry.server.is_none());
	}

	#[test]
	fn test_server_loglevel_and_name() {
		let mut server = NativeServer::new("example.org", 8080);
		server.loglevel = LogLevel::Debug;
		let entry = log_error("trace me", LogLevel::Debug, Some(&server)).unwrap();
		assert_eq!(entry.server.as_deref(), Some("example.org:8080"));
		assert_eq!(entry.to_json()["level"], "debug");
	}
}
