//! Native multi-valued table
//!
//! Ordered key/value string pairs with case-insensitive keys. Keys may repeat;
//! each occurrence is one value of the same logical header or variable.

use serde::{Deserialize, Serialize};

/// One table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
	pub key: String,
	pub val: String,
}

/// Insertion-ordered, duplicate-key-permitting table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
	entries: Vec<TableEntry>,
}

fn key_matches(entry: &TableEntry, key: &str) -> bool {
	entry.key.eq_ignore_ascii_case(key)
}

impl Table {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_capacity(nelts: usize) -> Self {
		Self {
			entries: Vec::with_capacity(nelts),
		}
	}

	/// First value stored under `key`
	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|e| key_matches(e, key))
			.map(|e| e.val.as_str())
	}

	/// Every value stored under `key`, in insertion order
	pub fn get_all(&self, key: &str) -> Vec<&str> {
		self.entries
			.iter()
			.filter(|e| key_matches(e, key))
			.map(|e| e.val.as_str())
			.collect()
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.entries.iter().any(|e| key_matches(e, key))
	}

	/// Replace every entry under `key` with a single new entry
	pub fn set(&mut self, key: &str, val: &str) {
		self.unset(key);
		self.add(key, val);
	}

	/// Append without touching existing entries under `key`
	pub fn add(&mut self, key: &str, val: &str) {
		self.entries.push(TableEntry {
			key: key.to_owned(),
			val: val.to_owned(),
		});
	}

	/// Remove every entry under `key`
	pub fn unset(&mut self, key: &str) {
		self.entries.retain(|e| !key_matches(e, key));
	}

	/// Append `val` to the first entry under `key` as a comma separated list,
	/// or add a new entry when there is none
	pub fn merge(&mut self, key: &str, val: &str) {
		match self.entries.iter_mut().find(|e| key_matches(e, key)) {
			Some(entry) => {
				entry.val.push_str(", ");
				entry.val.push_str(val);
			}
			None => self.add(key, val),
		}
	}

	/// Set every entry of `other` into this table, replacing same-key entries
	pub fn overlay(&mut self, other: &Table) {
		for key in other.distinct_keys() {
			self.unset(&key);
		}
		self.entries.extend(other.entries.iter().cloned());
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
		self.entries.iter().map(|e| (e.key.as_str(), e.val.as_str()))
	}

	/// Entry at `index` in insertion order
	pub fn entry(&self, index: usize) -> Option<&TableEntry> {
		self.entries.get(index)
	}

	fn distinct_keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = Vec::new();
		for e in &self.entries {
			if !keys.iter().any(|k| k.eq_ignore_ascii_case(&e.key)) {
				keys.push(e.key.clone());
			}
		}
		keys
	}
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Table {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut table = Table::new();
		for (k, v) in iter {
			table.add(k.as_ref(), v.as_ref());
		}
		table
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_keys_are_case_insensitive() {
		let mut t = Table::new();
		t.add("Content-Type", "text/html");
		assert_eq!(t.get("content-type"), Some("text/html"));
		assert!(t.contains_key("CONTENT-TYPE"));
	}

	#[test]
	fn test_set_collapses_duplicates() {
		let mut t = Table::new();
		t.add("Set-Cookie", "a=1");
		t.add("Set-Cookie", "b=2");
		assert_eq!(t.get_all("set-cookie"), vec!["a=1", "b=2"]);

		t.set("SET-COOKIE", "c=3");
		assert_eq!(t.get_all("Set-Cookie"), vec!["c=3"]);
		assert_eq!(t.len(), 1);
	}

	#[test]
	fn test_merge_and_overlay() {
		let mut t = Table::new();
		t.merge("Vary", "Accept");
		t.merge("vary", "Cookie");
		assert_eq!(t.get("Vary"), Some("Accept, Cookie"));

		let other: Table = vec![("Vary", "Origin"), ("X-A", "1")].into_iter().collect();
		t.overlay(&other);
		assert_eq!(t.get_all("Vary"), vec!["Origin"]);
		assert_eq!(t.get("x-a"), Some("1"));
	}
}
