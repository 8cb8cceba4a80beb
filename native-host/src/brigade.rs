//! Buckets and brigades
//!
//! A brigade is a queue of buckets. Data buckets carry bytes; `Flush` and `Eos`
//! are metadata markers. Splitting a data bucket is a cheap slice of the
//! underlying `Bytes`.

use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bucket {
	Data(Bytes),
	Flush,
	Eos,
}

impl Bucket {
	pub fn data(bytes: impl Into<Bytes>) -> Self {
		Bucket::Data(bytes.into())
	}

	pub fn is_eos(&self) -> bool {
		matches!(self, Bucket::Eos)
	}

	pub fn is_metadata(&self) -> bool {
		!matches!(self, Bucket::Data(_))
	}

	/// Payload length, zero for metadata buckets
	pub fn len(&self) -> usize {
		match self {
			Bucket::Data(b) => b.len(),
			_ => 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Ordered queue of buckets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Brigade {
	buckets: VecDeque<Bucket>,
}

impl Brigade {
	pub fn new() -> Self {
		Self::default()
	}

	/// Brigade holding `bytes` as a single data bucket
	pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
		let mut bb = Self::new();
		bb.push_back(Bucket::data(bytes));
		bb
	}

	pub fn push_back(&mut self, bucket: Bucket) {
		self.buckets.push_back(bucket);
	}

	pub fn push_front(&mut self, bucket: Bucket) {
		self.buckets.push_front(bucket);
	}

	pub fn pop_front(&mut self) -> Option<Bucket> {
		self.buckets.pop_front()
	}

	pub fn front(&self) -> Option<&Bucket> {
		self.buckets.front()
	}

	/// Append every bucket of `other`, leaving it empty
	pub fn concat(&mut self, other: &mut Brigade) {
		self.buckets.append(&mut other.buckets);
	}

	pub fn is_empty(&self) -> bool {
		self.buckets.is_empty()
	}

	/// Number of buckets
	pub fn len(&self) -> usize {
		self.buckets.len()
	}

	/// Total number of payload bytes
	pub fn data_len(&self) -> usize {
		self.buckets.iter().map(Bucket::len).sum()
	}

	pub fn contains_eos(&self) -> bool {
		self.buckets.iter().any(Bucket::is_eos)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Bucket> + '_ {
		self.buckets.iter()
	}

	/// Concatenate the payload of every data bucket
	pub fn to_bytes(&self) -> Bytes {
		let mut out = Vec::with_capacity(self.data_len());
		for bucket in &self.buckets {
			if let Bucket::Data(b) = bucket {
				out.extend_from_slice(b);
			}
		}
		Bytes::from(out)
	}

	/// Remove and return at most `max` payload bytes from the front, stopping
	/// at the first metadata bucket. A data bucket straddling the limit is split.
	pub fn take_data(&mut self, max: usize) -> Bytes {
		let mut out = Vec::new();
		while out.len() < max {
			match self.buckets.pop_front() {
				Some(Bucket::Data(mut b)) => {
					let want = max - out.len();
					if b.len() > want {
						let rest = b.split_off(want);
						self.buckets.push_front(Bucket::Data(rest));
					}
					out.extend_from_slice(&b);
				}
				Some(meta) => {
					self.buckets.push_front(meta);
					break;
				}
				None => break,
			}
		}
		Bytes::from(out)
	}
}

impl FromIterator<Bucket> for Brigade {
	fn from_iter<I: IntoIterator<Item = Bucket>>(iter: I) -> Self {
		Self {
			buckets: iter.into_iter().collect(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_take_data_splits_buckets() {
		let mut bb: Brigade = vec![Bucket::data("hello"), Bucket::data(" world"), Bucket::Eos]
			.into_iter()
			.collect();

		assert_eq!(bb.take_data(7), Bytes::from_static(b"hello w"));
		assert_eq!(bb.front(), Some(&Bucket::data("orld")));
		assert_eq!(bb.take_data(100), Bytes::from_static(b"orld"));
		assert_eq!(bb.front(), Some(&Bucket::Eos));
		assert!(bb.take_data(10).is_empty());
	}

	#[test]
	fn test_to_bytes_skips_markers() {
		let bb: Brigade = vec![Bucket::data("a"), Bucket::Flush, Bucket::data("b"), Bucket::Eos]
			.into_iter()
			.collect();
		assert_eq!(bb.to_bytes(), Bytes::from_static(b"ab"));
		assert_eq!(bb.data_len(), 2);
		assert!(bb.contains_eos());
	}
}
