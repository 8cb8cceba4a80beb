//! Blocking transport and filter-chain interfaces
//!
//! The host supplies one [`Transport`] per connection and a [`FilterChain`]
//! position per filter invocation. The in-memory implementations here back the
//! simulated host and the tests.

use crate::brigade::{Brigade, Bucket};
use crate::error::{NativeError, NativeResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Byte stream to and from the client
pub trait Transport: Send {
	/// Read at most `buf.len()` bytes; `Ok(0)` means the stream is exhausted
	fn read_block(&mut self, buf: &mut [u8]) -> NativeResult<usize>;

	fn write_all(&mut self, data: &[u8]) -> NativeResult<()>;

	/// Push buffered output to the peer
	fn flush(&mut self) -> NativeResult<()>;
}

/// Transport shared between a connection and the requests running on it
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared_transport(transport: impl Transport + 'static) -> SharedTransport {
	Arc::new(Mutex::new(Box::new(transport)))
}

#[derive(Debug, Default)]
struct MemoryState {
	input: VecDeque<Bytes>,
	pending: Vec<u8>,
	output: Vec<u8>,
	peer_closed: bool,
	flushes: usize,
}

/// In-memory transport that delivers input in the chunks it was given
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
	state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
	pub fn new() -> Self {
		Self::default()
	}

	/// Transport whose reads return exactly these chunks, one per read at most
	pub fn with_chunks<I, B>(chunks: I) -> Self
	where
		I: IntoIterator<Item = B>,
		B: Into<Bytes>,
	{
		let transport = Self::new();
		transport.state.lock().input = chunks.into_iter().map(Into::into).collect();
		transport
	}

	pub fn push_input(&self, chunk: impl Into<Bytes>) {
		self.state.lock().input.push_back(chunk.into());
	}

	/// Make later flushes fail as if the client went away
	pub fn close_peer(&self) {
		self.state.lock().peer_closed = true;
	}

	/// Bytes flushed to the peer so far
	pub fn output(&self) -> Vec<u8> {
		self.state.lock().output.clone()
	}

	pub fn flush_count(&self) -> usize {
		self.state.lock().flushes
	}
}

impl Transport for MemoryTransport {
	fn read_block(&mut self, buf: &mut [u8]) -> NativeResult<usize> {
		let mut state = self.state.lock();
		let Some(mut chunk) = state.input.pop_front() else {
			return Ok(0);
		};
		let n = chunk.len().min(buf.len());
		buf[..n].copy_from_slice(&chunk[..n]);
		if n < chunk.len() {
			let rest = chunk.split_off(n);
			state.input.push_front(rest);
		}
		Ok(n)
	}

	fn write_all(&mut self, data: &[u8]) -> NativeResult<()> {
		self.state.lock().pending.extend_from_slice(data);
		Ok(())
	}

	fn flush(&mut self) -> NativeResult<()> {
		let mut state = self.state.lock();
		if state.peer_closed {
			state.pending.clear();
			return Err(NativeError::PeerClosed);
		}
		let pending = std::mem::take(&mut state.pending);
		state.output.extend_from_slice(&pending);
		state.flushes += 1;
		Ok(())
	}
}

/// How an input filter asks for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
	/// Up to `readbytes` bytes
	Bytes,
	/// Up to and including the next line feed
	GetLine,
	/// Everything up to end of stream
	Exhaustive,
}

/// A position in the host's filter chain
pub trait FilterChain: Send {
	/// Pull the next brigade from the filter upstream of this position
	fn get_brigade(&mut self, mode: ReadMode, readbytes: usize) -> NativeResult<Brigade>;

	/// Hand a brigade to the filter downstream of this position
	fn pass_brigade(&mut self, bb: Brigade) -> NativeResult<()>;
}

#[derive(Debug, Default)]
struct ChainState {
	upstream: Brigade,
	passed: Vec<Brigade>,
	fail_pass: bool,
}

/// In-memory filter chain: serves a fixed upstream brigade and records what
/// is passed downstream
#[derive(Debug, Clone, Default)]
pub struct MemoryChain {
	state: Arc<Mutex<ChainState>>,
}

impl MemoryChain {
	pub fn new() -> Self {
		Self::default()
	}

	/// Upstream serving `chunks` followed by an end-of-stream marker
	pub fn with_input<I, B>(chunks: I) -> Self
	where
		I: IntoIterator<Item = B>,
		B: Into<Bytes>,
	{
		let chain = Self::new();
		{
			let mut state = chain.state.lock();
			for chunk in chunks {
				state.upstream.push_back(Bucket::data(chunk));
			}
			state.upstream.push_back(Bucket::Eos);
		}
		chain
	}

	/// Make later `pass_brigade` calls fail
	pub fn fail_passes(&self, fail: bool) {
		self.state.lock().fail_pass = fail;
	}

	/// Every brigade passed downstream so far
	pub fn passed(&self) -> Vec<Brigade> {
		self.state.lock().passed.clone()
	}

	/// Payload of every brigade passed downstream so far
	pub fn passed_bytes(&self) -> Bytes {
		let mut out = Vec::new();
		for bb in &self.state.lock().passed {
			out.extend_from_slice(&bb.to_bytes());
		}
		Bytes::from(out)
	}
}

impl FilterChain for MemoryChain {
	fn get_brigade(&mut self, mode: ReadMode, readbytes: usize) -> NativeResult<Brigade> {
		let mut state = self.state.lock();
		let mut bb = Brigade::new();
		// One upstream data bucket (or a piece of it) per call, so callers
		// exercise their refill path.
		match state.upstream.pop_front() {
			Some(Bucket::Data(mut b)) => {
				let limit = match mode {
					ReadMode::Exhaustive => b.len(),
					ReadMode::Bytes | ReadMode::GetLine => readbytes.max(1),
				};
				if b.len() > limit {
					let rest = b.split_off(limit);
					state.upstream.push_front(Bucket::Data(rest));
				}
				bb.push_back(Bucket::Data(b));
			}
			Some(meta) => bb.push_back(meta),
			None => {}
		}
		Ok(bb)
	}

	fn pass_brigade(&mut self, bb: Brigade) -> NativeResult<()> {
		let mut state = self.state.lock();
		if state.fail_pass {
			return Err(NativeError::PeerClosed);
		}
		state.passed.push(bb);
		Ok(())
	}
}
