//! I/O filter wrapper
//!
//! A [`FilterObject`] sits at one position of the host's filter chain for a
//! single invocation. Input filters pull brigades from upstream on demand;
//! output filters read the brigade handed to them and never pull. Data written
//! by either kind is buffered in an outgoing brigade: output filters pass it
//! downstream on `flush`/`close`, input filters hand it to the reader when
//! the invocation returns.
//!
//! Once closed, reads and writes fail. An end-of-stream marker seen on read is
//! reported as `None` and is terminal.

use crate::error::{BridgeError, BridgeResult};
use crate::interpreter::InterpreterGuard;
use crate::request::RequestObject;
use bytes::Bytes;
use native_host::{Brigade, Bucket, FilterChain, ReadMode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// State that outlives a single filter invocation
#[derive(Debug)]
pub struct FilterContext {
    name: String,
    disabled: AtomicBool,
}

impl FilterContext {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            disabled: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When set, later invocations pass data through without running the filter
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            debug!(filter = %self.name, "filter disabled");
        }
    }
}

struct FilterState {
    // Taken out while a blocking pull or pass is in progress.
    chain: Option<Box<dyn FilterChain>>,
    bb_in: Brigade,
    bb_out: Brigade,
    eos: bool,
    closed: bool,
}

struct FilterInner {
    name: String,
    is_input: bool,
    mode: ReadMode,
    readbytes: usize,
    ctx: Arc<FilterContext>,
    request: Option<RequestObject>,
    state: Mutex<FilterState>,
}

/// Reference-counted filter handle
#[derive(Clone)]
pub struct FilterObject {
    inner: Arc<FilterInner>,
}

enum Step {
    Done,
    Eos,
    Exhausted,
}

/// Move bytes from `bb` into `out` until `limit` is reached, a line feed is
/// copied in line mode, or a non-data marker is met
fn fill(bb: &mut Brigade, out: &mut Vec<u8>, limit: usize, line: bool) -> Step {
    loop {
        if out.len() >= limit || (line && out.last() == Some(&b'\n')) {
            return Step::Done;
        }
        match bb.pop_front() {
            None => return Step::Exhausted,
            Some(Bucket::Eos) => {
                bb.push_front(Bucket::Eos);
                return Step::Eos;
            }
            Some(Bucket::Flush) => continue,
            Some(Bucket::Data(mut b)) => {
                let mut take = b.len().min(limit - out.len());
                if line {
                    if let Some(i) = b[..take].iter().position(|&c| c == b'\n') {
                        take = i + 1;
                    }
                }
                if take < b.len() {
                    let rest = b.split_off(take);
                    bb.push_front(Bucket::Data(rest));
                }
                out.extend_from_slice(&b);
            }
        }
    }
}

impl FilterObject {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        is_input: bool,
        chain: Box<dyn FilterChain>,
        bb_in: Brigade,
        mode: ReadMode,
        readbytes: usize,
        ctx: Arc<FilterContext>,
        request: Option<RequestObject>,
    ) -> Self {
        Self {
            inner: Arc::new(FilterInner {
                name: name.to_owned(),
                is_input,
                mode,
                readbytes,
                ctx,
                request,
                state: Mutex::new(FilterState {
                    chain: Some(chain),
                    bb_in,
                    bb_out: Brigade::new(),
                    eos: false,
                    closed: false,
                }),
            }),
        }
    }

    /// Input filter asked for `readbytes` bytes in `mode`
    pub(crate) fn input(
        name: &str,
        chain: Box<dyn FilterChain>,
        mode: ReadMode,
        readbytes: usize,
        ctx: Arc<FilterContext>,
        request: Option<RequestObject>,
    ) -> Self {
        Self::new(name, true, chain, Brigade::new(), mode, readbytes, ctx, request)
    }

    /// Output filter handed `bb` by the previous filter
    pub(crate) fn output(
        name: &str,
        chain: Box<dyn FilterChain>,
        bb: Brigade,
        ctx: Arc<FilterContext>,
        request: Option<RequestObject>,
    ) -> Self {
        Self::new(name, false, chain, bb, ReadMode::Bytes, 0, ctx, request)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_input(&self) -> bool {
        self.inner.is_input
    }

    pub fn closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Request the filter runs for, if any
    pub fn request(&self) -> Option<&RequestObject> {
        self.inner.request.as_ref()
    }

    pub fn context(&self) -> &Arc<FilterContext> {
        &self.inner.ctx
    }

    /// Skip this filter on every later invocation
    pub fn disable(&self) {
        self.inner.ctx.disable();
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::closed(format!("filter {}", self.inner.name))
    }

    fn take_chain(&self) -> BridgeResult<Box<dyn FilterChain>> {
        self.inner
            .state
            .lock()
            .chain
            .take()
            .ok_or_else(|| BridgeError::state("filter chain is in use by another call"))
    }

    /// Pull one brigade from upstream; returns the number of buckets received
    fn pull(&self, py: &mut InterpreterGuard<'_>, readbytes: usize) -> BridgeResult<usize> {
        let mut chain = self.take_chain()?;
        let mode = self.inner.mode;
        let result = py.allow_threads(|| chain.get_brigade(mode, readbytes));

        let mut state = self.inner.state.lock();
        state.chain = Some(chain);
        let mut bb = result.map_err(|e| BridgeError::io_with_source("Input filter read error", e))?;
        let n = bb.len();
        state.bb_in.concat(&mut bb);
        Ok(n)
    }

    /// Hand `bb` downstream
    fn pass(&self, py: &mut InterpreterGuard<'_>, bb: Brigade, what: &str) -> BridgeResult<()> {
        let mut chain = self.take_chain()?;
        let result = py.allow_threads(|| chain.pass_brigade(bb));
        self.inner.state.lock().chain = Some(chain);
        result.map_err(|e| BridgeError::io_with_source(format!("{} failed", what), e))
    }

    fn read_into(
        &self,
        py: &mut InterpreterGuard<'_>,
        limit: Option<usize>,
        line: bool,
    ) -> BridgeResult<Option<Bytes>> {
        let max = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                if state.eos {
                    return Ok(None);
                }
                match fill(&mut state.bb_in, &mut out, max, line) {
                    Step::Done => return Ok(Some(Bytes::from(out))),
                    Step::Eos if out.is_empty() => {
                        state.bb_in.pop_front();
                        state.eos = true;
                        return Ok(None);
                    }
                    Step::Eos => return Ok(Some(Bytes::from(out))),
                    Step::Exhausted => {
                        if !self.inner.is_input {
                            return Ok(Some(Bytes::from(out)));
                        }
                        // A sized read returns whatever the last pull delivered.
                        if !line && limit.is_some() && !out.is_empty() {
                            return Ok(Some(Bytes::from(out)));
                        }
                    }
                }
            }

            let readbytes = match limit {
                Some(l) if !line => l - out.len(),
                _ => self.inner.readbytes,
            };
            if self.pull(py, readbytes.max(1))? == 0 {
                return Ok(Some(Bytes::from(out)));
            }
        }
    }

    /// Read up to `len` bytes, or everything up to end of stream for `None`.
    /// `Ok(None)` means end of stream.
    pub fn read(
        &self,
        py: &mut InterpreterGuard<'_>,
        len: Option<i64>,
    ) -> BridgeResult<Option<Bytes>> {
        let limit = size_arg(len, "read")?;
        if self.closed() {
            return Err(self.closed_error());
        }
        if limit == Some(0) {
            return Ok(Some(Bytes::new()));
        }
        self.read_into(py, limit, false)
    }

    /// Read one line including its line feed, of at most `len` bytes
    pub fn readline(
        &self,
        py: &mut InterpreterGuard<'_>,
        len: Option<i64>,
    ) -> BridgeResult<Option<Bytes>> {
        let limit = size_arg(len, "readline")?;
        if self.closed() {
            return Err(self.closed_error());
        }
        if limit == Some(0) {
            return Ok(Some(Bytes::new()));
        }
        self.read_into(py, limit, true)
    }

    /// Buffer `data` in the outgoing brigade
    pub fn write(&self, data: impl AsRef<[u8]>) -> BridgeResult<()> {
        let data = data.as_ref();
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        if !data.is_empty() {
            state.bb_out.push_back(Bucket::data(Bytes::copy_from_slice(data)));
        }
        Ok(())
    }

    /// Add a flush marker and, for output filters, pass everything buffered
    /// downstream. A failed pass leaves the filter open.
    pub fn flush(&self, py: &mut InterpreterGuard<'_>) -> BridgeResult<()> {
        let bb = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            state.bb_out.push_back(Bucket::Flush);
            if self.inner.is_input {
                return Ok(());
            }
            std::mem::take(&mut state.bb_out)
        };
        self.pass(py, bb, "Flush")
    }

    /// Terminate the outgoing stream. Closing twice is a no-op.
    pub fn close(&self, py: &mut InterpreterGuard<'_>) -> BridgeResult<()> {
        let bb = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            if self.inner.is_input {
                state.bb_out.push_back(Bucket::Eos);
                state.closed = true;
                return Ok(());
            }
            let mut bb = std::mem::take(&mut state.bb_out);
            bb.push_back(Bucket::Eos);
            bb
        };
        self.pass(py, bb, "Close")?;
        self.inner.state.lock().closed = true;
        debug!(filter = %self.inner.name, "filter closed");
        Ok(())
    }

    /// Brigade an input filter produced for its reader
    pub(crate) fn finish_input(&self) -> Brigade {
        std::mem::take(&mut self.inner.state.lock().bb_out)
    }

    /// Pass output left unflushed when the handler returned
    pub(crate) fn finish_output(&self, py: &mut InterpreterGuard<'_>) -> BridgeResult<()> {
        let bb = {
            let mut state = self.inner.state.lock();
            if state.closed || state.bb_out.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut state.bb_out)
        };
        self.pass(py, bb, "Pass")
    }
}

fn size_arg(len: Option<i64>, what: &str) -> BridgeResult<Option<usize>> {
    match len {
        Some(n) if n < 0 => Err(BridgeError::value(format!(
            "{} size must not be negative, got {}",
            what, n
        ))),
        Some(n) => Ok(Some(usize::try_from(n).unwrap_or(usize::MAX))),
        None => Ok(None),
    }
}

impl fmt::Debug for FilterObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterObject")
            .field("name", &self.inner.name)
            .field("is_input", &self.inner.is_input)
            .field("closed", &self.closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Interpreter;
    use native_host::MemoryChain;

    fn input_filter(chain: &MemoryChain) -> FilterObject {
        FilterObject::input(
            "upper",
            Box::new(chain.clone()),
            ReadMode::Bytes,
            8192,
            FilterContext::new("upper"),
            None,
        )
    }

    #[test]
    fn test_input_read_pulls_until_eos() {
        let chain = MemoryChain::with_input(["ab", "cd"]);
        let f = input_filter(&chain);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        assert_eq!(f.read(&mut py, None).unwrap().unwrap(), "abcd");
        assert_eq!(f.read(&mut py, None).unwrap(), None);
        assert_eq!(f.read(&mut py, Some(4)).unwrap(), None);
    }

    #[test]
    fn test_input_readline_spans_pulls() {
        let chain = MemoryChain::with_input(["one\ntw", "o\nthree"]);
        let f = input_filter(&chain);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        assert_eq!(f.readline(&mut py, None).unwrap().unwrap(), "one\n");
        assert_eq!(f.readline(&mut py, None).unwrap().unwrap(), "two\n");
        assert_eq!(f.readline(&mut py, None).unwrap().unwrap(), "three");
        assert_eq!(f.readline(&mut py, None).unwrap(), None);
    }

    #[test]
    fn test_sized_read_splits_buckets() {
        let chain = MemoryChain::with_input(["abcdef"]);
        let f = input_filter(&chain);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        assert_eq!(f.read(&mut py, Some(2)).unwrap().unwrap(), "ab");
        assert_eq!(f.read(&mut py, Some(10)).unwrap().unwrap(), "cdef");
        assert_eq!(f.read(&mut py, Some(10)).unwrap(), None);
    }

    #[test]
    fn test_output_filter_never_pulls() {
        let chain = MemoryChain::with_input(["upstream"]);
        let mut bb = Brigade::from_bytes("given");
        bb.push_back(Bucket::Flush);
        let f = FilterObject::output("out", Box::new(chain.clone()), bb, FilterContext::new("out"), None);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        assert_eq!(f.read(&mut py, None).unwrap().unwrap(), "given");
        assert_eq!(f.read(&mut py, None).unwrap().unwrap(), Bytes::new());
    }

    #[test]
    fn test_output_eos_then_close() {
        let chain = MemoryChain::new();
        let mut bb = Brigade::from_bytes("x");
        bb.push_back(Bucket::Eos);
        let f = FilterObject::output("out", Box::new(chain.clone()), bb, FilterContext::new("out"), None);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        let data = f.read(&mut py, None).unwrap().unwrap();
        assert_eq!(f.read(&mut py, None).unwrap(), None);
        f.write(data.to_ascii_uppercase()).unwrap();
        f.close(&mut py).unwrap();

        assert_eq!(chain.passed_bytes(), "X");
        assert!(chain.passed()[0].contains_eos());
    }

    #[test]
    fn test_closed_state() {
        let chain = MemoryChain::new();
        let f = FilterObject::output("out", Box::new(chain.clone()), Brigade::new(), FilterContext::new("out"), None);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        f.close(&mut py).unwrap();
        assert!(f.closed());
        assert!(matches!(f.read(&mut py, None), Err(BridgeError::Closed { .. })));
        assert!(matches!(f.write("late"), Err(BridgeError::Closed { .. })));

        f.close(&mut py).unwrap();
        assert_eq!(chain.passed().len(), 1);
    }

    #[test]
    fn test_zero_length_reads_fail_once_closed() {
        let f = FilterObject::output("out", Box::new(MemoryChain::new()), Brigade::from_bytes("abc"), FilterContext::new("out"), None);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        assert_eq!(f.read(&mut py, Some(0)).unwrap(), Some(Bytes::new()));
        f.close(&mut py).unwrap();
        assert!(matches!(f.read(&mut py, Some(0)), Err(BridgeError::Closed { .. })));
        assert!(matches!(f.readline(&mut py, Some(0)), Err(BridgeError::Closed { .. })));
    }

    #[test]
    fn test_failed_flush_keeps_filter_open() {
        let chain = MemoryChain::new();
        chain.fail_passes(true);
        let f = FilterObject::output("out", Box::new(chain.clone()), Brigade::new(), FilterContext::new("out"), None);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        f.write("data").unwrap();
        assert!(matches!(f.flush(&mut py), Err(BridgeError::Io { .. })));
        assert!(!f.closed());

        chain.fail_passes(false);
        f.close(&mut py).unwrap();
        assert!(f.closed());
    }

    #[test]
    fn test_input_write_goes_to_reader() {
        let chain = MemoryChain::with_input(["abc"]);
        let f = input_filter(&chain);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();

        let data = f.read(&mut py, None).unwrap().unwrap();
        f.write(&data[..1]).unwrap();
        f.close(&mut py).unwrap();

        let bb = f.finish_input();
        assert_eq!(bb.to_bytes(), "a");
        assert!(bb.contains_eos());
        assert!(chain.passed().is_empty());
    }

    #[test]
    fn test_negative_size_rejected() {
        let chain = MemoryChain::with_input(["abc"]);
        let f = input_filter(&chain);
        let interp = Interpreter::new("t");
        let mut py = interp.acquire();
        assert!(matches!(f.read(&mut py, Some(-1)), Err(BridgeError::Value { .. })));
    }

    #[test]
    fn test_disable_is_persistent() {
        let ctx = FilterContext::new("f");
        let f = FilterObject::output("f", Box::new(MemoryChain::new()), Brigade::new(), ctx.clone(), None);
        assert!(!ctx.is_disabled());
        f.disable();
        assert!(ctx.is_disabled());
        assert!(f.context().is_disabled());
    }
}
