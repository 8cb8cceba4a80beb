//! Request wrapper
//!
//! A [`RequestObject`] borrows a native request record for the lifetime of
//! the request's pool. Its header and environment tables are wrapped up
//! front; `connection`, `server`, `next`, `prev` and `main` are materialised on
//! first access and cached. Sibling requests are looked up through the
//! [`RequestCache`], so the same native request always yields the same wrapper.
//!
//! Blocking methods take the caller's [`InterpreterGuard`] and release it for
//! the duration of the transport call.

use crate::buffer::ReadBuffer;
use crate::config::BridgeConfig;
use crate::connection::ConnectionObject;
use crate::error::{BridgeError, BridgeResult};
use crate::finfo::FinfoObject;
use crate::hlist::{HandlerEntry, HandlerListObject};
use crate::interpreter::{Cleanup, Interpreter, InterpreterGuard};
use crate::lazy::LazySlot;
use crate::phase::Phase;
use crate::server::ServerObject;
use crate::table::{TableObject, type_name};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::StatusCode;
use native_host::{
    HostServices, LogEntry, LogLevel, NativeError, NativeRequest, NativeResult, PoolRef,
    RequestId, Table, read_client_block,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// At most one wrapper per live native request
pub(crate) struct RequestCache {
    entries: DashMap<RequestId, RequestObject>,
    interpreter: Arc<Interpreter>,
    host: Arc<dyn HostServices>,
    config: Arc<BridgeConfig>,
}

impl RequestCache {
    pub(crate) fn new(
        interpreter: Arc<Interpreter>,
        host: Arc<dyn HostServices>,
        config: Arc<BridgeConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            interpreter,
            host,
            config,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Cached wrapper for `native`, built on first use.
    ///
    /// Building registers a cleanup on the request pool that evicts the
    /// wrapper and drops its cached links when the pool is destroyed.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        native: &PoolRef<NativeRequest>,
    ) -> BridgeResult<RequestObject> {
        let (id, pool) = {
            let r = native.get()?;
            let r = r.lock();
            (r.id, r.pool.clone())
        };

        match self.entries.entry(id) {
            Entry::Occupied(cached) => Ok(cached.get().clone()),
            Entry::Vacant(slot) => {
                let pool = pool.upgrade()?;
                let request = RequestObject::build(native.clone(), id, self)?;

                let cache = Arc::downgrade(self);
                pool.register_cleanup(move || {
                    if let Some(cache) = cache.upgrade() {
                        if let Some((_, evicted)) = cache.entries.remove(&id) {
                            debug!(request = %id, "evicting request wrapper");
                            evicted.release_links();
                        }
                    }
                })?;

                debug!(request = %id, "created request wrapper");
                slot.insert(request.clone());
                Ok(request)
            }
        }
    }
}

impl Drop for RequestCache {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.value().release_links();
        }
    }
}

#[derive(Default)]
struct RequestState {
    phase: Option<Phase>,
    hlist: Option<HandlerListObject>,
    /// Handlers added for phases that have not run yet
    dynamic: HashMap<Phase, HandlerEntry>,
    rbuff: ReadBuffer,
}

struct RequestInner {
    request: PoolRef<NativeRequest>,
    id: RequestId,
    cache: Weak<RequestCache>,
    interpreter: Arc<Interpreter>,
    host: Arc<dyn HostServices>,
    config: Arc<BridgeConfig>,

    headers_in: TableObject,
    headers_out: TableObject,
    err_headers_out: TableObject,
    subprocess_env: TableObject,
    notes: TableObject,

    connection: LazySlot<ConnectionObject>,
    server: LazySlot<ServerObject>,
    next: LazySlot<RequestObject>,
    prev: LazySlot<RequestObject>,
    main: LazySlot<RequestObject>,

    state: Mutex<RequestState>,
}

/// Reference-counted request handle
#[derive(Clone)]
pub struct RequestObject {
    inner: Arc<RequestInner>,
}

fn nonnegative(len: Option<i64>, what: &str) -> BridgeResult<Option<usize>> {
    match len {
        None => Ok(None),
        Some(n) if n < 0 => Err(BridgeError::value(format!(
            "{} size must not be negative, got {}",
            what, n
        ))),
        Some(n) => Ok(Some(usize::try_from(n).unwrap_or(usize::MAX))),
    }
}

fn read_error(e: NativeError) -> BridgeError {
    match e {
        NativeError::PoolDestroyed | NativeError::LengthRequired => BridgeError::Native(e),
        other => BridgeError::io_with_source("Client read error", other),
    }
}

fn write_error(e: NativeError) -> BridgeError {
    match e {
        NativeError::PeerClosed => {
            BridgeError::io_with_source("Write failed, client closed connection", e)
        }
        NativeError::PoolDestroyed => BridgeError::Native(e),
        other => BridgeError::io_with_source("Write failed", other),
    }
}

/// One-time body read setup; returns the bytes the client still owes
fn start_body(request: &Mutex<NativeRequest>) -> BridgeResult<u64> {
    let mut r = request.lock();
    if !r.client_block_ready {
        r.setup_client_block()?;
    }
    Ok(r.remaining)
}

impl RequestObject {
    fn build(
        request: PoolRef<NativeRequest>,
        id: RequestId,
        cache: &Arc<RequestCache>,
    ) -> BridgeResult<Self> {
        let tables = {
            let r = request.get()?;
            let r = r.lock();
            [
                r.headers_in.clone(),
                r.headers_out.clone(),
                r.err_headers_out.clone(),
                r.subprocess_env.clone(),
                r.notes.clone(),
            ]
        };
        let [headers_in, headers_out, err_headers_out, subprocess_env, notes] =
            tables.map(TableObject::borrowed);

        Ok(Self {
            inner: Arc::new(RequestInner {
                request,
                id,
                cache: Arc::downgrade(cache),
                interpreter: cache.interpreter.clone(),
                host: cache.host.clone(),
                config: cache.config.clone(),
                headers_in,
                headers_out,
                err_headers_out,
                subprocess_env,
                notes,
                connection: LazySlot::new(),
                server: LazySlot::new(),
                next: LazySlot::new(),
                prev: LazySlot::new(),
                main: LazySlot::new(),
                state: Mutex::new(RequestState::default()),
            }),
        })
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Whether both handles are the same wrapper instance
    pub fn ptr_eq(&self, other: &RequestObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn native(&self) -> &PoolRef<NativeRequest> {
        &self.inner.request
    }

    /// Interpreter the request's handlers and cleanups run in
    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.inner.interpreter
    }

    fn with<R>(&self, f: impl FnOnce(&NativeRequest) -> R) -> BridgeResult<R> {
        let r = self.inner.request.get()?;
        let r = r.lock();
        Ok(f(&r))
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut NativeRequest) -> R) -> BridgeResult<R> {
        let r = self.inner.request.get()?;
        let mut r = r.lock();
        Ok(f(&mut r))
    }

    // ----- derived wrappers -----

    pub fn connection(&self) -> BridgeResult<ConnectionObject> {
        self.inner
            .connection
            .get_or_try_init(|| {
                let conn = self.with(|r| r.connection.clone())?;
                debug!(request = %self.inner.id, "materialising request.connection");
                ConnectionObject::new(conn).map(Some)
            })?
            .ok_or_else(|| BridgeError::state("request has no connection"))
    }

    pub fn server(&self) -> BridgeResult<Option<ServerObject>> {
        self.inner.server.get_or_try_init(|| {
            let server = self.with(|r| r.server.clone())?;
            Ok(server.map(|s| {
                debug!(request = %self.inner.id, "materialising request.server");
                ServerObject::new(s)
            }))
        })
    }

    fn sibling(
        &self,
        slot: &LazySlot<RequestObject>,
        link: fn(&NativeRequest) -> Option<PoolRef<NativeRequest>>,
        what: &'static str,
    ) -> BridgeResult<Option<RequestObject>> {
        slot.get_or_try_init(|| {
            let Some(native) = self.with(link)? else {
                return Ok(None);
            };
            let cache = self
                .inner
                .cache
                .upgrade()
                .ok_or_else(|| BridgeError::state("script context has been dropped"))?;
            debug!(request = %self.inner.id, field = what, "materialising sibling request");
            cache.get_or_create(&native).map(Some)
        })
    }

    /// Request this one was internally redirected to
    pub fn next(&self) -> BridgeResult<Option<RequestObject>> {
        self.sibling(&self.inner.next, |r| r.next.clone(), "next")
    }

    /// Request that internally redirected to this one
    pub fn prev(&self) -> BridgeResult<Option<RequestObject>> {
        self.sibling(&self.inner.prev, |r| r.prev.clone(), "prev")
    }

    /// Main request, for sub-requests
    pub fn main(&self) -> BridgeResult<Option<RequestObject>> {
        self.sibling(&self.inner.main, |r| r.main.clone(), "main")
    }

    pub fn headers_in(&self) -> &TableObject {
        &self.inner.headers_in
    }

    pub fn headers_out(&self) -> &TableObject {
        &self.inner.headers_out
    }

    pub fn err_headers_out(&self) -> &TableObject {
        &self.inner.err_headers_out
    }

    pub fn subprocess_env(&self) -> &TableObject {
        &self.inner.subprocess_env
    }

    pub fn notes(&self) -> &TableObject {
        &self.inner.notes
    }

    /// File information for `filename`, borrowed from the request pool
    pub fn finfo(&self) -> BridgeResult<FinfoObject> {
        Ok(FinfoObject::borrowed(self.with(|r| r.finfo.clone())?))
    }

    /// Phase currently (or last) dispatched
    pub fn phase(&self) -> Option<Phase> {
        self.inner.state.lock().phase
    }

    /// Live handler list of the phase being dispatched
    pub fn hlist(&self) -> Option<HandlerListObject> {
        self.inner.state.lock().hlist.clone()
    }

    // ----- body input -----

    fn with_read_buffer<R>(&self, f: impl FnOnce(&mut ReadBuffer) -> R) -> R {
        // Not held across blocking reads; see the module docs.
        let mut rbuff = std::mem::take(&mut self.inner.state.lock().rbuff);
        let result = f(&mut rbuff);
        self.inner.state.lock().rbuff = rbuff;
        result
    }

    /// Read up to `len` body bytes, or the whole remaining body for `None`
    pub fn read(&self, py: &mut InterpreterGuard<'_>, len: Option<i64>) -> BridgeResult<Bytes> {
        let len = nonnegative(len, "read")?;
        let native = self.inner.request.get()?;
        let remaining = start_body(&native)?;
        let chunk = self.inner.config.read_chunk_size.max(1);

        self.with_read_buffer(|rbuff| {
            let available = usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .saturating_add(rbuff.len());
            let limit = len.map_or(available, |n| n.min(available));

            let mut out = Vec::with_capacity(limit.min(chunk));
            rbuff.drain_into(&mut out, limit);
            while out.len() < limit {
                let start = out.len();
                out.resize(start + (limit - start).min(chunk), 0);
                match py.allow_threads(|| read_client_block(&native, &mut out[start..])) {
                    Ok(0) => {
                        out.truncate(start);
                        break;
                    }
                    Ok(n) => out.truncate(start + n),
                    Err(e) => {
                        rbuff.unread(&out[..start]);
                        return Err(read_error(e));
                    }
                }
            }
            Ok(Bytes::from(out))
        })
    }

    /// Read one line, including its line feed, of at most `len` bytes
    pub fn readline(
        &self,
        py: &mut InterpreterGuard<'_>,
        len: Option<i64>,
    ) -> BridgeResult<Bytes> {
        let limit = nonnegative(len, "readline")?.unwrap_or(usize::MAX);
        let native = self.inner.request.get()?;
        start_body(&native)?;
        let chunk = self.inner.config.read_chunk_size.max(1);

        self.with_read_buffer(|rbuff| {
            let mut out = Vec::new();
            while out.len() < limit {
                let room = limit - out.len();
                if rbuff.drain_line_into(&mut out, room) {
                    break;
                }
                if out.len() >= limit {
                    break;
                }
                let got =
                    rbuff.refill(chunk, |buf| py.allow_threads(|| read_client_block(&native, buf)));
                match got {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        rbuff.unread(&out);
                        return Err(read_error(e));
                    }
                }
            }
            Ok(Bytes::from(out))
        })
    }

    /// Read lines until the body is exhausted, stopping early once at least
    /// `sizehint` bytes were collected when the hint is positive
    pub fn readlines(
        &self,
        py: &mut InterpreterGuard<'_>,
        sizehint: Option<i64>,
    ) -> BridgeResult<Vec<Bytes>> {
        let hint = sizehint
            .filter(|h| *h > 0)
            .map(|h| usize::try_from(h).unwrap_or(usize::MAX));
        let mut lines = Vec::new();
        let mut total = 0usize;
        loop {
            let line = self.readline(py, None)?;
            if line.is_empty() {
                break;
            }
            total += line.len();
            lines.push(line);
            if hint.is_some_and(|h| total >= h) {
                break;
            }
        }
        Ok(lines)
    }

    // ----- response output -----

    /// Send `data` to the client, preceded by the header block on first use
    pub fn write(
        &self,
        py: &mut InterpreterGuard<'_>,
        data: impl AsRef<[u8]>,
        flush: bool,
    ) -> BridgeResult<()> {
        let data = data.as_ref();
        let native = self.inner.request.get()?;
        let (header, transport, header_only) = {
            let mut r = native.lock();
            let header = r.take_header_block()?;
            (header, r.transport.clone(), r.header_only)
        };

        py.allow_threads(|| -> NativeResult<()> {
            let mut t = transport.lock();
            if let Some(header) = header {
                t.write_all(&header)?;
            }
            if !header_only && !data.is_empty() {
                t.write_all(data)?;
            }
            if flush {
                t.flush()?;
            }
            Ok(())
        })
        .map_err(write_error)?;

        if !header_only {
            native.lock().bytes_sent += data.len() as u64;
        }
        Ok(())
    }

    pub fn flush(&self, py: &mut InterpreterGuard<'_>) -> BridgeResult<()> {
        self.write(py, b"", true)
    }

    // ----- processing control -----

    /// Restart processing with `uri`. Not allowed once headers are sent.
    pub fn internal_redirect(&self, py: &mut InterpreterGuard<'_>, uri: &str) -> BridgeResult<()> {
        if self.with(|r| r.headers_sent)? {
            return Err(BridgeError::state(
                "internal_redirect after response headers were sent",
            ));
        }
        let host = self.inner.host.clone();
        let native = self.inner.request.clone();
        debug!(request = %self.inner.id, uri, "internal redirect");
        py.allow_threads(|| host.internal_redirect(uri, &native))?;
        Ok(())
    }

    /// Schedule `handler` for `phase`. The current phase's live list is
    /// extended directly; later phases pick the handler up when they start.
    /// Without `directory` the running handler's directory is used.
    pub fn add_handler(
        &self,
        phase: &str,
        handler: &str,
        directory: Option<&str>,
    ) -> BridgeResult<()> {
        let phase: Phase = phase.parse()?;
        let mut state = self.inner.state.lock();
        let directory = match directory {
            Some(dir) => Some(dir.to_owned()),
            None => state.hlist.as_ref().and_then(HandlerListObject::directory),
        };

        if state.phase == Some(phase) {
            if let Some(hlist) = &state.hlist {
                hlist.append(handler, directory, false);
                return Ok(());
            }
        }
        match state.dynamic.get_mut(&phase) {
            Some(list) => {
                list.append(handler, directory, false);
            }
            None => {
                state
                    .dynamic
                    .insert(phase, HandlerEntry::new(handler, directory, false));
            }
        }
        Ok(())
    }

    /// Add `methods` to the allowed set, optionally clearing it first.
    /// Every entry is checked before any is applied.
    pub fn allow_methods(&self, methods: &[Value], reset: bool) -> BridgeResult<()> {
        let names = methods
            .iter()
            .map(|m| match m {
                Value::String(s) => Ok(s.as_str()),
                other => Err(BridgeError::type_error(format!(
                    "methods must be strings, not {}",
                    type_name(other)
                ))),
            })
            .collect::<BridgeResult<Vec<&str>>>()?;
        self.with_mut(|r| r.allow_methods(reset, &names))
    }

    /// Run `cleanup` exactly once when the request pool is destroyed
    pub fn register_cleanup(&self, cleanup: Cleanup, data: Option<Value>) -> BridgeResult<()> {
        let (pool, server) = self.with(|r| (r.pool.clone(), r.server.clone()))?;
        let pool = pool.upgrade()?;
        let interpreter = self.inner.interpreter.clone();
        pool.register_cleanup(move || interpreter.run_cleanup(cleanup, data, server.as_ref()))?;
        Ok(())
    }

    /// Owned table of the options configured for this request's directory
    pub fn get_options(&self) -> BridgeResult<TableObject> {
        let uri = self.uri()?;
        let table: Table = self.inner.config.options_for(&uri).into_iter().collect();
        TableObject::owned(table)
    }

    /// Absolute URL for `uri` on this request's server
    pub fn construct_url(&self, uri: &str) -> BridgeResult<String> {
        let (hostname, server) = self.with(|r| (r.hostname.clone(), r.server.clone()))?;
        let (name, port) = match server {
            Some(s) => {
                let s = s.get()?;
                let s = s.lock();
                (s.server_hostname.clone(), s.port)
            }
            None => ("localhost".to_string(), 80),
        };
        let host = hostname.unwrap_or(name);
        Ok(if port == 80 {
            format!("http://{}{}", host, uri)
        } else {
            format!("http://{}:{}{}", host, port, uri)
        })
    }

    pub fn set_content_length(&self, len: u64) -> BridgeResult<()> {
        self.with_mut(|r| -> BridgeResult<()> {
            r.clength = len;
            r.headers_out
                .get()?
                .lock()
                .set("Content-Length", &len.to_string());
            Ok(())
        })?
    }

    /// Write to the error log of this request's server
    pub fn log_error(&self, message: &str, level: LogLevel) -> BridgeResult<Option<LogEntry>> {
        match self.with(|r| r.server.clone())? {
            Some(server) => {
                let server = server.get()?;
                let server = server.lock();
                Ok(native_host::log_error(message, level, Some(&server)))
            }
            None => Ok(native_host::log_error(message, level, None)),
        }
    }

    // ----- writable fields -----

    pub fn set_content_type(&self, content_type: &str) -> BridgeResult<()> {
        self.with_mut(|r| r.content_type = Some(content_type.to_owned()))
    }

    pub fn set_user(&self, user: Option<&str>) -> BridgeResult<()> {
        self.with_mut(|r| r.user = user.map(str::to_owned))
    }

    pub fn set_filename(&self, filename: &str) -> BridgeResult<()> {
        self.with_mut(|r| r.filename = Some(filename.to_owned()))
    }

    pub fn set_ap_auth_type(&self, auth_type: Option<&str>) -> BridgeResult<()> {
        self.with_mut(|r| r.ap_auth_type = auth_type.map(str::to_owned))
    }

    pub fn set_status(&self, status: u16) -> BridgeResult<()> {
        StatusCode::from_u16(status)
            .map_err(|_| BridgeError::value(format!("invalid status code {}", status)))?;
        self.with_mut(|r| r.status = status)
    }

    /// Copy `finfo` into the request's own file-info record
    pub fn set_finfo(&self, finfo: &FinfoObject) -> BridgeResult<()> {
        let info = finfo.snapshot()?;
        let target = self.with(|r| r.finfo.clone())?;
        *target.get()?.lock() = info;
        Ok(())
    }

    // ----- read-only fields -----

    pub fn the_request(&self) -> BridgeResult<String> {
        self.with(|r| r.the_request.clone())
    }

    pub fn method(&self) -> BridgeResult<String> {
        self.with(|r| r.method.clone())
    }

    pub fn method_number(&self) -> BridgeResult<u32> {
        self.with(|r| r.method_number)
    }

    pub fn protocol(&self) -> BridgeResult<String> {
        self.with(|r| r.protocol.clone())
    }

    pub fn hostname(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.hostname.clone())
    }

    pub fn uri(&self) -> BridgeResult<String> {
        self.with(|r| r.uri.clone())
    }

    pub fn unparsed_uri(&self) -> BridgeResult<String> {
        self.with(|r| r.unparsed_uri.clone())
    }

    pub fn args(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.args.clone())
    }

    pub fn path_info(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.path_info.clone())
    }

    pub fn request_time(&self) -> BridgeResult<DateTime<Utc>> {
        self.with(|r| r.request_time)
    }

    pub fn status(&self) -> BridgeResult<u16> {
        self.with(|r| r.status)
    }

    pub fn status_line(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.status_line.clone())
    }

    pub fn content_type(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.content_type.clone())
    }

    pub fn user(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.user.clone())
    }

    pub fn ap_auth_type(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.ap_auth_type.clone())
    }

    pub fn filename(&self) -> BridgeResult<Option<String>> {
        self.with(|r| r.filename.clone())
    }

    pub fn header_only(&self) -> BridgeResult<bool> {
        self.with(|r| r.header_only)
    }

    pub fn headers_sent(&self) -> BridgeResult<bool> {
        self.with(|r| r.headers_sent)
    }

    pub fn bytes_sent(&self) -> BridgeResult<u64> {
        self.with(|r| r.bytes_sent)
    }

    pub fn clength(&self) -> BridgeResult<u64> {
        self.with(|r| r.clength)
    }

    pub fn remaining(&self) -> BridgeResult<u64> {
        self.with(|r| r.remaining)
    }

    pub fn read_length(&self) -> BridgeResult<u64> {
        self.with(|r| r.read_length)
    }

    /// Bitmask of allowed known methods
    pub fn allowed(&self) -> BridgeResult<u64> {
        self.with(|r| r.allowed)
    }

    /// Names of every allowed method
    pub fn allowed_methods(&self) -> BridgeResult<Vec<String>> {
        self.with(|r| r.allowed_method_names())
    }

    // ----- dispatch bookkeeping -----

    pub(crate) fn begin_phase(&self, phase: Phase, hlist: HandlerListObject) {
        let mut state = self.inner.state.lock();
        state.phase = Some(phase);
        state.hlist = Some(hlist);
    }

    pub(crate) fn end_phase(&self) {
        self.inner.state.lock().hlist = None;
    }

    pub(crate) fn take_dynamic_handlers(&self, phase: Phase) -> Option<HandlerEntry> {
        self.inner.state.lock().dynamic.remove(&phase)
    }

    /// Drop every cached link so request cycles can be freed
    pub(crate) fn release_links(&self) {
        self.inner.connection.clear();
        self.inner.server.clear();
        self.inner.next.clear();
        self.inner.prev.clear();
        self.inner.main.clear();
        let mut state = self.inner.state.lock();
        state.hlist = None;
        state.dynamic.clear();
        state.rbuff.clear();
    }
}

impl fmt::Debug for RequestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestObject")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use native_host::{
        MemoryTransport, NativeConnection, NativeServer, Pool, shared_transport,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoRedirect;

    impl HostServices for NoRedirect {
        fn internal_redirect(&self, _: &str, _: &PoolRef<NativeRequest>) -> NativeResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        cache: Arc<RequestCache>,
        transport: MemoryTransport,
        conn_pool: Pool,
        req_pool: Pool,
        native: PoolRef<NativeRequest>,
        _process: Pool,
    }

    fn fixture(chunks: Vec<&'static str>, content_length: Option<usize>) -> Fixture {
        let process = Pool::new("process");
        let server = NativeServer::create(&process, NativeServer::new("example.org", 8080)).unwrap();
        let conn_pool = process.create_child("connection").unwrap();
        let transport = MemoryTransport::with_chunks(chunks);
        let conn = NativeConnection::create(
            &conn_pool,
            1,
            shared_transport(transport.clone()),
            Some(server),
        )
        .unwrap();
        let req_pool = conn_pool.create_child("request").unwrap();
        let native = NativeRequest::create(&req_pool, &conn, "POST", "/app/form").unwrap();
        if let Some(cl) = content_length {
            let r = native.get().unwrap();
            let r = r.lock();
            r.headers_in
                .get()
                .unwrap()
                .lock()
                .set("Content-Length", &cl.to_string());
        }
        let config = BridgeConfig::default().with_read_chunk_size(4);
        let cache = RequestCache::new(
            Arc::new(Interpreter::new("test")),
            Arc::new(NoRedirect),
            Arc::new(config),
        );
        Fixture {
            cache,
            transport,
            conn_pool,
            req_pool,
            native,
            _process: process,
        }
    }

    #[test]
    fn test_wrapper_identity_is_cached() {
        let fx = fixture(vec![], None);
        let a = fx.cache.get_or_create(&fx.native).unwrap();
        let b = fx.cache.get_or_create(&fx.native).unwrap();
        assert!(a.ptr_eq(&b));

        let c1 = a.connection().unwrap();
        let c2 = a.connection().unwrap();
        assert!(c1.ptr_eq(&c2));
        let s1 = a.server().unwrap().unwrap();
        assert!(s1.ptr_eq(&a.server().unwrap().unwrap()));
    }

    #[test]
    fn test_pool_teardown_evicts_wrapper() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        req.connection().unwrap();
        assert_eq!(fx.cache.len(), 1);

        fx.req_pool.destroy();
        assert_eq!(fx.cache.len(), 0);
        assert!(req.uri().is_err());
        assert!(req.headers_in().len().is_err());
        assert!(!req.inner.connection.is_cached());
    }

    #[test]
    fn test_read_whole_body_and_slices() {
        let fx = fixture(vec!["hello ", "wor", "ld"], Some(11));
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();

        assert_eq!(&req.read(&mut py, Some(3)).unwrap()[..], b"hel");
        assert_eq!(&req.read(&mut py, None).unwrap()[..], b"lo world");
        assert!(req.read(&mut py, None).unwrap().is_empty());
        assert_eq!(req.read_length().unwrap(), 11);
    }

    #[test]
    fn test_negative_sizes_rejected() {
        let fx = fixture(vec!["x"], Some(1));
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        assert!(matches!(req.read(&mut py, Some(-1)), Err(BridgeError::Value { .. })));
        assert!(matches!(req.readline(&mut py, Some(-5)), Err(BridgeError::Value { .. })));
    }

    #[test]
    fn test_no_body_reads_empty() {
        let fx = fixture(vec!["ignored"], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        assert!(req.read(&mut py, None).unwrap().is_empty());
        assert!(req.readline(&mut py, None).unwrap().is_empty());
    }

    #[test]
    fn test_readline_then_read_shares_carry() {
        let fx = fixture(vec!["ab\ncdef", "gh\n"], Some(10));
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();

        assert_eq!(&req.readline(&mut py, None).unwrap()[..], b"ab\n");
        assert_eq!(&req.read(&mut py, Some(2)).unwrap()[..], b"cd");
        assert_eq!(&req.readline(&mut py, Some(2)).unwrap()[..], b"ef");
        assert_eq!(&req.readline(&mut py, None).unwrap()[..], b"gh\n");
        assert!(req.readline(&mut py, None).unwrap().is_empty());
    }

    #[test]
    fn test_readlines_honours_hint() {
        let fx = fixture(vec!["one\ntwo\nthree\n"], Some(14));
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();

        let first = req.readlines(&mut py, Some(5)).unwrap();
        assert_eq!(first, vec![Bytes::from("one\n"), Bytes::from("two\n")]);
        let rest = req.readlines(&mut py, None).unwrap();
        assert_eq!(rest, vec![Bytes::from("three\n")]);
    }

    #[test]
    fn test_short_body_is_io_error() {
        let fx = fixture(vec!["abc"], Some(10));
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        assert!(matches!(req.read(&mut py, None), Err(BridgeError::Io { .. })));
        // Bytes read before the failure are kept.
        assert_eq!(fx.native.get().unwrap().lock().read_length, 3);
    }

    #[test]
    fn test_chunked_body_is_length_required() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        req.headers_in().set("Transfer-Encoding", "chunked").unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        let err = req.read(&mut py, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[test]
    fn test_write_sends_headers_once() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        req.set_content_type("text/plain").unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();

        req.write(&mut py, "a", false).unwrap();
        req.write(&mut py, "b", true).unwrap();
        let out = String::from_utf8(fx.transport.output()).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\nab"));
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
        assert_eq!(req.bytes_sent().unwrap(), 2);
        assert_eq!(fx.transport.flush_count(), 1);
    }

    #[test]
    fn test_write_to_closed_peer() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        fx.transport.close_peer();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        match req.write(&mut py, "x", true) {
            Err(BridgeError::Io { message, .. }) => {
                assert_eq!(message, "Write failed, client closed connection")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(req.bytes_sent().unwrap(), 0);
    }

    #[test]
    fn test_redirect_after_headers_sent() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let interp = req.interpreter().clone();
        let mut py = interp.acquire();
        req.internal_redirect(&mut py, "/elsewhere").unwrap();
        req.flush(&mut py).unwrap();
        assert!(matches!(
            req.internal_redirect(&mut py, "/elsewhere"),
            Err(BridgeError::State { .. })
        ));
    }

    #[test]
    fn test_add_handler_targets() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();

        assert!(matches!(
            req.add_handler("NoSuchPhase", "h", None),
            Err(BridgeError::InvalidPhase { .. })
        ));

        let live = HandlerListObject::new(Some(HandlerEntry::new("first", Some("/app".into()), false)));
        req.begin_phase(Phase::Handler, live.clone());
        req.add_handler("Handler", "second", None).unwrap();
        req.add_handler("LogHandler", "logger", None).unwrap();
        req.add_handler("LogHandler", "logger2", Some("/other")).unwrap();

        assert_eq!(live.remaining(), 2);
        let later = req.take_dynamic_handlers(Phase::LogHandler).unwrap();
        let entries: Vec<(&str, Option<&str>)> = later
            .iter()
            .map(|e| (e.handler.as_str(), e.directory.as_deref()))
            .collect();
        assert_eq!(entries, vec![("logger", Some("/app")), ("logger2", Some("/other"))]);
        assert!(req.take_dynamic_handlers(Phase::LogHandler).is_none());
    }

    #[test]
    fn test_allow_methods_checks_all_first() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let err = req.allow_methods(&[Value::from("GET"), Value::from(3)], false);
        assert!(matches!(err, Err(BridgeError::Type { .. })));
        assert!(req.allowed_methods().unwrap().is_empty());

        req.allow_methods(&[Value::from("GET"), Value::from("POST")], false)
            .unwrap();
        req.allow_methods(&[Value::from("PUT")], true).unwrap();
        assert_eq!(req.allowed_methods().unwrap(), vec!["PUT"]);
    }

    #[test]
    fn test_cleanup_runs_exactly_once() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        req.register_cleanup(
            Box::new(move |data: Option<Value>| {
                assert_eq!(data, Some(Value::from(7)));
                h.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }),
            Some(Value::from(7)),
        )
        .unwrap();
        req.register_cleanup(
            Box::new(|_: Option<Value>| -> anyhow::Result<()> { Err(anyhow::anyhow!("ignored")) }),
            None,
        )
        .unwrap();

        fx.conn_pool.destroy();
        fx.req_pool.destroy();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_setters_and_urls() {
        let fx = fixture(vec![], None);
        let req = fx.cache.get_or_create(&fx.native).unwrap();
        assert!(matches!(req.set_status(42), Err(BridgeError::Value { .. })));
        req.set_status(404).unwrap();
        req.set_user(Some("alice")).unwrap();
        req.set_filename("/srv/app/form").unwrap();
        req.set_content_length(12).unwrap();

        assert_eq!(req.status().unwrap(), 404);
        assert_eq!(req.user().unwrap().as_deref(), Some("alice"));
        assert_eq!(req.headers_out().get("content-length").unwrap(), "12");
        assert_eq!(
            req.construct_url("/x").unwrap(),
            "http://example.org:8080/x"
        );
    }

    #[test]
    fn test_siblings_share_cache() {
        let fx = fixture(vec![], None);
        let prev = fx.cache.get_or_create(&fx.native).unwrap();
        let conn = fx.native.get().unwrap().lock().connection.clone();
        let next_pool = fx.req_pool.create_child("redirect").unwrap();
        let next_native = NativeRequest::create(&next_pool, &conn, "GET", "/b").unwrap();
        NativeRequest::link_redirect(&fx.native, &next_native).unwrap();

        let next = prev.next().unwrap().unwrap();
        assert!(next.ptr_eq(&fx.cache.get_or_create(&next_native).unwrap()));
        assert!(next.prev().unwrap().unwrap().ptr_eq(&prev));
        assert!(prev.prev().unwrap().is_none());
        assert!(prev.main().unwrap().is_none());

        fx.req_pool.destroy();
        assert_eq!(fx.cache.len(), 0);
    }
}
