//! Simulated host server
//!
//! Drives requests through the phase sequence the way the real host would:
//! one pool per connection and per request, the body delivered in chunks by
//! an in-memory transport, and internal redirects processed as nested
//! requests on the same connection. Used by the CLI and the integration tests.

use crate::config::BridgeConfig;
use crate::dispatch::{ScriptContext, Status};
use crate::error::BridgeResult;
use crate::phase::Phase;
use crate::server::ServerObject;
use bytes::Bytes;
use http::StatusCode;
use native_host::{
    HostServices, MemoryTransport, NativeConnection, NativeError, NativeRequest, NativeResult,
    NativeServer, Pool, PoolRef, RequestId, shared_transport,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// A request as it arrives from the client
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Size of the pieces the body is delivered in
    pub chunk_size: usize,
}

impl HostRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            chunk_size: native_host::HUGE_STRING_LEN,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    pub fn header(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.headers.push((key.into(), val.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn body_chunks(&self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < self.body.len() {
            let end = (start + self.chunk_size).min(self.body.len());
            chunks.push(self.body.slice(start..end));
            start = end;
        }
        chunks
    }
}

/// What the client received
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub request_id: RequestId,
    pub status: u16,
    /// Raw bytes written to the connection
    pub output: Bytes,
}

impl HostResponse {
    fn split(&self) -> (&[u8], &[u8]) {
        match self.output.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(i) => (&self.output[..i], &self.output[i + 4..]),
            None => (&self.output[..], &[][..]),
        }
    }

    /// Payload after the header block
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(self.split().1)
    }

    pub fn status_line(&self) -> Option<String> {
        let (head, _) = self.split();
        let head = String::from_utf8_lossy(head);
        head.lines().next().map(str::to_owned)
    }

    /// First response header named `name`
    pub fn header(&self, name: &str) -> Option<String> {
        let (head, _) = self.split();
        String::from_utf8_lossy(head)
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_owned())
    }
}

/// Run every phase but logging; stops at the first phase that ends the request
fn run_phases(context: &ScriptContext, native: &PoolRef<NativeRequest>) -> BridgeResult<()> {
    for phase in Phase::HOST_ORDER {
        if phase == Phase::LogHandler {
            continue;
        }
        let status = match context.dispatch(phase, native) {
            Ok(status) => status,
            Err(e) => {
                native.get()?.lock().status = e.status().as_u16();
                return Err(e);
            }
        };
        match status {
            Status::Ok => {}
            Status::Declined if phase == Phase::Handler => {
                debug!("no content handler accepted the request");
                native.get()?.lock().status = StatusCode::NOT_FOUND.as_u16();
            }
            Status::Declined => {}
            Status::Done => break,
            Status::Http(code) => {
                native.get()?.lock().status = code.as_u16();
                break;
            }
        }
    }
    Ok(())
}

/// Restarts processing of a request under a new URI
struct Redirector {
    context: Weak<ScriptContext>,
}

impl HostServices for Redirector {
    fn internal_redirect(&self, uri: &str, prev: &PoolRef<NativeRequest>) -> NativeResult<()> {
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| NativeError::InvalidState("script context is gone".to_owned()))?;

        let (pool, connection, method, hostname, headers_in) = {
            let p = prev.get()?;
            let p = p.lock();
            (
                p.pool.upgrade()?,
                p.connection.clone(),
                p.method.clone(),
                p.hostname.clone(),
                p.headers_in.clone(),
            )
        };
        let headers = headers_in.get()?.lock().clone();

        let next = NativeRequest::create(&pool.create_child("redirect")?, &connection, &method, uri)?;
        {
            let n = next.get()?;
            let mut n = n.lock();
            n.hostname = hostname;
            *n.headers_in.get()?.lock() = headers;
        }
        NativeRequest::link_redirect(prev, &next)?;

        info!(%uri, "internal redirect");
        let result = run_phases(&context, &next);

        let (status, headers_sent, bytes_sent) = {
            let n = next.get()?;
            let n = n.lock();
            (n.status, n.headers_sent, n.bytes_sent)
        };
        {
            let p = prev.get()?;
            let mut p = p.lock();
            p.status = status;
            p.headers_sent = headers_sent;
            p.bytes_sent = bytes_sent;
        }
        result.map_err(|e| NativeError::InvalidState(format!("redirect to {} failed: {}", uri, e)))
    }
}

/// In-process host running requests against one virtual server
pub struct SimulatedHost {
    context: Arc<ScriptContext>,
    process: Pool,
    server: ServerObject,
    connections: AtomicU64,
}

impl SimulatedHost {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let loglevel = config.log_level;
        let context = Arc::new_cyclic(|weak: &Weak<ScriptContext>| {
            let host: Arc<dyn HostServices> = Arc::new(Redirector {
                context: weak.clone(),
            });
            ScriptContext::new(config, host)
        });

        let process = Pool::new("process");
        let mut server = NativeServer::new("localhost", 80);
        server.loglevel = loglevel;
        let server = ServerObject::new(NativeServer::create(&process, server)?);

        Ok(Self {
            context,
            process,
            server,
            connections: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<ScriptContext> {
        &self.context
    }

    pub fn server(&self) -> &ServerObject {
        &self.server
    }

    /// Process one request on a fresh connection
    pub fn run(&self, request: HostRequest) -> BridgeResult<HostResponse> {
        let transport = MemoryTransport::with_chunks(request.body_chunks());
        let id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_pool = self.process.create_child("connection")?;
        let conn = NativeConnection::create(
            &conn_pool,
            id,
            shared_transport(transport.clone()),
            Some(self.server.native().clone()),
        )?;
        let req_pool = conn_pool.create_child("request")?;
        let native = NativeRequest::create(&req_pool, &conn, &request.method, &request.uri)?;
        let request_id = prepare(&native, &request)?;

        info!(request = %request_id, method = %request.method, uri = %request.uri, "processing request");
        let outcome = run_phases(&self.context, &native);
        if let Err(e) = &outcome {
            warn!(request = %request_id, "request failed: {}", e);
        }
        if let Err(e) = self.context.dispatch(Phase::LogHandler, &native) {
            warn!(request = %request_id, "log phase failed: {}", e);
        }
        self.finish(&native);

        let status = native.get()?.lock().status;
        // Cleanups take the interpreter themselves.
        req_pool.destroy();
        conn_pool.destroy();

        Ok(HostResponse {
            request_id,
            status,
            output: Bytes::from(transport.output()),
        })
    }

    /// Send the header block if no handler wrote anything, then flush
    fn finish(&self, native: &PoolRef<NativeRequest>) {
        let flushed = self.context.request_object(native).and_then(|request| {
            let mut py = self.context.interpreter().acquire();
            request.flush(&mut py)
        });
        if let Err(e) = flushed {
            warn!("failed to finish response: {}", e);
        }
    }

    /// Tear down the process pool, running server cleanups
    pub fn shutdown(&self) {
        debug!("shutting down simulated host");
        self.process.destroy();
    }
}

impl Drop for SimulatedHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Copy the client's headers into the request record
fn prepare(native: &PoolRef<NativeRequest>, request: &HostRequest) -> BridgeResult<RequestId> {
    let r = native.get()?;
    let mut r = r.lock();
    let headers = r.headers_in.get()?;
    let mut headers = headers.lock();
    for (k, v) in &request.headers {
        headers.add(k, v);
    }
    if !request.body.is_empty()
        && !headers.contains_key("Content-Length")
        && !headers.contains_key("Transfer-Encoding")
    {
        headers.set("Content-Length", &request.body.len().to_string());
    }
    let hostname = headers
        .get("Host")
        .map(|h| h.split(':').next().unwrap_or(h).to_owned());
    drop(headers);
    r.hostname = hostname;
    Ok(r.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;

    fn host(config: BridgeConfig) -> SimulatedHost {
        SimulatedHost::new(config).unwrap()
    }

    #[test]
    fn test_unhandled_request_is_404() {
        let host = host(BridgeConfig::default());
        let resp = host.run(HostRequest::get("/nothing")).unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.status_line().as_deref(), Some("HTTP/1.1 404 Not Found"));
        assert_eq!(host.context().cached_requests(), 0);
    }

    #[test]
    fn test_body_reaches_handler() {
        let config = BridgeConfig::default()
            .with_directory(DirectoryConfig::new("/").with_handler(Phase::Handler, "echo"));
        let host = host(config);
        host.context().register_fn("echo", |req, py| {
            let body = req.read(py, None)?;
            req.set_content_type("text/plain")?;
            req.write(py, &body, false)?;
            Ok(Status::Ok)
        });

        let resp = host
            .run(HostRequest::new("POST", "/").body("split across chunks").chunk_size(3))
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body(), "split across chunks");
        assert_eq!(resp.header("content-type").as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_internal_redirect_links_requests() {
        let config = BridgeConfig::default()
            .with_directory(DirectoryConfig::new("/old").with_handler(Phase::Handler, "move"))
            .with_directory(DirectoryConfig::new("/new").with_handler(Phase::Handler, "land"));
        let host = host(config);
        host.context().register_fn("move", |req, py| {
            req.internal_redirect(py, "/new/place")?;
            let next = req.next()?.ok_or_else(|| anyhow::anyhow!("no next request"))?;
            anyhow::ensure!(next.prev()?.is_some_and(|p| p.ptr_eq(req)));
            Ok(Status::Done)
        });
        host.context().register_fn("land", |req, py| {
            req.set_status(202)?;
            req.write(py, req.uri()?, true)?;
            Ok(Status::Ok)
        });

        let resp = host.run(HostRequest::get("/old").header("Host", "example.org:8080")).unwrap();
        assert_eq!(resp.status, 202);
        assert_eq!(resp.body(), "/new/place");
        assert_eq!(resp.output.windows(8).filter(|w| *w == b"HTTP/1.1").count(), 1);
        assert_eq!(host.context().cached_requests(), 0);
    }
}
