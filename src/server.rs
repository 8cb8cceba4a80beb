//! Server wrapper
//!
//! A borrowed handle over a virtual host record. The `next` virtual host is
//! materialised on first access and cached.

use crate::error::BridgeResult;
use crate::interpreter::{Cleanup, Interpreter};
use crate::lazy::LazySlot;
use native_host::{LogEntry, LogLevel, NativeServer, PoolRef};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct ServerInner {
    server: PoolRef<NativeServer>,
    next: LazySlot<ServerObject>,
}

/// Reference-counted server handle
#[derive(Clone)]
pub struct ServerObject {
    inner: Arc<ServerInner>,
}

impl ServerObject {
    pub fn new(server: PoolRef<NativeServer>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                server,
                next: LazySlot::new(),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &ServerObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Native record handle
    pub fn native(&self) -> &PoolRef<NativeServer> {
        &self.inner.server
    }

    fn with<R>(&self, f: impl FnOnce(&NativeServer) -> R) -> BridgeResult<R> {
        let server = self.inner.server.get()?;
        let server = server.lock();
        Ok(f(&server))
    }

    pub fn server_hostname(&self) -> BridgeResult<String> {
        self.with(|s| s.server_hostname.clone())
    }

    pub fn port(&self) -> BridgeResult<u16> {
        self.with(|s| s.port)
    }

    pub fn server_admin(&self) -> BridgeResult<Option<String>> {
        self.with(|s| s.server_admin.clone())
    }

    pub fn is_virtual(&self) -> BridgeResult<bool> {
        self.with(|s| s.is_virtual)
    }

    pub fn timeout(&self) -> BridgeResult<Duration> {
        self.with(|s| s.timeout)
    }

    pub fn keep_alive(&self) -> BridgeResult<bool> {
        self.with(|s| s.keep_alive)
    }

    pub fn keep_alive_timeout(&self) -> BridgeResult<Duration> {
        self.with(|s| s.keep_alive_timeout)
    }

    pub fn keep_alive_max(&self) -> BridgeResult<u32> {
        self.with(|s| s.keep_alive_max)
    }

    pub fn path(&self) -> BridgeResult<Option<String>> {
        self.with(|s| s.path.clone())
    }

    pub fn error_fname(&self) -> BridgeResult<Option<String>> {
        self.with(|s| s.error_fname.clone())
    }

    pub fn loglevel(&self) -> BridgeResult<LogLevel> {
        self.with(|s| s.loglevel)
    }

    pub fn limit_req_line(&self) -> BridgeResult<u32> {
        self.with(|s| s.limit_req_line)
    }

    pub fn limit_req_fieldsize(&self) -> BridgeResult<u32> {
        self.with(|s| s.limit_req_fieldsize)
    }

    pub fn limit_req_fields(&self) -> BridgeResult<u32> {
        self.with(|s| s.limit_req_fields)
    }

    pub fn defn_name(&self) -> BridgeResult<Option<String>> {
        self.with(|s| s.defn_name.clone())
    }

    pub fn defn_line_number(&self) -> BridgeResult<u32> {
        self.with(|s| s.defn_line_number)
    }

    /// Next virtual host in the host's list, `None` for the last one
    pub fn next(&self) -> BridgeResult<Option<ServerObject>> {
        self.inner.next.get_or_try_init(|| {
            let link = self.with(|s| s.next.clone())?;
            Ok(link.map(|next| {
                debug!("materialising server.next");
                ServerObject::new(next)
            }))
        })
    }

    /// Write to the host error log through this server's level filter
    pub fn log_error(&self, message: &str, level: LogLevel) -> BridgeResult<Option<LogEntry>> {
        self.with(|s| native_host::log_error(message, level, Some(s)))
    }

    /// Run `cleanup` once when the server's process pool is torn down
    pub fn register_cleanup(
        &self,
        interpreter: &Arc<Interpreter>,
        cleanup: Cleanup,
        data: Option<Value>,
    ) -> BridgeResult<()> {
        let pool = self.with(|s| s.pool.clone())?.upgrade()?;
        let interpreter = interpreter.clone();
        let server = self.inner.server.clone();
        pool.register_cleanup(move || interpreter.run_cleanup(cleanup, data, Some(&server)))?;
        Ok(())
    }
}

impl fmt::Debug for ServerObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerObject")
            .field("server", &self.inner.server)
            .field("next_cached", &self.inner.next.is_cached())
            .finish()
    }
}
