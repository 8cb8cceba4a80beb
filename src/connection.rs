//! Connection wrapper
//!
//! The notes table is wrapped eagerly. `server` and `base_server` are
//! materialised on first access and cached; a null link stays `None` and is
//! looked up again on the next access.

use crate::error::BridgeResult;
use crate::lazy::LazySlot;
use crate::server::ServerObject;
use crate::table::TableObject;
use native_host::{KeepAlive, NativeConnection, NativeServer, PoolRef};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

struct ConnectionInner {
    connection: PoolRef<NativeConnection>,
    notes: TableObject,
    server: LazySlot<ServerObject>,
    base_server: LazySlot<ServerObject>,
}

/// Reference-counted connection handle
#[derive(Clone)]
pub struct ConnectionObject {
    inner: Arc<ConnectionInner>,
}

impl ConnectionObject {
    pub fn new(connection: PoolRef<NativeConnection>) -> BridgeResult<Self> {
        let notes = connection.get()?.lock().notes.clone();
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                connection,
                notes: TableObject::borrowed(notes),
                server: LazySlot::new(),
                base_server: LazySlot::new(),
            }),
        })
    }

    pub fn ptr_eq(&self, other: &ConnectionObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn native(&self) -> &PoolRef<NativeConnection> {
        &self.inner.connection
    }

    fn with<R>(&self, f: impl FnOnce(&NativeConnection) -> R) -> BridgeResult<R> {
        let conn = self.inner.connection.get()?;
        let conn = conn.lock();
        Ok(f(&conn))
    }

    fn materialize(
        &self,
        slot: &LazySlot<ServerObject>,
        link: fn(&NativeConnection) -> Option<PoolRef<NativeServer>>,
        what: &'static str,
    ) -> BridgeResult<Option<ServerObject>> {
        slot.get_or_try_init(|| {
            let native = self.with(link)?;
            Ok(native.map(|server| {
                debug!(field = what, "materialising connection link");
                ServerObject::new(server)
            }))
        })
    }

    /// Server the connection was accepted for
    pub fn server(&self) -> BridgeResult<Option<ServerObject>> {
        self.materialize(&self.inner.server, |c| c.server.clone(), "server")
    }

    /// Physical server the connection came in on
    pub fn base_server(&self) -> BridgeResult<Option<ServerObject>> {
        self.materialize(&self.inner.base_server, |c| c.base_server.clone(), "base_server")
    }

    pub fn notes(&self) -> &TableObject {
        &self.inner.notes
    }

    pub fn id(&self) -> BridgeResult<u64> {
        self.with(|c| c.id)
    }

    pub fn remote_addr(&self) -> BridgeResult<Option<SocketAddr>> {
        self.with(|c| c.remote_addr)
    }

    pub fn local_addr(&self) -> BridgeResult<Option<SocketAddr>> {
        self.with(|c| c.local_addr)
    }

    pub fn remote_ip(&self) -> BridgeResult<Option<String>> {
        self.with(|c| c.remote_addr.map(|a| a.ip().to_string()))
    }

    pub fn remote_host(&self) -> BridgeResult<Option<String>> {
        self.with(|c| c.remote_host.clone())
    }

    pub fn remote_logname(&self) -> BridgeResult<Option<String>> {
        self.with(|c| c.remote_logname.clone())
    }

    pub fn keepalive(&self) -> BridgeResult<KeepAlive> {
        self.with(|c| c.keepalive)
    }

    pub fn keepalives(&self) -> BridgeResult<u32> {
        self.with(|c| c.keepalives)
    }

    pub fn aborted(&self) -> BridgeResult<bool> {
        self.with(|c| c.aborted)
    }
}

impl fmt::Debug for ConnectionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionObject")
            .field("connection", &self.inner.connection)
            .field("server_cached", &self.inner.server.is_cached())
            .finish()
    }
}
