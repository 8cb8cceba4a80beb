//! Script Bridge
//!
//! Object bridge exposing an HTTP server's request lifecycle to script
//! handlers.
//!
//! # Overview
//!
//! The host server keeps its state in pool-allocated native records. The
//! bridge presents that state as a graph of reference-counted wrappers:
//!
//! - **Tables**: multi-valued, case-insensitive header and environment maps
//! - **Request / Connection / Server**: lazily materialised, identity-stable
//!   views of the native records
//! - **File info**: validity-gated stat fields
//! - **Handler lists**: the live chain of handlers of the running phase
//! - **Filters**: one position of the host's input or output filter chain
//!
//! # Architecture
//!
//! ```text
//! Host request
//!      │
//!      ▼
//! ┌───────────────┐
//! │ ScriptContext │──► Directory config, handler registry
//! └──────┬────────┘
//!        │  dispatch(phase)
//!        ▼
//! ┌───────────────┐
//! │ RequestObject │──► Tables, connection, server, siblings
//! └──────┬────────┘
//!        │  read / write (interpreter released)
//!        ▼
//! ┌───────────────┐
//! │  native-host  │──► Pools, transport, filter chain
//! └───────────────┘
//! ```
//!
//! Every wrapper that borrows native memory is valid only while the owning
//! pool lives; after teardown its accessors fail with
//! [`NativeError::PoolDestroyed`](native_host::NativeError) instead of
//! touching freed state.
//!
//! # Usage
//!
//! ```rust,no_run
//! use script_bridge::{BridgeConfig, DirectoryConfig, HostRequest, Phase, SimulatedHost, Status};
//!
//! let config = BridgeConfig::default()
//!     .with_directory(DirectoryConfig::new("/").with_handler(Phase::Handler, "hello"));
//! let host = SimulatedHost::new(config).unwrap();
//! host.context().register_fn("hello", |req, py| {
//!     req.set_content_type("text/plain")?;
//!     req.write(py, "hello\n", false)?;
//!     Ok(Status::Ok)
//! });
//!
//! let response = host.run(HostRequest::get("/")).unwrap();
//! assert_eq!(response.status, 200);
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod finfo;
pub mod hlist;
pub mod host;
pub mod interpreter;
mod lazy;
pub mod phase;
pub mod request;
pub mod server;
pub mod table;

// Re-exports for convenience
pub use config::{BridgeConfig, DirectoryConfig};
pub use connection::ConnectionObject;
pub use dispatch::{FilterHandler, Handler, ScriptContext, Status};
pub use error::{BridgeError, BridgeResult};
pub use filter::{FilterContext, FilterObject};
pub use finfo::{FinfoField, FinfoObject, FinfoValue};
pub use hlist::{HandlerEntry, HandlerInfo, HandlerListObject};
pub use host::{HostRequest, HostResponse, SimulatedHost};
pub use interpreter::{Cleanup, Interpreter, InterpreterGuard};
pub use phase::Phase;
pub use request::RequestObject;
pub use server::ServerObject;
pub use table::{TableObject, TableValue, make_table};

// Re-export the native types handlers see directly
pub use native_host::{LogEntry, LogLevel};

/// Write `message` to the host error log, filtered by `server`'s log level
/// when one is given
pub fn log_error(
    message: &str,
    level: LogLevel,
    server: Option<&ServerObject>,
) -> BridgeResult<Option<LogEntry>> {
    match server {
        Some(server) => server.log_error(message, level),
        None => Ok(native_host::log_error(message, level, None)),
    }
}

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bridge name
pub const NAME: &str = "Script Bridge";

/// Print version information
pub fn print_version() {
    println!("{} v{}", NAME, VERSION);
}
