//! Native host model
//!
//! The host server side of the script bridge: hierarchical pools with cleanup
//! registration, the multi-valued native table, server/connection/request and
//! file-info records, the blocking client transport, and brigades flowing
//! through filter-chain positions. The bridge consumes these through the
//! narrow interfaces re-exported here.

mod brigade;
mod finfo;
mod pool;
mod record;
mod table;
mod transport;
pub mod error;
pub mod log;

pub use brigade::{Brigade, Bucket};
pub use error::{NativeError, NativeResult};
pub use finfo::{FileInfo, FileType, FinfoValid};
pub use log::{log_error, LogEntry, LogLevel};
pub use pool::{Pool, PoolRef, Pooled, WeakPool};
pub use record::{
	method_number, read_client_block, HostServices, KeepAlive, NativeConnection, NativeRequest,
	NativeServer, RequestId, METHODS, M_INVALID,
};
pub use table::{Table, TableEntry};
pub use transport::{
	shared_transport, FilterChain, MemoryChain, MemoryTransport, ReadMode, SharedTransport,
	Transport,
};

/// Default size of a transport read, and minimum size of a line carry buffer
pub const HUGE_STRING_LEN: usize = 8192;
