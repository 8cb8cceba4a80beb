//! Native server, connection and request records
//!
//! Every record is allocated from a pool and reached through a [`PoolRef`].
//! Links between records (a request's connection, a connection's server, the
//! redirect chain) are pool-scoped handles too, so nothing here keeps a
//! record alive past its pool.

use crate::error::{NativeError, NativeResult};
use crate::finfo::FileInfo;
use crate::log::LogLevel;
use crate::pool::{Pool, PoolRef, WeakPool};
use crate::table::Table;
use crate::transport::SharedTransport;
use chrono::{DateTime, Utc};
use http::StatusCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Methods with a bit in [`NativeRequest::allowed`], indexed by method number
pub const METHODS: [&str; 15] = [
	"GET", "PUT", "POST", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH", "PROPFIND",
	"PROPPATCH", "MKCOL", "COPY", "MOVE", "LOCK", "UNLOCK",
];

/// Method number used for methods outside [`METHODS`]
pub const M_INVALID: u32 = 26;

/// Bit number for a known method name
pub fn method_number(method: &str) -> Option<u32> {
	METHODS
		.iter()
		.position(|m| m.eq_ignore_ascii_case(method))
		.map(|i| i as u32)
}

/// Globally stable identity of a native request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for RequestId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Virtual host record
#[derive(Debug)]
pub struct NativeServer {
	pub server_hostname: String,
	pub port: u16,
	pub server_admin: Option<String>,
	pub is_virtual: bool,
	pub timeout: Duration,
	pub keep_alive_timeout: Duration,
	pub keep_alive_max: u32,
	pub keep_alive: bool,
	pub path: Option<String>,
	pub error_fname: Option<String>,
	pub loglevel: LogLevel,
	pub limit_req_line: u32,
	pub limit_req_fieldsize: u32,
	pub limit_req_fields: u32,
	pub defn_name: Option<String>,
	pub defn_line_number: u32,
	pub next: Option<PoolRef<NativeServer>>,
	/// Process-lifetime pool the record was created in
	pub pool: WeakPool,
}

impl NativeServer {
	pub fn new(hostname: impl Into<String>, port: u16) -> Self {
		Self {
			server_hostname: hostname.into(),
			port,
			server_admin: None,
			is_virtual: false,
			timeout: Duration::from_secs(60),
			keep_alive_timeout: Duration::from_secs(5),
			keep_alive_max: 100,
			keep_alive: true,
			path: None,
			error_fname: None,
			loglevel: LogLevel::Warning,
			limit_req_line: 8190,
			limit_req_fieldsize: 8190,
			limit_req_fields: 100,
			defn_name: None,
			defn_line_number: 0,
			next: None,
			pool: WeakPool::default(),
		}
	}

	/// Move the record into `pool`
	pub fn create(pool: &Pool, mut server: NativeServer) -> NativeResult<PoolRef<NativeServer>> {
		server.pool = pool.downgrade();
		pool.alloc(Mutex::new(server))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAlive {
	#[default]
	Unknown,
	Close,
	KeepAlive,
}

/// Client connection record
pub struct NativeConnection {
	pub id: u64,
	pub pool: WeakPool,
	pub remote_addr: Option<SocketAddr>,
	pub local_addr: Option<SocketAddr>,
	pub remote_host: Option<String>,
	pub remote_logname: Option<String>,
	pub keepalive: KeepAlive,
	pub keepalives: u32,
	pub aborted: bool,
	pub notes: PoolRef<Table>,
	pub server: Option<PoolRef<NativeServer>>,
	pub base_server: Option<PoolRef<NativeServer>>,
	pub transport: SharedTransport,
}

impl NativeConnection {
	/// Allocate a connection record (and its notes table) from `pool`
	pub fn create(
		pool: &Pool,
		id: u64,
		transport: SharedTransport,
		server: Option<PoolRef<NativeServer>>,
	) -> NativeResult<PoolRef<NativeConnection>> {
		let notes = pool.alloc(Mutex::new(Table::new()))?;
		pool.alloc(Mutex::new(NativeConnection {
			id,
			pool: pool.downgrade(),
			remote_addr: None,
			local_addr: None,
			remote_host: None,
			remote_logname: None,
			keepalive: KeepAlive::Unknown,
			keepalives: 0,
			aborted: false,
			notes,
			base_server: server.clone(),
			server,
			transport,
		}))
	}
}

impl fmt::Debug for NativeConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NativeConnection")
			.field("id", &self.id)
			.field("remote_addr", &self.remote_addr)
			.field("keepalive", &self.keepalive)
			.field("aborted", &self.aborted)
			.finish_non_exhaustive()
	}
}

/// Request record
pub struct NativeRequest {
	pub id: RequestId,
	pub pool: WeakPool,
	pub connection: PoolRef<NativeConnection>,
	pub server: Option<PoolRef<NativeServer>>,
	pub next: Option<PoolRef<NativeRequest>>,
	pub prev: Option<PoolRef<NativeRequest>>,
	pub main: Option<PoolRef<NativeRequest>>,

	pub the_request: String,
	pub method: String,
	pub method_number: u32,
	pub protocol: String,
	pub proto_num: u32,
	pub hostname: Option<String>,
	pub unparsed_uri: String,
	pub uri: String,
	pub args: Option<String>,
	pub path_info: Option<String>,
	pub request_time: DateTime<Utc>,

	pub status: u16,
	pub status_line: Option<String>,
	pub content_type: Option<String>,
	pub content_encoding: Option<String>,
	pub user: Option<String>,
	pub ap_auth_type: Option<String>,
	pub filename: Option<String>,
	pub header_only: bool,
	pub headers_sent: bool,
	pub bytes_sent: u64,

	pub allowed: u64,
	pub allowed_xmethods: Vec<String>,

	pub clength: u64,
	pub remaining: u64,
	pub read_length: u64,
	pub read_chunked: bool,
	pub client_block_ready: bool,

	pub headers_in: PoolRef<Table>,
	pub headers_out: PoolRef<Table>,
	pub err_headers_out: PoolRef<Table>,
	pub subprocess_env: PoolRef<Table>,
	pub notes: PoolRef<Table>,
	pub finfo: PoolRef<FileInfo>,

	pub transport: SharedTransport,
}

impl NativeRequest {
	/// Allocate a request record, and the tables it owns, from `pool`.
	///
	/// `pool` is normally a child of the connection's pool.
	pub fn create(
		pool: &Pool,
		connection: &PoolRef<NativeConnection>,
		method: &str,
		unparsed_uri: &str,
	) -> NativeResult<PoolRef<NativeRequest>> {
		let conn = connection.get()?;
		let (server, transport) = {
			let c = conn.lock();
			(c.server.clone(), c.transport.clone())
		};

		let (uri, args) = match unparsed_uri.split_once('?') {
			Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
			None => (unparsed_uri.to_owned(), None),
		};
		let method = method.to_ascii_uppercase();
		let header_only = method == "HEAD";

		let request = NativeRequest {
			id: RequestId::new(),
			pool: pool.downgrade(),
			connection: connection.clone(),
			server,
			next: None,
			prev: None,
			main: None,
			the_request: format!("{} {} HTTP/1.1", method, unparsed_uri),
			method_number: method_number(&method).unwrap_or(M_INVALID),
			method,
			protocol: "HTTP/1.1".to_owned(),
			proto_num: 1001,
			hostname: None,
			unparsed_uri: unparsed_uri.to_owned(),
			uri,
			args,
			path_info: None,
			request_time: Utc::now(),
			status: 200,
			status_line: None,
			content_type: None,
			content_encoding: None,
			user: None,
			ap_auth_type: None,
			filename: None,
			header_only,
			headers_sent: false,
			bytes_sent: 0,
			allowed: 0,
			allowed_xmethods: Vec::new(),
			clength: 0,
			remaining: 0,
			read_length: 0,
			read_chunked: false,
			client_block_ready: false,
			headers_in: pool.alloc(Mutex::new(Table::new()))?,
			headers_out: pool.alloc(Mutex::new(Table::new()))?,
			err_headers_out: pool.alloc(Mutex::new(Table::new()))?,
			subprocess_env: pool.alloc(Mutex::new(Table::new()))?,
			notes: pool.alloc(Mutex::new(Table::new()))?,
			finfo: pool.alloc(Mutex::new(FileInfo::none()))?,
			transport,
		};
		pool.alloc(Mutex::new(request))
	}

	/// Create a sub-request of `main` in a child of its pool
	pub fn create_subrequest(
		main: &PoolRef<NativeRequest>,
		method: &str,
		uri: &str,
	) -> NativeResult<PoolRef<NativeRequest>> {
		let (pool, connection) = {
			let m = main.get()?;
			let m = m.lock();
			(m.pool.upgrade()?, m.connection.clone())
		};
		let sub_pool = pool.create_child("subrequest")?;
		let sub = NativeRequest::create(&sub_pool, &connection, method, uri)?;
		sub.get()?.lock().main = Some(main.clone());
		Ok(sub)
	}

	/// Record `next` as the internal redirect target of `prev`
	pub fn link_redirect(
		prev: &PoolRef<NativeRequest>,
		next: &PoolRef<NativeRequest>,
	) -> NativeResult<()> {
		prev.get()?.lock().next = Some(next.clone());
		next.get()?.lock().prev = Some(prev.clone());
		Ok(())
	}

	/// Prepare to read the request body.
	///
	/// Chunked bodies are refused; the body length comes from `Content-Length`.
	pub fn setup_client_block(&mut self) -> NativeResult<()> {
		let headers = self.headers_in.get()?;
		let headers = headers.lock();

		if let Some(te) = headers.get("Transfer-Encoding") {
			if te.eq_ignore_ascii_case("chunked") {
				self.read_chunked = true;
				return Err(NativeError::LengthRequired);
			}
		}

		self.clength = match headers.get("Content-Length") {
			Some(cl) => cl.trim().parse().map_err(|_| {
				NativeError::InvalidState(format!("invalid Content-Length: {}", cl))
			})?,
			None => 0,
		};
		self.remaining = self.clength;
		self.read_length = 0;
		self.client_block_ready = true;
		Ok(())
	}

	/// Whether the client has body bytes left to send
	pub fn should_client_block(&self) -> bool {
		self.read_length == 0 && self.remaining > 0
	}

	/// Mark the methods in `methods` as allowed, optionally forgetting the
	/// current set first. Unknown methods are kept by name.
	pub fn allow_methods(&mut self, reset: bool, methods: &[&str]) {
		if reset {
			self.allowed = 0;
			self.allowed_xmethods.clear();
		}
		for m in methods {
			match method_number(m) {
				Some(n) => self.allowed |= 1 << n,
				None => {
					if !self
						.allowed_xmethods
						.iter()
						.any(|x| x.eq_ignore_ascii_case(m))
					{
						self.allowed_xmethods.push(m.to_ascii_uppercase());
					}
				}
			}
		}
	}

	/// Names of every allowed method, known methods first
	pub fn allowed_method_names(&self) -> Vec<String> {
		let mut names: Vec<String> = METHODS
			.iter()
			.enumerate()
			.filter(|(i, _)| self.allowed & (1 << i) != 0)
			.map(|(_, m)| (*m).to_owned())
			.collect();
		names.extend(self.allowed_xmethods.iter().cloned());
		names
	}

	/// Status line and header block, produced once. Later calls return `None`.
	pub fn take_header_block(&mut self) -> NativeResult<Option<Vec<u8>>> {
		if self.headers_sent {
			return Ok(None);
		}
		self.headers_sent = true;

		let status_line = match &self.status_line {
			Some(line) => line.clone(),
			None => {
				let code = StatusCode::from_u16(self.status)
					.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
				format!(
					"{} {}",
					code.as_u16(),
					code.canonical_reason().unwrap_or("Unknown")
				)
			}
		};

		let mut block = format!("{} {}\r\n", self.protocol, status_line);
		if let Some(ct) = &self.content_type {
			block.push_str(&format!("Content-Type: {}\r\n", ct));
		}
		if let Some(ce) = &self.content_encoding {
			block.push_str(&format!("Content-Encoding: {}\r\n", ce));
		}
		for table in [&self.headers_out, &self.err_headers_out] {
			let table = table.get()?;
			for (k, v) in table.lock().iter() {
				block.push_str(&format!("{}: {}\r\n", k, v));
			}
		}
		block.push_str("\r\n");
		Ok(Some(block.into_bytes()))
	}
}

/// Read the next piece of the request body into `buf`.
///
/// The request lock is not held while blocking on the transport. A transport
/// that ends before the announced length is a client read error.
pub fn read_client_block(request: &Mutex<NativeRequest>, buf: &mut [u8]) -> NativeResult<usize> {
	let (transport, want) = {
		let r = request.lock();
		if r.remaining == 0 || buf.is_empty() {
			return Ok(0);
		}
		let want = buf.len().min(usize::try_from(r.remaining).unwrap_or(usize::MAX));
		(r.transport.clone(), want)
	};

	let n = transport.lock().read_block(&mut buf[..want])?;
	if n == 0 {
		return Err(NativeError::ClientRead(
			"connection closed before the request body was complete".to_owned(),
		));
	}

	let mut r = request.lock();
	r.remaining -= n as u64;
	r.read_length += n as u64;
	Ok(n)
}

/// Services the host provides to the bridge
pub trait HostServices: Send + Sync {
	/// Restart processing of `request` with `uri`
	fn internal_redirect(&self, uri: &str, request: &PoolRef<NativeRequest>) -> NativeResult<()>;
}
