//! Script context and phase dispatch
//!
//! A [`ScriptContext`] is the explicit home of everything a running
//! interpreter shares between requests: the handler and filter registries,
//! the request-identity cache, and the configuration. The host calls
//! [`ScriptContext::dispatch`] once per phase and the filter entry points
//! once per filter invocation.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::filter::{FilterContext, FilterObject};
use crate::hlist::HandlerListObject;
use crate::interpreter::{Interpreter, InterpreterGuard};
use crate::phase::Phase;
use crate::request::{RequestCache, RequestObject};
use dashmap::DashMap;
use http::StatusCode;
use native_host::{Brigade, FilterChain, HostServices, LogLevel, NativeRequest, PoolRef, ReadMode};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a handler, and of a whole phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handled; the next handler of the phase runs
    Ok,
    /// Not handled here
    Declined,
    /// Request fully answered; later phases are skipped
    Done,
    /// Stop with an HTTP status
    Http(StatusCode),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Declined => write!(f, "DECLINED"),
            Status::Done => write!(f, "DONE"),
            Status::Http(code) => write!(f, "HTTP {}", code.as_u16()),
        }
    }
}

/// A named request handler
pub trait Handler: Send + Sync {
    fn handle(&self, req: &RequestObject, py: &mut InterpreterGuard<'_>) -> anyhow::Result<Status>;
}

impl<F> Handler for F
where
    F: Fn(&RequestObject, &mut InterpreterGuard<'_>) -> anyhow::Result<Status> + Send + Sync,
{
    fn handle(&self, req: &RequestObject, py: &mut InterpreterGuard<'_>) -> anyhow::Result<Status> {
        self(req, py)
    }
}

/// A named I/O filter
pub trait FilterHandler: Send + Sync {
    fn filter(&self, filter: &FilterObject, py: &mut InterpreterGuard<'_>) -> anyhow::Result<()>;
}

impl<F> FilterHandler for F
where
    F: Fn(&FilterObject, &mut InterpreterGuard<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn filter(&self, filter: &FilterObject, py: &mut InterpreterGuard<'_>) -> anyhow::Result<()> {
        self(filter, py)
    }
}

/// Status a failed handler turns into
fn failure_status(e: &anyhow::Error) -> StatusCode {
    e.downcast_ref::<BridgeError>()
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, BridgeError::status)
}

pub struct ScriptContext {
    interpreter: Arc<Interpreter>,
    handlers: DashMap<String, Arc<dyn Handler>>,
    filters: DashMap<String, Arc<dyn FilterHandler>>,
    requests: Arc<RequestCache>,
    config: Arc<BridgeConfig>,
}

impl ScriptContext {
    pub fn new(config: BridgeConfig, host: Arc<dyn HostServices>) -> Self {
        let config = Arc::new(config);
        let interpreter = Arc::new(Interpreter::new(config.interpreter.clone()));
        let requests = RequestCache::new(interpreter.clone(), host, config.clone());
        Self {
            interpreter,
            handlers: DashMap::new(),
            filters: DashMap::new(),
            requests,
            config,
        }
    }

    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interpreter
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Register a handler object under `name`, replacing any previous one
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        debug!(handler = %name, "registering handler");
        self.handlers.insert(name, handler);
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&RequestObject, &mut InterpreterGuard<'_>) -> anyhow::Result<Status>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(name, Arc::new(f));
    }

    pub fn register_filter(&self, name: impl Into<String>, filter: Arc<dyn FilterHandler>) {
        let name = name.into();
        debug!(filter = %name, "registering filter");
        self.filters.insert(name, filter);
    }

    pub fn register_filter_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&FilterObject, &mut InterpreterGuard<'_>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register_filter(name, Arc::new(f));
    }

    /// The one wrapper for `native`
    pub fn request_object(&self, native: &PoolRef<NativeRequest>) -> BridgeResult<RequestObject> {
        self.requests.get_or_create(native)
    }

    /// Number of live request wrappers
    pub fn cached_requests(&self) -> usize {
        self.requests.len()
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        // Cloned out so a handler may register others while it runs.
        self.handlers.get(name).map(|h| h.value().clone())
    }

    fn filter(&self, name: &str) -> BridgeResult<Arc<dyn FilterHandler>> {
        self.filters
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| BridgeError::config(format!("filter {} is not registered", name)))
    }

    /// Run the handlers configured for `phase` on `native`
    pub fn dispatch(&self, phase: Phase, native: &PoolRef<NativeRequest>) -> BridgeResult<Status> {
        let request = self.requests.get_or_create(native)?;
        let uri = request.uri()?;
        let directory = self.config.directory_for(&uri);

        let configured = directory.and_then(|d| d.handler_list(phase));
        let dynamic = request.take_dynamic_handlers(phase);
        let chain = match (configured, dynamic) {
            (Some(mut list), Some(extra)) => {
                list.extend(extra);
                list
            }
            (Some(list), None) | (None, Some(list)) => list,
            (None, None) => return Ok(Status::Declined),
        };

        debug!(request = %request.id(), %phase, handlers = chain.len(), "dispatching");
        let hlist = HandlerListObject::new(Some(chain));
        request.begin_phase(phase, hlist.clone());
        let result = {
            let mut py = self.interpreter.acquire();
            self.run_chain(&request, &hlist, &mut py)
        };
        request.end_phase();
        let mut status = result?;

        let authoritative = directory.is_none_or(|d| d.authoritative);
        if phase.is_auth() && !authoritative && status == Status::Http(StatusCode::UNAUTHORIZED) {
            debug!(%phase, "non-authoritative directory, declining 401");
            status = Status::Declined;
        }

        info!(request = %request.id(), %phase, %uri, %status, "phase finished");
        Ok(status)
    }

    fn run_chain(
        &self,
        request: &RequestObject,
        hlist: &HandlerListObject,
        py: &mut InterpreterGuard<'_>,
    ) -> BridgeResult<Status> {
        let mut status = Status::Declined;
        while let Some(entry) = hlist.current() {
            let Some(handler) = self.handler(&entry.handler) else {
                if entry.silent {
                    debug!(handler = %entry.handler, "skipping unregistered silent handler");
                    hlist.advance()?;
                    continue;
                }
                let message = format!("handler {} is not registered", entry.handler);
                error!("{}", message);
                request.log_error(&message, LogLevel::Error)?;
                return Ok(Status::Http(StatusCode::INTERNAL_SERVER_ERROR));
            };

            let outcome = handler.handle(request, py);
            // The handler may have consumed the list itself.
            if !hlist.is_empty() {
                hlist.advance()?;
            }

            match outcome {
                Ok(Status::Ok) => status = Status::Ok,
                Ok(other) => return Ok(other),
                Err(e) => {
                    let message = format!("handler {} failed: {:#}", entry.handler, e);
                    error!(request = %request.id(), "{}", message);
                    request.log_error(&message, LogLevel::Error)?;
                    return Ok(Status::Http(failure_status(&e)));
                }
            }
        }
        Ok(status)
    }

    /// Run input filter `name` for one read by the filter downstream of it
    pub fn filter_input(
        &self,
        name: &str,
        native: Option<&PoolRef<NativeRequest>>,
        ctx: &Arc<FilterContext>,
        mut chain: Box<dyn FilterChain>,
        mode: ReadMode,
        readbytes: usize,
    ) -> BridgeResult<Brigade> {
        if ctx.is_disabled() {
            return Ok(chain.get_brigade(mode, readbytes)?);
        }
        let handler = self.filter(name)?;
        let request = native.map(|n| self.requests.get_or_create(n)).transpose()?;
        let filter = FilterObject::input(name, chain, mode, readbytes, ctx.clone(), request);

        let mut py = self.interpreter.acquire();
        if let Err(e) = handler.filter(&filter, &mut py) {
            warn!(filter = %name, "input filter failed, disabling: {:#}", e);
            ctx.disable();
            return Err(BridgeError::handler(name, e));
        }
        Ok(filter.finish_input())
    }

    /// Run output filter `name` over the brigade handed to it
    pub fn filter_output(
        &self,
        name: &str,
        native: Option<&PoolRef<NativeRequest>>,
        ctx: &Arc<FilterContext>,
        mut chain: Box<dyn FilterChain>,
        bb: Brigade,
    ) -> BridgeResult<()> {
        if ctx.is_disabled() {
            return Ok(chain.pass_brigade(bb)?);
        }
        let handler = self.filter(name)?;
        let request = native.map(|n| self.requests.get_or_create(n)).transpose()?;
        let filter = FilterObject::output(name, chain, bb, ctx.clone(), request);

        let mut py = self.interpreter.acquire();
        if let Err(e) = handler.filter(&filter, &mut py) {
            warn!(filter = %name, "output filter failed, disabling: {:#}", e);
            ctx.disable();
            return Err(BridgeError::handler(name, e));
        }
        filter.finish_output(&mut py)
    }
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("interpreter", &self.interpreter)
            .field("handlers", &self.handlers.len())
            .field("filters", &self.filters.len())
            .field("cached_requests", &self.requests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use native_host::{
        Bucket, MemoryChain, MemoryTransport, NativeConnection, NativeResult, NativeServer, Pool,
        shared_transport,
    };
    use std::sync::Mutex;

    struct NoRedirect;

    impl HostServices for NoRedirect {
        fn internal_redirect(&self, _: &str, _: &PoolRef<NativeRequest>) -> NativeResult<()> {
            Ok(())
        }
    }

    fn context(config: BridgeConfig) -> ScriptContext {
        ScriptContext::new(config, Arc::new(NoRedirect))
    }

    fn native(uri: &str) -> (Pool, PoolRef<NativeRequest>) {
        let process = Pool::new("process");
        let server = NativeServer::create(&process, NativeServer::new("localhost", 80)).unwrap();
        let conn = NativeConnection::create(
            &process,
            1,
            shared_transport(MemoryTransport::new()),
            Some(server),
        )
        .unwrap();
        let req_pool = process.create_child("request").unwrap();
        let req = NativeRequest::create(&req_pool, &conn, "GET", uri).unwrap();
        (process, req)
    }

    fn recorder(ctx: &ScriptContext, names: &[&'static str], log: &Arc<Mutex<Vec<&'static str>>>) {
        for name in names {
            let log = log.clone();
            let name = *name;
            ctx.register_fn(name, move |_req, _py| {
                log.lock().unwrap().push(name);
                Ok(Status::Ok)
            });
        }
    }

    #[test]
    fn test_chain_runs_in_order_until_not_ok() {
        let config = BridgeConfig::default().with_directory(
            DirectoryConfig::new("/")
                .with_handler(Phase::Handler, "a")
                .with_handler(Phase::Handler, "stop")
                .with_handler(Phase::Handler, "never"),
        );
        let ctx = context(config);
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&ctx, &["a", "never"], &log);
        ctx.register_fn("stop", |_req, _py| Ok(Status::Done));

        let (_p, req) = native("/x");
        assert_eq!(ctx.dispatch(Phase::Handler, &req).unwrap(), Status::Done);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);

        let wrapper = ctx.request_object(&req).unwrap();
        assert_eq!(wrapper.phase(), Some(Phase::Handler));
        assert!(wrapper.hlist().is_none());
    }

    #[test]
    fn test_no_configured_handlers_declines() {
        let ctx = context(BridgeConfig::default());
        let (_p, req) = native("/x");
        assert_eq!(ctx.dispatch(Phase::FixupHandler, &req).unwrap(), Status::Declined);
    }

    #[test]
    fn test_add_handler_extends_live_and_later_phases() {
        let config = BridgeConfig::default()
            .with_directory(DirectoryConfig::new("/").with_handler(Phase::FixupHandler, "first"));
        let ctx = context(config);
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&ctx, &["second", "logger"], &log);
        let l = log.clone();
        ctx.register_fn("first", move |req, _py| {
            l.lock().unwrap().push("first");
            req.add_handler("FixupHandler", "second", None)?;
            req.add_handler("LogHandler", "logger", None)?;
            Ok(Status::Ok)
        });

        let (_p, req) = native("/x");
        assert_eq!(ctx.dispatch(Phase::FixupHandler, &req).unwrap(), Status::Ok);
        assert_eq!(ctx.dispatch(Phase::LogHandler, &req).unwrap(), Status::Ok);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "logger"]);
    }

    #[test]
    fn test_unregistered_handlers() {
        let config = BridgeConfig::default()
            .with_directory(
                DirectoryConfig::new("/quiet")
                    .with_handler(Phase::Handler, "ghost")
                    .with_handler(Phase::Handler, "real")
                    .with_silent("ghost"),
            )
            .with_directory(DirectoryConfig::new("/loud").with_handler(Phase::Handler, "ghost"));
        let ctx = context(config);
        ctx.register_fn("real", |_req, _py| Ok(Status::Ok));

        let (_p, quiet) = native("/quiet/page");
        assert_eq!(ctx.dispatch(Phase::Handler, &quiet).unwrap(), Status::Ok);
        let (_p2, loud) = native("/loud");
        assert_eq!(
            ctx.dispatch(Phase::Handler, &loud).unwrap(),
            Status::Http(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }

    #[test]
    fn test_handler_errors_map_to_status() {
        let config = BridgeConfig::default()
            .with_directory(DirectoryConfig::new("/boom").with_handler(Phase::Handler, "boom"))
            .with_directory(DirectoryConfig::new("/body").with_handler(Phase::Handler, "body"));
        let ctx = context(config);
        ctx.register_fn("boom", |_req, _py| Err(anyhow::anyhow!("kaput")));
        ctx.register_fn("body", |_req, _py| {
            Err(BridgeError::Native(native_host::NativeError::LengthRequired).into())
        });

        let (_p, boom) = native("/boom");
        assert_eq!(
            ctx.dispatch(Phase::Handler, &boom).unwrap(),
            Status::Http(StatusCode::INTERNAL_SERVER_ERROR)
        );
        let (_p2, body) = native("/body");
        assert_eq!(
            ctx.dispatch(Phase::Handler, &body).unwrap(),
            Status::Http(StatusCode::LENGTH_REQUIRED)
        );
    }

    #[test]
    fn test_non_authoritative_401_declines() {
        let config = BridgeConfig::default()
            .with_directory(
                DirectoryConfig::new("/soft")
                    .with_handler(Phase::AuthenHandler, "deny")
                    .with_handler(Phase::Handler, "deny")
                    .with_authoritative(false),
            )
            .with_directory(DirectoryConfig::new("/hard").with_handler(Phase::AuthenHandler, "deny"));
        let ctx = context(config);
        ctx.register_fn("deny", |_req, _py| Ok(Status::Http(StatusCode::UNAUTHORIZED)));

        let (_p, soft) = native("/soft");
        assert_eq!(ctx.dispatch(Phase::AuthenHandler, &soft).unwrap(), Status::Declined);
        // Only the authentication phases are downgraded.
        assert_eq!(
            ctx.dispatch(Phase::Handler, &soft).unwrap(),
            Status::Http(StatusCode::UNAUTHORIZED)
        );
        let (_p2, hard) = native("/hard");
        assert_eq!(
            ctx.dispatch(Phase::AuthenHandler, &hard).unwrap(),
            Status::Http(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn test_output_filter_rewrites_and_passes_leftovers() {
        let ctx = context(BridgeConfig::default());
        ctx.register_filter_fn("upper", |f, py| {
            while let Some(data) = f.read(py, None)? {
                if data.is_empty() {
                    break;
                }
                f.write(data.to_ascii_uppercase())?;
            }
            Ok(())
        });

        let chain = MemoryChain::new();
        let fctx = FilterContext::new("upper");
        let bb = Brigade::from_bytes("quiet words");
        ctx.filter_output("upper", None, &fctx, Box::new(chain.clone()), bb)
            .unwrap();
        assert_eq!(chain.passed_bytes(), "QUIET WORDS");
    }

    #[test]
    fn test_failing_filter_is_disabled() {
        let ctx = context(BridgeConfig::default());
        ctx.register_filter_fn("broken", |_f, _py| Err(anyhow::anyhow!("nope")));

        let fctx = FilterContext::new("broken");
        let chain = MemoryChain::with_input(["raw"]);
        let err = ctx
            .filter_input("broken", None, &fctx, Box::new(chain.clone()), ReadMode::Bytes, 8192)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Handler { .. }));
        assert!(fctx.is_disabled());

        // Later invocations pass data straight through.
        let bb = ctx
            .filter_input("broken", None, &fctx, Box::new(chain), ReadMode::Bytes, 8192)
            .unwrap();
        assert_eq!(bb.to_bytes(), "raw");
    }

    #[test]
    fn test_input_filter_output_goes_to_reader() {
        let ctx = context(BridgeConfig::default());
        ctx.register_filter_fn("strip", |f, py| {
            if let Some(line) = f.readline(py, None)? {
                f.write(line.trim_ascii())?;
            }
            f.close(py)?;
            Ok(())
        });

        let fctx = FilterContext::new("strip");
        let chain = MemoryChain::with_input(["  padded  \nrest"]);
        let bb = ctx
            .filter_input("strip", None, &fctx, Box::new(chain), ReadMode::GetLine, 8192)
            .unwrap();
        assert_eq!(bb.to_bytes(), "padded");
        assert!(bb.contains_eos());
        assert!(matches!(bb.front(), Some(Bucket::Data(_))));
    }

    #[test]
    fn test_unknown_filter_is_config_error() {
        let ctx = context(BridgeConfig::default());
        let fctx = FilterContext::new("missing");
        let err = ctx
            .filter_output("missing", None, &fctx, Box::new(MemoryChain::new()), Brigade::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }
}
