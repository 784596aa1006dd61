use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::value::Value;

/// Why an invocation frame was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReason {
    Main,
    Spawn,
    Run,
    HttpRoute,
    Require,
    Include,
}

impl FrameReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameReason::Main => "main",
            FrameReason::Spawn => "spawn",
            FrameReason::Run => "run",
            FrameReason::HttpRoute => "http_route",
            FrameReason::Require => "require",
            FrameReason::Include => "include",
        }
    }
}

/// Per-call invocation record forming a linked stack. The frame registered
/// for the current thread drives relative path resolution for `load`/`save`
/// and module lookup, and error stack reporting.
#[derive(Debug)]
pub struct Frame {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub reason: FrameReason,
    pub details: String,
    pub parent: Option<Arc<Frame>>,
}

impl Frame {
    pub fn new(
        file: impl Into<PathBuf>,
        reason: FrameReason,
        details: impl Into<String>,
        parent: Option<Arc<Frame>>,
    ) -> Arc<Frame> {
        Frame::at(file, 0, 0, reason, details, parent)
    }

    /// Frame recording the call site that created it.
    pub fn at(
        file: impl Into<PathBuf>,
        line: u32,
        column: u32,
        reason: FrameReason,
        details: impl Into<String>,
        parent: Option<Arc<Frame>>,
    ) -> Arc<Frame> {
        Arc::new(Frame {
            file: file.into(),
            line,
            column,
            reason,
            details: details.into(),
            parent,
        })
    }

    /// Directory the frame's script lives in; the base for relative paths.
    pub fn dir(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new("."))
    }

    fn describe(&self) -> String {
        format!("{} {}", self.reason.as_str(), self.file.display())
    }
}

/// Zero-arg callable yielding the caller-supplied data exposed through the
/// `context()` intrinsic.
pub type ContextGetter = Arc<dyn Fn() -> Value + Send + Sync>;

/// Per-request / per-worker execution context. For spawn and run workers the
/// HTTP half stays empty; for handler workers it carries the request data and
/// response bookkeeping.
pub struct RequestContext {
    /// Caller-supplied data, already deep-copied across the isolation
    /// boundary.
    pub data: Value,
    pub params: HashMap<String, String>,
    pub jwt_claims: Option<Value>,
    pub jwt_secret: Option<String>,
    pub request: Option<Arc<crate::http::request::RequestData>>,
    pub frame: Arc<Frame>,
    closed: AtomicBool,
}

impl RequestContext {
    pub fn new(data: Value, frame: Arc<Frame>) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            data,
            params: HashMap::new(),
            jwt_claims: None,
            jwt_secret: None,
            request: None,
            frame,
            closed: AtomicBool::new(false),
        })
    }

    /// Context for an HTTP handler worker, carrying the parsed request,
    /// extracted path parameters and verified claims.
    pub fn for_request(
        frame: Arc<Frame>,
        params: HashMap<String, String>,
        jwt_claims: Option<Value>,
        jwt_secret: Option<String>,
        request: Arc<crate::http::request::RequestData>,
    ) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            data: Value::Nil,
            params,
            jwt_claims,
            jwt_secret,
            request: Some(request),
            frame,
            closed: AtomicBool::new(false),
        })
    }

    /// Mark the context responded. At most one response is written per
    /// context; the second attempt fails.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::context_closed("response already written"));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

static FRAMES: Lazy<RwLock<HashMap<ThreadId, Arc<Frame>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static CONTEXTS: Lazy<RwLock<HashMap<ThreadId, Arc<RequestContext>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static GETTERS: Lazy<RwLock<HashMap<ThreadId, ContextGetter>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn current_frame() -> Option<Arc<Frame>> {
    FRAMES.read().get(&thread::current().id()).cloned()
}

pub fn current_context() -> Option<Arc<RequestContext>> {
    CONTEXTS.read().get(&thread::current().id()).cloned()
}

/// The value `context()` returns on this thread: whatever the registered
/// getter yields, `nil` when nothing is registered.
pub fn current_context_data() -> Value {
    let getter = GETTERS.read().get(&thread::current().id()).cloned();
    match getter {
        Some(getter) => getter(),
        None => Value::Nil,
    }
}

/// The current thread's context and getter pair, for handing down to
/// `parallel` branches.
pub fn current_registration() -> Option<(Arc<RequestContext>, ContextGetter)> {
    let thread = thread::current().id();
    let ctx = CONTEXTS.read().get(&thread).cloned()?;
    let getter = GETTERS.read().get(&thread).cloned()?;
    Some((ctx, getter))
}

/// Invocation stack of the current thread, innermost frame first.
pub fn capture_stack() -> Vec<String> {
    let mut out = Vec::new();
    let mut frame = current_frame();
    while let Some(f) = frame {
        out.push(f.describe());
        frame = f.parent.clone();
    }
    out
}

/// Install `frame` as the current thread's frame. The returned guard restores
/// the previous frame when dropped, so nesting (require inside a handler
/// inside a spawn) unwinds correctly.
pub fn push_frame(frame: Arc<Frame>) -> FrameGuard {
    let thread = thread::current().id();
    let prev = FRAMES.write().insert(thread, frame);
    FrameGuard {
        thread,
        prev,
        _not_send: PhantomData,
    }
}

pub struct FrameGuard {
    thread: ThreadId,
    prev: Option<Arc<Frame>>,
    // guards must be dropped on the thread that created them
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut frames = FRAMES.write();
        match self.prev.take() {
            Some(prev) => {
                frames.insert(self.thread, prev);
            }
            None => {
                frames.remove(&self.thread);
            }
        }
    }
}

/// Register the worker's context and getter under the current thread's id.
/// Cleared when the guard drops, which is guaranteed on worker exit.
pub fn register_context(ctx: Arc<RequestContext>, getter: ContextGetter) -> ContextGuard {
    let thread = thread::current().id();
    let prev_ctx = CONTEXTS.write().insert(thread, ctx);
    let prev_getter = GETTERS.write().insert(thread, getter);
    ContextGuard {
        thread,
        prev_ctx,
        prev_getter,
        _not_send: PhantomData,
    }
}

pub struct ContextGuard {
    thread: ThreadId,
    prev_ctx: Option<Arc<RequestContext>>,
    prev_getter: Option<ContextGetter>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let mut contexts = CONTEXTS.write();
        match self.prev_ctx.take() {
            Some(prev) => {
                contexts.insert(self.thread, prev);
            }
            None => {
                contexts.remove(&self.thread);
            }
        }
        drop(contexts);
        let mut getters = GETTERS.write();
        match self.prev_getter.take() {
            Some(prev) => {
                getters.insert(self.thread, prev);
            }
            None => {
                getters.remove(&self.thread);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_guard_restores_previous() {
        let outer = Frame::new("/app/main.du", FrameReason::Main, "", None);
        let g1 = push_frame(outer.clone());
        {
            let inner = Frame::new(
                "/app/mod.du",
                FrameReason::Require,
                "",
                Some(outer.clone()),
            );
            let _g2 = push_frame(inner);
            assert_eq!(
                current_frame().unwrap().file,
                PathBuf::from("/app/mod.du")
            );
            assert_eq!(capture_stack().len(), 2);
        }
        assert_eq!(
            current_frame().unwrap().file,
            PathBuf::from("/app/main.du")
        );
        drop(g1);
        assert!(current_frame().is_none());
    }

    #[test]
    fn context_guard_clears_on_drop() {
        let frame = Frame::new("/x.du", FrameReason::Spawn, "", None);
        let ctx = RequestContext::new(Value::Num(1.0), frame);
        let data = ctx.data.clone();
        {
            let _g = register_context(ctx, Arc::new(move || data.clone()));
            assert_eq!(current_context_data(), Value::Num(1.0));
            assert!(current_context().is_some());
        }
        assert!(current_context().is_none());
        assert!(current_context_data().is_nil());
    }

    #[test]
    fn close_is_exactly_once() {
        let frame = Frame::new("/x.du", FrameReason::HttpRoute, "", None);
        let ctx = RequestContext::new(Value::Nil, frame);
        ctx.close().unwrap();
        let err = ctx.close().unwrap_err();
        assert_eq!(err.kind_str(), "context_closed");
    }

    #[test]
    fn contexts_are_per_thread() {
        let frame = Frame::new("/x.du", FrameReason::Spawn, "", None);
        let ctx = RequestContext::new(Value::Num(7.0), frame);
        let data = ctx.data.clone();
        let _g = register_context(ctx, Arc::new(move || data.clone()));

        let other = std::thread::spawn(|| current_context_data().is_nil())
            .join()
            .unwrap();
        assert!(other);
        assert_eq!(current_context_data(), Value::Num(7.0));
    }
}
