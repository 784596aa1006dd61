use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::Mutex;

use crate::ast::Program;
use crate::context::{self, Frame, FrameReason};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::eval::{Evaluator, Flow};
use crate::interpreter::Interpreter;
use crate::parser;
use crate::store::{registry, StoreConfig, VFS_NAMESPACE};
use crate::value::Value;

/// Virtual prefix backed by the `vfs` datastore namespace.
pub const STORE_PREFIX: &str = "/STORE/";

/// Virtual prefix backed by compile-time embedded assets.
pub const EMBED_PREFIX: &str = "/EMBED/";

const AST_CACHE_SIZE: usize = 256;

struct CachedAst {
    program: Arc<Program>,
    mtime: Option<SystemTime>,
}

/// Script and module loading: resolution waterfall, mtime-revalidated AST
/// cache and the per-interpreter `require` export cache.
pub struct ModuleLoader {
    ast_cache: Mutex<LruCache<PathBuf, CachedAst, ahash::RandomState>>,
    exports: Mutex<HashMap<PathBuf, Value>>,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader {
    pub fn new() -> Self {
        let cache = LruCache::with_hasher(
            NonZeroUsize::new(AST_CACHE_SIZE).unwrap(),
            ahash::RandomState::default(),
        );
        ModuleLoader {
            ast_cache: Mutex::new(cache),
            exports: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `spec` through the waterfall and return the parsed program of
    /// the first candidate that loads. Parse failures are real errors, not a
    /// reason to fall through.
    pub fn resolve_and_parse(
        &self,
        interp: &Interpreter,
        spec: &str,
    ) -> Result<(PathBuf, Arc<Program>)> {
        let candidates = candidates(interp, spec);
        for candidate in &candidates {
            if let Some(program) = self.cached(interp, candidate) {
                return Ok((candidate.clone(), program));
            }
            match load_script_bytes(interp, candidate) {
                Ok(bytes) => {
                    let source = String::from_utf8_lossy(&bytes);
                    let program = Arc::new(
                        parser::parse(&source).map_err(|e| e.with_file(candidate.clone()))?,
                    );
                    let mtime = mtime_of(interp, candidate);
                    self.ast_cache.lock().put(
                        candidate.clone(),
                        CachedAst {
                            program: program.clone(),
                            mtime,
                        },
                    );
                    return Ok((candidate.clone(), program));
                }
                Err(_) => continue,
            }
        }
        Err(Error::not_found(format!(
            "module '{spec}' not found (searched {})",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Cache hit revalidated against the file's current mtime; a newer file
    /// on disk discards the entry so edits take effect without restart.
    fn cached(&self, interp: &Interpreter, path: &PathBuf) -> Option<Arc<Program>> {
        let mut cache = self.ast_cache.lock();
        let (program, cached_mtime) = {
            let entry = cache.get(path)?;
            (entry.program.clone(), entry.mtime)
        };
        if !is_virtual(path) {
            if let (Some(cached), Some(current)) = (cached_mtime, mtime_of(interp, path)) {
                if current > cached {
                    cache.pop(path);
                    return None;
                }
            }
        }
        Some(program)
    }

    pub fn cached_export(&self, path: &Path) -> Option<Value> {
        self.exports.lock().get(path).cloned()
    }

    pub fn store_export(&self, path: PathBuf, value: Value) {
        self.exports.lock().insert(path, value);
    }
}

fn mtime_of(interp: &Interpreter, path: &Path) -> Option<SystemTime> {
    if is_virtual(path) {
        return None;
    }
    interp.caps().stat_mtime(path)
}

fn is_virtual(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(STORE_PREFIX) || s.starts_with(EMBED_PREFIX)
}

/// The resolution waterfall: absolute and virtual paths are taken as-is;
/// anything else is tried against the caller frame's directory, the
/// interpreter's script directory, `/STORE/` and `/EMBED/`, in that order.
fn candidates(interp: &Interpreter, spec: &str) -> Vec<PathBuf> {
    let path = Path::new(spec);
    if path.is_absolute() || spec.starts_with(STORE_PREFIX) || spec.starts_with(EMBED_PREFIX) {
        return vec![path.to_path_buf()];
    }
    let mut out = Vec::with_capacity(4);
    if let Some(frame) = context::current_frame() {
        out.push(frame.dir().join(spec));
    }
    out.push(interp.config().script_dir.join(spec));
    out.push(PathBuf::from(format!("{STORE_PREFIX}{spec}")));
    out.push(PathBuf::from(format!("{EMBED_PREFIX}{spec}")));
    out.dedup();
    out
}

/// Read raw bytes for a resolved path through the matching backend.
fn read_backend(
    interp: &Interpreter,
    path: &Path,
    fs_read: impl FnOnce(&Path) -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    let text = path.to_string_lossy();
    if let Some(key) = text.strip_prefix(STORE_PREFIX) {
        let store = registry().obtain(VFS_NAMESPACE, StoreConfig::default());
        return match store.get(key) {
            Value::Str(s) => Ok(s.into_bytes()),
            Value::Nil => Err(Error::not_found(format!("{STORE_PREFIX}{key}"))),
            other => Err(Error::type_error(format!(
                "{STORE_PREFIX}{key} holds a {} value",
                other.type_name()
            ))),
        };
    }
    if let Some(key) = text.strip_prefix(EMBED_PREFIX) {
        let dir = interp
            .config()
            .embed
            .ok_or_else(|| Error::not_found("no embedded assets compiled in"))?;
        return dir
            .get_file(key)
            .map(|f| f.contents().to_vec())
            .ok_or_else(|| Error::not_found(format!("{EMBED_PREFIX}{key}")));
    }
    fs_read(path)
}

fn load_script_bytes(interp: &Interpreter, path: &Path) -> Result<Vec<u8>> {
    read_backend(interp, path, |p| interp.caps().load_script(p))
}

/// Resolve + read used by the `load` intrinsic and file responses.
pub fn read_file(interp: &Interpreter, spec: &str) -> Result<(PathBuf, Vec<u8>)> {
    let candidates = candidates(interp, spec);
    for candidate in &candidates {
        if let Ok(bytes) = read_backend(interp, candidate, |p| interp.caps().read_file(p)) {
            return Ok((candidate.clone(), bytes));
        }
    }
    Err(Error::not_found(format!(
        "file '{spec}' not found (searched {})",
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Resolve + write used by the `save` intrinsic. Writes resolve against the
/// caller frame's directory (no search), `/STORE/` writes to the vfs
/// namespace, `/EMBED/` is read-only.
pub fn write_file(interp: &Interpreter, spec: &str, content: &[u8]) -> Result<()> {
    let path = if Path::new(spec).is_absolute()
        || spec.starts_with(STORE_PREFIX)
        || spec.starts_with(EMBED_PREFIX)
    {
        PathBuf::from(spec)
    } else if let Some(frame) = context::current_frame() {
        frame.dir().join(spec)
    } else {
        interp.config().script_dir.join(spec)
    };
    let text = path.to_string_lossy();
    if let Some(key) = text.strip_prefix(STORE_PREFIX) {
        let store = registry().obtain(VFS_NAMESPACE, StoreConfig::default());
        let value = Value::Str(String::from_utf8_lossy(content).into_owned());
        return store.set(key, &value);
    }
    if text.starts_with(EMBED_PREFIX) {
        return Err(Error::permission_denied("embedded assets are read-only"));
    }
    interp.caps().write_file(&path, content)
}

// Per-thread stack of currently-loading module paths.
thread_local! {
    static LOADING: RefCell<Vec<PathBuf>> = const { RefCell::new(Vec::new()) };
}

struct CycleGuard;

impl Drop for CycleGuard {
    fn drop(&mut self) {
        LOADING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn enter_loading(path: &Path) -> Result<CycleGuard> {
    LOADING.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.iter().any(|p| p == path) {
            let chain = stack
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::circular_dependency(format!(
                "{chain} -> {}",
                path.display()
            )));
        }
        stack.push(path.to_path_buf());
        Ok(CycleGuard)
    })
}

/// `require`: execute the module body once in a fresh, isolated scope and
/// cache its final-expression value per interpreter.
pub fn require(eval: &mut Evaluator, spec: &str) -> Flow {
    let interp = eval.interp().clone();
    let (path, program) = interp.loader().resolve_and_parse(&interp, spec)?;
    if let Some(value) = interp.loader().cached_export(&path) {
        return Ok(value);
    }
    let _cycle = enter_loading(&path)?;
    let frame = Frame::new(
        path.clone(),
        FrameReason::Require,
        spec,
        context::current_frame(),
    );
    let _frame = context::push_frame(frame);
    let env = interp.root_env();
    let value = eval.run_program(&program, &env)?;
    interp.loader().store_export(path, value.clone());
    Ok(value)
}

/// `include`: execute in the caller's scope, no export cache; the AST cache
/// still applies.
pub fn include(eval: &mut Evaluator, spec: &str, env: &Env) -> Flow {
    let interp = eval.interp().clone();
    let (path, program) = interp.loader().resolve_and_parse(&interp, spec)?;
    let _cycle = enter_loading(&path)?;
    let frame = Frame::new(
        path.clone(),
        FrameReason::Include,
        spec,
        context::current_frame(),
    );
    let _frame = context::push_frame(frame);
    Ok(eval.run_program(&program, env)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::config::Config;

    fn interp_with(sources: Vec<(&str, &str)>) -> Interpreter {
        let sources = sources
            .into_iter()
            .map(|(p, s)| (PathBuf::from(p), s.to_string()))
            .collect();
        Interpreter::new(
            Config {
                script_dir: PathBuf::from("/app"),
                ..Config::default()
            },
            Capabilities::from_sources(sources),
        )
    }

    #[test]
    fn waterfall_prefers_script_dir_over_virtual() {
        let interp = interp_with(vec![("/app/mod.du", "41 + 1")]);
        let (path, program) = interp
            .loader()
            .resolve_and_parse(&interp, "mod.du")
            .unwrap();
        assert_eq!(path, PathBuf::from("/app/mod.du"));
        assert_eq!(program.body.len(), 1);
    }

    #[test]
    fn missing_module_lists_searched_paths() {
        let interp = interp_with(vec![]);
        let err = interp
            .loader()
            .resolve_and_parse(&interp, "nope.du")
            .unwrap_err();
        assert_eq!(err.kind_str(), "not_found");
        assert!(err.to_string().contains("/app/nope.du"));
        assert!(err.to_string().contains("/STORE/nope.du"));
    }

    #[test]
    fn store_prefix_reads_vfs_namespace() {
        let interp = interp_with(vec![]);
        registry()
            .obtain(VFS_NAMESPACE, StoreConfig::default())
            .set("lib/answer.du", &Value::Str("42".into()))
            .unwrap();
        let (path, _) = interp
            .loader()
            .resolve_and_parse(&interp, "/STORE/lib/answer.du")
            .unwrap();
        assert_eq!(path, PathBuf::from("/STORE/lib/answer.du"));
    }

    #[test]
    fn parse_failure_is_not_swallowed() {
        let interp = interp_with(vec![("/app/bad.du", "if x")]);
        let err = interp
            .loader()
            .resolve_and_parse(&interp, "bad.du")
            .unwrap_err();
        assert_eq!(err.kind_str(), "parse");
    }

    #[test]
    fn require_caches_export_and_side_effects() {
        let interp = interp_with(vec![(
            "/app/mod.du",
            "datastore(\"test-require-fx\").increment(\"loads\", 1)\n{answer: 42}",
        )]);
        let mut eval = Evaluator::new(interp.clone());

        let first = require(&mut eval, "mod.du").map_err(|_| ()).unwrap();
        let second = require(&mut eval, "mod.du").map_err(|_| ()).unwrap();

        // same shared value, not a re-execution
        assert_eq!(first, second);
        let store = registry().obtain("test-require-fx", StoreConfig::default());
        assert_eq!(store.get("loads"), Value::Num(1.0));
    }

    #[test]
    fn require_cycle_is_detected() {
        let interp = interp_with(vec![
            ("/app/a.du", "require(\"b.du\")"),
            ("/app/b.du", "require(\"a.du\")"),
        ]);
        let mut eval = Evaluator::new(interp);
        let err = match require(&mut eval, "a.du") {
            Err(crate::eval::Signal::Error(e)) => e,
            _ => panic!("expected circular dependency error"),
        };
        assert_eq!(err.kind_str(), "circular_dependency");
    }

    #[test]
    fn include_runs_in_caller_scope() {
        let interp = interp_with(vec![("/app/inc.du", "shared = shared + 1")]);
        let mut eval = Evaluator::new(interp.clone());
        let env = interp.root_env();
        env.define("shared", Value::Num(1.0));
        include(&mut eval, "inc.du", &env).map_err(|_| ()).unwrap();
        include(&mut eval, "inc.du", &env).map_err(|_| ()).unwrap();
        assert_eq!(env.get("shared"), Some(Value::Num(3.0)));
    }
}
