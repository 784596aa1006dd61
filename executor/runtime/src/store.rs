use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::metrics;
use crate::value::Value;

/// Namespace backing the `/STORE/` virtual file prefix.
pub const VFS_NAMESPACE: &str = "vfs";

/// Reserved read-only namespace exposing process metrics.
pub const SYS_NAMESPACE: &str = "sys";

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    stores: Mutex::new(HashMap::new()),
});

/// The process-wide store registry.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub struct Registry {
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

impl Registry {
    /// Return the namespace's store, creating it on first use. The
    /// configuration only applies at creation; later callers share the
    /// existing store unchanged.
    pub fn obtain(&self, namespace: &str, config: StoreConfig) -> Arc<Store> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(namespace) {
            return store.clone();
        }
        let store = Store::create(namespace, config);
        stores.insert(namespace.to_string(), store.clone());
        store
    }

    pub fn names(&self) -> Vec<String> {
        self.stores.lock().keys().cloned().collect()
    }

    /// Stop every auto-save task and write a final snapshot of each
    /// persistent store.
    pub fn shutdown(&self) {
        let stores: Vec<Arc<Store>> = self.stores.lock().values().cloned().collect();
        for store in stores {
            store.shutdown();
        }
    }
}

/// Persistence configuration, applied at first `obtain` of a namespace.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub persist: Option<PathBuf>,
    pub persist_interval: Option<Duration>,
}

struct StoreInner {
    data: HashMap<String, Value>,
    /// Bumped on every successful mutation; waiters key their re-checks on it.
    version: u64,
    dirty: bool,
}

struct PersistState {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A namespaced store. One monitor (mutex + condvar) per namespace
/// establishes a total order on the mutations a waiter can observe.
pub struct Store {
    name: String,
    inner: Mutex<StoreInner>,
    cond: Condvar,
    persist: Option<PersistState>,
    read_only: bool,
}

impl Store {
    fn create(namespace: &str, config: StoreConfig) -> Arc<Store> {
        let read_only = namespace == SYS_NAMESPACE;
        let store = Arc::new(Store {
            name: namespace.to_string(),
            inner: Mutex::new(StoreInner {
                data: HashMap::new(),
                version: 0,
                dirty: false,
            }),
            cond: Condvar::new(),
            persist: config.persist.clone().map(|path| PersistState {
                path,
                stop: Arc::new(AtomicBool::new(false)),
                task: Mutex::new(None),
            }),
            read_only,
        });

        if let Some(persist) = &store.persist {
            // restore an existing snapshot before anyone reads
            if let Err(e) = store.load() {
                info!("store '{namespace}': no snapshot restored ({e})");
            }
            if let Some(interval) = config.persist_interval {
                let handle = spawn_autosave(store.clone(), interval, persist.stop.clone());
                *persist.task.lock() = Some(handle);
            }
        }
        store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn deny_if_read_only(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::permission_denied(format!(
                "namespace '{}' is read-only",
                self.name
            )));
        }
        Ok(())
    }

    /// Run a mutation under the monitor: bump the version, mark dirty and
    /// wake every waiter. Failed mutations leave the version untouched.
    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<String, Value>) -> Result<R>) -> Result<R> {
        self.deny_if_read_only()?;
        let mut inner = self.inner.lock();
        let result = f(&mut inner.data)?;
        inner.version = inner.version.wrapping_add(1);
        inner.dirty = true;
        self.cond.notify_all();
        Ok(result)
    }

    /// Deep copy of the stored value, `nil` if absent.
    pub fn get(&self, key: &str) -> Value {
        if self.read_only {
            return self.sys_view().remove(key).unwrap_or(Value::Nil);
        }
        let inner = self.inner.lock();
        inner
            .data
            .get(key)
            .map(Value::deep_copy)
            .unwrap_or(Value::Nil)
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.mutate(|data| {
            data.insert(key.to_string(), value.deep_copy());
            Ok(())
        })
    }

    /// Store only if the key is absent; true iff the value was written.
    pub fn set_once(&self, key: &str, value: &Value) -> Result<bool> {
        self.mutate(|data| {
            if data.contains_key(key) {
                return Ok(false);
            }
            data.insert(key.to_string(), value.deep_copy());
            Ok(true)
        })
    }

    /// Atomic exchange; returns the previous value (`nil` if absent).
    pub fn swap(&self, key: &str, value: &Value) -> Result<Value> {
        self.mutate(|data| {
            let old = data.insert(key.to_string(), value.deep_copy());
            Ok(old.unwrap_or(Value::Nil))
        })
    }

    /// Add `delta` to a numeric key, treating an absent key as 0.
    pub fn increment(&self, key: &str, delta: f64) -> Result<f64> {
        self.mutate(|data| {
            let current = match data.get(key) {
                None | Some(Value::Nil) => 0.0,
                Some(Value::Num(n)) => *n,
                Some(other) => {
                    return Err(Error::type_error(format!(
                        "cannot increment {} value at '{key}'",
                        other.type_name()
                    )))
                }
            };
            let next = current + delta;
            data.insert(key.to_string(), Value::Num(next));
            Ok(next)
        })
    }

    /// Append to an array key, treating an absent key as an empty array.
    /// Returns the new length.
    pub fn push(&self, key: &str, item: &Value) -> Result<usize> {
        self.list_edit(key, |items, item| {
            items.push(item);
            items.len()
        }, item)
    }

    /// Prepend to an array key; same typing rules as push.
    pub fn unshift(&self, key: &str, item: &Value) -> Result<usize> {
        self.list_edit(key, |items, item| {
            items.insert(0, item);
            items.len()
        }, item)
    }

    fn list_edit(
        &self,
        key: &str,
        edit: impl FnOnce(&mut Vec<Value>, Value) -> usize,
        item: &Value,
    ) -> Result<usize> {
        self.mutate(|data| {
            let entry = data
                .entry(key.to_string())
                .or_insert_with(|| Value::array(Vec::new()));
            let arr = entry.as_array().ok_or_else(|| {
                Error::type_error(format!(
                    "cannot push onto {} value at '{key}'",
                    entry.type_name()
                ))
            })?;
            let mut items = arr.lock();
            Ok(edit(&mut items, item.deep_copy()))
        })
    }

    /// Remove and return the last element (`nil` when empty or absent).
    pub fn pop(&self, key: &str) -> Result<Value> {
        self.list_remove(key, |items| items.pop())
    }

    /// Remove and return the first element (`nil` when empty or absent).
    pub fn shift(&self, key: &str) -> Result<Value> {
        self.list_remove(key, |items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        })
    }

    fn list_remove(
        &self,
        key: &str,
        remove: impl FnOnce(&mut Vec<Value>) -> Option<Value>,
    ) -> Result<Value> {
        self.mutate(|data| {
            let Some(entry) = data.get(key) else {
                return Ok(Value::Nil);
            };
            let arr = entry.as_array().ok_or_else(|| {
                Error::type_error(format!(
                    "cannot pop from {} value at '{key}'",
                    entry.type_name()
                ))
            })?;
            let mut items = arr.lock();
            Ok(remove(&mut items).unwrap_or(Value::Nil))
        })
    }

    pub fn exists(&self, key: &str) -> bool {
        if self.read_only {
            return self.sys_view().contains_key(key);
        }
        self.inner.lock().data.contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(|data| Ok(data.remove(key).is_some()))
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(|data| {
            data.clear();
            Ok(())
        })
    }

    /// Rename a key; fails if `old` is absent or `new` already present.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.mutate(|data| {
            if data.contains_key(new) {
                return Err(Error::msg(format!("key '{new}' already exists")));
            }
            match data.remove(old) {
                Some(value) => {
                    data.insert(new.to_string(), value);
                    Ok(())
                }
                None => Err(Error::not_found(format!("key '{old}'"))),
            }
        })
    }

    /// Key list, stable within one call; ordering across calls unspecified.
    pub fn keys(&self) -> Vec<String> {
        if self.read_only {
            return self.sys_view().keys().cloned().collect();
        }
        self.inner.lock().data.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Waiting

    /// Block until the key's value changes from its value at entry (or its
    /// absence changes). When `expected` is given, block until the stored
    /// value structurally equals `expected`, returning immediately if it
    /// already does. A `timeout` of `None` waits forever.
    pub fn wait(
        &self,
        key: &str,
        expected: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock();
        let entry = inner.data.get(key).cloned();
        loop {
            let current = inner.data.get(key);
            let satisfied = match expected {
                Some(expected) => current.map_or(false, |v| v == expected),
                None => match (&entry, current) {
                    (None, None) => false,
                    (Some(before), Some(now)) => before != now,
                    _ => true,
                },
            };
            if satisfied {
                return Ok(current.map(Value::deep_copy).unwrap_or(Value::Nil));
            }
            self.block(&mut inner, deadline)?;
        }
    }

    /// Re-evaluate `predicate` over a deep-copied snapshot of the key on
    /// every broadcast; return the snapshot once it is truthy. The predicate
    /// runs with the monitor released (it may read the datastore itself);
    /// the store version is re-checked under the lock before returning, and
    /// a version advance during predicate evaluation re-enters the loop.
    pub fn wait_for<F>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        mut predicate: F,
    ) -> Result<Value>
    where
        F: FnMut(Value) -> Result<bool>,
    {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let (snapshot, version) = {
                let inner = self.inner.lock();
                (
                    inner.data.get(key).map(Value::deep_copy).unwrap_or(Value::Nil),
                    inner.version,
                )
            };
            if predicate(snapshot.clone())? {
                let inner = self.inner.lock();
                if inner.version == version {
                    return Ok(snapshot);
                }
                continue;
            }
            let mut inner = self.inner.lock();
            if inner.version != version {
                continue;
            }
            self.block(&mut inner, deadline)?;
        }
    }

    fn block(
        &self,
        inner: &mut parking_lot::MutexGuard<'_, StoreInner>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => {
                if self.cond.wait_until(inner, deadline).timed_out() {
                    return Err(Error::timeout(format!(
                        "wait on store '{}' timed out",
                        self.name
                    )));
                }
            }
            None => self.cond.wait(inner),
        }
        Ok(())
    }

    // --- Persistence

    fn persist_path(&self) -> Result<&PathBuf> {
        self.persist
            .as_ref()
            .map(|p| &p.path)
            .ok_or_else(|| Error::io(format!("store '{}' has no persistence path", self.name)))
    }

    /// Serialize a snapshot to the configured path. The write is atomic:
    /// temp file in the same directory, then rename.
    pub fn save(&self) -> Result<()> {
        let path = self.persist_path()?;
        let json = {
            let mut inner = self.inner.lock();
            inner.dirty = false;
            let map: serde_json::Map<String, serde_json::Value> = inner
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            serde_json::to_string(&serde_json::Value::Object(map))?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json.as_bytes())
            .map_err(|e| Error::io(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::io(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Replace the in-memory map with the snapshot at the configured path
    /// and wake every waiter.
    pub fn load(&self) -> Result<()> {
        self.deny_if_read_only()?;
        let path = self.persist_path()?;
        let bytes =
            std::fs::read(path).map_err(|e| Error::io(format!("{}: {e}", path.display())))?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)?;
        let serde_json::Value::Object(map) = json else {
            return Err(Error::parse("snapshot is not a JSON object", 0, 0));
        };
        let data: HashMap<String, Value> = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        let mut inner = self.inner.lock();
        inner.data = data;
        inner.version = inner.version.wrapping_add(1);
        inner.dirty = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Cancel the auto-save task and save once more.
    pub fn shutdown(&self) {
        let Some(persist) = &self.persist else {
            return;
        };
        persist.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = persist.task.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Err(e) = self.save() {
            error!("store '{}': final save failed - {e}", self.name);
        }
    }

    fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Metrics snapshot behind the `sys` namespace.
    fn sys_view(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "uptime_seconds".to_string(),
            Value::Num(metrics::uptime_seconds()),
        );
        map.insert(
            "spawn_procs".to_string(),
            Value::Num(metrics::SPAWN_PROCS.load(Ordering::Relaxed) as f64),
        );
        map.insert(
            "run_procs".to_string(),
            Value::Num(metrics::RUN_PROCS.load(Ordering::Relaxed) as f64),
        );
        map.insert(
            "http_requests".to_string(),
            Value::Num(metrics::HTTP_REQUESTS.load(Ordering::Relaxed) as f64),
        );
        map.insert(
            "namespaces".to_string(),
            Value::Num(registry().names().len() as f64),
        );
        map
    }
}

/// Background task saving the store whenever the dirty flag is set.
fn spawn_autosave(store: Arc<Store>, interval: Duration, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("du-store-{}", store.name()))
        .spawn(move || loop {
            std::thread::park_timeout(interval);
            if stop.load(Ordering::SeqCst) {
                return;
            }
            if store.is_dirty() {
                if let Err(e) = store.save() {
                    error!("store '{}': auto-save failed - {e}", store.name());
                }
            }
        })
        .expect("failed to spawn store auto-save thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(name: &str) -> Arc<Store> {
        // unique namespaces keep tests independent of each other
        registry().obtain(&format!("test-{name}"), StoreConfig::default())
    }

    #[test]
    fn set_get_deep_copies_both_ways() {
        let store = fresh("copy");
        let original = Value::array(vec![Value::Num(1.0)]);
        store.set("x", &original).unwrap();

        // mutating the original after set must not perturb the stored value
        original.as_array().unwrap().lock().push(Value::Num(2.0));
        let read = store.get("x");
        assert_eq!(read.as_array().unwrap().lock().len(), 1);

        // mutating the returned value must not perturb the stored one
        read.as_array().unwrap().lock().push(Value::Num(9.0));
        assert_eq!(store.get("x").as_array().unwrap().lock().len(), 1);
    }

    #[test]
    fn functions_do_not_survive_storage() {
        let store = fresh("fn");
        store
            .set("fn", &Value::native("noop", |_, _| Ok(Value::Nil)))
            .unwrap();
        assert!(store.get("fn").is_nil());
    }

    #[test]
    fn set_once_and_swap() {
        let store = fresh("once");
        assert!(store.set_once("k", &Value::Num(1.0)).unwrap());
        assert!(!store.set_once("k", &Value::Num(2.0)).unwrap());
        assert_eq!(store.get("k"), Value::Num(1.0));

        let old = store.swap("k", &Value::Num(5.0)).unwrap();
        assert_eq!(old, Value::Num(1.0));
        assert_eq!(store.get("k"), Value::Num(5.0));
        assert!(store.swap("absent", &Value::Num(1.0)).unwrap().is_nil());
    }

    #[test]
    fn increment_typing_rules() {
        let store = fresh("incr");
        assert_eq!(store.increment("n", 5.0).unwrap(), 5.0);
        assert_eq!(store.increment("n", 1.0).unwrap(), 6.0);

        store.set("s", &Value::Str("foo".into())).unwrap();
        let err = store.increment("s", 1.0).unwrap_err();
        assert_eq!(err.kind_str(), "type_error");
    }

    #[test]
    fn push_pop_shift_unshift() {
        let store = fresh("list");
        assert_eq!(store.push("l", &Value::Num(2.0)).unwrap(), 1);
        assert_eq!(store.unshift("l", &Value::Num(1.0)).unwrap(), 2);
        assert_eq!(store.push("l", &Value::Num(3.0)).unwrap(), 3);
        assert_eq!(store.shift("l").unwrap(), Value::Num(1.0));
        assert_eq!(store.pop("l").unwrap(), Value::Num(3.0));
        assert_eq!(store.pop("empty").unwrap(), Value::Nil);

        store.set("s", &Value::Str("x".into())).unwrap();
        assert_eq!(store.push("s", &Value::Num(1.0)).unwrap_err().kind_str(), "type_error");
        assert_eq!(store.pop("s").unwrap_err().kind_str(), "type_error");
    }

    #[test]
    fn rename_rules() {
        let store = fresh("rename");
        store.set("a", &Value::Num(1.0)).unwrap();
        store.set("b", &Value::Num(2.0)).unwrap();
        assert!(store.rename("a", "b").is_err());
        assert_eq!(store.rename("missing", "c").unwrap_err().kind_str(), "not_found");
        store.rename("a", "c").unwrap();
        assert!(!store.exists("a"));
        assert_eq!(store.get("c"), Value::Num(1.0));
    }

    #[test]
    fn wait_sees_final_value_of_a_sequence() {
        let store = fresh("wait-seq");
        store.set("k", &Value::Num(0.0)).unwrap();

        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.wait("k", Some(&Value::Num(10.0)), Some(Duration::from_secs(5)))
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        store.set("k", &Value::Num(1.0)).unwrap();
        store.set("k", &Value::Num(5.0)).unwrap();
        store.set("k", &Value::Num(10.0)).unwrap();

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, Value::Num(10.0));
    }

    #[test]
    fn wait_returns_immediately_when_already_equal() {
        let store = fresh("wait-now");
        store.set("k", &Value::Num(7.0)).unwrap();
        let got = store
            .wait("k", Some(&Value::Num(7.0)), Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(got, Value::Num(7.0));
    }

    #[test]
    fn wait_times_out_with_timeout_kind() {
        let store = fresh("wait-timeout");
        store.set("k", &Value::Num(0.0)).unwrap();
        let err = store
            .wait("k", Some(&Value::Num(1.0)), Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(err.kind_str(), "timeout");
    }

    #[test]
    fn wait_without_expected_returns_on_change() {
        let store = fresh("wait-change");
        store.set("k", &Value::Num(1.0)).unwrap();
        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || store.wait("k", None, Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(50));
        // same value does not count as a change
        store.set("k", &Value::Num(1.0)).unwrap();
        store.set("k", &Value::Num(2.0)).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), Value::Num(2.0));
    }

    #[test]
    fn wait_for_runs_predicate_unlocked() {
        let store = fresh("wait-for");
        let watched = store.clone();
        let waiter = std::thread::spawn(move || {
            watched.wait_for("k", Some(Duration::from_secs(5)), |v| {
                // a predicate reading the datastore must not deadlock
                let _ = registry().obtain("test-wait-for-side", StoreConfig::default()).get("x");
                Ok(v.as_num().map_or(false, |n| n >= 3.0))
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        store.set("k", &Value::Num(1.0)).unwrap();
        store.set("k", &Value::Num(3.0)).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), Value::Num(3.0));
    }

    #[test]
    fn sys_namespace_is_read_only() {
        let sys = registry().obtain(SYS_NAMESPACE, StoreConfig::default());
        let err = sys.set("x", &Value::Num(1.0)).unwrap_err();
        assert_eq!(err.kind_str(), "permission_denied");
        assert_eq!(sys.clear().unwrap_err().kind_str(), "permission_denied");
        assert!(sys.get("uptime_seconds").as_num().is_some());
        assert!(sys.keys().contains(&"spawn_procs".to_string()));
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        let store = registry().obtain(
            "test-persist",
            StoreConfig {
                persist: Some(path.clone()),
                persist_interval: None,
            },
        );
        store.set("n", &Value::Num(6.0)).unwrap();
        store
            .set("list", &Value::array(vec![Value::Num(2.0), Value::Num(3.0)]))
            .unwrap();
        store.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["n"], serde_json::json!(6));

        store.set("n", &Value::Num(99.0)).unwrap();
        store.load().unwrap();
        assert_eq!(store.get("n"), Value::Num(6.0));
        assert_eq!(
            store.get("list").as_array().unwrap().lock().len(),
            2
        );
    }

    #[test]
    fn obtain_returns_same_store() {
        let a = fresh("same");
        let b = registry().obtain("test-same", StoreConfig::default());
        a.set("k", &Value::Num(1.0)).unwrap();
        assert_eq!(b.get("k"), Value::Num(1.0));
    }
}
