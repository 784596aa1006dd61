use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Error, Result};

/// Entry returned by the directory-reader capability.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

type ReadFn = dyn Fn(&Path) -> io::Result<Vec<u8>> + Send + Sync;
type WriteFn = dyn Fn(&Path, &[u8]) -> io::Result<()> + Send + Sync;
type StatFn = dyn Fn(&Path) -> io::Result<SystemTime> + Send + Sync;
type ReadDirFn = dyn Fn(&Path) -> io::Result<Vec<DirEntry>> + Send + Sync;
type OutputFn = dyn Fn(&str) + Send + Sync;
type EnvFn = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Host-provided I/O callables. Every field is optional; an intrinsic that
/// needs an absent capability fails with `capability_missing`.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub file_reader: Option<Arc<ReadFn>>,
    pub file_writer: Option<Arc<WriteFn>>,
    pub file_statter: Option<Arc<StatFn>>,
    pub dir_reader: Option<Arc<ReadDirFn>>,
    pub script_loader: Option<Arc<ReadFn>>,
    pub output_writer: Option<Arc<OutputFn>>,
    pub env_reader: Option<Arc<EnvFn>>,
}

impl Capabilities {
    /// No capabilities at all; every dependent intrinsic fails.
    pub fn none() -> Self {
        Capabilities::default()
    }

    /// The standard set backed by the local filesystem, stdout and the
    /// process environment.
    pub fn local_fs() -> Self {
        Capabilities {
            file_reader: Some(Arc::new(|path: &Path| std::fs::read(path))),
            file_writer: Some(Arc::new(|path: &Path, content: &[u8]| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, content)
            })),
            file_statter: Some(Arc::new(|path: &Path| std::fs::metadata(path)?.modified())),
            dir_reader: Some(Arc::new(|path: &Path| {
                let mut out = Vec::new();
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    out.push(DirEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        is_dir: entry.file_type()?.is_dir(),
                    });
                }
                Ok(out)
            })),
            script_loader: Some(Arc::new(|path: &Path| std::fs::read(path))),
            output_writer: Some(Arc::new(|text: &str| {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            })),
            env_reader: Some(Arc::new(|name: &str| std::env::var(name).ok())),
        }
    }

    /// Like [`local_fs`](Self::local_fs) with all filesystem access removed
    /// (the runner's `--no-files` mode).
    pub fn no_files() -> Self {
        Capabilities {
            file_reader: None,
            file_writer: None,
            file_statter: None,
            dir_reader: None,
            script_loader: None,
            ..Capabilities::local_fs()
        }
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let f = self
            .file_reader
            .as_ref()
            .ok_or_else(|| Error::capability_missing("file_reader"))?;
        f(path).map_err(|e| Error::io(format!("{}: {e}", path.display())))
    }

    pub fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        let f = self
            .file_writer
            .as_ref()
            .ok_or_else(|| Error::capability_missing("file_writer"))?;
        f(path, content).map_err(|e| Error::io(format!("{}: {e}", path.display())))
    }

    /// Modification time of a file, when the statter capability is present.
    /// Returns `None` without a statter so cache revalidation degrades to
    /// "never stale".
    pub fn stat_mtime(&self, path: &Path) -> Option<SystemTime> {
        self.file_statter.as_ref().and_then(|f| f(path).ok())
    }

    pub fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let f = self
            .dir_reader
            .as_ref()
            .ok_or_else(|| Error::capability_missing("dir_reader"))?;
        f(path).map_err(|e| Error::io(format!("{}: {e}", path.display())))
    }

    pub fn load_script(&self, path: &Path) -> Result<Vec<u8>> {
        let f = self
            .script_loader
            .as_ref()
            .ok_or_else(|| Error::capability_missing("script_loader"))?;
        f(path).map_err(|e| Error::io(format!("{}: {e}", path.display())))
    }

    pub fn write_output(&self, text: &str) -> Result<()> {
        let f = self
            .output_writer
            .as_ref()
            .ok_or_else(|| Error::capability_missing("output_writer"))?;
        f(text);
        Ok(())
    }

    pub fn read_env(&self, name: &str) -> Result<Option<String>> {
        let f = self
            .env_reader
            .as_ref()
            .ok_or_else(|| Error::capability_missing("env_reader"))?;
        Ok(f(name))
    }

    /// Capability set serving scripts out of a fixed in-memory map, used by
    /// embedding hosts and tests.
    pub fn from_sources(sources: Vec<(PathBuf, String)>) -> Self {
        let map: std::collections::HashMap<PathBuf, Vec<u8>> = sources
            .into_iter()
            .map(|(p, s)| (p, s.into_bytes()))
            .collect();
        let map = Arc::new(map);
        let loader_map = map.clone();
        Capabilities {
            script_loader: Some(Arc::new(move |path: &Path| {
                loader_map.get(path).cloned().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no such script")
                })
            })),
            file_reader: Some(Arc::new(move |path: &Path| {
                map.get(path).cloned().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no such file")
                })
            })),
            ..Capabilities::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capability_has_its_own_kind() {
        let caps = Capabilities::none();
        let err = caps.read_file(Path::new("/nope")).unwrap_err();
        assert_eq!(err.kind_str(), "capability_missing");
        let err = caps.write_output("x").unwrap_err();
        assert_eq!(err.kind_str(), "capability_missing");
    }

    #[test]
    fn source_map_serves_scripts() {
        let caps =
            Capabilities::from_sources(vec![(PathBuf::from("/app/a.du"), "1".to_string())]);
        assert_eq!(caps.load_script(Path::new("/app/a.du")).unwrap(), b"1");
        assert!(caps.load_script(Path::new("/app/b.du")).is_err());
    }
}
