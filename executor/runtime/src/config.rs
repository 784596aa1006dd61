use std::path::PathBuf;

/// Interpreter-level configuration. Server and store configuration arrive
/// through script values (`http_server({...})`, `datastore(ns, {...})`); this
/// struct holds what the embedding host decides.
#[derive(Clone)]
pub struct Config {
    /// Base directory for relative script paths when no frame is active.
    pub script_dir: PathBuf,
    /// Compile-time embedded assets backing the `/EMBED/` prefix.
    pub embed: Option<&'static include_dir::Dir<'static>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            script_dir: PathBuf::from("."),
            embed: None,
        }
    }
}
