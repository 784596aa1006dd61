use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};

/// A registered route. `method` is uppercase or `"*"`; pattern routes carry
/// the compiled regex for their `:param` segments.
#[derive(Debug)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub pattern: Option<Regex>,
    pub param_names: Vec<String>,
    pub handler: String,
    /// Directory of the script that registered the route; handler paths and
    /// file responses resolve relative to it.
    pub script_dir: PathBuf,
    pub static_dir: Option<PathBuf>,
}

impl Route {
    pub fn is_static(&self) -> bool {
        self.static_dir.is_some()
    }
}

/// Compile a route path into its parameter names and matching regex.
/// Segments beginning with `:` capture greedily up to the next `/`; empty
/// segments do not match. Returns `(None, [])` for literal paths.
pub fn compile_pattern(path: &str) -> Result<(Option<Regex>, Vec<String>)> {
    if !path.split('/').any(|seg| seg.starts_with(':')) {
        return Ok((None, Vec::new()));
    }
    let mut names = Vec::new();
    let mut pattern = String::from("^");
    for (i, segment) in path.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            names.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');
    let regex = Regex::new(&pattern)
        .map_err(|e| Error::msg(format!("route pattern '{path}': {e}")))?;
    Ok((Some(regex), names))
}

/// Literal prefix of a pattern path (up to the first `:` segment), used for
/// specificity ordering.
fn literal_prefix(path: &str) -> &str {
    match path.find("/:") {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Route table keyed by `"METHOD /path"` with a derived key list sorted by
/// path length descending, rebuilt on every change. Matching walks the
/// sorted list and prefers the most specific path; at equal specificity an
/// exact-method route beats a wildcard one.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
    sorted_keys: Vec<String>,
}

fn route_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

impl RouteTable {
    pub fn register(&mut self, route: Route) {
        let key = route_key(&route.method, &route.path);
        self.routes.insert(key, Arc::new(route));
        self.rebuild_keys();
    }

    pub fn unregister(&mut self, method: &str, path: &str) -> bool {
        let removed = self.routes.remove(&route_key(method, path)).is_some();
        if removed {
            self.rebuild_keys();
        }
        removed
    }

    fn rebuild_keys(&mut self) {
        let mut keys: Vec<String> = self.routes.keys().cloned().collect();
        keys.sort_by(|a, b| {
            let pa = self.routes[a].path.len();
            let pb = self.routes[b].path.len();
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });
        self.sorted_keys = keys;
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Match a request against the table, returning the route and extracted
    /// path parameters.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        let method = method.to_uppercase();
        let mut best: Option<(Arc<Route>, HashMap<String, String>, usize, bool)> = None;

        for key in &self.sorted_keys {
            let route = &self.routes[key];
            if route.method != "*" && route.method != method {
                continue;
            }
            let Some(params) = match_path(route, path) else {
                continue;
            };
            let specificity = match &route.pattern {
                Some(_) => literal_prefix(&route.path).len(),
                None => route.path.len(),
            };
            let exact = route.method != "*";
            let better = match &best {
                None => true,
                Some((_, _, len, was_exact)) => {
                    specificity > *len || (specificity == *len && exact && !*was_exact)
                }
            };
            if better {
                best = Some((route.clone(), params, specificity, exact));
            }
        }
        best.map(|(route, params, _, _)| (route, params))
    }
}

fn match_path(route: &Route, path: &str) -> Option<HashMap<String, String>> {
    if route.is_static() {
        return if path_has_prefix(path, &route.path) {
            Some(HashMap::new())
        } else {
            None
        };
    }
    match &route.pattern {
        Some(regex) => {
            let captures = regex.captures(path)?;
            let params = route
                .param_names
                .iter()
                .zip(captures.iter().skip(1))
                .filter_map(|(name, cap)| cap.map(|c| (name.clone(), c.as_str().to_string())))
                .collect();
            Some(params)
        }
        // literal routes match exactly or as a path-boundary prefix
        None => {
            if path == route.path || path_has_prefix(path, &route.path) {
                Some(HashMap::new())
            } else {
                None
            }
        }
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, path: &str) -> Route {
        let (pattern, param_names) = compile_pattern(path).unwrap();
        Route {
            method: method.to_uppercase(),
            path: path.to_string(),
            pattern,
            param_names,
            handler: "h.du".to_string(),
            script_dir: PathBuf::from("/app"),
            static_dir: None,
        }
    }

    #[test]
    fn pattern_extraction() {
        let (regex, names) = compile_pattern("/users/:id/tokens/:token").unwrap();
        assert_eq!(names, vec!["id".to_string(), "token".to_string()]);
        let regex = regex.unwrap();

        let caps = regex.captures("/users/abc/tokens/xyz").unwrap();
        assert_eq!(&caps[1], "abc");
        assert_eq!(&caps[2], "xyz");

        // empty segments do not match
        assert!(regex.captures("/users/abc/tokens/").is_none());
        assert!(regex.captures("/users/abc/tokens/x/y").is_none());
    }

    #[test]
    fn literal_paths_have_no_pattern() {
        let (regex, names) = compile_pattern("/users").unwrap();
        assert!(regex.is_none());
        assert!(names.is_empty());
    }

    #[test]
    fn longest_specific_path_wins() {
        let mut table = RouteTable::default();
        table.register(route("GET", "/users"));
        table.register(route("GET", "/users/:id"));
        table.register(route("GET", "/users/admin"));

        let (matched, params) = table.match_route("GET", "/users/admin").unwrap();
        assert_eq!(matched.path, "/users/admin");
        assert!(params.is_empty());

        let (matched, params) = table.match_route("GET", "/users/42").unwrap();
        assert_eq!(matched.path, "/users/:id");
        assert_eq!(params.get("id").map(String::as_str), Some("42"));

        let (matched, _) = table.match_route("GET", "/users").unwrap();
        assert_eq!(matched.path, "/users");
    }

    #[test]
    fn method_matching_is_case_insensitive() {
        let mut table = RouteTable::default();
        table.register(route("get", "/users"));
        assert!(table.match_route("GET", "/users").is_some());
    }

    #[test]
    fn exact_method_beats_wildcard_at_same_path() {
        let mut table = RouteTable::default();
        table.register(route("*", "/api"));
        table.register(route("POST", "/api"));

        let (matched, _) = table.match_route("POST", "/api").unwrap();
        assert_eq!(matched.method, "POST");

        // wildcard still serves other methods
        let (matched, _) = table.match_route("DELETE", "/api").unwrap();
        assert_eq!(matched.method, "*");
    }

    #[test]
    fn literal_routes_prefix_match_on_boundaries() {
        let mut table = RouteTable::default();
        table.register(route("GET", "/docs"));
        assert!(table.match_route("GET", "/docs/intro").is_some());
        assert!(table.match_route("GET", "/docsx").is_none());
    }

    #[test]
    fn unregister_rebuilds_the_sorted_list() {
        let mut table = RouteTable::default();
        table.register(route("GET", "/users"));
        table.register(route("GET", "/users/admin"));
        assert!(table.unregister("GET", "/users/admin"));
        let (matched, _) = table.match_route("GET", "/users/admin").unwrap();
        assert_eq!(matched.path, "/users");
        assert!(!table.unregister("GET", "/ghost"));
    }

    #[test]
    fn no_match_is_none() {
        let table = RouteTable::default();
        assert!(table.match_route("GET", "/nope").is_none());
    }
}
