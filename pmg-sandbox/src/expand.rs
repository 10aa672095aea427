use std::path::{Component, Path, PathBuf};

use regex::Regex;

/// Values substituted for `${HOME}`, `${CWD}` and `${TMPDIR}` in policy
/// patterns.
#[derive(Debug, Clone)]
pub struct ExpansionVars {
    pub home: PathBuf,
    pub cwd: PathBuf,
    pub tmpdir: PathBuf,
}

impl ExpansionVars {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            tmpdir: std::env::temp_dir(),
        }
    }
}

/// Substitute variables and lexically clean the result.
pub fn expand_variables(pattern: &str, vars: &ExpansionVars) -> String {
    let expanded = pattern
        .replace("${HOME}", &vars.home.to_string_lossy())
        .replace("${CWD}", &vars.cwd.to_string_lossy())
        .replace("${TMPDIR}", &vars.tmpdir.to_string_lossy());
    lexical_clean(&expanded)
}

/// Collapse `.` and `..` components without touching the filesystem.
pub fn lexical_clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(&"..")) || (parts.is_empty() && !absolute) {
                    parts.push("..");
                } else {
                    parts.pop();
                }
            }
            Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

/// Whether a pattern carries glob syntax at all.
pub fn contains_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Convert a glob pattern to an anchored regex.
///
/// `*` and `?` match within a path component, `**` crosses separators
/// (`**/` also matches zero directories), `[…]` is a character class.
/// An unclosed bracket is escaped and matches a literal `[`.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut result = String::with_capacity(pattern.len() * 2);
    result.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                result.push('\\');
                result.push(c);
            }
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        // `**/` matches zero or more whole directories
                        result.push_str("(.*/)?");
                    } else {
                        result.push_str(".*");
                    }
                } else {
                    result.push_str("[^/]*");
                }
            }
            '?' => result.push_str("[^/]"),
            '[' => {
                // scan ahead for the closing bracket; escape a dangling one
                let class: String = chars.clone().take_while(|&inner| inner != ']').collect();
                let has_close = chars.clone().any(|inner| inner == ']');
                if has_close {
                    result.push('[');
                    for inner in class.chars() {
                        result.push(inner);
                        chars.next();
                    }
                    chars.next();
                    result.push(']');
                } else {
                    result.push_str("\\[");
                }
            }
            _ => result.push(c),
        }
    }

    result.push('$');
    result
}

/// Limits for filesystem glob expansion, preventing argv explosion.
#[derive(Debug, Clone, Copy)]
pub struct GlobLimits {
    pub max_depth: usize,
    pub max_paths: usize,
}

impl Default for GlobLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_paths: 256,
        }
    }
}

/// Result of expanding a glob pattern against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobExpansion {
    /// The pattern carried no glob syntax at all.
    Literal(PathBuf),
    /// Concrete matches.
    Paths(Vec<PathBuf>),
    /// Expansion exceeded a limit; bind this nearest non-glob ancestor
    /// instead of an unbounded match list.
    Ancestor(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GlobError {
    #[error("`**` pattern without a non-glob base would walk the filesystem root")]
    EmptyBase,
}

/// Longest leading part of the pattern that carries no glob syntax.
pub fn longest_non_glob_ancestor(pattern: &str) -> PathBuf {
    let mut ancestor = PathBuf::new();
    for part in pattern.split('/') {
        if contains_glob(part) {
            break;
        }
        if part.is_empty() {
            ancestor.push("/");
        } else {
            ancestor.push(part);
        }
    }
    ancestor
}

/// Expand a (variable-substituted) pattern against the filesystem.
///
/// Simple patterns walk only the components that carry globs; `**` uses a
/// bounded recursive walk. When either limit trips, expansion degrades to
/// the nearest non-glob ancestor.
pub fn expand_glob(pattern: &str, limits: GlobLimits) -> Result<GlobExpansion, GlobError> {
    if !contains_glob(pattern) {
        return Ok(GlobExpansion::Literal(PathBuf::from(pattern)));
    }

    let base = longest_non_glob_ancestor(pattern);
    if pattern.contains("**") && (base.as_os_str().is_empty() || base == Path::new("/")) {
        return Err(GlobError::EmptyBase);
    }
    if base.as_os_str().is_empty() {
        return Err(GlobError::EmptyBase);
    }

    let remainder: Vec<&str> = pattern
        .strip_prefix(&*base.to_string_lossy())
        .unwrap_or(pattern)
        .split('/')
        .filter(|part| !part.is_empty())
        .collect();

    let mut matches = Vec::new();
    let mut overflow = false;
    walk(
        &base,
        &remainder,
        0,
        limits,
        &mut matches,
        &mut overflow,
    );

    if overflow {
        tracing::debug!(
            "glob expansion for {pattern} exceeded limits, falling back to ancestor {}",
            base.display()
        );
        return Ok(GlobExpansion::Ancestor(base));
    }

    Ok(GlobExpansion::Paths(matches))
}

fn walk(
    dir: &Path,
    remainder: &[&str],
    depth: usize,
    limits: GlobLimits,
    matches: &mut Vec<PathBuf>,
    overflow: &mut bool,
) {
    if *overflow {
        return;
    }
    if depth > limits.max_depth {
        *overflow = true;
        return;
    }
    if !dir.is_dir() {
        return;
    }

    let Some((part, rest)) = remainder.split_first() else {
        return;
    };

    if *part == "**" {
        // `**` matches zero components...
        if rest.is_empty() {
            push_match(dir.to_path_buf(), limits, matches, overflow);
        } else {
            walk(dir, rest, depth, limits, matches, overflow);
        }
        // ...or descends into every subdirectory
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, remainder, depth + 1, limits, matches, overflow);
            } else if rest.is_empty() {
                push_match(path, limits, matches, overflow);
            }
            if *overflow {
                return;
            }
        }
        return;
    }

    if !contains_glob(part) {
        let next = dir.join(part);
        if rest.is_empty() {
            if next.exists() {
                push_match(next, limits, matches, overflow);
            }
        } else if next.is_dir() {
            walk(&next, rest, depth + 1, limits, matches, overflow);
        }
        return;
    }

    let Ok(re) = Regex::new(&glob_to_regex(part)) else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !re.is_match(name) {
            continue;
        }
        let path = entry.path();
        if rest.is_empty() {
            push_match(path, limits, matches, overflow);
        } else if path.is_dir() {
            walk(&path, rest, depth + 1, limits, matches, overflow);
        }
        if *overflow {
            return;
        }
    }
}

fn push_match(
    path: PathBuf,
    limits: GlobLimits,
    matches: &mut Vec<PathBuf>,
    overflow: &mut bool,
) {
    if matches.len() >= limits.max_paths {
        *overflow = true;
        return;
    }
    matches.push(path);
}
