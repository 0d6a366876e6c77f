use super::paths;

const IGNORED_PREFIXES: &[&str] = &[".", "desktop.ini", "thumbs.db", "~$"];
const IGNORED_SUFFIXES: &[&str] = &["~", ".swp", ".lock", ".part", ".partial", ".crdownload"];

/// Name-based rules for objects that never take part in synchronization.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    prefixes: Vec<String>,
    suffixes: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            prefixes: IGNORED_PREFIXES.iter().map(|s| s.to_string()).collect(),
            suffixes: IGNORED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl IgnoreRules {
    pub fn with_extra(mut self, prefixes: &[&str], suffixes: &[&str]) -> Self {
        self.prefixes
            .extend(prefixes.iter().map(|s| s.to_ascii_lowercase()));
        self.suffixes
            .extend(suffixes.iter().map(|s| s.to_ascii_lowercase()));
        self
    }

    pub fn is_ignored_name(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.prefixes.iter().any(|p| lower.starts_with(p.as_str()))
            || self.suffixes.iter().any(|s| lower.ends_with(s.as_str()))
            || is_office_temp_file(name)
    }

    /// A path is ignored when any of its components is.
    pub fn is_ignored_path(&self, path: &str) -> bool {
        if path == paths::ROOT {
            return false;
        }
        path.split('/')
            .filter(|part| !part.is_empty())
            .any(|part| self.is_ignored_name(part))
    }
}

/// Office suites litter the tree with short-lived temporary files:
/// `pptXXXX.tmp` (PowerPoint), eight hex digits with an optional `.tmp`
/// (Office 2007+) and `~*.tmp` (Office 97).
pub fn is_office_temp_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".tmp");

    if let Some(stem) = stem {
        if lower.starts_with('~') {
            return true;
        }
        if let Some(code) = stem.strip_prefix("ppt")
            && code.len() == 4
            && code.chars().all(|c| c.is_ascii_hexdigit())
        {
            return true;
        }
    }

    let core = stem.unwrap_or(&lower);
    core.len() == 8 && core.chars().all(|c| c.is_ascii_hexdigit())
}
