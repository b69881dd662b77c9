//! Bypass: per-Hop address exclusion list.
//!
//! A Hop is skipped for a target address/host when its Bypass matches. The
//! default implementation is a static allow/deny list of literal hosts and
//! `*`/`?` glob patterns (`*.internal`), compiled to `Regex` once at
//! construction: exact strings bypass the engine entirely, and `*`/`?`
//! characters turn into `(.*?)`/`(.)` groups anchored with `^`/`$`.

use regex::Regex;

/// Whether a Bypass blocks or admits by default when nothing matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Block only entries explicitly listed (allow-by-default).
    Blacklist,
    /// Admit only entries explicitly listed (deny-by-default).
    Whitelist,
}

pub trait Bypass: Send + Sync {
    /// True if `host` (a bare hostname or IP, no port) should NOT be routed
    /// through the owning Hop.
    fn contains(&self, host: &str) -> bool;
}

enum CompiledPattern {
    Exact(String),
    Glob(Regex),
}

impl CompiledPattern {
    fn compile(pattern: &str) -> CompiledPattern {
        let pattern = pattern.trim().to_ascii_lowercase();
        if !pattern.contains('*') && !pattern.contains('?') {
            return CompiledPattern::Exact(pattern);
        }
        match compile_wildcard_pattern(&pattern) {
            Ok(re) => CompiledPattern::Glob(re),
            // An unparsable glob never matches rather than failing config load.
            Err(_) => CompiledPattern::Exact(String::new()),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            CompiledPattern::Exact(p) => !p.is_empty() && p == host,
            CompiledPattern::Glob(re) => re.is_match(host),
        }
    }
}

fn compile_wildcard_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str("(.*?)"),
            '?' => out.push_str("(.)"),
            other => {
                if ".^$+()[]{}|\\".contains(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }
    out.push('$');
    Regex::new(&out)
}

pub struct StaticBypass {
    mode: Mode,
    patterns: Vec<CompiledPattern>,
}

impl StaticBypass {
    pub fn new(mode: Mode, patterns: Vec<String>) -> Self {
        Self {
            mode,
            patterns: patterns.iter().map(|p| CompiledPattern::compile(p)).collect(),
        }
    }

    fn matches_any(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }
}

impl Bypass for StaticBypass {
    fn contains(&self, host: &str) -> bool {
        let matched = self.matches_any(host);
        match self.mode {
            Mode::Blacklist => matched,
            Mode::Whitelist => !matched,
        }
    }
}

/// A permissive Bypass that never excludes anything, the default when no
/// Hop-level bypass is configured.
#[derive(Debug, Default, Clone)]
pub struct NoBypass;

impl Bypass for NoBypass {
    fn contains(&self, _host: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_blocks_listed_hosts_only() {
        let bp = StaticBypass::new(Mode::Blacklist, vec!["example.com".into(), "*.internal".into()]);
        assert!(bp.contains("example.com"));
        assert!(bp.contains("svc.internal"));
        assert!(!bp.contains("other.com"));
    }

    #[test]
    fn whitelist_admits_listed_hosts_only() {
        let bp = StaticBypass::new(Mode::Whitelist, vec!["example.com".into()]);
        assert!(!bp.contains("example.com"));
        assert!(bp.contains("other.com"));
    }

    #[test]
    fn glob_question_mark_matches_single_char() {
        let bp = StaticBypass::new(Mode::Blacklist, vec!["10.0.0.?".into()]);
        assert!(bp.contains("10.0.0.5"));
        assert!(!bp.contains("10.0.0.55"));
    }

    #[test]
    fn no_bypass_never_excludes() {
        assert!(!NoBypass.contains("anything"));
    }
}
