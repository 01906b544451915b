//! Naming service boundary: a read-only mirror used for resolution and a
//! register used to publish local sessions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// `(service name, connection spec)` as published in the naming service.
pub type NameSpec = (String, String);

pub trait NameMirror: Send + Sync {
    /// All published names matching `pattern`.
    fn lookup(&self, pattern: &str) -> Vec<NameSpec>;

    /// Generation counter; changes whenever the mirrored set changes.
    fn updates(&self) -> u64;

    fn ready(&self) -> bool;
}

pub trait NameRegister: Send + Sync {
    fn register_name(&self, name: &str, spec: &str);

    fn unregister_name(&self, name: &str, spec: &str);
}

/// In-memory naming service shared by every bus in one process.
///
/// Acts as both mirror and register, so registrations are visible to lookups
/// immediately.
#[derive(Debug, Default)]
pub struct LocalNameServer {
    names: Mutex<BTreeMap<String, String>>,
    generation: AtomicU64,
}

impl LocalNameServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.lock().expect("name server mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl NameMirror for LocalNameServer {
    fn lookup(&self, pattern: &str) -> Vec<NameSpec> {
        self.names
            .lock()
            .expect("name server mutex poisoned")
            .iter()
            .filter(|(name, _)| pattern_matches(pattern, name))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect()
    }

    fn updates(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn ready(&self) -> bool {
        true
    }
}

impl NameRegister for LocalNameServer {
    fn register_name(&self, name: &str, spec: &str) {
        let previous = self
            .names
            .lock()
            .expect("name server mutex poisoned")
            .insert(name.to_owned(), spec.to_owned());
        if previous.as_deref() != Some(spec) {
            self.bump();
        }
    }

    fn unregister_name(&self, name: &str, spec: &str) {
        let mut names = self.names.lock().expect("name server mutex poisoned");
        if names.get(name).is_some_and(|current| current == spec) {
            names.remove(name);
            drop(names);
            self.bump();
        }
    }
}

/// Matches a `/`-separated name against a pattern.
///
/// `*` matches any run of characters inside one component; a final `**`
/// component matches everything that remains.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut name_parts = name.split('/');
    loop {
        match (pattern_parts.next(), name_parts.next()) {
            (Some("**"), Some(_)) => return pattern_parts.next().is_none(),
            (Some(pattern_part), Some(name_part)) => {
                if !component_matches(pattern_part.as_bytes(), name_part.as_bytes()) {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn component_matches(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    // Last `*` seen and the name position it currently absorbs up to.
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, n));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&byte| byte == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_stay_inside_components() {
        assert!(pattern_matches("search/cluster.0/0", "search/cluster.0/0"));
        assert!(pattern_matches("search/*/0", "search/cluster.0/0"));
        assert!(pattern_matches("search/cluster.*/0", "search/cluster.12/0"));
        assert!(!pattern_matches("search/*", "search/cluster.0/0"));
        assert!(!pattern_matches("search/cluster.0", "search/cluster.0/0"));
        assert!(pattern_matches("search/**", "search/cluster.0/0"));
        assert!(!pattern_matches("docproc/**", "search/cluster.0/0"));
    }

    #[test]
    fn component_wildcards_backtrack() {
        assert!(component_matches(b"*", b""));
        assert!(component_matches(b"a*c", b"abbbc"));
        assert!(component_matches(b"*bc*", b"abcbcd"));
        assert!(component_matches(b"a*b*c", b"aXbYbZc"));
        assert!(!component_matches(b"a*c", b"abcd"));
        assert!(!component_matches(b"abc", b"ab"));
        assert!(!component_matches(b"", b"a"));
    }

    #[test]
    fn many_wildcards_against_a_long_component_fail_fast() {
        let name = "a".repeat(64);
        let started = std::time::Instant::now();
        assert!(!component_matches(b"*a*a*a*a*a*a*a*a*b", name.as_bytes()));
        assert!(component_matches(b"*a*a*a*a*a*a*a*a*", name.as_bytes()));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn registration_changes_generation_once() {
        let names = LocalNameServer::new();
        let start = names.updates();
        names.register_name("search/0/session", "tcp/a:1");
        names.register_name("search/0/session", "tcp/a:1");
        assert_eq!(names.updates(), start + 1);
        assert_eq!(
            names.lookup("search/*/session"),
            vec![("search/0/session".to_owned(), "tcp/a:1".to_owned())]
        );

        names.unregister_name("search/0/session", "tcp/other:2");
        assert_eq!(names.len(), 1, "spec must match to unregister");
        names.unregister_name("search/0/session", "tcp/a:1");
        assert!(names.is_empty());
        assert_eq!(names.updates(), start + 2);
    }
}
