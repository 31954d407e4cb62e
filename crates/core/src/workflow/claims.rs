//! Exclusive filesystem roots held by running jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Tracks which roots each running job owns. Two jobs may run together
/// only when no root of one is equal to, inside, or above a root of the other.
#[derive(Debug, Default)]
pub struct RootClaims {
    held: HashMap<String, Vec<PathBuf>>,
}

impl RootClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// The job currently holding a root that overlaps `roots`.
    pub fn conflict(&self, roots: &[PathBuf]) -> Option<&str> {
        self.held
            .iter()
            .find(|(_, held)| {
                held.iter()
                    .any(|h| roots.iter().any(|r| overlaps(h, r)))
            })
            .map(|(job_id, _)| job_id.as_str())
    }

    /// Claim `roots` for `job_id` unless another job overlaps them.
    pub fn try_claim(&mut self, job_id: &str, roots: Vec<PathBuf>) -> bool {
        if self.conflict(&roots).is_some() {
            return false;
        }
        self.held.insert(job_id.to_string(), roots);
        true
    }

    pub fn release(&mut self, job_id: &str) {
        self.held.remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(paths: &[&str]) -> Vec<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_disjoint_roots_run_together() {
        let mut claims = RootClaims::new();
        assert!(claims.try_claim("a", roots(&["/data/media/tv/Show A"])));
        assert!(claims.try_claim("b", roots(&["/data/media/tv/Show B"])));
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn test_nested_or_equal_roots_conflict() {
        let mut claims = RootClaims::new();
        assert!(claims.try_claim("a", roots(&["/data/media/tv/Show"])));
        assert!(!claims.try_claim("b", roots(&["/data/media/tv/Show/Season 02"])));
        assert!(!claims.try_claim("c", roots(&["/data/media/tv"])));
        assert_eq!(claims.conflict(&roots(&["/data/media/tv/Show"])), Some("a"));
    }

    #[test]
    fn test_prefix_strings_are_not_nested() {
        let mut claims = RootClaims::new();
        assert!(claims.try_claim("a", roots(&["/data/media/tv/Show"])));
        assert!(claims.try_claim("b", roots(&["/data/media/tv/Show Returns"])));
    }

    #[test]
    fn test_release_frees_roots() {
        let mut claims = RootClaims::new();
        assert!(claims.try_claim("a", roots(&["/x"])));
        claims.release("a");
        assert!(claims.is_empty());
        assert!(claims.try_claim("b", roots(&["/x/y"])));
    }
}
