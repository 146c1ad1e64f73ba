use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::models::RepositoryRef;
use crate::extract::ErrorCandidate;
use crate::repo::normalize_url;

/// How `scan` treats repeated errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Every candidate becomes an attempt.
    #[default]
    Off,
    /// Skip candidates whose repository, file and message match an open
    /// attempt or an earlier candidate in the same scan.
    Signature,
}

/// Stable fingerprint of an error within a repository.
pub fn fingerprint(repository: &RepositoryRef, candidate: &ErrorCandidate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(&repository.url).as_bytes());
    hasher.update([0]);
    hasher.update(candidate.file_path.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(candidate.message.trim().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(file: Option<&str>, message: &str) -> ErrorCandidate {
        ErrorCandidate::new(file.map(str::to_string), Some(1), message, "raw")
    }

    #[test]
    fn test_fingerprint_ignores_ids_and_url_spelling() {
        let a = fingerprint(
            &RepositoryRef::new("https://github.com/o/r.git"),
            &candidate(Some("a.py"), "KeyError: 'x'"),
        );
        let b = fingerprint(
            &RepositoryRef::new("https://github.com/o/r/"),
            &candidate(Some("a.py"), "KeyError: 'x' "),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_file_and_message() {
        let repo = RepositoryRef::new("https://github.com/o/r");
        let base = fingerprint(&repo, &candidate(Some("a.py"), "KeyError"));
        assert_ne!(base, fingerprint(&repo, &candidate(Some("b.py"), "KeyError")));
        assert_ne!(base, fingerprint(&repo, &candidate(Some("a.py"), "ValueError")));
        assert_ne!(base, fingerprint(&repo, &candidate(None, "KeyError")));
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(DedupPolicy::default(), DedupPolicy::Off);
        let parsed: DedupPolicy = serde_json::from_str("\"signature\"").unwrap();
        assert_eq!(parsed, DedupPolicy::Signature);
    }
}
