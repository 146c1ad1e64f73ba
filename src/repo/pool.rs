use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{RepositoryFactory, RepositoryHandle, normalize_url};
use crate::lifecycle::models::RepositoryRef;

/// A handle shared by every attempt against the same repository. The mutex is
/// what serializes git steps on one working copy.
pub type SharedHandle = Arc<tokio::sync::Mutex<Box<dyn RepositoryHandle>>>;

/// One handle per distinct repository URL, created on first use.
pub struct RepositoryPool {
    factory: Arc<dyn RepositoryFactory>,
    handles: Mutex<HashMap<String, SharedHandle>>,
}

impl RepositoryPool {
    pub fn new(factory: Arc<dyn RepositoryFactory>) -> Self {
        Self {
            factory,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The handle for `repository`, opening one if this URL is new.
    pub fn handle_for(&self, repository: &RepositoryRef) -> SharedHandle {
        let key = normalize_url(&repository.url);
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(self.factory.open(repository))))
            .clone()
    }

    /// The handle for a URL already seen, if any.
    pub fn get(&self, url: &str) -> Option<SharedHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize_url(url))
            .cloned()
    }

    pub fn known_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        urls.sort();
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::git::{CommitIdentity, GitRepositoryFactory};
    use tempfile::tempdir;

    fn pool(root: &std::path::Path) -> RepositoryPool {
        RepositoryPool::new(Arc::new(GitRepositoryFactory::new(
            root.to_path_buf(),
            None,
            CommitIdentity {
                name: "t".into(),
                email: "t@t".into(),
            },
        )))
    }

    #[tokio::test]
    async fn test_same_url_shares_one_handle() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path());

        let a = pool.handle_for(&RepositoryRef::new("https://github.com/o/widget.git"));
        let b = pool.handle_for(&RepositoryRef::new("https://github.com/o/widget/"));
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.handle_for(&RepositoryRef::new("https://github.com/o/gadget"));
        assert!(!Arc::ptr_eq(&a, &c));
        let c_path = c.lock().await.local_path().to_path_buf();
        assert_eq!(c_path.parent(), Some(dir.path()));
        assert!(
            c_path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("gadget-")
        );
    }

    #[test]
    fn test_get_and_known_urls() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path());
        assert!(pool.get("https://github.com/o/widget").is_none());

        pool.handle_for(&RepositoryRef::new("https://github.com/o/widget.git"));
        assert!(pool.get("https://github.com/o/widget").is_some());
        assert_eq!(pool.known_urls(), vec!["https://github.com/o/widget"]);
    }
}
