//! In-memory doubles for the repository handle and the analysis service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fixloop::analysis::{ProposalDraft, ProposalRequester};
use fixloop::errors::FixError;
use fixloop::extract::{ErrorCandidate, Extractor};
use fixloop::lifecycle::{
    DedupPolicy, InMemoryStore, Orchestrator, OrchestratorSettings, RepositoryRef,
};
use fixloop::repo::{RepositoryFactory, RepositoryHandle, RepositoryPool};
use tokio_util::sync::CancellationToken;

pub const REPO_URL: &str = "https://github.com/acme/widget.git";

/// How a scripted operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unavailable,
    PushRejected,
    Auth,
    Corrupt,
    /// Never completes; only a timeout or cancellation ends it.
    Hang,
}

impl Failure {
    async fn raise<T>(self, op: &str, url: &str) -> Result<T, FixError> {
        let err = match self {
            Failure::Hang => return std::future::pending::<Result<T, FixError>>().await,
            Failure::Unavailable => FixError::RepositoryUnavailable {
                url: url.to_string(),
                reason: format!("{} failed: connection reset", op),
            },
            Failure::PushRejected => FixError::PushRejected {
                branch: op.to_string(),
                reason: "non-fast-forward".to_string(),
            },
            Failure::Auth => FixError::AuthenticationFailed {
                reason: "bad credentials".to_string(),
            },
            Failure::Corrupt => FixError::WorkingCopyCorrupt {
                path: PathBuf::from("/tmp/widget"),
                reason: "index locked".to_string(),
            },
        };
        Err(err)
    }
}

/// Everything the doubles record, shared between the test and every handle.
#[derive(Debug, Default)]
pub struct RepoState {
    /// Content of the default branch.
    pub files: HashMap<String, String>,
    /// Committed content per local branch.
    pub branches: HashMap<String, HashMap<String, String>>,
    pub pushed: Vec<String>,
    /// Operation log, `op:branch`.
    pub ops: Vec<String>,
    pub failures: HashMap<&'static str, Failure>,
    pub ensure_calls: usize,
    pub commits: usize,
    /// Latest commit id per branch.
    pub heads: HashMap<String, String>,
    /// Applies currently between `create_branch` and `restore_default`.
    pub active: usize,
    pub max_active: usize,
    pub opened: usize,
    /// Cancelled from inside `push`, just before it succeeds.
    pub cancel_on_push: Option<CancellationToken>,
}

pub type SharedRepoState = Arc<Mutex<RepoState>>;

pub fn repo_state(files: &[(&str, &str)]) -> SharedRepoState {
    let state = RepoState {
        files: files
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..RepoState::default()
    };
    Arc::new(Mutex::new(state))
}

pub fn fail(state: &SharedRepoState, op: &'static str, failure: Failure) {
    state.lock().unwrap().failures.insert(op, failure);
}

pub fn clear_failures(state: &SharedRepoState) {
    state.lock().unwrap().failures.clear();
}

pub struct MockRepository {
    url: String,
    path: PathBuf,
    state: SharedRepoState,
    current: Option<String>,
    staged: HashMap<String, String>,
    step_delay: Duration,
}

impl MockRepository {
    fn failure(&self, op: &'static str) -> Option<Failure> {
        self.state.lock().unwrap().failures.get(op).copied()
    }

    fn log(&self, op: &str) {
        let branch = self.current.clone().unwrap_or_default();
        self.state.lock().unwrap().ops.push(format!("{}:{}", op, branch));
    }
}

#[async_trait]
impl RepositoryHandle for MockRepository {
    fn url(&self) -> &str {
        &self.url
    }

    fn local_path(&self) -> &Path {
        &self.path
    }

    fn default_branch(&self) -> &str {
        "main"
    }

    async fn ensure_local(&mut self) -> Result<(), FixError> {
        self.state.lock().unwrap().ensure_calls += 1;
        if let Some(f) = self.failure("ensure_local") {
            return f.raise("ensure_local", &self.url).await;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, FixError> {
        Ok(self.state.lock().unwrap().files.get(path).cloned())
    }

    async fn create_branch(&mut self, name: &str) -> Result<(), FixError> {
        {
            let mut state = self.state.lock().unwrap();
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
        }
        if let Some(f) = self.failure("create_branch") {
            return f.raise("create_branch", &self.url).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.branches.contains_key(name) {
            return Err(FixError::BranchAlreadyExists {
                branch: name.to_string(),
            });
        }
        let base = state.files.clone();
        state.branches.insert(name.to_string(), base);
        state.ops.push(format!("create_branch:{}", name));
        drop(state);
        self.current = Some(name.to_string());
        Ok(())
    }

    async fn checkout_branch(&mut self, name: &str) -> Result<(), FixError> {
        if !self.state.lock().unwrap().branches.contains_key(name) {
            return Err(FixError::RepositoryUnavailable {
                url: self.url.clone(),
                reason: format!("no branch {}", name),
            });
        }
        self.current = Some(name.to_string());
        self.log("checkout_branch");
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), FixError> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        if let Some(f) = self.failure("write_file") {
            return f.raise("write_file", &self.url).await;
        }
        if path.starts_with('/') || path.split('/').any(|part| part == "..") {
            return Err(FixError::PathOutsideRepository {
                path: path.to_string(),
            });
        }
        self.staged.insert(path.to_string(), content.to_string());
        self.log("write_file");
        Ok(())
    }

    async fn commit(&mut self, _message: &str) -> Result<String, FixError> {
        if let Some(f) = self.failure("commit") {
            return f.raise("commit", &self.url).await;
        }
        let branch = self.current.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        let tree = state.branches.entry(branch.clone()).or_default();
        let changed = self
            .staged
            .iter()
            .any(|(path, content)| tree.get(path) != Some(content));
        if !changed {
            self.staged.clear();
            return Err(FixError::NothingToCommit);
        }
        tree.extend(self.staged.drain());
        state.commits += 1;
        let id = format!("{:040x}", state.commits);
        state.heads.insert(branch.clone(), id.clone());
        state.ops.push(format!("commit:{}", branch));
        Ok(id)
    }

    async fn head_commit(&self) -> Result<String, FixError> {
        let branch = self.current.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .heads
            .get(&branch)
            .cloned()
            .ok_or_else(|| FixError::WorkingCopyCorrupt {
                path: self.path.clone(),
                reason: format!("no commits on {}", branch),
            })
    }

    async fn push(&mut self, branch: &str) -> Result<(), FixError> {
        if let Some(f) = self.failure("push") {
            return f.raise(branch, &self.url).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(token) = &state.cancel_on_push {
            token.cancel();
        }
        state.pushed.push(branch.to_string());
        state.ops.push(format!("push:{}", branch));
        Ok(())
    }

    async fn restore_default(&mut self) -> Result<(), FixError> {
        self.log("restore_default");
        self.current = None;
        self.staged.clear();
        let mut state = self.state.lock().unwrap();
        state.active = state.active.saturating_sub(1);
        Ok(())
    }
}

pub struct MockFactory {
    pub state: SharedRepoState,
    pub step_delay: Duration,
}

impl RepositoryFactory for MockFactory {
    fn open(&self, repository: &RepositoryRef) -> Box<dyn RepositoryHandle> {
        self.state.lock().unwrap().opened += 1;
        Box::new(MockRepository {
            url: repository.url.clone(),
            path: PathBuf::from("/tmp/fixloop-mock/widget"),
            state: self.state.clone(),
            current: None,
            staged: HashMap::new(),
            step_delay: self.step_delay,
        })
    }
}

/// What the scripted analysis service answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Draft(ProposalDraft),
    Unavailable,
    Malformed,
    Hang,
}

pub struct MockRequester {
    pub reply: Mutex<Reply>,
    pub calls: Mutex<Vec<String>>,
}

impl MockRequester {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Source context passed on the most recent call.
    pub fn last_context(&self) -> Option<String> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProposalRequester for MockRequester {
    async fn request_proposal(
        &self,
        _candidate: &ErrorCandidate,
        source_context: &str,
    ) -> Result<ProposalDraft, FixError> {
        self.calls.lock().unwrap().push(source_context.to_string());
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Draft(draft) => Ok(draft),
            Reply::Unavailable => Err(FixError::AnalysisUnavailable(
                "service error (503 Service Unavailable)".to_string(),
            )),
            Reply::Malformed => Err(FixError::MalformedProposal(
                "reply has no fixed_code".to_string(),
            )),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn draft(patched: &str) -> ProposalDraft {
    ProposalDraft {
        explanation: "data has no key 'x'".to_string(),
        suggested_fix: Some("use dict.get".to_string()),
        patched_content: patched.to_string(),
        target_file: None,
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        network_timeout: Duration::from_millis(200),
        ..OrchestratorSettings::default()
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub repo: SharedRepoState,
    pub requester: Arc<MockRequester>,
}

pub fn harness(files: &[(&str, &str)], reply: Reply, settings: OrchestratorSettings) -> Harness {
    harness_with_delay(files, reply, settings, Duration::ZERO)
}

pub fn harness_with_delay(
    files: &[(&str, &str)],
    reply: Reply,
    settings: OrchestratorSettings,
    step_delay: Duration,
) -> Harness {
    let repo = repo_state(files);
    let requester = MockRequester::new(reply);
    let factory = MockFactory {
        state: repo.clone(),
        step_delay,
    };
    let orchestrator = Orchestrator::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(RepositoryPool::new(Arc::new(factory))),
        requester.clone(),
        Extractor::default(),
        settings,
    );
    Harness {
        orchestrator: Arc::new(orchestrator),
        repo,
        requester,
    }
}

pub fn with_dedup(policy: DedupPolicy) -> OrchestratorSettings {
    OrchestratorSettings {
        dedup: policy,
        ..settings()
    }
}

pub fn repository() -> RepositoryRef {
    RepositoryRef::new(REPO_URL)
}

pub fn candidate(file: Option<&str>) -> ErrorCandidate {
    ErrorCandidate::new(
        file.map(str::to_string),
        file.map(|_| 1),
        "KeyError: 'x'",
        "Traceback (most recent call last):\nKeyError: 'x'",
    )
}

pub const TRACEBACK_LOG: &str = "2024-05-01 12:00:00 INFO starting worker
Traceback (most recent call last):
  File \"app.py\", line 1, in <module>
    print(data['x'])
KeyError: 'x'
2024-05-01 12:00:01 INFO worker exited
";
