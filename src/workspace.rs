//! Workspace isolation.
//!
//! Every dispatch receives a [`WorkspaceHandle`] by value instead of reading a
//! shared working directory. Decomposed scopes get their own handle from a
//! [`WorkspaceProvider`], which the engine treats as a black box.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, Signature, WorktreeAddOptions, WorktreePruneOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Identity of one working area: a directory plus optional branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl WorkspaceHandle {
    /// The project root, shared by non-decomposed work.
    pub fn root(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            branch: None,
            scope_id: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    NoChanges,
    Conflict,
}

/// Creates, merges and destroys isolated working areas per scope.
/// Real implementation: `GitWorktreeProvider`. Test double: `DirectoryProvider`.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(&self, parent: &WorkspaceHandle, scope_id: &str) -> Result<WorkspaceHandle>;

    async fn merge(&self, scope: &WorkspaceHandle, into: &WorkspaceHandle) -> Result<MergeOutcome>;

    async fn destroy(&self, scope: &WorkspaceHandle) -> Result<()>;
}

/// Branch + worktree per scope, backed by libgit2.
pub struct GitWorktreeProvider {
    repo_path: PathBuf,
    worktree_root: PathBuf,
}

impl GitWorktreeProvider {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        let repo_path = repo_path.into();
        let worktree_root = repo_path.join(".phasegraph").join("worktrees");
        Self {
            repo_path,
            worktree_root,
        }
    }

    pub fn with_worktree_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.worktree_root = root.into();
        self
    }
}

fn worktree_name(scope_id: &str) -> String {
    scope_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

fn current_branch(repo: &Repository) -> Result<String> {
    let head = repo.head().context("Repository has no HEAD commit")?;
    head.shorthand()
        .map(str::to_string)
        .context("HEAD is detached")
}

#[async_trait]
impl WorkspaceProvider for GitWorktreeProvider {
    async fn create(&self, parent: &WorkspaceHandle, scope_id: &str) -> Result<WorkspaceHandle> {
        let repo_path = self.repo_path.clone();
        let name = worktree_name(scope_id);
        let path = self.worktree_root.join(&name);
        let base = parent.branch.clone();
        let scope = scope_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<WorkspaceHandle> {
            let repo = Repository::open(&repo_path).context("Failed to open git repository")?;
            let base = match base {
                Some(b) => b,
                None => current_branch(&repo)?,
            };
            let base_commit = repo
                .find_branch(&base, BranchType::Local)
                .with_context(|| format!("Base branch '{}' not found", base))?
                .get()
                .peel_to_commit()?;

            let branch_name = format!("phasegraph/scope-{}", name);
            let branch = repo
                .branch(&branch_name, &base_commit, false)
                .with_context(|| format!("Failed to create branch {}", branch_name))?;

            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut opts = WorktreeAddOptions::new();
            opts.reference(Some(branch.get()));
            repo.worktree(&name, &path, Some(&opts))
                .with_context(|| format!("Failed to add worktree at {}", path.display()))?;

            info!(scope = %scope, branch = %branch_name, path = %path.display(), "workspace created");
            Ok(WorkspaceHandle {
                path,
                branch: Some(branch_name),
                scope_id: Some(scope),
            })
        })
        .await
        .context("workspace create task panicked")?
    }

    async fn merge(&self, scope: &WorkspaceHandle, into: &WorkspaceHandle) -> Result<MergeOutcome> {
        let repo_path = self.repo_path.clone();
        let source = scope
            .branch
            .clone()
            .context("Scope workspace has no branch to merge")?;
        let target = into.branch.clone();

        tokio::task::spawn_blocking(move || -> Result<MergeOutcome> {
            let repo = Repository::open(&repo_path).context("Failed to open git repository")?;
            let target = match target {
                Some(t) => t,
                None => current_branch(&repo)?,
            };
            let target_commit = repo
                .find_branch(&target, BranchType::Local)?
                .get()
                .peel_to_commit()?;
            let source_commit = repo
                .find_branch(&source, BranchType::Local)?
                .get()
                .peel_to_commit()?;

            if source_commit.id() == target_commit.id()
                || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
            {
                return Ok(MergeOutcome::NoChanges);
            }

            let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
            if index.has_conflicts() {
                warn!(source = %source, target = %target, "scope merge has conflicts");
                return Ok(MergeOutcome::Conflict);
            }

            let tree = repo.find_tree(index.write_tree_to(&repo)?)?;

            // Update the checked-out files while HEAD still names the old tip.
            if current_branch(&repo).ok().as_deref() == Some(target.as_str()) {
                repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe()))?;
            }

            let sig = Signature::now("phasegraph", "phasegraph@localhost")?;
            repo.commit(
                Some(&format!("refs/heads/{}", target)),
                &sig,
                &sig,
                &format!("[phasegraph] merge {} into {}", source, target),
                &tree,
                &[&target_commit, &source_commit],
            )?;

            info!(source = %source, target = %target, "scope merged");
            Ok(MergeOutcome::Merged)
        })
        .await
        .context("workspace merge task panicked")?
    }

    async fn destroy(&self, scope: &WorkspaceHandle) -> Result<()> {
        let repo_path = self.repo_path.clone();
        let handle = scope.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = Repository::open(&repo_path).context("Failed to open git repository")?;
            let name = handle
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .context("Workspace path has no name")?;

            if let Ok(worktree) = repo.find_worktree(name) {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true).working_tree(true);
                worktree.prune(Some(&mut opts))?;
            }
            if handle.path.exists() {
                std::fs::remove_dir_all(&handle.path)?;
            }
            debug!(path = %handle.path.display(), "workspace destroyed");
            Ok(())
        })
        .await
        .context("workspace destroy task panicked")?
    }
}

/// Plain directories under `<root>/.scopes`; merge copies files back.
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0;
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl WorkspaceProvider for DirectoryProvider {
    async fn create(&self, _parent: &WorkspaceHandle, scope_id: &str) -> Result<WorkspaceHandle> {
        let path = self.root.join(".scopes").join(worktree_name(scope_id));
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(WorkspaceHandle {
            path,
            branch: None,
            scope_id: Some(scope_id.to_string()),
        })
    }

    async fn merge(&self, scope: &WorkspaceHandle, into: &WorkspaceHandle) -> Result<MergeOutcome> {
        let from = scope.path.clone();
        let to = into.path.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .context("workspace merge task panicked")??;
        Ok(if copied == 0 {
            MergeOutcome::NoChanges
        } else {
            MergeOutcome::Merged
        })
    }

    async fn destroy(&self, scope: &WorkspaceHandle) -> Result<()> {
        if tokio::fs::try_exists(&scope.path).await? {
            tokio::fs::remove_dir_all(&scope.path).await?;
        }
        Ok(())
    }
}
