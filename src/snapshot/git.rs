//! git2-backed implementation of the [`VersionControl`] port.
//!
//! `git2::Repository` holds raw libgit2 pointers and is not `Sync`, so the
//! backend stores the repository path and opens a fresh handle inside each
//! call. Opening an already-discovered repository is cheap, and it keeps
//! the backend shareable across supervisor tasks.

use anyhow::{Context, Result, anyhow};
use git2::{BranchType, Delta, DiffOptions, Repository};
use std::path::{Path, PathBuf};

use super::{DiffEntry, DiffStat, DiffStatus, VersionControl};

pub struct GitBackend {
    repo_path: PathBuf,
    workdir: PathBuf,
}

impl GitBackend {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| anyhow!("Repository has no working tree"))?
            .to_path_buf();
        Ok(Self {
            repo_path: project_dir.to_path_buf(),
            workdir,
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.repo_path).context("Failed to open git repository")
    }

    fn head_commit(repo: &Repository) -> Result<git2::Commit<'_>> {
        repo.head()
            .context("Failed to resolve HEAD")?
            .peel_to_commit()
            .context("HEAD does not point at a commit")
    }

    fn branch_tree<'r>(repo: &'r Repository, name: &str) -> Result<git2::Tree<'r>> {
        repo.find_branch(name, BranchType::Local)
            .with_context(|| format!("No local branch {}", name))?
            .get()
            .peel_to_tree()
            .with_context(|| format!("Branch {} does not point at a tree", name))
    }

    fn diff_from_branch<'r>(repo: &'r Repository, name: &str) -> Result<git2::Diff<'r>> {
        let tree = Self::branch_tree(repo, name)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))
            .context("Failed to diff snapshot against working tree")
    }
}

impl VersionControl for GitBackend {
    fn rev_parse_head(&self) -> Result<String> {
        let repo = self.repo()?;
        Ok(Self::head_commit(&repo)?.id().to_string())
    }

    fn branch_create(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let head = Self::head_commit(&repo)?;
        repo.branch(name, &head, true)
            .with_context(|| format!("Failed to create branch {}", name))?;
        Ok(())
    }

    fn branch_delete(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        match repo.find_branch(name, BranchType::Local) {
            Ok(mut branch) => {
                branch
                    .delete()
                    .with_context(|| format!("Failed to delete branch {}", name))?;
                Ok(true)
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to look up branch {}", name)),
        }
    }

    fn branch_list(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut names = Vec::new();
        for entry in repo
            .branches(Some(BranchType::Local))
            .context("Failed to list branches")?
        {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn diff_name_only(&self, ref_name: &str) -> Result<Vec<DiffEntry>> {
        let repo = self.repo()?;
        let diff = Self::diff_from_branch(&repo, ref_name)?;
        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path());
            let Some(path) = path else { continue };
            let status = match delta.status() {
                Delta::Added | Delta::Untracked => DiffStatus::Added,
                Delta::Modified | Delta::Renamed | Delta::Typechange => DiffStatus::Modified,
                Delta::Deleted => DiffStatus::Deleted,
                _ => continue,
            };
            entries.push(DiffEntry {
                path: path.to_string_lossy().to_string(),
                status,
            });
        }
        Ok(entries)
    }

    fn diff_numstat(&self, ref_name: &str) -> Result<Vec<DiffStat>> {
        let repo = self.repo()?;
        let diff = Self::diff_from_branch(&repo, ref_name)?;
        let mut stats = Vec::new();
        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_string_lossy().to_string();

            let mut lines_added = 0u32;
            let mut lines_removed = 0u32;
            if let Ok(Some(mut patch)) = git2::Patch::from_diff(&diff, idx) {
                patch
                    .print(&mut |_delta, _hunk, line| {
                        match line.origin() {
                            '+' => lines_added += 1,
                            '-' => lines_removed += 1,
                            _ => {}
                        }
                        true
                    })
                    .ok();
            }
            stats.push(DiffStat {
                path,
                lines_added,
                lines_removed,
            });
        }
        Ok(stats)
    }

    fn checkout_path_from_ref(&self, ref_name: &str, path: &str) -> Result<()> {
        let repo = self.repo()?;
        let tree = Self::branch_tree(&repo, ref_name)?;
        let entry = tree
            .get_path(Path::new(path))
            .with_context(|| format!("Path {} not present in {}", path, ref_name))?;
        let blob = repo
            .find_blob(entry.id())
            .with_context(|| format!("Object for {} is not a blob", path))?;

        let target = self.workdir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directories for {}", path))?;
        }
        std::fs::write(&target, blob.content())
            .with_context(|| format!("Failed to restore {}", path))?;
        Ok(())
    }

    fn remove_path(&self, path: &str) -> Result<()> {
        let target = self.workdir.join(path);
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitBackend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        drop(repo);
        commit_file(dir.path(), "README.md", "hello\n", "init");
        let backend = GitBackend::open(dir.path()).unwrap();
        (backend, dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        let file_path = dir.join(name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&file_path, content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn backend_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GitBackend>();
    }

    #[test]
    fn rev_parse_head_returns_full_sha() {
        let (backend, _dir) = setup_repo();
        assert_eq!(backend.rev_parse_head().unwrap().len(), 40);
    }

    #[test]
    fn branch_create_is_forced() {
        let (backend, dir) = setup_repo();
        backend.branch_create("swarm/f1").unwrap();
        commit_file(dir.path(), "more.txt", "x\n", "second");
        // Re-create at the new HEAD without error
        backend.branch_create("swarm/f1").unwrap();
        let branches = backend.branch_list("swarm/").unwrap();
        assert_eq!(branches, vec!["swarm/f1"]);
    }

    #[test]
    fn branch_delete_is_idempotent() {
        let (backend, _dir) = setup_repo();
        backend.branch_create("swarm/f1").unwrap();
        assert!(backend.branch_delete("swarm/f1").unwrap());
        assert!(!backend.branch_delete("swarm/f1").unwrap());
    }

    #[test]
    fn diff_detects_modified_and_added() {
        let (backend, dir) = setup_repo();
        backend.branch_create("swarm/f1").unwrap();
        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        fs::write(dir.path().join("new.txt"), "fresh\n").unwrap();

        let entries = backend.diff_name_only("swarm/f1").unwrap();
        let modified = entries
            .iter()
            .find(|e| e.path == "README.md")
            .expect("README.md in diff");
        assert_eq!(modified.status, DiffStatus::Modified);
        let added = entries
            .iter()
            .find(|e| e.path == "new.txt")
            .expect("new.txt in diff");
        assert_eq!(added.status, DiffStatus::Added);
    }

    #[test]
    fn numstat_counts_added_and_removed_lines() {
        let (backend, dir) = setup_repo();
        commit_file(dir.path(), "code.txt", "one\ntwo\nthree\n", "add code");
        backend.branch_create("swarm/f1").unwrap();
        // Replace one line and append two more
        fs::write(dir.path().join("code.txt"), "one\nTWO\nthree\nfour\nfive\n").unwrap();

        let stats = backend.diff_numstat("swarm/f1").unwrap();
        let code = stats
            .iter()
            .find(|s| s.path == "code.txt")
            .expect("code.txt in numstat");
        assert_eq!(code.lines_added, 3);
        assert_eq!(code.lines_removed, 1);
    }

    #[test]
    fn checkout_path_restores_snapshot_content() {
        let (backend, dir) = setup_repo();
        backend.branch_create("swarm/f1").unwrap();
        fs::write(dir.path().join("README.md"), "mangled\n").unwrap();

        backend
            .checkout_path_from_ref("swarm/f1", "README.md")
            .unwrap();
        let content = fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn remove_path_tolerates_missing_files() {
        let (backend, dir) = setup_repo();
        fs::write(dir.path().join("junk.txt"), "x").unwrap();
        backend.remove_path("junk.txt").unwrap();
        assert!(!dir.path().join("junk.txt").exists());
        // Already gone: still fine
        backend.remove_path("junk.txt").unwrap();
    }
}
