//! Filesystem walk (§4.2 "Walk"): a bounded pool of traversal tasks
//! performing concurrent directory scans, backed by `ignore::WalkBuilder`'s
//! parallel walker — each directory yields subdirectories (scheduled as new
//! work by the walker itself) and files (dispatched to this closure, which
//! plays the role of the per-file action pool).
//!
//! The scan is restartable: a crash mid-walk loses nothing, because nothing
//! here is itself stateful — idempotency lives in the Metadata Store's
//! upserts (`upsert_location`, `record_version`), not in the walk.

use super::error::Result;
use chrono::{DateTime, Utc};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Built-in excludes applied regardless of any `.casparianignore` (§4.2:
/// "ordered gitignore-style rules plus a built-in list").
const BUILTIN_EXCLUDES: &[&str] = &["!.git/", "!__pycache__/", "!*.tmp", "!*.swp"];

pub struct ScannedFile {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Walks `root`, skipping anything the built-in excludes or a
/// `.casparianignore` at the root reject. Per-entry walk errors (permission
/// denied, a symlink loop) are absorbed and logged; they never abort the
/// walk (§4.2 "Failure model").
pub fn walk(root: &Path, threads: usize) -> Result<Vec<ScannedFile>> {
    let mut overrides = OverrideBuilder::new(root);
    for rule in BUILTIN_EXCLUDES {
        overrides.add(rule).expect("built-in exclude patterns are valid globs");
    }
    let overrides = overrides.build().expect("built-in excludes compile");

    let walker = WalkBuilder::new(root)
        .threads(threads)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .add_custom_ignore_filename(".casparianignore")
        .overrides(overrides)
        .build_parallel();

    let found: Arc<Mutex<Vec<ScannedFile>>> = Arc::new(Mutex::new(Vec::new()));
    let root = root.to_path_buf();

    walker.run(|| {
        let found = found.clone();
        let root = root.clone();
        Box::new(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "scout: walk entry error, skipping");
                    return ignore::WalkState::Continue;
                }
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "scout: could not stat entry, skipping");
                    return ignore::WalkState::Continue;
                }
            };

            if !metadata.is_file() {
                return ignore::WalkState::Continue;
            }

            let abs_path = entry.path().to_path_buf();
            let rel_path = match abs_path.strip_prefix(&root) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => return ignore::WalkState::Continue,
            };

            let mtime: DateTime<Utc> = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

            if let Ok(mut found) = found.lock() {
                found.push(ScannedFile { abs_path, rel_path, size: metadata.len(), mtime });
            }
            ignore::WalkState::Continue
        })
    });

    let found = Arc::try_unwrap(found).map(|m| m.into_inner().unwrap_or_default()).unwrap_or_default();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walk_finds_files_and_skips_builtin_excludes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), b"1,2,3").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), b"ref: refs/heads/main").unwrap();
        fs::write(dir.path().join("scratch.tmp"), b"junk").unwrap();

        let files = walk(dir.path(), 2).unwrap();
        let rel_paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(rel_paths, vec!["a.csv"]);
    }

    #[test]
    fn walk_respects_casparianignore() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".casparianignore"), b"secrets/\n").unwrap();
        fs::create_dir_all(dir.path().join("secrets")).unwrap();
        fs::write(dir.path().join("secrets").join("key.pem"), b"---").unwrap();
        fs::write(dir.path().join("public.csv"), b"1,2,3").unwrap();

        let files = walk(dir.path(), 2).unwrap();
        let rel_paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(rel_paths, vec!["public.csv"]);
    }
}
