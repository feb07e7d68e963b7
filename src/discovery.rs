//! Local weight discovery: when no model path is configured, scan the usual
//! places for `.gguf` files and pick the largest (newest breaks ties).

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size_bytes: u64,
    mtime: SystemTime,
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
}

fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(home) = std::env::var("HOME") {
        roots.push(Path::new(&home).join(".arbor").join("weights"));
    }

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    roots
}

fn collect_gguf_candidates(root: &Path, max_depth: usize, out: &mut Vec<Candidate>) {
    if max_depth < 1 {
        return;
    }
    let Ok(rd) = fs::read_dir(root) else { return };
    for entry in rd.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            if is_gguf(&path) {
                tracing::trace!(path = %path.display(), "discovery: found a gguf file");
                out.push(Candidate {
                    path,
                    size_bytes: meta.len(),
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                });
            }
        } else if meta.is_dir() {
            collect_gguf_candidates(&path, max_depth - 1, out);
        }
    }
}

pub fn choose_best_model_path() -> Option<PathBuf> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for root in candidate_roots() {
        collect_gguf_candidates(&root, 4, &mut candidates);
    }

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| match b.size_bytes.cmp(&a.size_bytes) {
        Ordering::Equal => b.mtime.cmp(&a.mtime),
        other => other,
    });

    candidates.into_iter().next().map(|c| c.path)
}
