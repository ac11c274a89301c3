use std::env;
use std::path::PathBuf;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=HAGENT_BUILD_ID_OVERRIDE");
    for watched in git_watch_paths() {
        println!("cargo:rerun-if-changed={}", watched.display());
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git(&["describe", "--tags", "--dirty", "--always"])
        .unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("HAGENT_BUILD_ID_OVERRIDE")
        .unwrap_or_else(|_| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=HAGENT_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=HAGENT_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=HAGENT_BUILD_GIT={}", git_label);
}

/// HEAD plus the ref it points at, resolved through git itself so the
/// script works from any member directory of the workspace.
fn git_watch_paths() -> Vec<PathBuf> {
    let Some(git_dir) = git(&["rev-parse", "--git-dir"]).map(PathBuf::from) else {
        return Vec::new();
    };
    let mut paths = vec![git_dir.join("HEAD")];
    if let Some(head_ref) = git(&["symbolic-ref", "-q", "HEAD"]) {
        let ref_path = git_dir.join(head_ref);
        if ref_path.exists() {
            paths.push(ref_path);
        }
    }
    paths
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
