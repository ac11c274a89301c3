use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hagent_wire::protocol::{Component, LifecycleAction};
use tracing::{debug, warn};

use super::ComponentLifecycle;

/// Longest script output echoed back to the client.
const OUTPUT_SNIPPET_LIMIT: usize = 512;

/// Runs `<scripts_dir>/<component>/<action> [args...]` and reports how it went.
#[derive(Debug, Clone)]
pub struct ScriptLifecycle {
    scripts_dir: PathBuf,
}

impl ScriptLifecycle {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn script_path(&self, component: Component, action: LifecycleAction) -> PathBuf {
        self.scripts_dir.join(component.id()).join(action.name())
    }
}

impl ComponentLifecycle for ScriptLifecycle {
    fn component_action(
        &self,
        component: Component,
        action: LifecycleAction,
        args: &[&str],
    ) -> String {
        let script = self.script_path(component, action);
        if !script.is_file() {
            return format!("No {action} script for {component}.\n");
        }

        debug!(script = %script.display(), ?args, "running lifecycle script");
        let output = Command::new(&script)
            .args(args)
            .env("HAGENT_COMPONENT", component.id())
            .env("HAGENT_ACTION", action.name())
            .current_dir(script.parent().unwrap_or_else(|| Path::new("/")))
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let mut status = format!("{component} {action} succeeded.\n");
                push_snippet(&mut status, &output.stdout);
                status
            }
            Ok(output) => {
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"));
                warn!(component = component.id(), action = action.name(), %code, "lifecycle script failed");
                let mut status = format!("{component} {action} failed ({code}).\n");
                let detail = if output.stderr.is_empty() {
                    &output.stdout
                } else {
                    &output.stderr
                };
                push_snippet(&mut status, detail);
                status
            }
            Err(err) => {
                warn!(script = %script.display(), %err, "could not run lifecycle script");
                format!("Could not run {action} script for {component}: {err}\n")
            }
        }
    }
}

fn push_snippet(status: &mut String, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let mut end = text.len().min(OUTPUT_SNIPPET_LIMIT);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    status.push_str(&text[..end]);
    if end < text.len() {
        status.push_str("...");
    }
    status.push('\n');
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(root: &Path, component: Component, action: LifecycleAction, body: &str) {
        let dir = root.join(component.id());
        fs::create_dir_all(&dir).expect("script dir");
        let path = dir.join(action.name());
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[test]
    fn missing_script_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lifecycle = ScriptLifecycle::new(dir.path());
        assert_eq!(
            lifecycle.component_action(Component::Kafka, LifecycleAction::Stop, &[]),
            "No stop script for Kafka.\n"
        );
    }

    #[test]
    fn success_echoes_output_and_passes_args() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(
            dir.path(),
            Component::Hdfs,
            LifecycleAction::Start,
            r#"echo "started $HAGENT_COMPONENT with $1""#,
        );
        let lifecycle = ScriptLifecycle::new(dir.path());
        assert_eq!(
            lifecycle.component_action(Component::Hdfs, LifecycleAction::Start, &["namenode"]),
            "HDFS start succeeded.\nstarted hdfs with namenode\n"
        );
    }

    #[test]
    fn failure_reports_exit_code_and_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(
            dir.path(),
            Component::Spark,
            LifecycleAction::Install,
            "echo 'disk full' >&2; exit 3",
        );
        let lifecycle = ScriptLifecycle::new(dir.path());
        assert_eq!(
            lifecycle.component_action(Component::Spark, LifecycleAction::Install, &[]),
            "Spark install failed (exit code 3).\ndisk full\n"
        );
    }

    #[test]
    fn long_output_is_cut() {
        let mut status = String::new();
        push_snippet(&mut status, "é".repeat(400).as_bytes());
        assert!(status.ends_with("...\n"));
        assert!(status.len() <= OUTPUT_SNIPPET_LIMIT + 4);
    }
}
