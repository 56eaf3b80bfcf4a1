//! Human and JSON renderings for CLI output.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::ProjectConfig;
use crate::paths::InstallPaths;
use crate::supervisor::RunReport;

pub fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults: no .firstrun/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn join_or_none<T: AsRef<str>>(items: &[T]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let s = &config.supervisor;
    let mut output = String::new();

    output.push_str("Supervisor\n");
    push_kv(&mut output, "deadline", format!("{}s", s.deadline_secs));
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", s.poll_interval_millis),
    );
    push_kv(&mut output, "quiet_period", format!("{}s", s.quiet_secs));
    push_kv(&mut output, "stable_observations", s.stable_observations);
    push_kv(&mut output, "settle_delay", format!("{}ms", s.settle_millis));
    push_kv(
        &mut output,
        "verify_interval",
        format!("{}s", s.verify_interval_secs),
    );
    push_kv(
        &mut output,
        "max_verification_resets",
        s.max_verification_resets,
    );
    push_kv(&mut output, "grace_period", format!("{}s", s.grace_period_secs));
    output.push('\n');

    output.push_str("Readiness\n");
    push_kv(&mut output, "markers", join_or_none(&config.readiness.markers));
    output.push('\n');

    output.push_str("Layout\n");
    let candidates: Vec<String> = config
        .layout
        .candidates
        .iter()
        .map(|c| c.display().to_string())
        .collect();
    push_kv(&mut output, "candidates", join_or_none(&candidates));
    push_kv(&mut output, "launch_script", &config.layout.launch_script);
    push_kv(&mut output, "artifact", config.layout.artifact.display());
    output.push('\n');

    output.push_str("Run Log\n");
    push_kv(&mut output, "enabled", config.log.enabled);
    push_kv(&mut output, "dir", config.log.dir.display());
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let s = &config.supervisor;
    let payload = serde_json::json!({
        "supervisor": {
            "deadline_secs": s.deadline_secs,
            "poll_interval_millis": s.poll_interval_millis,
            "quiet_secs": s.quiet_secs,
            "stable_observations": s.stable_observations,
            "settle_millis": s.settle_millis,
            "verify_interval_secs": s.verify_interval_secs,
            "max_verification_resets": s.max_verification_resets,
            "grace_period_secs": s.grace_period_secs
        },
        "readiness": {
            "markers": &config.readiness.markers
        },
        "layout": {
            "candidates": &config.layout.candidates,
            "launch_script": &config.layout.launch_script,
            "artifact": &config.layout.artifact
        },
        "log": {
            "enabled": config.log.enabled,
            "dir": &config.log.dir
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn found_label(found: bool) -> &'static str {
    if found { "found" } else { "missing" }
}

pub fn render_paths_human(paths: &InstallPaths) -> String {
    let mut output = String::new();
    output.push_str("Install Layout\n");
    push_kv(&mut output, "root", paths.root.display());
    push_kv(
        &mut output,
        "base",
        format!("{} ({})", paths.base.display(), found_label(paths.base_found)),
    );
    push_kv(
        &mut output,
        "launch_script",
        format!(
            "{} ({})",
            paths.launch_script.display(),
            found_label(paths.launch_script.is_file())
        ),
    );
    push_kv(
        &mut output,
        "artifact",
        format!(
            "{} ({})",
            paths.artifact.display(),
            found_label(paths.artifact.exists())
        ),
    );
    output
}

pub fn render_paths_json(paths: &InstallPaths) -> Result<String> {
    serde_json::to_string_pretty(paths).context("failed to serialize install paths to JSON")
}

pub fn render_report(report: &RunReport) -> String {
    let mut output = String::new();
    output.push_str("First Run\n");
    push_kv(&mut output, "outcome", report.outcome);
    push_kv(&mut output, "message", &report.message);
    push_kv(
        &mut output,
        "elapsed",
        format!("{:.1}s", report.elapsed.as_secs_f64()),
    );
    if !report.launched {
        push_kv(&mut output, "launched", "no");
        return output;
    }
    if let Some(pid) = report.pid {
        push_kv(&mut output, "pid", pid);
    }
    push_kv(&mut output, "verification_resets", report.verification_resets);
    if let Some(ref t) = report.termination {
        push_kv(
            &mut output,
            "teardown",
            format!(
                "{} descendants, {} forced, {} failed",
                t.descendants.len(),
                t.forced(),
                t.failures()
            ),
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutSettings;
    use crate::process_tree::{ProcessFate, TerminationReport};
    use crate::supervisor::Outcome;
    use std::time::Duration;

    #[test]
    fn render_config_human_groups_sections() {
        let config = ProjectConfig::default();
        let rendered = render_config_human(&config, None);

        assert!(rendered.contains("Supervisor"));
        assert!(rendered.contains("Readiness"));
        assert!(rendered.contains("Layout"));
        assert!(rendered.contains("Run Log"));
        assert!(rendered.contains("300s"));
        assert!(rendered.contains("To see the GUI go to:, http://127.0.0.1:8188"));
        assert!(rendered.contains("(defaults: no .firstrun/config.toml found)"));
    }

    #[test]
    fn render_config_human_marks_empty_markers() {
        let mut config = ProjectConfig::default();
        config.readiness.markers.clear();
        let rendered = render_config_human(&config, Some(Path::new("/x/.firstrun/config.toml")));
        assert!(rendered.contains("(none)"));
        assert!(rendered.contains("/x/.firstrun/config.toml"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = ProjectConfig::default();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["supervisor"]["deadline_secs"], 300);
        assert_eq!(value["supervisor"]["poll_interval_millis"], 100);
        assert!(value["readiness"]["markers"].is_array());
        assert_eq!(value["layout"]["launch_script"], "run_nvidia_gpu.bat");
        assert_eq!(value["log"]["enabled"], true);
    }

    #[test]
    fn render_paths_reports_missing_pieces() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = InstallPaths::resolve(tmp.path(), &LayoutSettings::default());

        let human = render_paths_human(&paths);
        assert!(human.contains("missing"));
        assert!(human.contains("run_nvidia_gpu.bat"));

        let value: serde_json::Value =
            serde_json::from_str(&render_paths_json(&paths).unwrap()).unwrap();
        assert_eq!(value["base_found"], false);
        assert!(value["artifact"].as_str().unwrap().ends_with("python.exe"));
    }

    #[test]
    fn render_report_includes_teardown() {
        let report = RunReport {
            outcome: Outcome::TimedOut,
            message: "first-run initialization timed out after 300.1s".to_string(),
            elapsed: Duration::from_millis(300_100),
            launched: true,
            pid: Some(900),
            verification_resets: 0,
            termination: Some(TerminationReport {
                root: 900,
                descendants: vec![901],
                fates: vec![(901, ProcessFate::Killed), (900, ProcessFate::Stopped)],
            }),
        };
        let rendered = render_report(&report);
        assert!(rendered.contains("timed out"));
        assert!(rendered.contains("300.1s"));
        assert!(rendered.contains("1 descendants, 1 forced, 0 failed"));
    }

    #[test]
    fn render_report_for_skipped_launch() {
        let report = RunReport::not_launched(Outcome::Succeeded, "already initialized");
        let rendered = render_report(&report);
        assert!(rendered.contains("launched"));
        assert!(!rendered.contains("pid"));
    }
}
