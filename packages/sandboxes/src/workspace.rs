// ABOUTME: Temporary execution workspace for the container tier
// ABOUTME: Stages sources, composes the container script, parses results, and collects artifacts

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SandboxError};
use crate::profiles::LanguageProfile;
use crate::types::Artifact;
use crate::validation::CodeSubmission;

pub const OUTPUT_FILE: &str = ".runbox-output.log";
pub const FAILURE_FILE: &str = ".runbox-failure.json";
const EXIT_CODE_FILE: &str = ".runbox-exit";

/// Artifacts larger than this are listed without content
pub const MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;
/// Most artifacts returned from one run
pub const MAX_ARTIFACTS: usize = 64;
/// Most artifact content, in bytes, returned from one run
pub const MAX_TOTAL_ARTIFACT_BYTES: u64 = 8 * 1024 * 1024;

/// Dependency and build caches written by installers and compilers
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "target",
    "vendor",
    ".git",
    ".cache",
    ".npm",
    ".bundle",
    ".pytest_cache",
];

/// Files collected from a workspace after a run
#[derive(Debug, Default, PartialEq)]
pub struct CollectedArtifacts {
    pub artifacts: Vec<Artifact>,
    /// True when a count or size cap dropped files
    pub truncated: bool,
}

/// Host directory staged for one container execution
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    known_files: HashSet<String>,
}

impl Workspace {
    /// Create a temporary directory and write the submission into it
    pub fn stage(submission: &CodeSubmission, profile: &LanguageProfile) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("runbox-").tempdir()?;
        let path = dir.path().to_path_buf();
        let mut known_files = HashSet::new();

        // The container user is not the host user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))?;
        }

        let source = profile.source_file();
        std::fs::write(path.join(&source), &submission.code)?;
        known_files.insert(source);

        if let (Some(tests), Some(test_file)) = (&submission.tests, &profile.test_file) {
            std::fs::write(path.join(test_file), tests)?;
            known_files.insert(test_file.clone());
        }

        if let (Some(deps), Some(manifest)) = (&submission.dependencies, &profile.manifest_file) {
            std::fs::write(path.join(manifest), deps)?;
            known_files.insert(manifest.clone());
        }

        for name in [OUTPUT_FILE, FAILURE_FILE, EXIT_CODE_FILE] {
            known_files.insert(name.to_string());
        }

        debug!("Staged workspace at {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            known_files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the captured program output
    pub fn read_output(&self) -> String {
        std::fs::read_to_string(self.path.join(OUTPUT_FILE)).unwrap_or_default()
    }

    /// Exit code recorded by the failure marker, if the program failed
    pub fn read_failure(&self) -> Option<i64> {
        #[derive(Deserialize)]
        struct FailureMarker {
            exit_code: i64,
        }

        let contents = std::fs::read_to_string(self.path.join(FAILURE_FILE)).ok()?;
        match serde_json::from_str::<FailureMarker>(&contents) {
            Ok(marker) => Some(marker.exit_code),
            Err(e) => {
                warn!("Malformed failure marker: {}", e);
                Some(-1)
            }
        }
    }

    /// Files produced by the run beyond the staged inputs and marker files.
    ///
    /// Dependency and cache directories are skipped. Collection stops at
    /// [`MAX_ARTIFACTS`] files; once [`MAX_TOTAL_ARTIFACT_BYTES`] of content
    /// is used, remaining files are listed without content.
    pub fn collect_artifacts(&self) -> CollectedArtifacts {
        let mut files: Vec<(String, PathBuf, u64)> = WalkDir::new(&self.path)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && is_ignored_dir(e.file_name())))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.path).ok()?;
                let name = relative.to_string_lossy().replace('\\', "/");
                if self.known_files.contains(&name) {
                    return None;
                }
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some((name, entry.into_path(), size_bytes))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut collected = CollectedArtifacts::default();
        if files.len() > MAX_ARTIFACTS {
            debug!(
                "Workspace produced {} files, keeping the first {}",
                files.len(),
                MAX_ARTIFACTS
            );
            files.truncate(MAX_ARTIFACTS);
            collected.truncated = true;
        }

        let mut budget = MAX_TOTAL_ARTIFACT_BYTES;
        for (name, path, size_bytes) in files {
            let fits = size_bytes <= MAX_ARTIFACT_BYTES && size_bytes <= budget;
            if size_bytes <= MAX_ARTIFACT_BYTES && !fits {
                collected.truncated = true;
            }
            let content_base64 = if fits {
                budget -= size_bytes;
                std::fs::read(&path).ok().map(|bytes| STANDARD.encode(bytes))
            } else {
                None
            };

            collected.artifacts.push(Artifact {
                name,
                size_bytes,
                content_base64,
                truncated: !fits,
            });
        }

        collected
    }

    /// Delete the directory now
    pub fn remove(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove workspace {}: {}", self.path.display(), e);
            }
        }
    }
}

fn is_ignored_dir(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Compose the single `sh -c` script run inside the container.
///
/// Output is teed into the output file so it both streams as container logs
/// and survives for parsing. A non-zero exit writes the failure marker.
pub fn compose_script(submission: &CodeSubmission, profile: &LanguageProfile) -> Result<String> {
    let mut steps: Vec<String> = profile.setup_commands.clone();

    if submission.dependencies.is_some() {
        if let Some(install) = &profile.install_command {
            steps.push(install.clone());
        }
    }

    let main = if submission.tests.is_some() {
        profile.test_command().ok_or_else(|| {
            SandboxError::Validation(format!(
                "language '{}' does not support tests",
                profile.id
            ))
        })?
    } else {
        profile.run_command()
    };
    steps.push(main);

    Ok(format!(
        "cd {mount} && {{ ( {steps} ) 2>&1; echo $? > {exit}; }} | tee {out}; \
         code=$(cat {exit} 2>/dev/null || echo 1); \
         if [ \"$code\" != \"0\" ]; then printf '{{\"success\":false,\"exit_code\":%s}}' \"$code\" > {fail}; fi; \
         exit $code",
        mount = crate::container::WORKSPACE_MOUNT,
        steps = steps.join(" && "),
        exit = EXIT_CODE_FILE,
        out = OUTPUT_FILE,
        fail = FAILURE_FILE,
    ))
}

/// Interpretation of a finished container run
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResult {
    pub success: bool,
    pub value: Value,
    pub error: Option<String>,
}

/// Decide the outcome of a container run.
///
/// The failure marker wins. Otherwise output that parses as JSON is the
/// value, and an object's boolean `success` field decides the outcome.
/// Anything else falls back to the raw output with success taken from the
/// exit code.
pub fn parse_result(output: &str, failure: Option<i64>, exit_code: Option<i64>) -> ParsedResult {
    let trimmed = output.trim();

    if let Some(code) = failure {
        return ParsedResult {
            success: false,
            value: Value::String(trimmed.to_string()),
            error: Some(format!("process exited with code {}", code)),
        };
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
            let success = value
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let error = if success {
                None
            } else {
                Some(
                    value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("program reported failure")
                        .to_string(),
                )
            };
            ParsedResult {
                success,
                value,
                error,
            }
        }
        Err(e) => {
            let unparsable = SandboxError::ResultUnparsable(e.to_string());
            debug!("{}; using raw output", unparsable);

            let code = exit_code.unwrap_or(0);
            ParsedResult {
                success: code == 0,
                value: Value::String(trimmed.to_string()),
                error: (code != 0).then(|| format!("process exited with code {}", code)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::LanguageProfiles;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn submission(tests: Option<&str>, deps: Option<&str>) -> CodeSubmission {
        CodeSubmission {
            language: "python".to_string(),
            code: "print('hi')".to_string(),
            tests: tests.map(String::from),
            dependencies: deps.map(String::from),
            inputs: json!({}),
        }
    }

    fn python() -> LanguageProfile {
        LanguageProfiles::builtin()
            .unwrap()
            .resolve("python")
            .unwrap()
            .clone()
    }

    #[test]
    fn test_stage_writes_inputs_and_cleans_up() {
        let ws = Workspace::stage(&submission(Some("assert True"), Some("requests")), &python())
            .unwrap();
        let path = ws.path().to_path_buf();

        assert_eq!(std::fs::read_to_string(path.join("main.py")).unwrap(), "print('hi')");
        assert!(path.join("test_main.py").exists());
        assert!(path.join("requirements.txt").exists());

        ws.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_workspace() {
        let path = {
            let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_artifacts_exclude_known_files() {
        let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
        std::fs::write(ws.path().join(OUTPUT_FILE), "log").unwrap();
        std::fs::create_dir(ws.path().join("out")).unwrap();
        std::fs::write(ws.path().join("out/report.txt"), "hello").unwrap();

        let collected = ws.collect_artifacts();
        let artifacts = collected.artifacts;

        assert!(!collected.truncated);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "out/report.txt");
        assert_eq!(artifacts[0].size_bytes, 5);
        assert_eq!(artifacts[0].content_base64.as_deref(), Some("aGVsbG8="));
        assert!(!artifacts[0].truncated);
    }

    #[test]
    fn test_artifacts_skip_dependency_directories() {
        let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
        for dir in ["node_modules/left-pad", "__pycache__", "target/release"] {
            std::fs::create_dir_all(ws.path().join(dir)).unwrap();
        }
        std::fs::write(ws.path().join("node_modules/x.js"), "module.exports = 1").unwrap();
        std::fs::write(ws.path().join("node_modules/left-pad/index.js"), "x").unwrap();
        std::fs::write(ws.path().join("__pycache__/main.cpython-312.pyc"), "x").unwrap();
        std::fs::write(ws.path().join("target/release/main"), "x").unwrap();
        std::fs::write(ws.path().join("chart.svg"), "<svg/>").unwrap();

        let collected = ws.collect_artifacts();
        let names: Vec<_> = collected.artifacts.iter().map(|a| a.name.as_str()).collect();

        assert_eq!(names, vec!["chart.svg"]);
        assert!(!collected.truncated);
    }

    #[test]
    fn test_artifact_count_is_capped() {
        let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
        for i in 0..MAX_ARTIFACTS + 5 {
            std::fs::write(ws.path().join(format!("out-{:03}.txt", i)), "x").unwrap();
        }

        let collected = ws.collect_artifacts();

        assert!(collected.truncated);
        assert_eq!(collected.artifacts.len(), MAX_ARTIFACTS);
        assert_eq!(collected.artifacts[0].name, "out-000.txt");
    }

    #[test]
    fn test_artifact_total_size_is_capped() {
        let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
        let chunk = vec![b'a'; MAX_ARTIFACT_BYTES as usize];
        let files = (MAX_TOTAL_ARTIFACT_BYTES / MAX_ARTIFACT_BYTES) as usize + 1;
        for i in 0..files {
            std::fs::write(ws.path().join(format!("blob-{:02}.bin", i)), &chunk).unwrap();
        }

        let collected = ws.collect_artifacts();

        assert!(collected.truncated);
        assert_eq!(collected.artifacts.len(), files);
        let last = collected.artifacts.last().unwrap();
        assert!(last.truncated);
        assert!(last.content_base64.is_none());
        assert!(collected.artifacts[0].content_base64.is_some());
    }

    #[test]
    fn test_failure_marker_is_read() {
        let ws = Workspace::stage(&submission(None, None), &python()).unwrap();
        assert_eq!(ws.read_failure(), None);

        std::fs::write(
            ws.path().join(FAILURE_FILE),
            r#"{"success":false,"exit_code":3}"#,
        )
        .unwrap();
        assert_eq!(ws.read_failure(), Some(3));
    }

    #[test]
    fn test_script_runs_program() {
        let script = compose_script(&submission(None, None), &python()).unwrap();
        assert!(script.starts_with("cd /workspace && { ( python main.py ) 2>&1;"));
        assert!(script.contains("tee .runbox-output.log"));
        assert!(script.contains(".runbox-failure.json"));
    }

    #[test]
    fn test_script_installs_and_tests() {
        let script =
            compose_script(&submission(Some("assert True"), Some("requests")), &python()).unwrap();
        assert!(script.contains(
            "( pip install --quiet -r requirements.txt && python -m unittest test_main.py )"
        ));
    }

    #[test]
    fn test_go_dependencies_are_fetched_from_manifest() {
        let go = LanguageProfiles::builtin()
            .unwrap()
            .resolve("go")
            .unwrap()
            .clone();
        let mut sub = submission(None, Some("github.com/google/uuid@v1.6.0\n"));
        sub.language = "go".to_string();

        let ws = Workspace::stage(&sub, &go).unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("go.deps")).unwrap(),
            "github.com/google/uuid@v1.6.0\n"
        );

        let script = compose_script(&sub, &go).unwrap();
        assert!(script.contains("xargs -r go get < go.deps && go mod tidy && go run main.go"));
    }

    #[test]
    fn test_script_rejects_tests_without_test_command() {
        let bash = LanguageProfiles::builtin()
            .unwrap()
            .resolve("bash")
            .unwrap()
            .clone();
        assert!(compose_script(&submission(Some("x"), None), &bash).is_err());
    }

    #[rstest]
    #[case("", Some(2), Some(2), false, Some("process exited with code 2"))]
    #[case(r#"{"answer": 42}"#, None, Some(0), true, None)]
    #[case(r#"{"success": false, "error": "bad input"}"#, None, Some(0), false, Some("bad input"))]
    #[case("plain text", None, Some(0), true, None)]
    #[case("plain text", None, Some(1), false, Some("process exited with code 1"))]
    fn test_parse_result(
        #[case] output: &str,
        #[case] failure: Option<i64>,
        #[case] exit_code: Option<i64>,
        #[case] success: bool,
        #[case] error: Option<&str>,
    ) {
        let parsed = parse_result(output, failure, exit_code);
        assert_eq!(parsed.success, success);
        assert_eq!(parsed.error.as_deref(), error);
    }

    #[test]
    fn test_parse_result_keeps_json_value() {
        let parsed = parse_result("{\"answer\": 42}\n", None, Some(0));
        assert_eq!(parsed.value, json!({"answer": 42}));
    }
}
