//! Stage executor backed by an external program.
//!
//! The program is spawned once per work item. It receives one JSON request on
//! stdin and answers with one JSON response on stdout; anything it writes to
//! stderr goes straight to our stderr.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use docpipe_shared::{AppConfig, DocPipeError, Result, StageCommandConfig, StageError, StageName};

use crate::executor::{Artifact, PriorOutputs, StageExecutor, StageInput, StageOutput};
use crate::registry::StageRegistry;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Request written to the program's stdin.
#[derive(Debug, serde::Serialize)]
struct Request<'a> {
    stage: StageName,
    document: &'a Path,
    relative_path: &'a str,
    prior_outputs: &'a PriorOutputs,
    options: &'a Value,
}

/// Response read from the program's stdout.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Ok {
        #[serde(default)]
        artifacts: Vec<WireArtifact>,
        #[serde(default)]
        result: Value,
    },
    Mismatch {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, serde::Deserialize)]
struct WireArtifact {
    suffix: String,
    content: String,
}

// ---------------------------------------------------------------------------
// Registry from configuration
// ---------------------------------------------------------------------------

/// Build the canonical stage chain from the `[stages.*]` sections, one
/// [`CommandExecutor`] per configured stage.
pub fn registry_from_config(config: &AppConfig) -> Result<StageRegistry> {
    let mut bindings: BTreeMap<StageName, Arc<dyn StageExecutor>> = BTreeMap::new();
    let mut settings: BTreeMap<StageName, (Value, Option<Duration>)> = BTreeMap::new();

    for (stage, command) in &config.stages {
        let options = serde_json::to_value(&command.options).map_err(|e| {
            DocPipeError::config(format!("stages.{stage}.options cannot be forwarded: {e}"))
        })?;
        let timeout = config.stage_timeout_secs(*stage).map(Duration::from_secs);
        bindings.insert(*stage, Arc::new(CommandExecutor::from_config(command)));
        settings.insert(*stage, (options, timeout));
    }

    StageRegistry::standard(bindings, &settings)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs a configured command for each `(document, stage)` work item.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &StageCommandConfig) -> Self {
        let mut executor = Self::new(&config.command).with_args(config.args.iter().cloned());
        if let Some(dir) = &config.working_dir {
            executor = executor.with_working_dir(dir);
        }
        executor
    }

    async fn invoke(
        &self,
        payload: Vec<u8>,
    ) -> std::result::Result<std::process::Output, StageError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            StageError::Transient(format!(
                "failed to spawn `{}`: {e}. Is it installed?",
                self.program
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StageError::Transient("failed to capture executor stdin".into()))?;

        let writer = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());

        if let Err(e) = written {
            // The program may legitimately exit without reading its input.
            debug!(program = %self.program, error = %e, "could not write full request");
        }

        output.map_err(|e| {
            StageError::Transient(format!("failed to wait for `{}`: {e}", self.program))
        })
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    #[instrument(skip_all, fields(program = %self.program, stage = %input.stage, doc = %input.document))]
    async fn execute(
        &self,
        input: StageInput<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        let request = Request {
            stage: input.stage,
            document: &input.document.path,
            relative_path: &input.document.rel_path,
            prior_outputs: input.prior,
            options: input.options,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| StageError::Transient(format!("failed to serialize request: {e}")))?;

        let output = self.invoke(payload).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match parse_response(&stdout) {
            Some(response) => {
                if !output.status.success() {
                    warn!(status = %output.status, "executor answered but exited unsuccessfully");
                }
                response.into_result()
            }
            None if !output.status.success() => Err(StageError::Transient(format!(
                "`{}` exited with {}",
                self.program, output.status
            ))),
            None => Err(StageError::Transient(format!(
                "invalid executor response (got: {})",
                truncate(stdout.trim(), 200)
            ))),
        }
    }
}

impl Response {
    fn into_result(self) -> std::result::Result<StageOutput, StageError> {
        match self {
            Self::Ok { artifacts, result } => Ok(StageOutput {
                artifacts: artifacts
                    .into_iter()
                    .map(|a| Artifact::new(a.suffix, a.content))
                    .collect(),
                result,
            }),
            Self::Mismatch { message } => Err(StageError::ValidationMismatch(message)),
            Self::Error { message } => Err(StageError::Transient(message)),
        }
    }
}

/// Parse the whole of stdout as a response, or failing that its last
/// non-empty line (programs may print progress before answering).
fn parse_response(stdout: &str) -> Option<Response> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_shared::Document;

    #[test]
    fn parses_each_response_kind() {
        let ok = parse_response(
            r##"{"type":"ok","artifacts":[{"suffix":".converted.md","content":"# Title"}],"result":{"pages":3}}"##,
        )
        .unwrap()
        .into_result()
        .unwrap();
        assert_eq!(ok.artifacts, vec![Artifact::new(".converted.md", "# Title")]);
        assert_eq!(ok.result["pages"], 3);

        let mismatch = parse_response(r#"{"type":"mismatch","message":"table 3 missing"}"#)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(mismatch, StageError::ValidationMismatch("table 3 missing".into()));

        let error = parse_response(r#"{"type":"error","message":"upstream 503"}"#)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(error, StageError::Transient("upstream 503".into()));
    }

    #[test]
    fn ok_response_fields_are_optional() {
        let out = parse_response(r#"{"type":"ok"}"#).unwrap().into_result().unwrap();
        assert!(out.artifacts.is_empty());
        assert_eq!(out.result, Value::Null);
    }

    #[test]
    fn last_line_wins_when_program_logs_to_stdout() {
        let stdout = "loading model...\nconverting\n{\"type\":\"ok\",\"result\":true}\n\n";
        let out = parse_response(stdout).unwrap().into_result().unwrap();
        assert_eq!(out.result, Value::Bool(true));
    }

    #[test]
    fn garbage_is_not_a_response() {
        assert!(parse_response("").is_none());
        assert!(parse_response("not json").is_none());
        assert!(parse_response(r#"{"type":"unknown"}"#).is_none());
    }

    #[test]
    fn request_wire_format() {
        let doc = Document::new(Path::new("/data"), "/data/report.pdf");
        let mut prior = PriorOutputs::new();
        prior.insert(
            StageName::Convert,
            crate::executor::PriorOutput {
                artifacts: vec![PathBuf::from("/data/report.pdf.converted.md")],
                result: Value::Null,
            },
        );
        let options = serde_json::json!({"strict": true});
        let request = Request {
            stage: StageName::Validate,
            document: &doc.path,
            relative_path: &doc.rel_path,
            prior_outputs: &prior,
            options: &options,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "stage": "validate",
                "document": "/data/report.pdf",
                "relative_path": "report.pdf",
                "prior_outputs": {
                    "convert": {"artifacts": ["/data/report.pdf.converted.md"], "result": null}
                },
                "options": {"strict": true}
            })
        );
    }

    #[test]
    fn builds_from_config() {
        let config = StageCommandConfig {
            command: "docling-bridge".into(),
            args: vec!["convert".into()],
            working_dir: Some("/opt/bridge".into()),
            ..Default::default()
        };
        let executor = CommandExecutor::from_config(&config);
        assert_eq!(executor.program, "docling-bridge");
        assert_eq!(executor.args, vec!["convert"]);
        assert_eq!(executor.working_dir, Some(PathBuf::from("/opt/bridge")));
    }

    #[test]
    fn registry_from_stage_sections() {
        let config: AppConfig = toml::from_str(
            r#"
            [pipeline]
            stage_timeout_secs = 60

            [stages.convert]
            command = "docling-bridge"
            options = { format = "markdown" }

            [stages.validate]
            command = "validator"
            timeout_secs = 5
            "#,
        )
        .unwrap();

        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.names(), vec![StageName::Convert, StageName::Validate]);
        let convert = &registry.stages()[0];
        assert_eq!(convert.options, serde_json::json!({"format": "markdown"}));
        assert_eq!(convert.timeout, Some(Duration::from_secs(60)));
        assert_eq!(
            registry.stages()[1].timeout,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn registry_from_config_needs_a_contiguous_chain() {
        let config: AppConfig = toml::from_str(
            r#"
            [stages.convert]
            command = "a"

            [stages.embed]
            command = "b"
            "#,
        )
        .unwrap();
        assert!(matches!(
            registry_from_config(&config).unwrap_err(),
            DocPipeError::Config { .. }
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn doc() -> Document {
            Document::new(Path::new("/data"), "/data/report.pdf")
        }

        async fn run_script(script: &str) -> std::result::Result<StageOutput, StageError> {
            let executor = CommandExecutor::new("sh").with_args(["-c", script]);
            let doc = doc();
            let prior = PriorOutputs::new();
            let options = serde_json::json!({});
            executor
                .execute(StageInput {
                    stage: StageName::Convert,
                    document: &doc,
                    prior: &prior,
                    options: &options,
                })
                .await
        }

        #[tokio::test]
        async fn successful_program() {
            let out = run_script(
                r#"cat >/dev/null; printf '%s\n' '{"type":"ok","artifacts":[{"suffix":".converted.md","content":"hi"}],"result":{"ok":1}}'"#,
            )
            .await
            .unwrap();
            assert_eq!(out.artifacts, vec![Artifact::new(".converted.md", "hi")]);
            assert_eq!(out.result["ok"], 1);
        }

        #[tokio::test]
        async fn program_sees_the_request() {
            // Echo the request's stage back as the result.
            let out = run_script(
                r#"req=$(cat); case "$req" in *'"stage":"convert"'*) s=yes;; *) s=no;; esac; printf '{"type":"ok","result":"%s"}' "$s""#,
            )
            .await
            .unwrap();
            assert_eq!(out.result, Value::String("yes".into()));
        }

        #[tokio::test]
        async fn mismatch_is_reported() {
            let err = run_script(r#"cat >/dev/null; echo '{"type":"mismatch","message":"page count"}'"#)
                .await
                .unwrap_err();
            assert_eq!(err, StageError::ValidationMismatch("page count".into()));
        }

        #[tokio::test]
        async fn failing_exit_without_response_is_transient() {
            let err = run_script("cat >/dev/null; echo oops >&2; exit 3")
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Transient(ref m) if m.contains("exited with")));
        }

        #[tokio::test]
        async fn missing_program_is_transient() {
            let executor = CommandExecutor::new("docpipe-definitely-not-installed");
            let doc = doc();
            let prior = PriorOutputs::new();
            let options = Value::Null;
            let err = executor
                .execute(StageInput {
                    stage: StageName::Convert,
                    document: &doc,
                    prior: &prior,
                    options: &options,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Transient(ref m) if m.contains("failed to spawn")));
        }
    }
}
