use super::stream::{ContentBlock, StreamEvent, describe_tool_use, read_path};
use super::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::config::ExecutorSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs the configured agent CLI as a child process.
///
/// The prompt goes to stdin, stdout is streamed line by line into the
/// run's `log` and parsed as stream-json when possible. The child is
/// killed if the execution future is dropped, which is how the phase
/// watchdog stops a hung executor.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    allowed_tools_flag: Option<String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            allowed_tools_flag: None,
        }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            allowed_tools_flag: settings.allowed_tools_flag.clone(),
        }
    }

    fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(ref flag) = self.allowed_tools_flag
            && !request.allowed_tools.is_empty()
        {
            args.push(flag.clone());
            args.push(request.allowed_tools.join(","));
        }
        args
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let args = self.build_args(request);

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn executor '{}'", self.command))?;

        info!(
            run_id = %request.run_id,
            pid = child.id().unwrap_or(0),
            command = %self.command,
            "Executor spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(request.prompt.as_bytes()).await {
                Ok(()) => {
                    let _ = stdin.shutdown().await;
                }
                // The executor may exit without reading its prompt.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(run_id = %request.run_id, "Executor closed stdin early");
                }
                Err(e) => return Err(e).context("Failed to write prompt to executor"),
            }
        }

        let stderr = child.stderr.take().context("Failed to capture executor stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            let mut collected = String::new();
            while let Ok(Some(line)) = next_line_lossy(&mut reader, &mut buf).await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .await
            .with_context(|| format!("Failed to open {}", request.log_path.display()))?;

        let stdout = child.stdout.take().context("Failed to capture executor stdout")?;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut read_paths = Vec::new();

        while let Some(line) = next_line_lossy(&mut reader, &mut buf).await? {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::ToolUse { name, input } => {
                                debug!(run_id = %request.run_id, "{}", describe_tool_use(&name, &input));
                                if let Some(path) = read_path(&name, &input) {
                                    read_paths.push(path);
                                }
                            }
                            ContentBlock::Text { text } => {
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            ContentBlock::Other => {}
                        }
                    }
                }
                Ok(StreamEvent::Result { result, is_error }) => {
                    if is_error {
                        warn!(run_id = %request.run_id, "Executor reported an error result");
                    }
                    final_result = result;
                }
                Ok(StreamEvent::User { .. }) | Ok(StreamEvent::System { .. }) => {}
                Err(_) => {
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for executor")?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !stderr_text.is_empty() {
            log.write_all(b"--- stderr ---\n").await?;
            log.write_all(stderr_text.as_bytes()).await?;
        }
        log.flush().await?;

        let exit_code = status.code().unwrap_or(-1);
        info!(run_id = %request.run_id, exit_code, "Executor finished");

        Ok(ExecutionOutcome {
            exit_code,
            transcript: final_result.unwrap_or(accumulated),
            read_paths,
        })
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Next line without its terminator. Invalid UTF-8 is replaced rather
/// than ending the stream.
async fn next_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufReadExt + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn request(dir: &Path, prompt: &str) -> ExecutionRequest {
        ExecutionRequest {
            run_id: "run-1".into(),
            pipeline: "tdd".into(),
            phase: "red".into(),
            prompt: prompt.into(),
            allowed_tools: vec!["Read".into(), "Write".into()],
            working_dir: dir.to_path_buf(),
            run_dir: dir.to_path_buf(),
            log_path: dir.join("log"),
            env: vec![("ORCHESTRATE_PHASE".into(), "red".into())],
        }
    }

    #[test]
    fn allowed_tools_flag_is_appended_only_when_configured() {
        let dir = tempdir().unwrap();
        let req = request(dir.path(), "");

        let plain = CommandExecutor::new("agent", vec!["--print".into()]);
        assert_eq!(plain.build_args(&req), vec!["--print"]);

        let mut flagged = plain.clone();
        flagged.allowed_tools_flag = Some("--allowedTools".into());
        assert_eq!(
            flagged.build_args(&req),
            vec!["--print", "--allowedTools", "Read,Write"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_shell_command_with_prompt_env_and_log() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                "read line; echo \"got $line in $ORCHESTRATE_PHASE\"; echo oops >&2; exit 3".into(),
            ],
        );
        let outcome = executor.execute(&request(dir.path(), "hello\n")).await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.transcript.contains("got hello in red"));
        let log = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert!(log.contains("got hello in red"));
        assert!(log.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parses_stream_json_output() {
        let dir = tempdir().unwrap();
        let script = r#"cat >/dev/null
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"spec.md"}}]}}'
echo '{"type":"result","subtype":"success","result":"final answer","is_error":false}'"#;
        let executor = CommandExecutor::new("sh", vec!["-c".into(), script.into()]);
        let outcome = executor.execute(&request(dir.path(), "prompt")).await.unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.transcript, "final answer");
        assert_eq!(outcome.read_paths, vec!["spec.md"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_output_does_not_abort_the_stream() {
        let dir = tempdir().unwrap();
        let script = r#"cat >/dev/null
printf 'bad \377 byte\r\n'
printf 'err \377\n' >&2
echo after"#;
        let executor = CommandExecutor::new("sh", vec!["-c".into(), script.into()]);
        let outcome = executor.execute(&request(dir.path(), "prompt")).await.unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.transcript.contains("bad \u{FFFD} byte\n"));
        assert!(outcome.transcript.contains("after"));
        let log = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert!(log.contains("err \u{FFFD}"));
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("definitely-not-a-real-binary-xyz", vec![]);
        assert!(executor.execute(&request(dir.path(), "")).await.is_err());
    }
}
