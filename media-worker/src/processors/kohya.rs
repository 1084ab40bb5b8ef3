//! kohya_ss subprocess supervisor used by the LoRA-training processor:
//! command construction, piped-stdio spawn, streamed log parsing, and
//! SIGTERM→SIGKILL timeout escalation.
//!
//! Grounded on `ffmpeg_runner::run`'s subprocess-supervision shape
//! (spawn, buffer stderr, map exit code), extended with line-buffered
//! stdout/stderr parsing and the worker's own timeout-escalation contract.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use worker_common::job::{LogSource, Progress, ProgressStage};
use worker_common::job::LoraTrainingConfig;
use worker_common::progress::ProgressThrottler;

const LOG_BUFFER_CAPACITY: usize = 200;
/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

static STEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)step\s+(\d+)\s*/\s*(\d+)").expect("valid regex"));
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})\s*%").expect("valid regex"));

#[derive(Debug, Error)]
pub enum KohyaError {
    #[error("failed to spawn kohya_ss subprocess: {0}")]
    Spawn(String),
    #[error("failed to wait on kohya_ss subprocess: {0}")]
    Wait(String),
    #[error("kohya_ss subprocess timed out and was terminated")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct KohyaCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct KohyaOutcome {
    pub exit_code: i32,
    pub logs: Vec<String>,
}

/// Default hyperparameter values used to fill in flags the caller didn't
/// already supply (see DESIGN.md for why these particular defaults).
fn ensure_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    let already_present = args
        .iter()
        .any(|a| a == flag || a.starts_with(&format!("{flag}=")));
    if !already_present {
        args.push(format!("{flag}={value}"));
    }
}

/// Build the kohya_ss invocation: base binary, `launch train_network.py`
/// prepended only when the binary itself defaulted to `accelerate`, the
/// caller's args, then the ensured hyperparameter flags, then
/// `config.extra_args`.
pub fn build_kohya_command(
    config: &LoraTrainingConfig,
    kohya_args: &[String],
    train_data_dir: &str,
    output_dir: &str,
) -> KohyaCommand {
    let using_default_binary = config.kohya_command.is_none();
    let program = config.kohya_command.clone().unwrap_or_else(|| "accelerate".to_string());

    let mut args: Vec<String> = Vec::new();
    if using_default_binary {
        args.push("launch".to_string());
        args.push("train_network.py".to_string());
    }
    args.extend(kohya_args.iter().cloned());

    ensure_flag(&mut args, "--train_data_dir", train_data_dir);
    ensure_flag(&mut args, "--output_dir", output_dir);
    ensure_flag(&mut args, "--network_module", "networks.lora");
    ensure_flag(&mut args, "--learning_rate", "1e-4");
    ensure_flag(&mut args, "--lr", "1e-4");
    ensure_flag(&mut args, "--max_train_epochs", "10");
    ensure_flag(&mut args, "--train_batch_size", "1");
    ensure_flag(&mut args, "--resolution", "512,512");
    ensure_flag(&mut args, "--network_dim", "32");
    ensure_flag(&mut args, "--network_alpha", "16");
    ensure_flag(&mut args, "--max_train_steps", "1000");
    ensure_flag(
        &mut args,
        "--pretrained_model_name_or_path",
        config
            .pretrained_model_name_or_path
            .as_deref()
            .unwrap_or("runwayml/stable-diffusion-v1-5"),
    );

    if let Some(extra) = &config.extra_args {
        args.extend(extra.iter().cloned());
    }

    KohyaCommand {
        program,
        args,
        cwd: config.working_dir.clone(),
        env: config.env.clone(),
    }
}

/// Spawn the command, stream stdout/stderr into throttled progress events,
/// and enforce `timeout` with SIGTERM→SIGKILL escalation.
pub async fn run(
    command: &KohyaCommand,
    timeout: Duration,
    throttler: &ProgressThrottler,
) -> Result<KohyaOutcome, KohyaError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&command.env);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| KohyaError::Spawn(e.to_string()))?;
    let pid = child.id();

    let stdout = child.stdout.take().expect("stdout piped at spawn");
    let stderr = child.stderr.take().expect("stderr piped at spawn");

    let logs: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_BUFFER_CAPACITY)));

    let stdout_task = spawn_stream_reader(stdout, LogSource::Stdout, throttler.clone(), logs.clone());
    let stderr_task = spawn_stream_reader(stderr, LogSource::Stderr, throttler.clone(), logs.clone());

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;

    let status = match wait_result {
        Ok(result) => result.map_err(|e| KohyaError::Wait(e.to_string()))?,
        Err(_) => {
            if let Some(pid) = pid {
                escalate_and_kill(&mut child, pid as i32).await;
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(KohyaError::Timeout);
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(KohyaOutcome {
        exit_code: status.code().unwrap_or(-1),
        logs: logs.lock().await.iter().cloned().collect(),
    })
}

async fn escalate_and_kill(child: &mut tokio::process::Child, pid: i32) {
    let target = Pid::from_raw(pid);
    if signal::kill(target, Signal::SIGTERM).is_err() {
        // Process may already be gone; nothing further to escalate.
        return;
    }
    if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await.is_err() {
        let _ = signal::kill(target, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

fn spawn_stream_reader<R>(
    stream: R,
    source: LogSource,
    throttler: ProgressThrottler,
    logs: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            {
                let mut logs = logs.lock().await;
                if logs.len() == LOG_BUFFER_CAPACITY {
                    logs.pop_front();
                }
                logs.push_back(line.clone());
            }

            let mut progress = Progress::stage(ProgressStage::Running)
                .with_message(line.clone())
                .with_source(source);

            if let Some(caps) = STEP_RE.captures(&line) {
                let step: Option<u64> = caps.get(1).and_then(|m| m.as_str().parse().ok());
                let total: Option<u64> = caps.get(2).and_then(|m| m.as_str().parse().ok());
                progress.step = step;
                progress.total_steps = total;
                if let (Some(step), Some(total)) = (step, total) {
                    if total > 0 {
                        progress.percent = Some(step as f64 / total as f64 * 100.0);
                    }
                }
            } else if let Some(caps) = PERCENT_RE.captures(&line) {
                progress.percent = caps.get(1).and_then(|m| m.as_str().parse().ok());
            }

            throttler.schedule(progress).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kohya_command: Option<&str>) -> LoraTrainingConfig {
        LoraTrainingConfig {
            kohya_command: kohya_command.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn default_binary_prepends_launch_train_network() {
        let cmd = build_kohya_command(&config(None), &[], "/data", "/out");
        assert_eq!(cmd.program, "accelerate");
        assert_eq!(&cmd.args[0..2], &["launch".to_string(), "train_network.py".to_string()]);
    }

    #[test]
    fn custom_binary_does_not_prepend_launch() {
        let cmd = build_kohya_command(&config(Some("python3")), &[], "/data", "/out");
        assert_eq!(cmd.program, "python3");
        assert!(!cmd.args.contains(&"launch".to_string()));
    }

    #[test]
    fn user_supplied_flag_is_not_duplicated() {
        let kohya_args = vec!["--learning_rate=5e-5".to_string()];
        let cmd = build_kohya_command(&config(None), &kohya_args, "/data", "/out");
        let count = cmd.args.iter().filter(|a| a.starts_with("--learning_rate")).count();
        assert_eq!(count, 1);
        assert!(cmd.args.contains(&"--learning_rate=5e-5".to_string()));
    }

    #[test]
    fn ensures_required_flags_present() {
        let cmd = build_kohya_command(&config(None), &[], "/data/train", "/out/dir");
        assert!(cmd.args.contains(&"--train_data_dir=/data/train".to_string()));
        assert!(cmd.args.contains(&"--output_dir=/out/dir".to_string()));
        assert!(cmd.args.iter().any(|a| a.starts_with("--network_module=")));
    }

    #[test]
    fn extra_args_appended_last() {
        let config = LoraTrainingConfig {
            extra_args: Some(vec!["--seed=42".to_string()]),
            ..Default::default()
        };
        let cmd = build_kohya_command(&config, &[], "/data", "/out");
        assert_eq!(cmd.args.last(), Some(&"--seed=42".to_string()));
    }

    #[test]
    fn step_regex_matches_expected_shape() {
        let caps = STEP_RE.captures("step 3/10").unwrap();
        assert_eq!(&caps[1], "3");
        assert_eq!(&caps[2], "10");
    }

    #[test]
    fn percent_regex_matches_expected_shape() {
        let caps = PERCENT_RE.captures("loss 0.123 (50%)").unwrap();
        assert_eq!(&caps[1], "50");
    }
}
