//! External encoder process.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use transcoda_core::defaults::{ENCODER_ARGS, ENCODER_PROGRAM};
use transcoda_core::{Encoder, Error, Result};

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Keep the error message readable when the tool dumps a banner to stderr.
const STDERR_TAIL_BYTES: usize = 2048;

/// Encoder command configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: String,
    /// Argument template; `{input}` and `{output}` are replaced per call.
    pub args: Vec<String>,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: ENCODER_PROGRAM.to_string(),
            args: ENCODER_ARGS.iter().map(|s| s.to_string()).collect(),
            timeout: None,
        }
    }
}

impl EncoderConfig {
    /// Load from environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ENCODER_PROGRAM` | `ffmpeg` | Executable name or path |
    /// | `ENCODER_ARGS` | `-nostdin -y -i {input} {output}` | Whitespace-separated template |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("ENCODER_PROGRAM")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.program),
            args: std::env::var("ENCODER_ARGS")
                .ok()
                .map(|v| v.split_whitespace().map(String::from).collect::<Vec<_>>())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.args),
            timeout: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// [`Encoder`] that runs an external program such as ffmpeg.
///
/// Success is exit status 0; the output file itself is not inspected.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    config: EncoderConfig,
}

impl CommandEncoder {
    /// Fails with `Config` if the template lacks either placeholder.
    pub fn new(config: EncoderConfig) -> Result<Self> {
        for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
            if !config.args.iter().any(|a| a.contains(placeholder)) {
                return Err(Error::Config(format!(
                    "encoder arguments must contain {}",
                    placeholder
                )));
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|a| {
                a.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn encode(&self, input: &Path, output: &Path) -> Result<()> {
        let start = Instant::now();
        let args = self.render_args(input, output);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            subsystem = "jobs",
            component = "encoder",
            op = "encode",
            program = %self.config.program,
            input = %input.display(),
            output = %output.display(),
            "Starting encoder"
        );

        // Dropping the `output()` future on timeout kills the child.
        let result = match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| {
                    Error::Conversion(format!(
                        "{} timed out after {}s",
                        self.config.program,
                        timeout.as_secs()
                    ))
                })?,
            None => cmd.output().await,
        };

        let out = result.map_err(|e| {
            Error::Conversion(format!("failed to run {}: {}", self.config.program, e))
        })?;

        if !out.status.success() {
            let stderr = stderr_tail(&out.stderr);
            warn!(
                subsystem = "jobs",
                component = "encoder",
                op = "encode",
                program = %self.config.program,
                status = %out.status,
                duration_ms = start.elapsed().as_millis() as u64,
                "Encoder exited unsuccessfully"
            );
            return Err(Error::Conversion(format!(
                "{} failed ({}): {}",
                self.config.program, out.status, stderr
            )));
        }

        debug!(
            subsystem = "jobs",
            component = "encoder",
            op = "encode",
            duration_ms = start.elapsed().as_millis() as u64,
            "Encoder finished"
        );
        Ok(())
    }
}
