//! Command-line agent backend
//!
//! Spawns one process per call and decodes its stdout as newline-delimited
//! JSON in the configured dialect. The child is killed when the call future
//! is dropped (timeout, cancellation or an abandoned stream).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::decoder::LineDecoder;
use super::types::{Call, GatewayError, MessageSink};
use super::Backend;
use crate::config::{PromptDelivery, SubprocessConfig};
use crate::model::truncate_chars;

/// Upper bound on stderr kept for error reports
const STDERR_LIMIT: usize = 4096;

const READ_CHUNK: usize = 16 * 1024;

pub struct SubprocessBackend {
    name: String,
    config: SubprocessConfig,
}

impl SubprocessBackend {
    pub fn new(name: impl Into<String>, config: SubprocessConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Build the command line; returns the stdin payload for stdin delivery
    fn build_command(&self, call: &Call) -> (Command, Option<String>) {
        let config = &self.config;
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(flag) = &config.model_flag {
            if !call.model.is_empty() {
                cmd.arg(flag).arg(&call.model);
            }
        }

        let prompt = match (&config.system_prompt_flag, call.system_prompt.as_deref()) {
            (Some(flag), Some(system)) => {
                cmd.arg(flag).arg(system);
                call.prompt.clone()
            }
            _ => call.merged_prompt(),
        };

        let stdin_payload = match config.prompt_delivery {
            PromptDelivery::Argument => {
                if config.prompt_separator {
                    cmd.arg("--");
                }
                cmd.arg(&prompt);
                None
            }
            PromptDelivery::Stdin => Some(prompt),
        };

        for (key, value) in &config.env {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            cmd.env(key, expanded.as_ref());
        }
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        (cmd, stdin_payload)
    }

    /// Decode one line; returns false when the consumer has gone away
    async fn dispatch(&self, line: &str, sink: &MessageSink) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }

        let record: serde_json::Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                sink.record_malformed();
                tracing::warn!(
                    provider = %self.name,
                    error = %e,
                    "Dropping malformed record: {}",
                    truncate_chars(line, 100)
                );
                return true;
            }
        };

        for message in self.config.dialect.decode(&record) {
            if !sink.send(message).await {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, call: Call, sink: MessageSink) -> Result<(), GatewayError> {
        let (mut cmd, stdin_payload) = self.build_command(&call);

        tracing::debug!(
            provider = %self.name,
            command = %self.config.command,
            model = %call.model,
            "Spawning agent process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GatewayError::Unavailable(format!(
                    "'{}' not found; is it installed and in PATH?",
                    self.config.command
                ))
            } else {
                GatewayError::Io(e)
            }
        })?;

        if let (Some(payload), Some(mut stdin)) = (stdin_payload, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!("Failed to write prompt to stdin: {}", e);
                }
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_limited(stderr)));

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Provider("stdout was not captured".to_string()))?;

        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for line in decoder.push(&buf[..n]) {
                if !self.dispatch(&line, &sink).await {
                    tracing::debug!(provider = %self.name, "Consumer gone, stopping agent process");
                    return Ok(());
                }
            }
        }
        if let Some(line) = decoder.finish() {
            self.dispatch(&line, &sink).await;
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(GatewayError::Process {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        tracing::debug!(
            provider = %self.name,
            malformed = sink.malformed_count(),
            "Agent process finished"
        );
        Ok(())
    }
}

async fn read_limited<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(collected.len());
                collected.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
