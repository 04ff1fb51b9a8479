//! Database dump through an external command.

use anyhow::{bail, Context};
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::backup::{DumpProducer, MemberSink};
use crate::config::BackupConfig;

/// Runs the configured dump command and zstd-compresses its stdout into the
/// archive member.
pub struct CommandDumper {
    command: Vec<String>,
    compression_level: i32,
}

impl CommandDumper {
    pub fn new(command: Vec<String>, compression_level: i32) -> Self {
        Self {
            command,
            compression_level,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(config.dump_command.clone(), config.compression_level)
    }
}

#[async_trait]
impl DumpProducer for CommandDumper {
    async fn dump_schema_into(&self, out: &mut MemberSink<'_>) -> anyhow::Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .context("dump command is empty")?;

        info!("Running dump command: {}", self.command.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;

        let mut stdout = child.stdout.take().context("dump stdout was not captured")?;
        let mut stderr = child.stderr.take().context("dump stderr was not captured")?;
        // Drained concurrently so a chatty command cannot block on a full pipe.
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let mut encoder = ZstdEncoder::with_quality(&mut *out, Level::Precise(self.compression_level));
        let copied = tokio::io::copy(&mut stdout, &mut encoder)
            .await
            .context("failed to stream dump output")?;
        encoder.shutdown().await?;

        let status = child.wait().await?;
        let stderr_text = stderr_reader.await.unwrap_or_default();
        if !status.success() {
            bail!("{} exited with {}: {}", program, status, stderr_text.trim());
        }

        debug!(bytes = copied, "Database dump streamed");
        Ok(())
    }
}
