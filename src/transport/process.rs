//! Transport that runs a local program (typically `ssh`) and talks to it
//! over piped stdio

use super::{SessionStream, Transport, TransportError};
use crate::config::AuthConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Spawns the configured program for every connection
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
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

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        let mut transport = Self::new(auth.program.clone()).with_args(auth.args.iter().cloned());
        for (key, value) in &auth.env {
            transport = transport.with_env(key.clone(), value.clone());
        }
        if let Some(dir) = &auth.working_dir {
            transport = transport.with_working_dir(dir.clone());
        }
        transport
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn connect(&self) -> Result<SessionStream, TransportError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingStream("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingStream("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingStream("stderr"))?;

        tracing::info!(
            "Started '{}' (pid {:?})",
            self.describe(),
            child.id()
        );

        // The reaper owns the child so the process lives as long as its pipes.
        let description = self.describe();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("'{}' exited with {}", description, status),
                Err(e) => tracing::warn!("Failed to wait for '{}': {}", description, e),
            }
        });

        Ok(SessionStream::new(Box::new(stdin), Box::new(stdout)).with_stderr(Box::new(stderr)))
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_cat_echoes_input() -> anyhow::Result<()> {
        let transport = ProcessTransport::new("cat");
        let mut session = transport.connect().await?;

        session.input.write_all(b"hello\n").await?;
        session.input.flush().await?;

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), session.stdout.read(&mut buf)).await??;
        assert_eq!(&buf[..n], b"hello\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let transport = ProcessTransport::new("/definitely/not/a/program");
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }

    #[test]
    fn test_describe_includes_args() {
        let transport = ProcessTransport::new("ssh").with_args(["-tt", "ops@host"]);
        assert_eq!(transport.describe(), "ssh -tt ops@host");
    }
}
