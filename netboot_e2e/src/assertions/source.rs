// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Where validators read their evidence from.

use crate::config::ApiLogConfig;
use crate::run_host_cmd;
use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// A text source that validators poll.
///
/// Each read returns the source's full current contents. Read failures are
/// treated as transient by the validators.
#[async_trait]
pub trait EvidenceSource: Send + Sync + fmt::Debug {
    /// Returns the current contents of the source.
    async fn read(&self) -> anyhow::Result<String>;
}

/// A text file on the host, such as a DHCP lease file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Reads `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EvidenceSource for FileSource {
    async fn read(&self) -> anyhow::Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))
    }
}

/// The standard output of a host command, such as `kubectl logs`.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSource {
    /// Runs `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `kubectl logs` for the provisioning API's deployment in the cluster
    /// `kubeconfig` points at.
    pub fn kubectl_logs(config: &ApiLogConfig, kubeconfig: &Path) -> Self {
        let mut source = Self::new(&config.kubectl)
            .arg("--kubeconfig")
            .arg(kubeconfig)
            .args(["logs", "--namespace", config.namespace.as_str()])
            .arg(format!("deployment/{}", config.deployment));
        if let Some(tail) = config.tail_lines {
            source = source.arg(format!("--tail={tail}"));
        }
        source
    }
}

#[async_trait]
impl EvidenceSource for CommandSource {
    async fn read(&self) -> anyhow::Result<String> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_host_cmd(cmd)
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        Ok(output)
    }
}

/// Shared in-memory text. Clones see the same contents, so a test (or a
/// caller that already holds logs) can keep appending while a validator
/// polls.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(Arc<Mutex<String>>);

impl StaticSource {
    /// A source holding `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(text.into())))
    }

    /// Appends `line` and a newline.
    pub fn push_line(&self, line: &str) {
        let mut text = self.0.lock();
        text.push_str(line);
        text.push('\n');
    }

    /// Replaces the contents.
    pub fn set(&self, text: impl Into<String>) {
        *self.0.lock() = text.into();
    }
}

#[async_trait]
impl EvidenceSource for StaticSource {
    async fn read(&self) -> anyhow::Result<String> {
        Ok(self.0.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_an_error_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("dnsmasq.leases"));
        assert!(source.read().await.is_err());
        fs_err::write(source.path(), "1 52:54:00:12:34:56 10.0.0.2 vm *\n").unwrap();
        assert!(source.read().await.unwrap().contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn static_source_is_shared() {
        let source = StaticSource::default();
        let writer = source.clone();
        writer.push_line("first");
        writer.push_line("second");
        assert_eq!(source.read().await.unwrap(), "first\nsecond\n");
        writer.set("");
        assert_eq!(source.read().await.unwrap(), "");
    }

    #[test]
    fn kubectl_logs_arguments() {
        let config = ApiLogConfig {
            tail_lines: Some(500),
            ..Default::default()
        };
        let source = CommandSource::kubectl_logs(&config, Path::new("/tmp/kubeconfig"));
        let args: Vec<_> = source
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--kubeconfig",
                "/tmp/kubeconfig",
                "logs",
                "--namespace",
                "netboot-system",
                "deployment/netboot-api",
                "--tail=500"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_and_failure() {
        let ok = CommandSource::new("sh").args(["-c", "echo hello"]);
        assert_eq!(ok.read().await.unwrap(), "hello\n");
        let failing = CommandSource::new("sh").args(["-c", "exit 3"]);
        assert!(failing.read().await.is_err());
    }
}
