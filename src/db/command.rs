use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::debug;

/// An external dump/restore tool invocation.
///
/// Credentials travel through `env` or inside an argument registered with
/// [`ToolCommand::secret`]; secrets are masked in log lines and in the
/// captured output attached to errors.
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    secrets: Vec<(String, String)>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            secrets: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable in the child's environment (inherits the parent's otherwise).
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Register a value that must never appear in logs or error text.
    #[must_use]
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push((value, "***".to_string()));
        }
        self
    }

    /// Register a connection string; it is shown with only its password masked.
    #[must_use]
    pub fn connection_string(mut self, dsn: &str) -> Self {
        if !dsn.is_empty() {
            self.secrets.push((dsn.to_string(), super::redact_dsn(dsn)));
        }
        self
    }

    /// Feed the child's stdin from a file.
    #[must_use]
    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    /// Send the child's stdout to a file instead of capturing it.
    #[must_use]
    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments joined for display, secrets masked.
    pub fn display_args(&self) -> String {
        self.redact(&self.args.join(" "))
    }

    /// Run to completion and return the captured output (stdout, then stderr).
    ///
    /// Blocks until the tool exits; there is no timeout. A non-zero exit is an
    /// error whose message carries the captured output.
    pub async fn run(self) -> Result<String> {
        debug!(program = %self.program, args = %self.display_args(), "running external tool");

        let mut cmd = tokio::process::Command::new(&self.program);
        // An aborted run must not leave the tool running.
        cmd.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        match &self.stdin {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("opening {} for {}", path.display(), self.program))?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        match &self.stdout {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("creating {}", path.display()))?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .with_context(|| format!("running {}", self.program))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = self.redact(combined.trim_end());

        if !output.status.success() {
            anyhow::bail!("{} failed ({}), output: {combined}", self.program, output.status);
        }
        Ok(combined)
    }

    #[cfg(test)]
    pub(crate) fn raw_args(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub(crate) fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[cfg(test)]
    pub(crate) const fn redirects(&self) -> (Option<&PathBuf>, Option<&PathBuf>) {
        (self.stdin.as_ref(), self.stdout.as_ref())
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, (secret, shown)| replace_bounded(&acc, secret, shown))
    }
}

/// Replace whole-token occurrences of `needle`. A match touching a letter,
/// digit or underscore on either side is part of a longer word and is kept.
fn replace_bounded(text: &str, needle: &str, shown: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (at, _) in text.match_indices(needle) {
        let end = at + needle.len();
        let before = text[..at].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(is_word) || after.is_some_and(is_word) {
            continue;
        }
        out.push_str(&text[copied..at]);
        out.push_str(shown);
        copied = end;
    }
    out.push_str(&text[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_of_successful_tool() -> Result<()> {
        let out = ToolCommand::new("sh")
            .args(["-c", "echo hello; echo warn >&2"])
            .run()
            .await?;
        assert_eq!(out, "hello\nwarn");
        Ok(())
    }

    #[tokio::test]
    async fn failure_carries_combined_output() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo partial; echo 'fatal: boom' >&2; exit 3"])
            .run()
            .await
            .err()
            .map(|e| format!("{e:#}"))
            .unwrap_or_default();
        assert!(err.contains("sh failed"), "got: {err}");
        assert!(err.contains("partial"), "got: {err}");
        assert!(err.contains("fatal: boom"), "got: {err}");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let result = ToolCommand::new("backyard-definitely-not-installed").run().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn env_is_passed_and_secret_redacted() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo \"pw=$TOOL_PW\" >&2; exit 1"])
            .env("TOOL_PW", "hunter2")
            .secret("hunter2")
            .run()
            .await
            .err()
            .map(|e| format!("{e:#}"))
            .unwrap_or_default();
        assert!(err.contains("pw=***"), "got: {err}");
        assert!(!err.contains("hunter2"));
    }

    #[tokio::test]
    async fn stdout_redirect_and_stdin_feed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "line one\nline two\n")?;

        ToolCommand::new("cat")
            .stdin_from(&input)
            .stdout_to(&output)
            .run()
            .await?;

        assert_eq!(std::fs::read_to_string(&output)?, "line one\nline two\n");
        Ok(())
    }

    #[test]
    fn display_args_masks_secrets() {
        let cmd = ToolCommand::new("pg_dump")
            .arg("postgres://app:pw@db/orders")
            .args(["-f", "/tmp/x.sql"])
            .connection_string("postgres://app:pw@db/orders");
        assert_eq!(cmd.display_args(), "postgres://app:***@db/orders -f /tmp/x.sql");
        assert_eq!(cmd.program(), "pg_dump");

        let cmd = ToolCommand::new("mongodump")
            .arg("--password=topsecret")
            .secret("topsecret");
        assert_eq!(cmd.display_args(), "--password=***");
    }

    #[test]
    fn short_secret_inside_words_is_left_alone() {
        let cmd = ToolCommand::new("mysqldump")
            .args(["--host=dbhost", "--databases", "mydb", "--password", "db"])
            .secret("db");
        assert_eq!(cmd.display_args(), "--host=dbhost --databases mydb --password ***");

        let cmd = ToolCommand::new("pg_dump").secret("a");
        assert_eq!(
            cmd.redact("pg_dump: error: password authentication failed for user \"a\""),
            "pg_dump: error: password authentication failed for user \"***\""
        );
    }

    #[test]
    fn bounded_replace_handles_edges_and_repeats() {
        assert_eq!(replace_bounded("pw", "pw", "***"), "***");
        assert_eq!(replace_bounded("pw pw:pwd", "pw", "***"), "*** ***:pwd");
        assert_eq!(replace_bounded("no match here", "zz", "***"), "no match here");
        assert_eq!(replace_bounded("é1é", "1", "***"), "é1é");
    }
}
