use std::{
    ffi::{OsStr, OsString},
    process::{ExitStatus, Stdio},
};

use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// An OS command, this is `tokio::process::Command` wrapped with recording of
/// the standard streams. The child is killed if the running future is
/// dropped, which is how an in flight command gets cancelled.
#[derive(Debug, Clone, Default)]
pub struct Command {
    /// The program to run.
    pub program: OsString,
    /// All the arguments that will be passed to the program
    pub args: Vec<OsString>,
}

impl Command {
    /// Creates a new `Command` for launching the `program`
    pub fn new_os_str(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().into(),
            ..Default::default()
        }
    }

    /// Adds an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs the command to completion, piping `input` to its stdin and
    /// recording its stdout and stderr
    pub async fn run_with_input_to_completion(self, input: &[u8]) -> Result<CommandResult> {
        let spawn_err = |source| Error::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        };
        let mut child = self.to_tokio().spawn().map_err(spawn_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            // a program that does not read its stdin closes the pipe early
            if let Err(e) = stdin.write_all(input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(spawn_err(e))
                }
            }
            // needs to close to actually finish
            drop(stdin);
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;
        Ok(CommandResult {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// The result of a [Command]
#[must_use]
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandResult {
    /// The exit code, `None` if the process was killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdin_is_piped() {
        let comres = Command::new_os_str("sh")
            .arg("-c")
            .arg("read line; echo \"got $line\"; echo err >&2; exit 3")
            .run_with_input_to_completion(b"hello")
            .await
            .unwrap();
        assert_eq!(comres.code(), Some(3));
        assert_eq!(comres.stdout, b"got hello\n");
        assert_eq!(comres.stderr, b"err\n");
    }

    #[tokio::test]
    async fn missing_program() {
        let err = Command::new_os_str("definitely-not-a-real-program-4c1d")
            .run_with_input_to_completion(&[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
