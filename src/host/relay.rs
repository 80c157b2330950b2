//! Shell command relay.
//!
//! The child's stdout and stderr share one pipe and are forwarded in chunks as they come,
//! which keeps their interleaving and does not stall on partial lines.

use std::{
    io::Read,
    process::{Command, ExitStatus, Stdio},
};

use futures::{channel::mpsc, StreamExt};

use crate::{
    error::{Error, Result},
    internal::run_blocking,
    proxy::writer::RemoteWriter,
};

const CHUNK_SIZE: usize = 4096;

fn shell(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => status.to_string(),
    }
}

/// Runs `command` through the shell and streams its combined output to `output`.
///
/// A failing command is reported on `output` with one line; only failures to run the
/// command or to reach the output are returned as errors.
pub async fn relay(command: &str, output: &RemoteWriter) -> Result<ExitStatus> {
    let (reader, writer) = std::io::pipe()?;
    let mut child = {
        let mut cmd = shell(command);
        cmd.stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        // Dropping `cmd` closes our copies of the write end.
        cmd.spawn()?
    };
    tracing::debug!(command, pid = child.id(), "relaying shell command");

    let (sender, mut chunks) = mpsc::unbounded();
    std::thread::Builder::new()
        .name("telerepl-relay".to_owned())
        .spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if sender.unbounded_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        let _ = sender.unbounded_send(Err(err));
                        break;
                    }
                }
            }
        })?;

    let forwarded = async {
        while let Some(chunk) = chunks.next().await {
            output.write(&chunk?).await?;
        }
        Ok::<_, Error>(())
    }
    .await;
    if let Err(err) = forwarded {
        let _ = child.kill();
        let _ = run_blocking(move || child.wait()).await;
        return Err(err);
    }

    let status = run_blocking(move || child.wait()).await?;
    if !status.success() {
        let failure = Error::Subprocess {
            command: command.to_owned(),
            status: describe(status),
        };
        tracing::debug!("{failure}");
        output.puts(&failure.to_string()).await?;
    }
    Ok(status)
}

#[cfg(all(test, unix))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        proxy::writer::WriterServer,
        tests::{run_with_timeout, TestSink},
    };

    fn run(command: &'static str) -> (ExitStatus, String) {
        let sink = TestSink::default();
        let status = run_with_timeout(10, |_| {
            let sink = sink.clone();
            async move {
                let output = RemoteWriter::new(capnp_rpc::new_client(WriterServer::new(sink)));
                Ok(relay(command, &output).await?)
            }
        });
        (status, sink.contents())
    }

    #[test]
    fn test_failure_is_a_single_line() {
        let (status, output) = run("exit 2");
        assert_eq!(status.code(), Some(2));
        assert_eq!(output, "command `exit 2` failed: exit status 2\n");
    }

    #[test]
    fn test_stdout_and_stderr_are_combined_in_order() {
        let (status, output) = run("printf one; printf two >&2; printf three");
        assert!(status.success());
        assert_eq!(output, "onetwothree");
    }

    #[test]
    fn test_partial_lines_are_not_held_back() {
        let (status, output) = run("printf 'no newline'; sleep 0.2; echo ' done'; exit 1");
        assert_eq!(status.code(), Some(1));
        assert_eq!(
            output,
            concat!(
                "no newline done\n",
                "command `printf 'no newline'; sleep 0.2; echo ' done'; exit 1` failed: ",
                "exit status 1\n",
            )
        );
    }
}
