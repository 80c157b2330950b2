//! What the evaluator sees of an attached session.
//!
//! Pager, shell and editor behaviours are bound to the [`Session`] value instead of being
//! swapped in process-wide, so nothing needs restoring when the session ends.

use std::{cell::Cell, io::Write, path::Path, process::ExitStatus, rc::Rc};

use crate::{
    error::{Error, Result},
    handle::SessionSlots,
    host::relay,
    proxy::{
        editor::RemoteEditor,
        reader::RemoteLineReader,
        writer::{shared_sink, RemoteWriter, SharedSink},
    },
};

/// The host's own output streams, used whenever output is not captured.
#[derive(Clone)]
pub struct LocalStreams {
    stdout: SharedSink,
    stderr: SharedSink,
}

impl LocalStreams {
    pub fn new(stdout: impl Write + 'static, stderr: impl Write + 'static) -> Self {
        Self {
            stdout: shared_sink(stdout),
            stderr: shared_sink(stderr),
        }
    }

    pub fn stdio() -> Self {
        Self::new(std::io::stdout(), std::io::stderr())
    }
}

impl Default for LocalStreams {
    fn default() -> Self {
        Self::stdio()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// An attached session, handed to the evaluator for the duration of its run.
pub struct Session {
    input: RemoteLineReader,
    output: RemoteWriter,
    slots: Rc<SessionSlots>,
    local: LocalStreams,
    units: Cell<usize>,
}

impl Session {
    pub(crate) fn new(
        input: RemoteLineReader,
        output: RemoteWriter,
        slots: Rc<SessionSlots>,
        local: LocalStreams,
    ) -> Self {
        Self {
            input,
            output,
            slots,
            local,
            units: Cell::new(0),
        }
    }

    /// The operator's input, to be used as the evaluator's input source.
    pub fn input(&self) -> &RemoteLineReader {
        &self.input
    }

    /// The operator's terminal, to be used as the evaluator's output sink.
    pub fn output(&self) -> &RemoteWriter {
        &self.output
    }

    /// Starts an evaluation unit.
    ///
    /// If the operator asked for capture, [`stdout`](Session::stdout) and
    /// [`stderr`](Session::stderr) go to the operator while the guard lives and come back to
    /// the host when it is dropped.
    pub fn unit(&self) -> UnitGuard<'_> {
        let units = self.units.get() + 1;
        self.units.set(units);
        if units == 1 && self.slots.stdout().is_some() {
            tracing::trace!("capturing stdout and stderr");
        }
        UnitGuard { session: self }
    }

    /// Whether [`stdout`](Session::stdout) currently reaches the operator.
    pub fn is_capturing(&self) -> bool {
        self.units.get() > 0 && self.slots.stdout().is_some()
    }

    pub fn stdout(&self) -> SessionStream<'_> {
        SessionStream {
            session: self,
            kind: StreamKind::Stdout,
        }
    }

    pub fn stderr(&self) -> SessionStream<'_> {
        SessionStream {
            session: self,
            kind: StreamKind::Stderr,
        }
    }

    /// Pages `text`. There is no usable pager on the other side, so it is written as is.
    pub async fn page(&self, text: &str) -> Result<()> {
        self.output.print(text).await
    }

    /// Runs a shell command, its output relayed to the operator.
    pub async fn system(&self, command: &str) -> Result<ExitStatus> {
        relay::relay(command, &self.output).await
    }

    /// Edits a file with the operator's editor and overwrites it with the result.
    ///
    /// A missing file is edited as empty.
    pub async fn edit_file(&self, path: &Path, line: u32) -> Result<()> {
        let editor = self
            .slots
            .editor()
            .map(RemoteEditor::new)
            .ok_or_else(|| Error::Unsupported("the operator provided no editor".to_owned()))?;
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let edited = editor.edit(&content, line).await?;
        std::fs::write(path, edited)?;
        Ok(())
    }
}

/// Guard of an evaluation unit, see [`Session::unit`].
pub struct UnitGuard<'a> {
    session: &'a Session,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        let units = self.session.units.get() - 1;
        self.session.units.set(units);
        if units == 0 && self.session.slots.stdout().is_some() {
            tracing::trace!("stdout and stderr released");
        }
    }
}

/// Standard stream of the evaluator, routed according to the capture state.
pub struct SessionStream<'a> {
    session: &'a Session,
    kind: StreamKind,
}

impl SessionStream<'_> {
    fn remote(&self) -> Option<RemoteWriter> {
        if self.session.units.get() == 0 {
            return None;
        }
        let client = match self.kind {
            StreamKind::Stdout => self.session.slots.stdout(),
            StreamKind::Stderr => self.session.slots.stderr(),
        };
        client.map(RemoteWriter::new)
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if let Some(remote) = self.remote() {
            remote.write(data).await?;
            return Ok(());
        }
        let local = match self.kind {
            StreamKind::Stdout => &self.session.local.stdout,
            StreamKind::Stderr => &self.session.local.stderr,
        };
        let mut local = local.borrow_mut();
        local.write_all(data)?;
        local.flush()?;
        Ok(())
    }

    pub async fn print(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        handle::SessionHandleServer,
        proxy::{
            editor::{shared_editor, EditorServer},
            reader::{shared_source, LineReaderServer, ScriptedLines},
            writer::WriterServer,
        },
        rpc::telerepl_capnp::{editor, session_handle, writer},
        tests::{run_with_timeout, TestSink},
    };

    struct Fixture {
        operator_output: TestSink,
        operator_stdout: TestSink,
        operator_stderr: TestSink,
        host_stdout: TestSink,
        host_stderr: TestSink,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                operator_output: TestSink::default(),
                operator_stdout: TestSink::default(),
                operator_stderr: TestSink::default(),
                host_stdout: TestSink::default(),
                host_stderr: TestSink::default(),
            }
        }

        async fn session(&self, capture: bool) -> Result<Session, Box<dyn std::error::Error>> {
            let slots = Rc::new(SessionSlots::default());
            let handle: session_handle::Client =
                capnp_rpc::new_client(SessionHandleServer::new(slots.clone()));

            let mut req = handle.set_input_request();
            req.get().set_input(capnp_rpc::new_client(LineReaderServer::new(shared_source(
                ScriptedLines::new(["1"]),
            ))));
            req.send().promise.await?;
            let mut req = handle.set_output_request();
            req.get().set_output(capnp_rpc::new_client(WriterServer::new(
                self.operator_output.clone(),
            )));
            req.send().promise.await?;
            if capture {
                let stdout: writer::Client =
                    capnp_rpc::new_client(WriterServer::new(self.operator_stdout.clone()));
                let mut req = handle.set_stdout_request();
                req.get().set_stdout(stdout);
                req.send().promise.await?;
                let stderr: writer::Client =
                    capnp_rpc::new_client(WriterServer::new(self.operator_stderr.clone()));
                let mut req = handle.set_stderr_request();
                req.get().set_stderr(stderr);
                req.send().promise.await?;
            }
            let editor: editor::Client = capnp_rpc::new_client(EditorServer::new(shared_editor(
                |content: &str, line: u32| -> std::io::Result<String> {
                    Ok(format!("{content}edited at line {line}\n"))
                },
            )));
            let mut req = handle.set_editor_request();
            req.get().set_editor(editor);
            req.send().promise.await?;

            let (input, output) = slots.attach().ok_or("not ready")?;
            Ok(Session::new(
                RemoteLineReader::new(input),
                RemoteWriter::new(output),
                slots,
                LocalStreams::new(self.host_stdout.clone(), self.host_stderr.clone()),
            ))
        }
    }

    #[test]
    fn test_capture_only_during_units() {
        let fixture = &Fixture::new();
        run_with_timeout(5, |_| async move {
            let session = fixture.session(true).await?;

            session.stdout().print("before ").await?;
            {
                let _unit = session.unit();
                assert!(session.is_capturing());
                session.stdout().print("hello").await?;
                session.stderr().print("oops").await?;
            }
            assert!(!session.is_capturing());
            session.stdout().print("after").await?;
            Ok(())
        });
        assert_eq!(fixture.operator_stdout.contents(), "hello");
        assert_eq!(fixture.operator_stderr.contents(), "oops");
        assert_eq!(fixture.host_stdout.contents(), "before after");
        assert_eq!(fixture.host_stderr.contents(), "");
    }

    #[test]
    fn test_units_without_capture_stay_local() {
        let fixture = &Fixture::new();
        run_with_timeout(5, |_| async move {
            let session = fixture.session(false).await?;
            let _outer = session.unit();
            let _inner = session.unit();
            assert!(!session.is_capturing());
            session.stdout().print("hello").await?;
            Ok(())
        });
        assert_eq!(fixture.host_stdout.contents(), "hello");
        assert_eq!(fixture.operator_stdout.contents(), "");
    }

    #[test]
    fn test_nested_units() {
        let fixture = &Fixture::new();
        run_with_timeout(5, |_| async move {
            let session = fixture.session(true).await?;
            let outer = session.unit();
            {
                let _inner = session.unit();
            }
            session.stdout().print("still captured").await?;
            drop(outer);
            session.stdout().print("released").await?;
            Ok(())
        });
        assert_eq!(fixture.operator_stdout.contents(), "still captured");
        assert_eq!(fixture.host_stdout.contents(), "released");
    }

    #[test]
    fn test_io_and_pager() {
        let fixture = &Fixture::new();
        run_with_timeout(5, |_| async move {
            let session = fixture.session(false).await?;
            assert_eq!(session.input().readline("> ").await?.as_deref(), Some("1"));
            session.output().puts("=> 1").await?;
            session.page("long\ntext\n").await?;
            Ok(())
        });
        assert_eq!(fixture.operator_output.contents(), "=> 1\nlong\ntext\n");
    }

    #[test]
    fn test_edit_file_goes_through_operator() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("script.rb");
        std::fs::write(&existing, "puts 1\n").unwrap();
        let missing = dir.path().join("new.rb");

        let fixture = &Fixture::new();
        run_with_timeout(5, |_| {
            let (existing, missing) = (existing.clone(), missing.clone());
            async move {
                let session = fixture.session(false).await?;
                session.edit_file(&existing, 4).await?;
                session.edit_file(&missing, 1).await?;
                Ok(())
            }
        });
        assert_eq!(
            std::fs::read_to_string(&existing).unwrap(),
            "puts 1\nedited at line 4\n"
        );
        assert_eq!(std::fs::read_to_string(&missing).unwrap(), "edited at line 1\n");
    }

    #[test]
    fn test_edit_file_without_editor() {
        run_with_timeout(5, |_| async move {
            let slots = Rc::new(SessionSlots::default());
            let session = Session::new(
                RemoteLineReader::new(capnp_rpc::new_client(LineReaderServer::new(
                    shared_source(ScriptedLines::default()),
                ))),
                RemoteWriter::new(capnp_rpc::new_client(WriterServer::new(Vec::new()))),
                slots,
                LocalStreams::new(Vec::new(), Vec::new()),
            );
            let res = session.edit_file(Path::new("/nonexistent/file"), 1).await;
            assert_matches!(res, Err(Error::Unsupported(_)));
            Ok(())
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_system_is_relayed() {
        let fixture = &Fixture::new();
        run_with_timeout(10, |_| async move {
            let session = fixture.session(false).await?;
            let status = session.system("echo relayed").await?;
            assert!(status.success());
            Ok(())
        });
        assert_eq!(fixture.operator_output.contents(), "relayed\n");
        assert_eq!(fixture.host_stdout.contents(), "");
    }
}
