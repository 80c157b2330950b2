//! Editor delegation: the host sends content, the operator edits it and sends it back.

use std::{
    io::Write,
    process::Command,
    sync::{Arc, Mutex},
};

use capnp::capability::Rc as ServerRc;

use crate::{error::Result, internal::run_blocking, rpc::telerepl_capnp::editor};

/// Something able to edit a piece of text, starting at a given line.
pub trait EditorBackend: Send + 'static {
    fn edit(&mut self, content: &str, line: u32) -> std::io::Result<String>;
}

impl<F> EditorBackend for F
where
    F: FnMut(&str, u32) -> std::io::Result<String> + Send + 'static,
{
    fn edit(&mut self, content: &str, line: u32) -> std::io::Result<String> {
        self(content, line)
    }
}

pub type SharedEditor = Arc<Mutex<Box<dyn EditorBackend>>>;

pub fn shared_editor(editor: impl EditorBackend) -> SharedEditor {
    Arc::new(Mutex::new(Box::new(editor)))
}

/// Runs the user's editor on a temporary file.
#[derive(Clone, Debug)]
pub struct ExternalEditor {
    command: String,
}

impl ExternalEditor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// `$VISUAL`, then `$EDITOR`, then `vi`.
    pub fn from_env() -> Self {
        let command = ["VISUAL", "EDITOR"]
            .into_iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "vi".to_owned());
        Self::new(command)
    }
}

impl EditorBackend for ExternalEditor {
    fn edit(&mut self, content: &str, line: u32) -> std::io::Result<String> {
        let mut file = tempfile::Builder::new()
            .prefix("telerepl-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;

        let mut words = self.command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| std::io::Error::other("empty editor command"))?;
        let status = Command::new(program)
            .args(words)
            .arg(format!("+{}", line.max(1)))
            .arg(file.path())
            .status()?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "editor `{}` exited with {status}",
                self.command
            )));
        }
        std::fs::read_to_string(file.path())
    }
}

/// Exports an [`EditorBackend`] as an `Editor` capability.
pub struct EditorServer {
    backend: SharedEditor,
}

impl EditorServer {
    pub fn new(backend: SharedEditor) -> Self {
        Self { backend }
    }
}

impl editor::Server for EditorServer {
    async fn edit(
        self: ServerRc<Self>,
        params: editor::EditParams,
        mut results: editor::EditResults,
    ) -> Result<(), capnp::Error> {
        let params = params.get()?;
        let content = params.get_content()?.to_str()?.to_owned();
        let line = params.get_line();
        let backend = self.backend.clone();

        let edited = run_blocking(move || {
            backend
                .lock()
                .map_err(|_| std::io::Error::other("editor poisoned"))?
                .edit(&content, line)
        })
        .await
        .map_err(|err| capnp::Error::failed(format!("edit failed: {err}")))?;

        results.get().set_content(edited.as_str());
        Ok(())
    }
}

/// Host-side handle on the operator's editor.
#[derive(Clone)]
pub struct RemoteEditor {
    client: editor::Client,
}

impl RemoteEditor {
    pub fn new(client: editor::Client) -> Self {
        Self { client }
    }

    pub async fn edit(&self, content: &str, line: u32) -> Result<String> {
        let mut req = self.client.edit_request();
        req.get().set_content(content);
        req.get().set_line(line);
        let reply = req.send().promise.await?;
        Ok(reply.get()?.get_content()?.to_str()?.to_owned())
    }
}
