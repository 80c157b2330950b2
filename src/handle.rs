//! Session handle: the record through which the operator hands its capabilities to the host.
//!
//! The operator writes, the host reads. The host considers the handle ready as soon as both
//! `input` and `output` are present; the optional fields are read when they are needed.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use capnp::capability::Rc as ServerRc;

use crate::rpc::telerepl_capnp::{editor, line_reader, session_handle, terminator, writer};

/// Storage shared between the handle server and the host controller.
#[derive(Default)]
pub struct SessionSlots {
    input: RefCell<Option<line_reader::Client>>,
    output: RefCell<Option<writer::Client>>,
    stdout: RefCell<Option<writer::Client>>,
    stderr: RefCell<Option<writer::Client>>,
    editor: RefCell<Option<editor::Client>>,
    terminator: RefCell<Option<terminator::Client>>,
    attached: Cell<bool>,
}

impl SessionSlots {
    /// Ready means `input` and `output` are both present, nothing less.
    pub fn is_ready(&self) -> bool {
        self.input.borrow().is_some() && self.output.borrow().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    /// Marks the handle as attached and returns input and output, if ready.
    ///
    /// Once attached, `input` and `output` can no longer be replaced.
    pub fn attach(&self) -> Option<(line_reader::Client, writer::Client)> {
        if self.attached.get() {
            return None;
        }
        let input = self.input.borrow().clone()?;
        let output = self.output.borrow().clone()?;
        self.attached.set(true);
        Some((input, output))
    }

    pub fn stdout(&self) -> Option<writer::Client> {
        self.stdout.borrow().clone()
    }

    pub fn stderr(&self) -> Option<writer::Client> {
        self.stderr.borrow().clone()
    }

    pub fn editor(&self) -> Option<editor::Client> {
        self.editor.borrow().clone()
    }

    pub fn terminator(&self) -> Option<terminator::Client> {
        self.terminator.borrow().clone()
    }

    fn store<T>(
        &self,
        slot: &RefCell<Option<T>>,
        value: T,
        name: &str,
        required: bool,
    ) -> Result<(), capnp::Error> {
        if required && self.attached.get() {
            return Err(capnp::Error::overloaded(format!(
                "session already attached, cannot replace {name}"
            )));
        }
        if slot.replace(Some(value)).is_some() {
            // Left over by an attempt which failed half way.
            tracing::debug!("replacing {name} of the session handle");
        } else {
            tracing::trace!("session handle {name} set");
        }
        Ok(())
    }
}

/// Root capability published by the host.
pub struct SessionHandleServer {
    slots: Rc<SessionSlots>,
}

impl SessionHandleServer {
    pub fn new(slots: Rc<SessionSlots>) -> Self {
        Self { slots }
    }
}

impl session_handle::Server for SessionHandleServer {
    async fn ping(
        self: ServerRc<Self>,
        _params: session_handle::PingParams,
        _results: session_handle::PingResults,
    ) -> Result<(), capnp::Error> {
        Ok(())
    }

    async fn set_input(
        self: ServerRc<Self>,
        params: session_handle::SetInputParams,
        _results: session_handle::SetInputResults,
    ) -> Result<(), capnp::Error> {
        let input = params.get()?.get_input()?;
        self.slots.store(&self.slots.input, input, "input", true)
    }

    async fn set_output(
        self: ServerRc<Self>,
        params: session_handle::SetOutputParams,
        _results: session_handle::SetOutputResults,
    ) -> Result<(), capnp::Error> {
        let output = params.get()?.get_output()?;
        self.slots.store(&self.slots.output, output, "output", true)
    }

    async fn set_stdout(
        self: ServerRc<Self>,
        params: session_handle::SetStdoutParams,
        _results: session_handle::SetStdoutResults,
    ) -> Result<(), capnp::Error> {
        let stdout = params.get()?.get_stdout()?;
        self.slots.store(&self.slots.stdout, stdout, "stdout", false)
    }

    async fn set_stderr(
        self: ServerRc<Self>,
        params: session_handle::SetStderrParams,
        _results: session_handle::SetStderrResults,
    ) -> Result<(), capnp::Error> {
        let stderr = params.get()?.get_stderr()?;
        self.slots.store(&self.slots.stderr, stderr, "stderr", false)
    }

    async fn set_editor(
        self: ServerRc<Self>,
        params: session_handle::SetEditorParams,
        _results: session_handle::SetEditorResults,
    ) -> Result<(), capnp::Error> {
        let editor = params.get()?.get_editor()?;
        self.slots.store(&self.slots.editor, editor, "editor", false)
    }

    async fn set_terminator(
        self: ServerRc<Self>,
        params: session_handle::SetTerminatorParams,
        _results: session_handle::SetTerminatorResults,
    ) -> Result<(), capnp::Error> {
        let terminator = params.get()?.get_terminator()?;
        self.slots
            .store(&self.slots.terminator, terminator, "terminator", false)
    }
}
