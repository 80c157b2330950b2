//! Operator side: find a published session handle and plug the local terminal into it.
//!
//! [`attach`] is the blocking entry point used by the `telerepl` binary.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_io::Timer;
use async_net::UdpSocket;
use futures::FutureExt;

use crate::{
    cancellation::CancellationToken,
    config::RendezvousAddress,
    error::{Error, Result},
    proxy::{
        editor::{shared_editor, EditorServer, ExternalEditor, SharedEditor},
        reader::{
            shared_source, Completions, LineReaderServer, LineSource, SharedSource, TerminalLines,
        },
        terminator::TerminatorServer,
        writer::{shared_sink, SharedSink, WriterServer},
    },
    rpc::{
        telerepl_capnp::{editor, line_reader, session_handle, terminator, writer},
        RemoteReference, Spawner, Substrate,
    },
};

/// Delay before attaching again after a connection error.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub address: RendezvousAddress,
    /// Retry the attachment while the host is unreachable.
    pub wait: bool,
    /// Attach again after each session, retrying like `wait`.
    pub persist: bool,
    /// Also hand the local stdout and stderr to the host.
    pub capture: bool,
    pub retry_delay: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            address: RendezvousAddress::from_env(),
            wait: false,
            persist: false,
            capture: false,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// The local streams the operator lends to the host, reused across sessions.
#[derive(Clone)]
pub struct OperatorIo {
    input: SharedSource,
    output: SharedSink,
    stdout: SharedSink,
    stderr: SharedSink,
    editor: SharedEditor,
}

impl OperatorIo {
    pub fn new(input: impl LineSource, output: impl std::io::Write + 'static) -> Self {
        Self {
            input: shared_source(input),
            output: shared_sink(output),
            stdout: shared_sink(std::io::stdout()),
            stderr: shared_sink(std::io::stderr()),
            editor: shared_editor(ExternalEditor::from_env()),
        }
    }

    /// This process' terminal and the user's editor.
    pub fn terminal() -> Self {
        Self::new(TerminalLines::stdio(), std::io::stdout())
    }

    /// Streams receiving the host's captured stdout and stderr.
    pub fn with_capture_streams(
        mut self,
        stdout: impl std::io::Write + 'static,
        stderr: impl std::io::Write + 'static,
    ) -> Self {
        self.stdout = shared_sink(stdout);
        self.stderr = shared_sink(stderr);
        self
    }

    pub fn with_editor(mut self, editor: impl crate::proxy::editor::EditorBackend) -> Self {
        self.editor = shared_editor(editor);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorState {
    Connecting,
    Retrying,
    Attached,
    Detached,
    Failed,
}

pub struct Operator {
    config: OperatorConfig,
    io: OperatorIo,
    spawner: Spawner,
    state: OperatorState,
    retries: usize,
    sessions: usize,
    completions: Option<Completions>,
}

impl Operator {
    pub fn new(config: OperatorConfig, io: OperatorIo, spawner: Spawner) -> Self {
        Self {
            config,
            io,
            spawner,
            state: OperatorState::Connecting,
            retries: 0,
            sessions: 0,
            completions: None,
        }
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    /// Number of attach attempts which failed and were retried.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Number of sessions completed.
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// Completer installed by the host during the current or last session.
    pub fn completions(&self) -> Option<&Completions> {
        self.completions.as_ref()
    }

    /// Attaches and stays attached until the host ends the session.
    ///
    /// With `persist`, starts over right after each session and only returns on an error
    /// which is not worth retrying. A handle still held by the previous session is retried.
    pub async fn connect(&mut self) -> Result<()> {
        loop {
            self.state = OperatorState::Connecting;
            match self.attach_once().await {
                Ok(()) => {
                    self.state = OperatorState::Detached;
                    self.sessions += 1;
                    tracing::info!("detached");
                    if !self.config.persist {
                        return Ok(());
                    }
                }
                Err(err) if err.is_retryable() && (self.config.wait || self.config.persist) => {
                    self.state = OperatorState::Retrying;
                    self.retries += 1;
                    tracing::warn!(
                        "unable to attach to {}: {err}, retrying in {:?}",
                        self.config.address,
                        self.config.retry_delay
                    );
                    Timer::after(self.config.retry_delay).await;
                }
                Err(err) => {
                    self.state = OperatorState::Failed;
                    return Err(err);
                }
            }
        }
    }

    async fn attach_once(&mut self) -> Result<()> {
        let address = self.config.address.resolve().await?;
        match local_address_toward(address).await {
            Ok(local) => tracing::debug!(%local, "reaching {address}"),
            Err(err) => {
                tracing::debug!("unable to find the local address toward {address}: {err}")
            }
        }

        let substrate = Substrate::new(self.spawner.clone());
        let reference: RemoteReference<session_handle::Client> = substrate.resolve(address);
        let res = self.attach_with(&reference).await;
        reference.disconnect().await;
        res
    }

    async fn attach_with(
        &mut self,
        reference: &RemoteReference<session_handle::Client>,
    ) -> Result<()> {
        let handle = cleanup(reference, reference.client().await?).await?;

        let input = LineReaderServer::new(self.io.input.clone());
        self.completions = Some(input.completions());
        let input: line_reader::Client = capnp_rpc::new_client(input);
        let mut req = handle.set_input_request();
        req.get().set_input(input);
        req.send().promise.await?;

        let output: writer::Client =
            capnp_rpc::new_client(WriterServer::from_shared(self.io.output.clone()));
        let mut req = handle.set_output_request();
        req.get().set_output(output);
        req.send().promise.await?;

        if self.config.capture {
            let stdout: writer::Client =
                capnp_rpc::new_client(WriterServer::from_shared(self.io.stdout.clone()));
            let mut req = handle.set_stdout_request();
            req.get().set_stdout(stdout);
            req.send().promise.await?;

            let stderr: writer::Client =
                capnp_rpc::new_client(WriterServer::from_shared(self.io.stderr.clone()));
            let mut req = handle.set_stderr_request();
            req.get().set_stderr(stderr);
            req.send().promise.await?;
        }

        let editor: editor::Client =
            capnp_rpc::new_client(EditorServer::new(self.io.editor.clone()));
        let mut req = handle.set_editor_request();
        req.get().set_editor(editor);
        req.send().promise.await?;

        let terminated = CancellationToken::new();
        let terminator: terminator::Client =
            capnp_rpc::new_client(TerminatorServer::new(terminated.clone()));
        let mut req = handle.set_terminator_request();
        req.get().set_terminator(terminator);
        req.send().promise.await?;

        self.state = OperatorState::Attached;
        tracing::info!("attached to {}", reference.address());

        let mut terminated = terminated.cancelled().fuse();
        let mut closed = Box::pin(reference.closed().fuse());
        futures::select! {
            () = terminated => tracing::info!("session terminated by the host"),
            () = closed => tracing::warn!("connection to the host lost"),
        }
        Ok(())
    }
}

/// Calls the handle once so that a stale connection is noticed and replaced.
///
/// Connection and missing-method errors are swallowed.
async fn cleanup(
    reference: &RemoteReference<session_handle::Client>,
    handle: session_handle::Client,
) -> Result<session_handle::Client> {
    match handle.ping_request().send().promise.await.map_err(Error::from) {
        Ok(_) | Err(Error::Unsupported(_)) => Ok(handle),
        Err(Error::Connection(err)) => {
            tracing::debug!("stale connection ({err}), reconnecting");
            reference.reconnect().await
        }
        Err(err) => Err(err),
    }
}

/// Returns the local address the system would use to reach `peer`.
///
/// Connecting a UDP socket sends nothing, it only selects the route.
pub async fn local_address_toward(peer: SocketAddr) -> Result<IpAddr> {
    let unspecified: IpAddr = if peer.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind((unspecified, 0)).await?;
    socket.connect(peer).await?;
    Ok(socket.local_addr()?.ip())
}

/// Attaches the terminal described by `io` according to `config`, blocking until done.
pub fn attach(config: OperatorConfig, io: OperatorIo) -> Result<()> {
    let mut exec = futures::executor::LocalPool::new();
    let mut operator = Operator::new(config, io, exec.spawner());

    let res = exec.run_until(operator.connect());
    exec.run_until_stalled();

    res
}
