//! Remote object substrate on Cap'n Proto RPC.
//!
//! [`Substrate`] publishes a root capability on a TCP address and resolves remote roots.
//!
//! Whether a value crossing the boundary is copied or referenced is decided by its type in
//! `telerepl.capnp`: structs, text and data are copied, interfaces are always live
//! capabilities whose calls travel back to the process which exported them. Every terminal,
//! editor and signal capability of a session is an interface.
//!
//! [`run_server_connection`] and [`client_connection`] wire a pair of byte streams with an
//! RPC system and can be used with any transport.

use std::net::SocketAddr;

use async_net::{TcpListener, TcpStream};
use async_stream::try_stream;
use capnp::{
    capability::{Client, FromClientHook},
    private::capability::ClientHook,
};
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::{
    channel::oneshot,
    io::{BufReader, BufWriter},
    task::LocalSpawnExt,
    AsyncRead, AsyncWrite, FutureExt, Stream, StreamExt,
};

use crate::{
    cancellation::CancellationToken,
    error::{Error, Result},
};

pub use reference::RemoteReference;

mod reference;

capnp::generated_code!(pub mod telerepl_capnp);

pub type Spawner = futures::executor::LocalSpawner;

/// Process-local endpoint of the substrate.
///
/// It owns the listeners started by [`publish`](Substrate::publish) and hands out lazy
/// [`RemoteReference`]s.
pub struct Substrate {
    spawner: Spawner,
    publications: Vec<Publication>,
}

struct Publication {
    address: SocketAddr,
    cancellation: CancellationToken,
    stopped: oneshot::Receiver<()>,
}

impl Substrate {
    pub fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            publications: Vec::new(),
        }
    }

    /// Publishes `root` at `address`.
    ///
    /// Every accepted connection gets `root` as its bootstrap capability. Returns the bound
    /// address, which differs from `address` when port 0 was requested.
    pub async fn publish(
        &mut self,
        address: SocketAddr,
        root: Box<dyn ClientHook>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                Error::AddressInUse(address)
            } else {
                err.into()
            }
        })?;
        let bound = listener.local_addr()?;

        let cancellation = CancellationToken::new();
        let (stopped_sender, stopped) = oneshot::channel();
        self.spawner.spawn_local(serve(
            listener,
            root,
            cancellation.clone(),
            self.spawner.clone(),
            stopped_sender,
        ))?;

        tracing::debug!(%bound, "published root capability");
        self.publications.push(Publication {
            address: bound,
            cancellation,
            stopped,
        });
        Ok(bound)
    }

    /// Returns a reference to the root published at `address`.
    ///
    /// Nothing is attempted on the network until the reference is first used.
    pub fn resolve<C>(&self, address: SocketAddr) -> RemoteReference<C>
    where
        C: FromClientHook + Clone,
    {
        RemoteReference::new(address, self.spawner.clone())
    }

    /// Stops every publication and closes their live connections.
    ///
    /// Returns once the listeners are closed, so the addresses can be published again.
    /// Calling it with nothing published, or twice, is fine.
    pub async fn shutdown(&mut self) {
        for publication in self.publications.drain(..) {
            publication.cancellation.cancel();
            // Only fails if the accept loop was dropped along with its executor.
            let _ = publication.stopped.await;
            tracing::debug!(address = %publication.address, "publication stopped");
        }
    }
}

async fn serve(
    listener: TcpListener,
    root: Box<dyn ClientHook>,
    cancellation: CancellationToken,
    spawner: Spawner,
    stopped: oneshot::Sender<()>,
) {
    let mut connections = Box::pin(listen(listener, cancellation.clone()));
    while let Some(conn) = connections.next().await {
        let (stream, peer) = match conn {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                break;
            }
        };
        tracing::debug!(%peer, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "unable to disable Nagle: {err}");
        }
        let (input, output) = futures::AsyncReadExt::split(stream);
        if let Err(err) = spawner.spawn_local(run_server_connection(
            input,
            output,
            root.clone(),
            cancellation.clone(),
        )) {
            tracing::error!("error while spawning connection handler: {err}");
        }
    }
    // The listener lives in the stream.
    drop(connections);
    let _ = stopped.send(());
}

fn listen(
    listener: TcpListener,
    cancellation: CancellationToken,
) -> impl Stream<Item = Result<(TcpStream, SocketAddr)>> {
    try_stream! {
        while let Some(conn) = await_connection(&listener, cancellation.clone()).await? {
            yield conn;
        }
    }
}

async fn await_connection(
    listener: &TcpListener,
    cancellation: CancellationToken,
) -> Result<Option<(TcpStream, SocketAddr)>> {
    let mut accept = Box::pin(listener.accept().fuse());
    let mut cancelled = cancellation.cancelled().fuse();
    futures::select! {
        conn = accept => Ok(Some(conn?)),
        () = cancelled => Ok(None),
    }
}

/// Runs a new RPC server connection.
///
/// The communication goes through the passed input and output, `client` is the bootstrap
/// capability offered to the peer. The connection stops when the peer leaves or when the
/// cancellation token is cancelled.
pub async fn run_server_connection<R, W>(
    input: R,
    output: W,
    client: Box<dyn ClientHook>,
    cancellation_token: CancellationToken,
) where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let network = twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        rpc_twoparty_capnp::Side::Server,
        Default::default(),
    );
    let mut rpc_system = RpcSystem::new(Box::new(network), Some(Client { hook: client })).fuse();

    let mut cancelled = cancellation_token.cancelled().fuse();
    futures::select! {
        res = rpc_system => {
            if let Err(err) = res {
                tracing::debug!("connection interrupted: {err}");
            } else {
                tracing::debug!("connection closed by peer");
            }
        }
        () = cancelled => {
            tracing::debug!("connection stopped");
        }
    }
}

/// Creates a RPC client connection.
///
/// The returned system must be driven by the executor. Capabilities passed through the
/// bootstrap client are exported by that system, so it is also the local server of the
/// calling process.
pub fn client_connection<R, W, C>(input: R, output: W) -> (RpcSystem<rpc_twoparty_capnp::Side>, C)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
    C: FromClientHook,
{
    let network = twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    );
    let mut rpc_system = RpcSystem::new(Box::new(network), None);
    let root: C = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);
    (rpc_system, root)
}
