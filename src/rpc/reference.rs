use std::{cell::RefCell, future::Future, net::SocketAddr};

use async_net::TcpStream;
use capnp::capability::FromClientHook;
use capnp_rpc::{rpc_twoparty_capnp::Side, Disconnector};
use futures::{task::LocalSpawnExt, AsyncReadExt};

use super::{client_connection, Spawner};
use crate::{cancellation::CancellationToken, error::Result};

/// Lazy reference to a root capability published by a peer.
///
/// The connection is opened on first use and cached. The RPC system behind it also
/// serves the capabilities this process passes to the peer.
pub struct RemoteReference<C> {
    address: SocketAddr,
    spawner: Spawner,
    connection: RefCell<Option<Connection<C>>>,
}

struct Connection<C> {
    root: C,
    disconnector: Disconnector<Side>,
    closed: CancellationToken,
}

impl<C> RemoteReference<C>
where
    C: FromClientHook + Clone,
{
    pub(super) fn new(address: SocketAddr, spawner: Spawner) -> Self {
        Self {
            address,
            spawner,
            connection: RefCell::new(None),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the remote root, connecting if there is no live connection.
    pub async fn client(&self) -> Result<C> {
        if let Some(conn) = self.connection.borrow().as_ref() {
            if !conn.closed.is_cancelled() {
                return Ok(conn.root.clone());
            }
        }
        let conn = self.connect().await?;
        let root = conn.root.clone();
        *self.connection.borrow_mut() = Some(conn);
        Ok(root)
    }

    /// Drops the cached connection and dials again.
    pub async fn reconnect(&self) -> Result<C> {
        self.disconnect().await;
        self.client().await
    }

    /// Completes when the current connection stops, immediately if there is none.
    pub fn closed(&self) -> impl Future<Output = ()> + 'static {
        let closed = self
            .connection
            .borrow()
            .as_ref()
            .map(|conn| conn.closed.clone());
        async move {
            if let Some(closed) = closed {
                closed.cancelled().await;
            }
        }
    }

    /// Stops the local RPC system, if any.
    pub async fn disconnect(&self) {
        let conn = self.connection.borrow_mut().take();
        if let Some(conn) = conn {
            if conn.closed.is_cancelled() {
                return;
            }
            if let Err(err) = conn.disconnector.await {
                tracing::debug!(address = %self.address, "disconnect: {err}");
            }
        }
    }

    async fn connect(&self) -> Result<Connection<C>> {
        let stream = TcpStream::connect(self.address).await?;
        stream.set_nodelay(true)?;
        let (input, output) = stream.split();
        let (rpc_system, root) = client_connection::<_, _, C>(input, output);
        let disconnector = rpc_system.get_disconnector();

        let closed = CancellationToken::new();
        self.spawner.spawn_local({
            let closed = closed.clone();
            let address = self.address;
            async move {
                if let Err(err) = rpc_system.await {
                    tracing::debug!(%address, "connection interrupted: {err}");
                }
                closed.cancel();
            }
        })?;

        tracing::debug!(address = %self.address, "connected");
        Ok(Connection {
            root,
            disconnector,
            closed,
        })
    }
}
