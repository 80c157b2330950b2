//! One-shot termination signal, exported by the operator and fired by the host.

use capnp::capability::Rc as ServerRc;

use crate::{cancellation::CancellationToken, error::Result, rpc::telerepl_capnp::terminator};

pub struct TerminatorServer {
    token: CancellationToken,
}

impl TerminatorServer {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl terminator::Server for TerminatorServer {
    async fn terminate(
        self: ServerRc<Self>,
        _params: terminator::TerminateParams,
        _results: terminator::TerminateResults,
    ) -> Result<(), capnp::Error> {
        tracing::debug!("termination requested by the host");
        self.token.cancel();
        Ok(())
    }
}

/// Fires the operator's terminator.
pub async fn terminate(client: &terminator::Client) -> Result<()> {
    client.terminate_request().send().promise.await?;
    Ok(())
}
