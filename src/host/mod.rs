//! Host side: publish a session handle, wait for an operator and run the evaluator on its
//! terminal.
//!
//! [`serve`] is the blocking entry point. [`HostController`] does the same from inside an
//! existing `LocalPool`.

use std::{future::Future, rc::Rc, time::Duration};

use async_io::Timer;

use crate::{
    config::RendezvousAddress,
    error::{Error, Result},
    handle::{SessionHandleServer, SessionSlots},
    proxy::{reader::RemoteLineReader, terminator, writer::RemoteWriter},
    rpc::{telerepl_capnp::session_handle, Spawner, Substrate},
};

pub use session::{LocalStreams, Session, SessionStream, UnitGuard};

pub mod relay;
mod session;

/// Interval between two checks of the session handle while waiting for an operator.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls spent waiting for the rest of the handle once `input` and `output` are there.
const SETTLE_POLLS: u32 = 10;

/// The interpreter driven through the session.
///
/// It reads from [`Session::input`], writes to [`Session::output`] and returns when the
/// session is over. Returning an error ends the session the same way.
pub trait Evaluator {
    fn evaluate(
        &mut self,
        session: &Session,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error>>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Idle,
    PublishedWaiting,
    Attached,
    TearingDown,
    Done,
}

pub struct HostConfig {
    pub address: RendezvousAddress,
    /// Where uncaptured output goes.
    pub local: LocalStreams,
    pub poll_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: RendezvousAddress::from_env(),
            local: LocalStreams::stdio(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

pub struct HostController<E> {
    config: HostConfig,
    evaluator: E,
    spawner: Spawner,
    state: HostState,
}

impl<E> HostController<E>
where
    E: Evaluator,
{
    pub fn new(config: HostConfig, evaluator: E, spawner: Spawner) -> Self {
        Self {
            config,
            evaluator,
            spawner,
            state: HostState::Idle,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Runs one full session.
    ///
    /// Waits as long as needed for an operator. Whatever the evaluator returns, the operator
    /// is signalled and the publication is stopped before returning. The controller can be
    /// run again afterwards.
    pub async fn run(&mut self) -> Result<()> {
        let address = self.config.address.resolve().await?;
        let slots = Rc::new(SessionSlots::default());
        let root: session_handle::Client =
            capnp_rpc::new_client(SessionHandleServer::new(slots.clone()));

        let mut substrate = Substrate::new(self.spawner.clone());
        let bound = substrate.publish(address, root.client.hook).await?;
        self.state = HostState::PublishedWaiting;
        tracing::info!("waiting for an operator on {bound}");

        let (input, output) = loop {
            if let Some(io) = slots.attach() {
                break io;
            }
            Timer::after(self.config.poll_interval).await;
        };
        // The terminator is assigned last, give the operator a moment to finish.
        for _ in 0..SETTLE_POLLS {
            if slots.terminator().is_some() {
                break;
            }
            Timer::after(self.config.poll_interval).await;
        }
        self.state = HostState::Attached;
        tracing::info!("operator attached");

        let session = Session::new(
            RemoteLineReader::new(input),
            RemoteWriter::new(output),
            slots.clone(),
            self.config.local.clone(),
        );
        let res = self.evaluator.evaluate(&session).await;
        drop(session);

        self.state = HostState::TearingDown;
        teardown(&slots, &mut substrate).await;
        self.state = HostState::Done;

        res.map_err(Error::Evaluator)
    }
}

async fn teardown(slots: &SessionSlots, substrate: &mut Substrate) {
    tracing::info!("session terminated");
    match slots.terminator() {
        Some(client) => {
            if let Err(err) = terminator::terminate(&client).await {
                // The operator may already be gone.
                tracing::warn!("unable to signal the operator: {err}");
            }
        }
        None => tracing::debug!("the operator registered no terminator"),
    }
    tracing::info!("stopping");
    substrate.shutdown().await;
}

/// Publishes a session for `evaluator` and blocks until one full session completes.
///
/// Returns the evaluator so that its state can be inspected or reused.
pub fn serve<E>(evaluator: E, config: HostConfig) -> Result<E>
where
    E: Evaluator,
{
    let mut exec = futures::executor::LocalPool::new();
    let mut controller = HostController::new(config, evaluator, exec.spawner());

    let res = exec.run_until(controller.run());
    exec.run_until_stalled();

    res.map(|()| controller.evaluator)
}
