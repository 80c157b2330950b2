//! Telerepl lets an operator drive a REPL running in another process, possibly on another
//! machine, from their own terminal.
//!
//! It is built on Cap'n Proto RPC over TCP, see `telerepl.capnp` for the protocol.
//!
//! ## Host
//!
//! The process running the interpreter publishes a session handle at a rendezvous address and
//! waits:
//!
//! * an operator attaches and hands over its terminal input, its terminal output and optionally
//!   its editor, its standard streams and a terminator
//! * the interpreter runs with the remote terminal as its input and output, see
//!   [`host::Evaluator`] and [`host::Session`]
//! * when the interpreter returns, the operator is signalled through its terminator and the
//!   handle is withdrawn
//!
//! The capabilities are references to the operator's objects, not copies of them: reading a
//! line on the host reads a line on the operator's terminal.
//!
//! ## Operator
//!
//! The `telerepl` binary, or [`operator::attach`], resolves the rendezvous address, registers the
//! local terminal and blocks until the host ends the session. It can wait for a host which is
//! not up yet and attach again after each session.
//!
//! ## Example
//!
//! See `demos/host.rs` in the Git repository for a toy interpreter to attach to.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod cancellation;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod operator;
pub mod proxy;
pub mod rpc;

mod internal;

pub use error::{Error, Result};

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{cell::RefCell, future::Future, io::Write, rc::Rc, time::Duration};

    use async_io::Timer;
    use futures::{executor::LocalSpawner, select, FutureExt};

    use crate::proxy::reader::LineSource;

    /// A port nobody listens on, at least right now.
    pub(crate) fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// In-memory sink whose contents stay readable after it was handed out.
    #[derive(Clone, Default)]
    pub(crate) struct TestSink(Rc<RefCell<Vec<u8>>>);

    impl TestSink {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for TestSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Input which blocks until a line is fed, and ends when the feeding side is dropped.
    pub(crate) struct FedLines(std::sync::mpsc::Receiver<String>);

    impl LineSource for FedLines {
        fn read_line(&mut self, _prompt: Option<&str>) -> std::io::Result<Option<String>> {
            Ok(self.0.recv().ok())
        }
    }

    pub(crate) fn fed_lines() -> (std::sync::mpsc::Sender<String>, FedLines) {
        let (feed, lines) = std::sync::mpsc::channel();
        (feed, FedLines(lines))
    }

    /// Runs `job` on a fresh `LocalPool`, failing the test after `secs` seconds.
    pub(crate) fn run_with_timeout<T, F>(secs: u64, job: impl FnOnce(LocalSpawner) -> F) -> T
    where
        F: Future<Output = Result<T, Box<dyn std::error::Error>>>,
    {
        let mut exec = futures::executor::LocalPool::new();
        let job = job(exec.spawner());

        let res = exec.run_until(async {
            let timeout =
                Timer::after(Duration::from_secs(secs)).then(async |_| Err("Test timeout".into()));

            select! {
                a = job.fuse() => a,
                b = timeout.fuse() => b,
            }
        });

        exec.run_until_stalled();

        res.unwrap()
    }
}
