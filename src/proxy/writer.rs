//! Output capability.

use std::{cell::RefCell, fmt, io::Write, rc::Rc};

use capnp::capability::Rc as ServerRc;

use crate::{error::Result, rpc::telerepl_capnp::writer};

pub type SharedSink = Rc<RefCell<Box<dyn Write>>>;

pub fn shared_sink(sink: impl Write + 'static) -> SharedSink {
    Rc::new(RefCell::new(Box::new(sink)))
}

/// Exports a local sink as a `Writer` capability.
///
/// Every call is written and flushed before it returns, in the order received.
pub struct WriterServer {
    sink: SharedSink,
}

impl WriterServer {
    pub fn new(sink: impl Write + 'static) -> Self {
        Self::from_shared(shared_sink(sink))
    }

    pub fn from_shared(sink: SharedSink) -> Self {
        Self { sink }
    }

    fn write_all(&self, data: &[u8]) -> Result<(), capnp::Error> {
        let mut sink = self.sink.borrow_mut();
        sink.write_all(data)
            .and_then(|()| sink.flush())
            .map_err(|err| capnp::Error::failed(format!("write failed: {err}")))
    }
}

impl writer::Server for WriterServer {
    async fn write(
        self: ServerRc<Self>,
        params: writer::WriteParams,
        mut results: writer::WriteResults,
    ) -> Result<(), capnp::Error> {
        let data = params.get()?.get_data()?;
        self.write_all(data)?;
        results.get().set_written(data.len() as u64);
        Ok(())
    }

    async fn puts(
        self: ServerRc<Self>,
        params: writer::PutsParams,
        _results: writer::PutsResults,
    ) -> Result<(), capnp::Error> {
        let line = params.get()?.get_line()?.to_str()?;
        if line.ends_with('\n') {
            self.write_all(line.as_bytes())
        } else {
            self.write_all(format!("{line}\n").as_bytes())
        }
    }

    async fn is_interactive(
        self: ServerRc<Self>,
        _params: writer::IsInteractiveParams,
        mut results: writer::IsInteractiveResults,
    ) -> Result<(), capnp::Error> {
        results.get().set_interactive(false);
        Ok(())
    }
}

/// Host-side handle on one of the operator's output streams.
#[derive(Clone)]
pub struct RemoteWriter {
    client: writer::Client,
}

impl RemoteWriter {
    pub fn new(client: writer::Client) -> Self {
        Self { client }
    }

    pub async fn write(&self, data: &[u8]) -> Result<u64> {
        let mut req = self.client.write_request();
        req.get().set_data(data);
        let reply = req.send().promise.await?;
        Ok(reply.get()?.get_written())
    }

    pub async fn print(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await?;
        Ok(())
    }

    /// Writes `line`, adding a newline unless it already ends with one.
    pub async fn puts(&self, line: &str) -> Result<()> {
        let mut req = self.client.puts_request();
        req.get().set_line(line);
        req.send().promise.await?;
        Ok(())
    }

    /// Formats locally, writes remotely: `out.printf(format_args!("{x:>4}")).await`.
    pub async fn printf(&self, args: fmt::Arguments<'_>) -> Result<()> {
        let text = fmt::format(args);
        self.print(&text).await
    }

    /// Chained writes: `out.append("a").await?.append("b").await?`.
    pub async fn append(&self, text: &str) -> Result<&Self> {
        self.print(text).await?;
        Ok(self)
    }

    /// Always false for a remote terminal.
    pub fn is_interactive(&self) -> bool {
        false
    }
}
