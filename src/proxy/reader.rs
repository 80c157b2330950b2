//! Line reading capability.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{BufRead, BufReader, Write},
    rc::Rc,
    sync::mpsc,
};

use capnp::capability::Rc as ServerRc;
use futures::channel::oneshot;

use crate::{
    error::{Error, Result},
    rpc::telerepl_capnp::{completer, line_reader},
};

/// A source of input lines on the operator side.
///
/// Reads may block; they run on the source's own thread, see [`shared_source`].
pub trait LineSource: Send + 'static {
    /// Whether [`read_line`](LineSource::read_line) displays the prompt itself.
    fn accepts_prompt(&self) -> bool {
        false
    }

    /// Reads one line without its terminator, `None` at end of input.
    ///
    /// `prompt` is only passed to sources which accept it.
    fn read_line(&mut self, prompt: Option<&str>) -> std::io::Result<Option<String>>;

    fn keeps_history(&self) -> bool {
        false
    }

    fn add_history(&mut self, _line: &str) {}

    fn supports_completion(&self) -> bool {
        false
    }
}

struct ReadRequest {
    prompt: Option<String>,
    reply: oneshot::Sender<std::io::Result<Option<String>>>,
}

/// Handle on a [`LineSource`] owned by a dedicated input thread.
///
/// Reads are served one at a time, in order. A line read for a caller which gave up in the
/// meantime goes to the next caller, so input typed across sessions is not lost.
#[derive(Clone)]
pub struct SharedSource {
    requests: mpsc::Sender<ReadRequest>,
    accepts_prompt: bool,
    supports_completion: bool,
}

/// Moves `source` to its input thread.
pub fn shared_source(source: impl LineSource) -> SharedSource {
    let accepts_prompt = source.accepts_prompt();
    let supports_completion = source.supports_completion();
    let (requests, receiver) = mpsc::channel();
    let source: Box<dyn LineSource> = Box::new(source);
    if let Err(err) = std::thread::Builder::new()
        .name("telerepl-input".to_owned())
        .spawn(move || feed(source, receiver))
    {
        // The receiver is gone with the closure, every read reports it.
        tracing::error!("unable to start the input thread: {err}");
    }
    SharedSource {
        requests,
        accepts_prompt,
        supports_completion,
    }
}

impl SharedSource {
    pub fn accepts_prompt(&self) -> bool {
        self.accepts_prompt
    }

    pub fn supports_completion(&self) -> bool {
        self.supports_completion
    }

    /// Reads the next line. `prompt` is only handed to sources which accept it.
    pub async fn read_line(&self, prompt: &str) -> std::io::Result<Option<String>> {
        let (reply, line) = oneshot::channel();
        let prompt = self.accepts_prompt.then(|| prompt.to_owned());
        self.requests
            .send(ReadRequest { prompt, reply })
            .map_err(|_| std::io::Error::other("input thread is gone"))?;
        line.await.map_err(|_| std::io::Error::other("input thread is gone"))?
    }
}

fn feed(mut source: Box<dyn LineSource>, requests: mpsc::Receiver<ReadRequest>) {
    let keeps_history = source.keeps_history();
    let mut unclaimed = VecDeque::new();
    for ReadRequest { prompt, reply } in requests {
        let line = match unclaimed.pop_front() {
            Some(line) => Ok(Some(line)),
            None => {
                if reply.is_canceled() {
                    continue;
                }
                let line = source.read_line(prompt.as_deref());
                if let Ok(Some(line)) = &line {
                    if keeps_history && !line.trim().is_empty() {
                        source.add_history(line);
                    }
                }
                line
            }
        };
        if let Err(Ok(Some(line))) = reply.send(line) {
            tracing::debug!("line reader abandoned, keeping its line for the next read");
            unclaimed.push_front(line);
        }
    }
}

fn trim_newline(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

/// Plain buffered reader. It knows nothing about prompts.
pub struct ReaderLines<R> {
    reader: R,
}

impl<R> ReaderLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> LineSource for ReaderLines<R>
where
    R: BufRead + Send + 'static,
{
    fn read_line(&mut self, _prompt: Option<&str>) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(trim_newline(line)))
    }
}

/// Terminal input: shows the prompt, then reads a line.
pub struct TerminalLines<R, W> {
    reader: R,
    prompt_output: W,
}

impl TerminalLines<BufReader<std::io::Stdin>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R, W> TerminalLines<R, W> {
    pub fn new(reader: R, prompt_output: W) -> Self {
        Self {
            reader,
            prompt_output,
        }
    }
}

impl<R, W> LineSource for TerminalLines<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    fn accepts_prompt(&self) -> bool {
        true
    }

    fn read_line(&mut self, prompt: Option<&str>) -> std::io::Result<Option<String>> {
        if let Some(prompt) = prompt {
            self.prompt_output.write_all(prompt.as_bytes())?;
            self.prompt_output.flush()?;
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(trim_newline(line)))
    }
}

/// Fixed list of lines, for scripted sessions.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLines {
    lines: VecDeque<String>,
    prompted: bool,
    prompts: Vec<String>,
}

impl ScriptedLines {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            prompted: false,
            prompts: Vec::new(),
        }
    }

    /// Makes the source accept the prompt, which is recorded.
    pub fn prompted(mut self) -> Self {
        self.prompted = true;
        self
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl LineSource for ScriptedLines {
    fn accepts_prompt(&self) -> bool {
        self.prompted
    }

    fn read_line(&mut self, prompt: Option<&str>) -> std::io::Result<Option<String>> {
        if let Some(prompt) = prompt {
            self.prompts.push(prompt.to_owned());
        }
        Ok(self.lines.pop_front())
    }
}

type CompleterSlot = Rc<RefCell<Option<completer::Client>>>;

/// Exports a [`SharedSource`] as a `LineReader` capability.
pub struct LineReaderServer {
    source: SharedSource,
    completer: CompleterSlot,
}

impl LineReaderServer {
    pub fn new(source: SharedSource) -> Self {
        Self {
            source,
            completer: CompleterSlot::default(),
        }
    }

    /// Access to the completer the peer installs, which keeps working after the server has
    /// been turned into a client.
    pub fn completions(&self) -> Completions {
        Completions {
            slot: self.completer.clone(),
        }
    }
}

impl line_reader::Server for LineReaderServer {
    async fn readline(
        self: ServerRc<Self>,
        params: line_reader::ReadlineParams,
        mut results: line_reader::ReadlineResults,
    ) -> Result<(), capnp::Error> {
        let prompt = params.get()?.get_prompt()?.to_str()?.to_owned();
        let line = self
            .source
            .read_line(&prompt)
            .await
            .map_err(|err| capnp::Error::failed(format!("readline failed: {err}")))?;

        let mut results = results.get();
        match line {
            Some(line) => results.set_line(line.as_str()),
            None => results.set_eof(true),
        }
        Ok(())
    }

    async fn is_interactive(
        self: ServerRc<Self>,
        _params: line_reader::IsInteractiveParams,
        mut results: line_reader::IsInteractiveResults,
    ) -> Result<(), capnp::Error> {
        results.get().set_interactive(false);
        Ok(())
    }

    async fn set_completer(
        self: ServerRc<Self>,
        params: line_reader::SetCompleterParams,
        _results: line_reader::SetCompleterResults,
    ) -> Result<(), capnp::Error> {
        if !self.source.supports_completion() {
            return Err(capnp::Error::unimplemented(
                "input does not support completion".to_owned(),
            ));
        }
        let completer = params.get()?.get_completer()?;
        *self.completer.borrow_mut() = Some(completer);
        Ok(())
    }

    async fn get_completer(
        self: ServerRc<Self>,
        _params: line_reader::GetCompleterParams,
        mut results: line_reader::GetCompleterResults,
    ) -> Result<(), capnp::Error> {
        let completer = self.completer.borrow().clone();
        let mut results = results.get();
        if let Some(completer) = completer {
            results.set_completer(completer);
            results.set_installed(true);
        }
        Ok(())
    }
}

/// Operator-side view of the completer installed by the host.
#[derive(Clone)]
pub struct Completions {
    slot: CompleterSlot,
}

impl Completions {
    pub fn current(&self) -> Option<RemoteCompleter> {
        self.slot.borrow().clone().map(RemoteCompleter::new)
    }

    /// Calls the installed completer, in the process which installed it.
    pub async fn complete(&self, input: &str) -> Result<Vec<String>> {
        match self.current() {
            Some(completer) => completer.complete(input).await,
            None => Err(Error::Unsupported("no completer installed".to_owned())),
        }
    }
}

/// Exports a completion function as a `Completer` capability.
pub struct CompleterServer<F> {
    complete: F,
}

impl<F> CompleterServer<F>
where
    F: Fn(&str) -> Vec<String> + 'static,
{
    pub fn new(complete: F) -> Self {
        Self { complete }
    }
}

impl<F> completer::Server for CompleterServer<F>
where
    F: Fn(&str) -> Vec<String> + 'static,
{
    async fn complete(
        self: ServerRc<Self>,
        params: completer::CompleteParams,
        mut results: completer::CompleteResults,
    ) -> Result<(), capnp::Error> {
        let input = params.get()?.get_input()?.to_str()?;
        let candidates = (self.complete)(input);
        let mut list = results.get().init_candidates(candidates.len() as u32);
        for (i, candidate) in candidates.iter().enumerate() {
            list.set(i as u32, candidate.as_str());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RemoteCompleter {
    client: completer::Client,
}

impl RemoteCompleter {
    pub fn new(client: completer::Client) -> Self {
        Self { client }
    }

    pub async fn complete(&self, input: &str) -> Result<Vec<String>> {
        let mut req = self.client.complete_request();
        req.get().set_input(input);
        let reply = req.send().promise.await?;
        let candidates = reply.get()?.get_candidates()?;
        let mut out = Vec::with_capacity(candidates.len() as usize);
        for candidate in candidates.iter() {
            out.push(candidate?.to_str()?.to_owned());
        }
        Ok(out)
    }
}

/// Host-side handle on the operator's input.
#[derive(Clone)]
pub struct RemoteLineReader {
    client: line_reader::Client,
}

impl RemoteLineReader {
    pub fn new(client: line_reader::Client) -> Self {
        Self { client }
    }

    /// Reads the next line, `None` at end of input.
    ///
    /// The prompt is shown only if the operator's source can display it.
    pub async fn readline(&self, prompt: &str) -> Result<Option<String>> {
        let mut req = self.client.readline_request();
        req.get().set_prompt(prompt);
        let reply = req.send().promise.await?;
        let reply = reply.get()?;
        if reply.get_eof() {
            return Ok(None);
        }
        Ok(Some(reply.get_line()?.to_str()?.to_owned()))
    }

    /// Always false for a remote terminal.
    pub fn is_interactive(&self) -> bool {
        false
    }

    /// Installs a completion function which keeps running in this process.
    ///
    /// Returns `false` when the operator's input does not support completion.
    pub async fn set_completion<F>(&self, complete: F) -> Result<bool>
    where
        F: Fn(&str) -> Vec<String> + 'static,
    {
        let completer: completer::Client = capnp_rpc::new_client(CompleterServer::new(complete));
        let mut req = self.client.set_completer_request();
        req.get().set_completer(completer);
        match req.send().promise.await.map_err(Error::from) {
            Ok(_) => Ok(true),
            Err(Error::Unsupported(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn completion(&self) -> Result<Option<RemoteCompleter>> {
        let reply = self.client.get_completer_request().send().promise.await?;
        let reply = reply.get()?;
        if !reply.get_installed() {
            return Ok(None);
        }
        Ok(Some(RemoteCompleter::new(reply.get_completer()?)))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{
        io::Cursor,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_io::Timer;
    use futures::FutureExt;

    use super::*;
    use crate::tests::{fed_lines, run_with_timeout};

    /// Scripted lines whose reader accepts a completer.
    struct Completing(ScriptedLines);

    impl LineSource for Completing {
        fn read_line(&mut self, prompt: Option<&str>) -> std::io::Result<Option<String>> {
            self.0.read_line(prompt)
        }

        fn supports_completion(&self) -> bool {
            true
        }
    }

    fn remote(source: SharedSource) -> RemoteLineReader {
        RemoteLineReader::new(capnp_rpc::new_client(LineReaderServer::new(source)))
    }

    #[test]
    fn test_prompt_arity_is_transparent() {
        run_with_timeout(5, |_| async move {
            let plain = shared_source(ScriptedLines::new(["a", "b"]));
            let prompted = shared_source(ScriptedLines::new(["a", "b"]).prompted());

            for source in [plain, prompted] {
                let reader = remote(source);
                assert_eq!(reader.readline("prompt> ").await?.as_deref(), Some("a"));
                assert_eq!(reader.readline("prompt> ").await?.as_deref(), Some("b"));
                assert_eq!(reader.readline("prompt> ").await?, None);
            }
            Ok(())
        });
    }

    #[test]
    fn test_terminal_shows_prompt() {
        let mut terminal =
            TerminalLines::new(Cursor::new(b"x = 1\r\n\nx\n".to_vec()), Vec::new());
        assert!(terminal.accepts_prompt());
        assert!(!terminal.keeps_history());
        assert!(!terminal.supports_completion());
        assert_eq!(terminal.read_line(Some("> ")).unwrap().as_deref(), Some("x = 1"));
        assert_eq!(terminal.read_line(Some("> ")).unwrap().as_deref(), Some(""));
        assert_eq!(terminal.prompt_output, b"> > ");

        let source = shared_source(terminal);
        run_with_timeout(5, |_| {
            let source = source.clone();
            async move {
                let reader = remote(source);
                assert_eq!(reader.readline(">> ").await?.as_deref(), Some("x"));
                assert_eq!(reader.readline(">> ").await?, None);
                Ok(())
            }
        });
    }

    #[test]
    fn test_reader_lines_ignores_prompt() {
        let mut lines = ReaderLines::new(Cursor::new(b"one\ntwo".to_vec()));
        assert!(!lines.accepts_prompt());
        assert_eq!(lines.read_line(None).unwrap().as_deref(), Some("one"));
        assert_eq!(lines.read_line(None).unwrap().as_deref(), Some("two"));
        assert_eq!(lines.read_line(None).unwrap(), None);
    }

    #[test]
    fn test_history_is_appended_on_read() {
        struct Recording(Arc<Mutex<Vec<String>>>, VecDeque<&'static str>);

        impl LineSource for Recording {
            fn read_line(&mut self, _prompt: Option<&str>) -> std::io::Result<Option<String>> {
                Ok(self.1.pop_front().map(str::to_owned))
            }

            fn keeps_history(&self) -> bool {
                true
            }

            fn add_history(&mut self, line: &str) {
                self.0.lock().unwrap().push(line.to_owned());
            }
        }

        let history = Arc::new(Mutex::new(Vec::new()));
        let recording = shared_source(Recording(history.clone(), ["a", " ", "b"].into()));
        run_with_timeout(5, |_| async move {
            let reader = remote(recording);
            while reader.readline("").await?.is_some() {}
            Ok(())
        });
        // Blank lines are not worth recalling.
        assert_eq!(*history.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_never_interactive() {
        run_with_timeout(5, |_| async move {
            let client: line_reader::Client = capnp_rpc::new_client(LineReaderServer::new(
                shared_source(TerminalLines::new(Cursor::new(Vec::new()), Vec::new())),
            ));
            let reply = client.is_interactive_request().send().promise.await?;
            assert!(!reply.get()?.get_interactive());
            assert!(!RemoteLineReader::new(client).is_interactive());
            Ok(())
        });
    }

    #[test]
    fn test_completion_runs_where_installed() {
        run_with_timeout(5, |_| async move {
            let server = LineReaderServer::new(shared_source(Completing(ScriptedLines::default())));
            let completions = server.completions();
            let reader = RemoteLineReader::new(capnp_rpc::new_client(server));

            assert!(reader.completion().await?.is_none());
            assert!(completions.complete("pr").await.is_err());

            let calls = Rc::new(RefCell::new(Vec::new()));
            let installed = reader
                .set_completion({
                    let calls = calls.clone();
                    move |input: &str| {
                        calls.borrow_mut().push(input.to_owned());
                        ["print", "printf", "proc"]
                            .into_iter()
                            .filter(|word| word.starts_with(input))
                            .map(str::to_owned)
                            .collect()
                    }
                })
                .await?;
            assert!(installed);

            assert_eq!(completions.complete("pri").await?, ["print", "printf"]);
            let completer = reader.completion().await?.unwrap();
            assert_eq!(completer.complete("pro").await?, ["proc"]);
            assert_eq!(*calls.borrow(), ["pri", "pro"]);
            Ok(())
        });
    }

    #[test]
    fn test_completion_unsupported() {
        run_with_timeout(5, |_| async move {
            let reader = remote(shared_source(ScriptedLines::default()));
            assert!(!reader.set_completion(|_: &str| Vec::new()).await?);

            let terminal = TerminalLines::new(Cursor::new(Vec::new()), Vec::new());
            let reader = remote(shared_source(terminal));
            assert!(!reader.set_completion(|_: &str| Vec::new()).await?);
            Ok(())
        });
    }

    #[test]
    fn test_abandoned_read_keeps_its_line() {
        let (feed, lines) = fed_lines();
        let source = shared_source(lines);
        run_with_timeout(5, |_| async move {
            let mut abandoned = Box::pin(source.read_line("").fuse());
            futures::select! {
                res = abandoned => panic!("nothing was fed yet: {res:?}"),
                _ = Timer::after(Duration::from_millis(50)).fuse() => {}
            }
            drop(abandoned);

            feed.send("typed late".to_owned())?;
            feed.send("next".to_owned())?;
            assert_eq!(source.read_line("").await?.as_deref(), Some("typed late"));
            assert_eq!(source.read_line("").await?.as_deref(), Some("next"));
            drop(feed);
            assert_eq!(source.read_line("").await?, None);
            Ok(())
        });
    }
}
