use std::future::Future;

use futures::channel::oneshot;

/// Runs blocking work (editors, child processes) on its own thread.
///
/// The RPC event loop is single threaded; awaiting the returned future keeps it serving
/// other calls while the work is in progress.
pub(crate) fn run_blocking<T, F>(f: F) -> impl Future<Output = std::io::Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("telerepl-blocking".to_owned())
        .spawn(move || {
            let _ = sender.send(f());
        });
    async move {
        spawned?;
        receiver
            .await
            .map_err(|_| std::io::Error::other("blocking task vanished"))?
    }
}
