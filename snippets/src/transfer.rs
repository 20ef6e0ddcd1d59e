//! File transfer over plain TCP
//!
//! Transfers run on a background tokio task so that the call returns right
//! away. Everything the caller learns about a transfer arrives as events on
//! its callback id: one `onTransferStarted`, any number of
//! `onTransferProgress`, then either `onTransferComplete` or
//! `onTransferFailed`. Cancelling aborts the task, which drops (and so
//! closes) its socket and file.

use std::net::SocketAddr;
use std::path::Path;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::event::{EventSink, ListenerHandle, Retention};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::storage::resolve_under;
use crate::{Bundle, Error, Result, SnippetContext};

pub const EVENT_TRANSFER_STARTED: &str = "onTransferStarted";
pub const EVENT_TRANSFER_PROGRESS: &str = "onTransferProgress";
pub const EVENT_TRANSFER_COMPLETE: &str = "onTransferComplete";
pub const EVENT_TRANSFER_FAILED: &str = "onTransferFailed";

const CHUNK_SIZE: usize = 64 * 1024;

pub struct TransferSnippet {
    ctx: SnippetContext,
}

impl TransferSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    // The task is aborted when the registration is released
    fn spawn<F>(&self, callback_id: &str, transfer: F) -> Result<()>
        where F: FnOnce(EventSink) -> tokio::task::JoinHandle<()>
    {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::precondition("File transfers need a tokio runtime"));
        }
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let task = transfer(sink);
                             Ok(ListenerHandle::new(move || task.abort()))
                         })
    }

    /// Sends the file at `path` (under the storage root) to `host:port`
    pub fn send_file(&self, callback_id: &str, host: &str, port: u16, path: &str) -> Result<()> {
        let source = resolve_under(self.ctx.storage_root(), path)?;
        let target = format!("{}:{}", host, port);
        self.spawn(callback_id, |sink| {
                tokio::spawn(async move {
                    match send(&sink, &target, &source).await {
                        Ok(bytes) => complete(&sink, bytes),
                        Err(err) => fail(&sink, err),
                    }
                })
            })
    }

    /// Accepts one connection on `port` and stores whatever it sends at
    /// `path` (under the storage root). Returns the port actually bound,
    /// which is only interesting when `port` is 0.
    pub fn receive_file(&self, callback_id: &str, port: u16, path: &str) -> Result<u16> {
        let destination = resolve_under(self.ctx.storage_root(), path)?;
        // Bound here rather than on the task so that bind errors reach the
        // caller directly.
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();
        self.spawn(callback_id, |sink| {
                tokio::spawn(async move {
                    let result = async {
                        let listener = TcpListener::from_std(listener)?;
                        receive(&sink, listener, &destination).await
                    };
                    match result.await {
                        Ok(bytes) => complete(&sink, bytes),
                        Err(err) => fail(&sink, err),
                    }
                })
            })?;
        info!("Waiting for a transfer on port {}", local_port);
        Ok(local_port)
    }

    /// Aborts the transfer, if it's still running, and forgets it
    pub fn cancel(&self, callback_id: &str) {
        self.ctx.bridge().unregister(callback_id);
    }
}

async fn send(sink: &EventSink, target: &str, source: &Path) -> Result<u64> {
    let mut file = File::open(source).await?;
    let total = file.metadata().await?.len();
    let mut stream = TcpStream::connect(target).await?;
    debug!("Sending {:?} ({} bytes) to {}", source, total, target);
    sink.emit(EVENT_TRANSFER_STARTED,
              Bundle::new().with("path", source.to_string_lossy().into_owned())
                           .with("peer", target)
                           .with("totalBytes", total as i64));
    let bytes = copy_with_progress(sink, &mut file, &mut stream, Some(total)).await?;
    stream.shutdown().await?;
    Ok(bytes)
}

async fn receive(sink: &EventSink, listener: TcpListener, destination: &Path) -> Result<u64> {
    let (mut stream, peer): (TcpStream, SocketAddr) = listener.accept().await?;
    // One transfer per call; stop listening right away
    drop(listener);
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(destination).await?;
    debug!("Receiving {:?} from {}", destination, peer);
    sink.emit(EVENT_TRANSFER_STARTED,
              Bundle::new().with("path", destination.to_string_lossy().into_owned())
                           .with("peer", peer.to_string()));
    let bytes = copy_with_progress(sink, &mut stream, &mut file, None).await?;
    file.sync_all().await?;
    Ok(bytes)
}

async fn copy_with_progress<R, W>(sink: &EventSink, reader: &mut R, writer: &mut W,
                                  total: Option<u64>)
                                  -> Result<u64>
    where R: AsyncRead + Unpin,
          W: AsyncWrite + Unpin
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        transferred += n as u64;
        let mut progress = Bundle::new();
        progress.put("bytes", transferred as i64);
        if let Some(total) = total {
            progress.put("totalBytes", total as i64);
        }
        sink.emit(EVENT_TRANSFER_PROGRESS, progress);
    }
    writer.flush().await?;
    Ok(transferred)
}

fn complete(sink: &EventSink, bytes: u64) {
    info!("Transfer {:?} complete, {} bytes", sink.callback_id(), bytes);
    sink.emit(EVENT_TRANSFER_COMPLETE, Bundle::new().with("bytes", bytes as i64));
}

fn fail(sink: &EventSink, err: Error) {
    warn!("Transfer {:?} failed: {}", sink.callback_id(), err);
    sink.emit(EVENT_TRANSFER_FAILED, Bundle::new().with("error", err.to_string()));
}

#[async_trait]
impl Snippet for TransferSnippet {
    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "transferSendFile" => {
                let callback_id: String = args.get(0)?;
                let host: String = args.get(1)?;
                let port: u16 = args.get(2)?;
                let path: String = args.get(3)?;
                to_value(self.send_file(&callback_id, &host, port, &path)?)
            }
            "transferReceiveFile" => {
                let callback_id: String = args.get(0)?;
                let port: u16 = args.get(1)?;
                let path: String = args.get(2)?;
                to_value(self.receive_file(&callback_id, port, &path)?)
            }
            "transferCancel" => to_value(self.cancel(&args.get::<String>(0)?)),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ContextConfig;

    const WAIT: Duration = Duration::from_secs(10);

    fn setup() -> (tempfile::TempDir, SnippetContext, TransferSnippet) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ContextConfig::new();
        config.set_storage_root(dir.path());
        let ctx = config.start().unwrap();
        let snippet = TransferSnippet::new(&ctx);
        (dir, ctx, snippet)
    }

    #[tokio::test]
    async fn file_goes_across() {
        let (dir, ctx, snippet) = setup();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("out.bin"), &payload).unwrap();

        let port = snippet.receive_file("rx", 0, "inbox/in.bin").unwrap();
        snippet.send_file("tx", "127.0.0.1", port, "out.bin").unwrap();

        let sent = ctx.bridge().wait_and_get("tx", EVENT_TRANSFER_COMPLETE, WAIT).await.unwrap();
        let received =
            ctx.bridge().wait_and_get("rx", EVENT_TRANSFER_COMPLETE, WAIT).await.unwrap();
        assert_eq!(sent.data.get_int("bytes"), Some(payload.len() as i64));
        assert_eq!(received.data.get_int("bytes"), Some(payload.len() as i64));
        assert_eq!(std::fs::read(dir.path().join("inbox/in.bin")).unwrap(), payload);

        let started = ctx.bridge().get_all("tx", EVENT_TRANSFER_STARTED);
        assert_eq!(started[0].data.get_int("totalBytes"), Some(payload.len() as i64));
        let progress = ctx.bridge().get_all("tx", EVENT_TRANSFER_PROGRESS);
        assert_eq!(progress.last().unwrap().data.get_int("bytes"),
                   Some(payload.len() as i64));
    }

    #[tokio::test]
    async fn failures_are_events() {
        let (_dir, ctx, snippet) = setup();
        // Nothing listens there once the throwaway listener is dropped
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap()
                                                             .local_addr()
                                                             .unwrap()
                                                             .port();
        std::fs::write(ctx.storage_root().join("f.txt"), b"data").unwrap();
        snippet.send_file("tx", "127.0.0.1", port, "f.txt").unwrap();
        let failed = ctx.bridge().wait_and_get("tx", EVENT_TRANSFER_FAILED, WAIT).await.unwrap();
        assert!(failed.data.get_str("error").is_some());

        snippet.send_file("missing", "127.0.0.1", port, "nope.txt").unwrap();
        ctx.bridge().wait_and_get("missing", EVENT_TRANSFER_FAILED, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn bad_paths_fail_the_call() {
        let (_dir, _ctx, snippet) = setup();
        assert!(matches!(snippet.send_file("tx", "127.0.0.1", 1, "../f"),
                         Err(Error::Precondition(_))));
        assert!(matches!(snippet.receive_file("rx", 0, "/etc/f"), Err(Error::Precondition(_))));
    }

    #[tokio::test]
    async fn cancel_releases_the_callback_id() {
        let (_dir, ctx, snippet) = setup();
        snippet.receive_file("rx", 0, "in.bin").unwrap();
        assert!(matches!(snippet.receive_file("rx", 0, "in.bin"),
                         Err(Error::AlreadyRegistered(_))));
        snippet.cancel("rx");
        assert!(!ctx.bridge().is_registered("rx"));
        snippet.receive_file("rx", 0, "in.bin").unwrap();
        snippet.shutdown();
        assert!(!ctx.bridge().is_registered("rx"));
    }

    #[test]
    fn needs_a_runtime() {
        let (_dir, _ctx, snippet) = setup();
        assert!(matches!(snippet.receive_file("rx", 0, "in.bin"), Err(Error::Precondition(_))));
    }
}
