//! Uplink connection plumbing.
//!
//! A [`Conn`] is the live half of a remote instance: a bounded write
//! queue drained by a writer task, and a reader task decoding
//! length-prefixed frames into the owner's callback.  Either side
//! failing marks the connection closed and cancels the other; the
//! owner's `on_closed` fires exactly once, from the reader.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gate_proto::ByteOrder;
use gate_proto::framing::FrameCodec;

use crate::error::ServiceError;
use crate::options::Options;

#[derive(Clone)]
pub(crate) struct Conn {
    write_tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Conn {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Queues pre-framed bytes for the writer.  A full queue is a send
    /// error surfaced to the caller, not a stall.
    pub(crate) fn send(&self, frames: Bytes) -> Result<(), ServiceError> {
        if self.is_closed() {
            return Err(ServiceError::NotConnected);
        }
        self.write_tx.try_send(frames).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServiceError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => ServiceError::NotConnected,
        })
    }
}

/// Applies socket options and spawns the reader/writer tasks.
pub(crate) fn spawn_conn(
    stream: TcpStream,
    options: &Options,
    order: ByteOrder,
    mut on_body: impl FnMut(BytesMut) + Send + 'static,
    on_closed: impl FnOnce() + Send + 'static,
) -> Conn {
    apply_socket_options(&stream, options);

    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(options.transfer_write_queue_cap);
    let closed = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    let (read_half, mut write_half) = stream.into_split();

    let writer_closed = closed.clone();
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = write_rx.recv() => match item {
                    Some(frames) => {
                        if let Err(e) = write_half.write_all(&frames).await {
                            debug!(error = %e, "uplink write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        writer_closed.store(true, Ordering::Release);
        writer_cancel.cancel();
        let _ = write_half.shutdown().await;
    });

    let reader_closed = closed.clone();
    let reader_cancel = cancel.clone();
    let read_cap = options.transfer_read_buffer_cap;
    tokio::spawn(async move {
        let mut framed = FramedRead::with_capacity(read_half, FrameCodec::new(order), read_cap);
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = framed.next() => match frame {
                    Some(Ok(body)) => on_body(body),
                    Some(Err(e)) => {
                        warn!(error = %e, "uplink read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        reader_closed.store(true, Ordering::Release);
        reader_cancel.cancel();
        on_closed();
    });

    Conn {
        write_tx,
        closed,
        cancel,
    }
}

fn apply_socket_options(stream: &TcpStream, options: &Options) {
    let _ = stream.set_nodelay(true);
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_recv_buffer_size(options.transfer_socket_recv_buffer);
    let _ = sock.set_send_buffer_size(options.transfer_socket_send_buffer);
    let keepalive = socket2::TcpKeepalive::new().with_time(options.transfer_tcp_keep_alive);
    let _ = sock.set_tcp_keepalive(&keepalive);
}
