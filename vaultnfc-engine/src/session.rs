use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vaultnfc_core::codec::{encode_frame_to_bytes, try_decode_frame};
use vaultnfc_core::error::TransferError;
use vaultnfc_core::transport::Connection;

const READ_BUF_LEN: usize = 2048;

/// Commands the manager sends to a live session.
#[derive(Debug)]
pub(crate) enum SessionCmd {
    /// Frame and write one payload; the outcome goes back on `reply`.
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    /// Shut down the write half and stop the read loop.
    Close,
}

/// What a session reports back to the manager.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Raw bytes exactly as one read returned them.
    Chunk(Bytes),
    /// A complete frame payload reassembled from one or more chunks.
    Payload(Bytes),
    /// The session is over.  Emitted exactly once, as the last event.
    /// `error` is `None` when the manager asked the session to close.
    Closed { error: Option<TransferError> },
}

/// Manager-side handle to a spawned session.
pub(crate) struct SessionHandle {
    pub id: u64,
    pub peer: String,
    pub cmd_tx: mpsc::Sender<SessionCmd>,
    pub task: JoinHandle<()>,
}

/// Spawns the single read/write task for `conn`.  Events are tagged with
/// `id` so the manager can drop those from a session it already replaced.
pub(crate) fn spawn<C: Connection>(
    id: u64,
    conn: C,
    events: mpsc::Sender<(u64, SessionEvent)>,
) -> SessionHandle {
    let peer = conn.peer();
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let task = tokio::spawn(run(id, conn, cmd_rx, events));
    SessionHandle {
        id,
        peer,
        cmd_tx,
        task,
    }
}

async fn run<C: Connection>(
    id: u64,
    mut conn: C,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    events: mpsc::Sender<(u64, SessionEvent)>,
) {
    let peer = conn.peer();
    info!(session_id = id, peer = %peer, "Session started");

    let mut buf = [0u8; READ_BUF_LEN];
    let mut accum = BytesMut::with_capacity(4096);

    let error = loop {
        select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCmd::Send { payload, reply }) => {
                    let frame = match encode_frame_to_bytes(&payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            // Nothing was written; the stream is still usable.
                            let _ = reply.send(Err(TransferError::write(&e)));
                            continue;
                        }
                    };
                    match conn.write_all(&frame).await {
                        Ok(()) => {
                            debug!(session_id = id, len = payload.len(), "Payload sent");
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(
                                session_id = id,
                                peer = %peer,
                                error = %e,
                                "Write failed, closing session"
                            );
                            let err = TransferError::write(&e);
                            let _ = reply.send(Err(err.clone()));
                            break Some(err);
                        }
                    }
                }
                Some(SessionCmd::Close) | None => {
                    if let Err(e) = conn.shutdown().await {
                        debug!(session_id = id, error = %e, "Shutdown after close failed");
                    }
                    break None;
                }
            },
            res = conn.read(&mut buf) => match res {
                Ok(0) => {
                    info!(session_id = id, peer = %peer, "Connection closed by peer");
                    break Some(TransferError::PeerDisconnected);
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    accum.extend_from_slice(&chunk);
                    let _ = events.send((id, SessionEvent::Chunk(chunk))).await;

                    match drain_frames(id, &mut accum, &events).await {
                        Ok(()) => {}
                        Err(err) => break Some(err),
                    }
                }
                Err(e) => {
                    warn!(session_id = id, peer = %peer, error = %e, "Read error, closing session");
                    break Some(TransferError::read(&e));
                }
            }
        }
    };

    let _ = events.send((id, SessionEvent::Closed { error })).await;
    debug!(session_id = id, "Session task stopped");
}

/// Emits every complete frame sitting in `accum`, leaving any partial frame
/// for the next read.
async fn drain_frames(
    id: u64,
    accum: &mut BytesMut,
    events: &mpsc::Sender<(u64, SessionEvent)>,
) -> Result<(), TransferError> {
    loop {
        match try_decode_frame(accum) {
            Ok(Some(payload)) => {
                debug!(session_id = id, len = payload.len(), "Payload received");
                let _ = events
                    .send((id, SessionEvent::Payload(payload.freeze())))
                    .await;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                // The stream cannot be resynchronised after a bad header.
                warn!(session_id = id, error = %e, "Protocol error, closing session");
                return Err(TransferError::read(&e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    /// Test connection over one end of an in-memory pipe.
    struct Pipe(DuplexStream);

    impl Connection for Pipe {
        fn peer(&self) -> String {
            "pipe".into()
        }

        async fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> anyhow::Result<usize> {
            Ok(self.0.read(buf).await?)
        }

        async fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> anyhow::Result<()> {
            Ok(self.0.write_all(buf).await?)
        }

        async fn shutdown(&mut self) -> anyhow::Result<()> {
            Ok(self.0.shutdown().await?)
        }
    }

    async fn next(rx: &mut mpsc::Receiver<(u64, SessionEvent)>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed")
            .1
    }

    async fn next_payload(rx: &mut mpsc::Receiver<(u64, SessionEvent)>) -> Bytes {
        loop {
            match next(rx).await {
                SessionEvent::Payload(p) => return p,
                SessionEvent::Chunk(_) => {}
                SessionEvent::Closed { error } => panic!("session closed early: {error:?}"),
            }
        }
    }

    /// Given a frame split into pieces, when read, then one payload is emitted.
    #[tokio::test]
    async fn given_fragmented_frame_when_read_then_one_payload_is_emitted() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let _handle = spawn(1, Pipe(local), events_tx);

        let frame = encode_frame_to_bytes(b"{\"title\":\"x\"}").unwrap();
        let (head, tail) = frame.split_at(5);
        remote.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(tail).await.unwrap();

        assert_eq!(&next_payload(&mut events_rx).await[..], b"{\"title\":\"x\"}");
    }

    /// Given a send command, when written, then the peer receives the framed payload.
    #[tokio::test]
    async fn given_send_cmd_when_written_then_peer_receives_framed_payload() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (events_tx, _events_rx) = mpsc::channel(32);
        let handle = spawn(1, Pipe(local), events_tx);

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(SessionCmd::Send {
                payload: b"abc".to_vec(),
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();

        let mut buf = vec![0u8; 12];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], b"VNFC");
        assert_eq!(&buf[9..], b"abc");
    }

    /// Given a peer that drops, when reading, then exactly one closed event is emitted.
    #[tokio::test]
    async fn given_peer_drops_when_reading_then_exactly_one_closed_event() {
        let (local, remote) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let handle = spawn(1, Pipe(local), events_tx);

        drop(remote);

        match next(&mut events_rx).await {
            SessionEvent::Closed { error } => {
                assert_eq!(error, Some(TransferError::PeerDisconnected));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        handle.task.await.unwrap();
        assert!(events_rx.recv().await.is_none());
    }

    /// Given a garbage header, when read, then the session closes with a read error.
    #[tokio::test]
    async fn given_garbage_header_when_read_then_session_closes_with_read_error() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let _handle = spawn(1, Pipe(local), events_tx);

        remote.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();

        loop {
            match next(&mut events_rx).await {
                SessionEvent::Chunk(_) => {}
                SessionEvent::Closed { error } => {
                    assert!(matches!(error, Some(TransferError::ReadFailed(_))));
                    break;
                }
                SessionEvent::Payload(_) => panic!("garbage must not decode"),
            }
        }
    }

    /// Given a close command, when processed, then the session closes without an error.
    #[tokio::test]
    async fn given_close_cmd_when_processed_then_closed_without_error() {
        let (local, _remote) = tokio::io::duplex(64);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let handle = spawn(1, Pipe(local), events_tx);

        handle.cmd_tx.send(SessionCmd::Close).await.unwrap();
        match next(&mut events_rx).await {
            SessionEvent::Closed { error } => assert_eq!(error, None),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
