//! Stream connection to the server.
//!
//! One reader task routes every inbound message either to a
//! request-id-indexed waiter (completing a `send_with_response` call) or
//! to the callback channel the sync engine drains. One writer task owns
//! the write half, so concurrent senders never interleave frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::protocol::{self, ClientMessage, ServerMessage};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type WaiterMap = Arc<Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>>;

pub struct Connection {
    outbound: mpsc::UnboundedSender<Bytes>,
    waiters: WaiterMap,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Connect and start the reader/writer tasks. Returns the connection
    /// and the channel of messages that match no waiter (snapshots,
    /// content chunks, pushed errors).
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let stream = TcpStream::connect(addr).await.map_err(SyncError::Io)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (mut read_half, write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (callback_tx, callback_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(frame) = outbound_rx.recv().await {
                if protocol::write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_waiters = waiters.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            loop {
                let (msg_type, request_id, payload) =
                    match protocol::read_frame(&mut read_half).await {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("server stream ended: {e:#}");
                            break;
                        }
                    };

                let msg = match ServerMessage::decode(msg_type, payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("undecodable {msg_type:?} message: {e:#}");
                        continue;
                    }
                };

                // Responses complete their waiter; everything else goes to
                // the callback queue.
                if !request_id.is_empty() {
                    if let Some(waiter) = reader_waiters.lock().remove(&request_id) {
                        let _ = waiter.send(msg);
                        continue;
                    }
                }
                if callback_tx.send(msg).is_err() {
                    break;
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            // Wake every outstanding waiter with Cancelled
            reader_waiters.lock().clear();
        });

        (
            Self {
                outbound,
                waiters,
                connected,
                reader: Mutex::new(Some(reader)),
            },
            callback_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send without waiting for a response. The reply, if any, arrives on
    /// the callback channel.
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        self.send_with_request_id(msg, &Uuid::new_v4().to_string())
    }

    fn send_with_request_id(&self, msg: &ClientMessage, request_id: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.outbound
            .send(msg.encode(request_id))
            .map_err(|_| SyncError::NotConnected)
    }

    /// Send and wait for the response echoing our request id.
    pub async fn send_with_response(
        &self,
        msg: &ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        // Register before sending so a fast response cannot slip past
        self.waiters.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.send_with_request_id(msg, &request_id) {
            self.waiters.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SyncError::Cancelled),
            Err(_) => {
                self.waiters.lock().remove(&request_id);
                Err(SyncError::Timeout(format!(
                    "no response to {:?} within {timeout:?}",
                    msg.message_type()
                )))
            }
        }
    }

    /// Tear the connection down: stops the reader and wakes every
    /// outstanding waiter with `Cancelled`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.waiters.lock().clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
