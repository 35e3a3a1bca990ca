use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{FrameSink, LinkEvent, PeerTransport};

/// Typed JSON messages over an open transport.
///
/// A background task owns the transport and decodes incoming frames, so
/// messages arrive in order and exactly once. Frames that fail to decode are
/// logged and dropped without closing the channel.
pub struct MessageChannel<M> {
    sink: Arc<dyn FrameSink>,
    inbound: mpsc::UnboundedReceiver<M>,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl<M> MessageChannel<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn open(mut transport: Box<dyn PeerTransport>) -> Self {
        let sink = transport.sink();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, inbound) = mpsc::unbounded_channel();

        let flag = closed.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = transport.next_event().await {
                match event {
                    LinkEvent::Frame(frame) => match serde_json::from_str::<M>(&frame) {
                        Ok(message) => {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "dropping undecodable frame"),
                    },
                    LinkEvent::Open => {}
                    LinkEvent::Closed => {
                        debug!("peer closed the link");
                        break;
                    }
                }
            }
            flag.store(true, Ordering::SeqCst);
            transport.close();
        });

        Self {
            sink,
            inbound,
            closed,
            pump,
        }
    }

    /// `false` when the channel is not open; the message is not queued.
    pub fn send(&self, message: &M) -> bool {
        if !self.is_open() {
            return false;
        }
        match serde_json::to_string(message) {
            Ok(frame) => self.sink.send_frame(frame),
            Err(err) => {
                warn!(%err, "cannot encode message");
                false
            }
        }
    }

    /// Next message; `None` once the link is closed and everything that
    /// arrived before has been handed out.
    pub async fn recv(&mut self) -> Option<M> {
        self.inbound.recv().await
    }
}

impl<M> MessageChannel<M> {
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.sink.is_open()
    }

    pub fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sink.close();
        }
        self.pump.abort();
    }
}

impl<M> Drop for MessageChannel<M> {
    fn drop(&mut self) {
        self.close();
    }
}
