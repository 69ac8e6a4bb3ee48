//! Out-of-band event relay to listeners outside the core.
//!
//! Frames are the interface name, NUL padded to [`IFNAMSIZ`], followed by the
//! payload. Broadcasting never blocks and never queues beyond each listener's
//! bounded channel. A listener that is behind misses the frame; the caller
//! gets an error only when no listener took it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, RwLock};

use log::{debug, trace};

use crate::error::WlanError;
use crate::types::IFNAMSIZ;

/// Largest frame handed to a listener, interface-name prefix included.
pub const NL_MAX_PAYLOAD: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFrame {
    bytes: Vec<u8>,
}

impl EventFrame {
    pub fn encode(ifname: &str, payload: &[u8]) -> Result<Self, WlanError> {
        let name = ifname.as_bytes();
        if name.len() >= IFNAMSIZ {
            return Err(WlanError::config(format!("interface name {ifname:?} too long")));
        }
        let len = IFNAMSIZ + payload.len();
        if len > NL_MAX_PAYLOAD {
            return Err(WlanError::EventTooLarge {
                len,
                max: NL_MAX_PAYLOAD,
            });
        }
        let mut bytes = vec![0u8; len];
        bytes[..name.len()].copy_from_slice(name);
        bytes[IFNAMSIZ..].copy_from_slice(payload);
        Ok(Self { bytes })
    }

    pub fn ifname(&self) -> String {
        let prefix = &self.bytes[..IFNAMSIZ];
        let end = prefix.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&prefix[..end]).into_owned()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[IFNAMSIZ..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub trait EventSink: Send + Sync {
    fn sink_id(&self) -> &str;

    fn publish(&self, frame: EventFrame) -> Result<(), WlanError>;
}

/// Listener fed through a bounded channel.
pub struct ChannelEventSink {
    sink_id: String,
    tx: SyncSender<EventFrame>,
}

impl ChannelEventSink {
    pub fn new(
        sink_id: impl Into<String>,
        capacity: usize,
    ) -> Result<(Self, Receiver<EventFrame>), WlanError> {
        let sink_id = sink_id.into();
        if sink_id.trim().is_empty() {
            return Err(WlanError::config("event sink_id must not be empty"));
        }
        if capacity == 0 {
            return Err(WlanError::config("event sink capacity must be greater than zero"));
        }
        let (tx, rx) = mpsc::sync_channel(capacity);
        Ok((Self { sink_id, tx }, rx))
    }
}

impl EventSink for ChannelEventSink {
    fn sink_id(&self) -> &str {
        &self.sink_id
    }

    fn publish(&self, frame: EventFrame) -> Result<(), WlanError> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => WlanError::busy(format!("event sink {}", self.sink_id)),
            TrySendError::Disconnected(_) => WlanError::ChannelUnavailable,
        })
    }
}

/// Fan-out to every attached listener. A listener whose receiving end is
/// gone is dropped on the next broadcast.
#[derive(Default)]
pub struct EventChannel {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    next_listener: AtomicU64,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `sink`, replacing an attached sink with the same id.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.retain(|existing| existing.sink_id() != sink.sink_id());
        sinks.push(sink);
    }

    pub fn detach(&self, sink_id: &str) -> Option<Arc<dyn EventSink>> {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let pos = sinks.iter().position(|sink| sink.sink_id() == sink_id)?;
        Some(sinks.remove(pos))
    }

    /// Attaches a bounded channel listener and returns its receiving end.
    pub fn subscribe(&self, capacity: usize) -> Result<Receiver<EventFrame>, WlanError> {
        let n = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = ChannelEventSink::new(format!("listener-{n}"), capacity)?;
        self.attach(Arc::new(sink));
        Ok(rx)
    }

    pub fn listener_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Publishes to every listener. Succeeds when at least one accepted the
    /// frame; otherwise returns the last listener's error, or
    /// [`WlanError::ChannelUnavailable`] when none is attached.
    pub fn broadcast(&self, ifname: &str, payload: &[u8]) -> Result<(), WlanError> {
        let frame = EventFrame::encode(ifname, payload)?;
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut delivered = false;
        let mut last_err = WlanError::ChannelUnavailable;
        let mut gone = Vec::new();
        for sink in &sinks {
            trace!("events: {ifname} -> {} ({} bytes)", sink.sink_id(), frame.as_bytes().len());
            match sink.publish(frame.clone()) {
                Ok(()) => delivered = true,
                Err(WlanError::ChannelUnavailable) => gone.push(sink.sink_id().to_string()),
                Err(err) => last_err = err,
            }
        }
        if !gone.is_empty() {
            debug!("events: dropping closed listeners {gone:?}");
            self.sinks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|sink| !gone.iter().any(|id| id == sink.sink_id()));
        }
        if delivered {
            Ok(())
        } else {
            Err(last_err)
        }
    }
}
