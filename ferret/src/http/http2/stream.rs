//! Bookkeeping for the streams a multiplexer forwards.

use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    events::HeaderList,
    frame::{
        ErrorCode,
        Priority,
    },
    Error,
};

/// How long streams are kept around after their connection closed.
pub const ZOMBIE_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Something that happened on either half of a stream, delivered to the
/// stream's worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Response headers from the server, or trailers from either side.
    Headers {
        from_client: bool,
        headers: HeaderList,
    },
    /// `flow_controlled_length` counts padding too. That much stream window
    /// is released once the worker takes the event.
    Data {
        from_client: bool,
        data: Bytes,
        flow_controlled_length: u32,
    },
    Ended {
        from_client: bool,
    },
    Reset {
        from_client: bool,
        error_code: ErrorCode,
    },
}

impl StreamEvent {
    pub fn from_client(&self) -> bool {
        match self {
            Self::Headers { from_client, .. }
            | Self::Data { from_client, .. }
            | Self::Ended { from_client }
            | Self::Reset { from_client, .. } => *from_client,
        }
    }
}

#[derive(Debug)]
struct Entry {
    server_id: Option<u32>,
    priority: Option<Priority>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    zombie_since: Option<Instant>,
}

/// Receiving end for a stream's worker.
#[derive(Debug)]
pub struct StreamHandle {
    pub client_id: u32,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    /// Cancelled when the stream turns into a zombie.
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    by_client: HashMap<u32, Entry>,
    client_for_server: HashMap<u32, u32>,
}

/// Maps client stream IDs to server stream IDs and back.
///
/// Streams are keyed by their client-side ID. The server-side ID is assigned
/// when the request is sent upstream, or right away for pushed streams.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<Inner>,
}

impl StreamTable {
    pub fn insert(
        &self,
        client_id: u32,
        server_id: Option<u32>,
        priority: Option<Priority>,
    ) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut inner = self.inner.lock();
        if let Some(server_id) = server_id {
            inner.client_for_server.insert(server_id, client_id);
        }
        inner.by_client.insert(
            client_id,
            Entry {
                server_id,
                priority,
                events: tx,
                cancel: cancel.clone(),
                zombie_since: None,
            },
        );

        StreamHandle {
            client_id,
            events: rx,
            cancel,
        }
    }

    pub fn set_server_id(&self, client_id: u32, server_id: u32) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let entry = inner
            .by_client
            .get_mut(&client_id)
            .filter(|entry| entry.zombie_since.is_none())
            .ok_or(Error::ZombieStream {
                stream_id: client_id,
            })?;
        entry.server_id = Some(server_id);
        inner.client_for_server.insert(server_id, client_id);
        Ok(())
    }

    pub fn server_id(&self, client_id: u32) -> Option<u32> {
        self.inner
            .lock()
            .by_client
            .get(&client_id)
            .and_then(|entry| entry.server_id)
    }

    pub fn client_id(&self, server_id: u32) -> Option<u32> {
        self.inner.lock().client_for_server.get(&server_id).copied()
    }

    pub fn priority(&self, client_id: u32) -> Option<Priority> {
        self.inner
            .lock()
            .by_client
            .get(&client_id)
            .and_then(|entry| entry.priority)
    }

    pub fn set_priority(&self, client_id: u32, priority: Priority) {
        if let Some(entry) = self.inner.lock().by_client.get_mut(&client_id) {
            entry.priority = Some(priority);
        }
    }

    /// Delivers an event to the worker of a stream. Returns `false` if there
    /// is no such stream, or it's a zombie.
    pub fn dispatch(&self, client_id: u32, event: StreamEvent) -> bool {
        self.inner
            .lock()
            .by_client
            .get(&client_id)
            .filter(|entry| entry.zombie_since.is_none())
            .map_or(false, |entry| entry.events.send(event).is_ok())
    }

    pub fn remove(&self, client_id: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.by_client.remove(&client_id) {
            if let Some(server_id) = entry.server_id {
                inner.client_for_server.remove(&server_id);
            }
        }
    }

    /// Marks all streams as zombies and stops their workers.
    pub fn zombify(&self, now: Instant) {
        let mut inner = self.inner.lock();
        for entry in inner.by_client.values_mut() {
            entry.zombie_since.get_or_insert(now);
            entry.cancel.cancel();
        }
    }

    /// Removes zombies that are older than the grace period. Returns how many
    /// were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let expired = inner
            .by_client
            .iter()
            .filter(|(_, entry)| {
                entry
                    .zombie_since
                    .map_or(false, |since| now.duration_since(since) >= ZOMBIE_GRACE_PERIOD)
            })
            .map(|(client_id, _)| *client_id)
            .collect::<Vec<_>>();

        for client_id in &expired {
            if let Some(server_id) = inner
                .by_client
                .remove(client_id)
                .and_then(|entry| entry.server_id)
            {
                inner.client_for_server.remove(&server_id);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::{
        Duration,
        Instant,
    };

    use bytes::Bytes;

    use super::{
        StreamEvent,
        StreamTable,
    };
    use crate::http::http2::Error;

    #[test]
    fn it_maps_ids_both_ways() {
        let table = StreamTable::default();
        let mut handle = table.insert(1, None, None);
        table.insert(2, Some(4), None);

        table.set_server_id(1, 3).unwrap();
        assert_eq!(table.server_id(1), Some(3));
        assert_eq!(table.client_id(3), Some(1));
        assert_eq!(table.client_id(4), Some(2));

        let event = StreamEvent::Data {
            from_client: true,
            data: Bytes::from_static(b"hi"),
            flow_controlled_length: 2,
        };
        assert!(table.dispatch(1, event.clone()));
        assert_eq!(handle.events.try_recv().unwrap(), event);

        table.remove(1);
        assert_eq!(table.client_id(3), None);
        assert!(!table.dispatch(1, StreamEvent::Ended { from_client: true }));
    }

    #[test]
    fn it_fails_fast_on_zombies_and_sweeps_them() {
        let table = StreamTable::default();
        let handle = table.insert(1, Some(1), None);
        let now = Instant::now();

        table.zombify(now);
        assert!(handle.cancel.is_cancelled());
        assert!(!table.dispatch(1, StreamEvent::Ended { from_client: true }));
        assert!(matches!(
            table.set_server_id(1, 5),
            Err(Error::ZombieStream { .. })
        ));

        assert_eq!(table.sweep(now + Duration::from_secs(5)), 0);
        assert_eq!(table.sweep(now + Duration::from_secs(11)), 1);
        assert!(table.is_empty());
        assert_eq!(table.client_id(1), None);
    }
}
