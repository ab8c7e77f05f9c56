//! In-memory routing state shared by every session on the host.
//!
//! Two maps: service identifier to control connection handle, and socket identifier to the
//! open caller socket plus its outbound [`FrameQueue`]. Every operation is atomic per key and
//! none of them await.

use dashmap::{DashMap, mapref::entry::Entry};

use crate::queue::FrameQueue;

struct SocketEntry<S> {
    queue: FrameQueue,
    handle: S,
}

/// Service and socket routing tables.
///
/// `H` is the control connection handle a service id routes to and `S` the caller socket
/// handle stored next to each socket's queue. Service ids are matched case-insensitively;
/// socket ids are matched exactly.
pub struct ConnectionRegistry<H, S> {
    services: DashMap<String, H>,
    sockets: DashMap<String, SocketEntry<S>>,
}

impl<H, S> Default for ConnectionRegistry<H, S>
where
    H: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Service identifiers are case-insensitive.
fn service_key(service_id: &str) -> String {
    service_id.to_ascii_uppercase()
}

impl<H, S> ConnectionRegistry<H, S>
where
    H: Clone + PartialEq,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            sockets: DashMap::new(),
        }
    }

    /// Returns `false` without touching the existing entry if `service_id` is already taken.
    pub fn register(&self, service_id: &str, handle: H) -> bool {
        match self.services.entry(service_key(service_id)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    /// Removes `service_id` only if it is held by `handle`.
    pub fn unregister(&self, service_id: &str, handle: &H) -> bool {
        self.services
            .remove_if(&service_key(service_id), |_, registered| registered == handle)
            .is_some()
    }

    /// Removes every registration held by `handle`, returning the removed identifiers.
    pub fn unregister_by_handle(&self, handle: &H) -> Vec<String> {
        let keys = self
            .services
            .iter()
            .filter(|entry| entry.value() == handle)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();

        keys.into_iter()
            .filter_map(|key| {
                self.services
                    .remove_if(&key, |_, registered| registered == handle)
                    .map(|(key, _)| key)
            })
            .collect()
    }

    /// The connection currently holding `service_id`, if any.
    #[must_use]
    pub fn lookup(&self, service_id: &str) -> Option<H> {
        self.services
            .get(&service_key(service_id))
            .map(|entry| entry.value().clone())
    }

    /// Returns `false` on a duplicate `socket_id`.
    pub fn open_socket(&self, socket_id: &str, queue: FrameQueue, handle: S) -> bool {
        match self.sockets.entry(socket_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(SocketEntry { queue, handle });
                true
            }
        }
    }

    /// Producer half of the socket's queue. `None` once the socket has been closed.
    #[must_use]
    pub fn outbound_queue(&self, socket_id: &str) -> Option<FrameQueue> {
        self.sockets
            .get(socket_id)
            .map(|entry| entry.value().queue.clone())
    }

    /// Removes the socket and closes its queue. Exactly one of any number of concurrent
    /// callers gets the handle back; the rest see `None`.
    ///
    /// Frames already in the queue stay readable, so the socket's own send loop can still
    /// write them before it closes the caller's WebSocket.
    pub fn close_socket(&self, socket_id: &str) -> Option<S> {
        let (_, entry) = self.sockets.remove(socket_id)?;
        entry.queue.close();
        Some(entry.handle)
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}
