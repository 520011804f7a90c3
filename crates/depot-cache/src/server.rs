//! TCP cache server
//!
//! One accept loop; one spawned task per connection; one mutex around the
//! store. Each inbound frame is decoded, handled against the store, and
//! answered with a frame echoing the request's correlation id. Malformed
//! frames and unknown operations close the offending connection without
//! touching any other connection.

use crate::error::Result;
use crate::store::CacheStore;
use depot_net::{Connection, ConnectionEvent, Listener};
use depot_wire::{Archive, CacheRequest, CacheResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Run the cache server on `listener` until the accept loop fails.
///
/// # Errors
///
/// Returns an error if accepting a connection fails; per-connection errors
/// are logged and contained.
pub async fn serve(listener: Listener, store: Arc<Mutex<CacheStore>>) -> Result<()> {
    if let Ok(endpoint) = listener.local_endpoint() {
        info!("cache server listening on {endpoint}");
    }

    loop {
        let (connection, events) = listener.accept().await?;
        let store = Arc::clone(&store);
        let peer = connection.endpoint().clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(connection, events, store).await {
                warn!("connection from {peer} closed with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut connection: Connection,
    mut events: UnboundedReceiver<ConnectionEvent>,
    store: Arc<Mutex<CacheStore>>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::PacketReceived(frame) => {
                // A protocol error anywhere in the frame closes the
                // connection; a request is never partially processed.
                let archive = Archive::decode(&frame)?;
                let (seq, request) = CacheRequest::from_archive(&archive)?;
                let response = handle_request(request, &store);
                connection.send(response.to_archive(seq).encode())?;
            }
            ConnectionEvent::Closed { reason } => {
                debug!("peer disconnected: {reason}");
                break;
            }
            ConnectionEvent::Opened | ConnectionEvent::PacketDelivered(_) => {}
        }
    }
    connection.disconnect().await;
    Ok(())
}

fn handle_request(request: CacheRequest, store: &Mutex<CacheStore>) -> CacheResponse {
    match request {
        CacheRequest::Get { key } => {
            let mut store = store.lock();
            match store.get(&key) {
                Ok(Some(value)) => CacheResponse::Get {
                    found: true,
                    value: Some(value),
                },
                Ok(None) => CacheResponse::Get {
                    found: false,
                    value: None,
                },
                Err(e) => {
                    // A miss is normal; a read failure is not, but it is
                    // still local to this key.
                    warn!("get {key} failed: {e}");
                    CacheResponse::Get {
                        found: false,
                        value: None,
                    }
                }
            }
        }
        CacheRequest::Put { key, value } => {
            let accepted = match store.lock().put(key, value) {
                Ok(()) => true,
                Err(e) => {
                    warn!("put {key} failed: {e}");
                    false
                }
            };
            CacheResponse::Put { accepted }
        }
        CacheRequest::Status => {
            let (entry_count, total_size, capacity) = store.lock().status();
            CacheResponse::Status {
                entry_count,
                total_size,
                capacity,
            }
        }
    }
}
