//! The accept loop

use std::sync::Arc;

use keel_engine::Runtime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cursors::{CursorMap, CursorScope};
use crate::session::Session;

/// Accepts client connections and spawns a session task per connection
pub struct Listener {
    rt: Arc<Runtime>,
    /// Present when cursor ids are process-global
    global_cursors: Option<Arc<CursorMap>>,
}

impl Listener {
    pub fn new(rt: Arc<Runtime>) -> Self {
        let global_cursors = rt
            .env
            .options
            .global_cursors
            .then(|| Arc::new(CursorMap::new()));
        Self { rt, global_cursors }
    }

    fn cursor_scope(&self) -> CursorScope {
        match &self.global_cursors {
            Some(shared) => CursorScope::Global(Arc::clone(shared)),
            None => CursorScope::Local(CursorMap::new()),
        }
    }

    /// Serve until cancelled
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(address = %local, "listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let mut session =
                                Session::new(Arc::clone(&self.rt), stream, self.cursor_scope());
                            tokio::spawn(async move {
                                if let Err(e) = session.run().await {
                                    tracing::debug!(peer = %peer, error = %e, "session ended");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "cannot accept a new connection");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }

        tracing::info!(address = %local, "listener stopped");
    }
}
