//! The record store: an HTTP service keeping quiz answers, chat messages and
//! discussion posts in memory.

mod routes;
mod storage;

pub use routes::{router, ApiError};
pub use storage::MemStorage;

use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// A bound, not yet running record store.
pub struct Server {
  listener: TcpListener,
  router: Router,
}

impl Server {
  /// Bind `addr` with fresh, empty storage. Port 0 picks a free port.
  pub async fn bind(addr: SocketAddr) -> Result<Self> {
    Self::bind_with_storage(addr, Arc::new(MemStorage::new())).await
  }

  pub async fn bind_with_storage(addr: SocketAddr, storage: Arc<MemStorage>) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

    Ok(Self {
      listener,
      router: router(storage),
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self
      .listener
      .local_addr()
      .map_err(|e| eyre!("Failed to read local address: {}", e))
  }

  /// Serve until Ctrl-C.
  pub async fn run(self) -> Result<()> {
    self
      .run_until(async {
        if tokio::signal::ctrl_c().await.is_ok() {
          info!("Shutdown signal received");
        }
      })
      .await
  }

  /// Serve until `shutdown` resolves, then drain open connections.
  pub async fn run_until<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let addr = self.local_addr()?;
    info!(%addr, "serving record store");

    axum::serve(self.listener, self.router)
      .with_graceful_shutdown(shutdown)
      .await
      .map_err(|e| eyre!("Server error: {}", e))
  }
}
