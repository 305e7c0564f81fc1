use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Events driving a long-running command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for query polling
  Tick,
  /// Ctrl-C was pressed
  Shutdown,
}

/// Event handler that produces ticks until interrupted
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      let shutdown = tokio::signal::ctrl_c();
      tokio::pin!(shutdown);

      loop {
        tokio::select! {
          _ = interval.tick() => {
            if tx.send(Event::Tick).is_err() {
              break;
            }
          }
          _ = &mut shutdown => {
            let _ = tx.send(Event::Shutdown);
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
