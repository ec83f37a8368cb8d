//! In-process fan-out of Postgres `NOTIFY` payloads.
//!
//! One background task owns the single [`sqlx::postgres::PgListener`]
//! connection Postgres requires per listening session; callers ask for
//! a [`broadcast::Receiver`] keyed by channel name and the task adds a
//! `LISTEN` for it on demand. This preserves the fast in-process
//! pub/sub half of the two-layer wake-up design without one connection
//! per subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{broadcast, mpsc};

#[derive(Clone)]
pub struct Notifier {
  channels: Arc<Mutex<HashMap<String, broadcast::Sender<()>>>>,
  listen_tx: mpsc::UnboundedSender<String>,
}

impl Notifier {
  pub async fn connect(pool: PgPool) -> Result<Self, sqlx::Error> {
    let listener = PgListener::connect_with(&pool).await?;
    let channels: Arc<Mutex<HashMap<String, broadcast::Sender<()>>>> =
      Arc::new(Mutex::new(HashMap::new()));
    let (listen_tx, listen_rx) = mpsc::unbounded_channel();

    tokio::spawn(Self::run(listener, channels.clone(), listen_rx));

    Ok(Self {
      channels,
      listen_tx,
    })
  }

  /// Returns a receiver woken whenever `channel` receives a `NOTIFY`.
  /// Registers the underlying `LISTEN` the first time a channel name is
  /// requested.
  pub async fn subscribe(&self, channel: String) -> broadcast::Receiver<()> {
    let mut channels = self.channels.lock();
    if let Some(tx) = channels.get(&channel) {
      return tx.subscribe();
    }

    let (tx, rx) = broadcast::channel(16);
    channels.insert(channel.clone(), tx);
    drop(channels);

    // Best-effort: if the background task has died, callers fall back
    // to the bounded poll interval in `Queue::await_response`.
    let _ = self.listen_tx.send(channel);

    rx
  }

  async fn run(
    mut listener: PgListener,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<()>>>>,
    mut listen_rx: mpsc::UnboundedReceiver<String>,
  ) {
    loop {
      tokio::select! {
        biased;

        channel = listen_rx.recv() => {
          match channel {
            Some(channel) => {
              if let Err(error) = listener.listen(&channel).await {
                tracing::warn!(%channel, %error, "failed to LISTEN on channel");
              }
            }
            None => return,
          }
        }

        notification = listener.recv() => {
          match notification {
            Ok(notification) => {
              let channel = notification.channel().to_string();
              let channels = channels.lock();
              if let Some(tx) = channels.get(&channel) {
                let _ = tx.send(());
              }
            }
            Err(error) => {
              tracing::warn!(%error, "PgListener connection lost, reconnecting");
              // sqlx's PgListener transparently reconnects and
              // re-subscribes on the next `recv` call.
            }
          }
        }
      }
    }
  }
}
