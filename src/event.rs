//! Typed lifecycle events and the router that dispatches them to the
//! gateway's hooks.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::gateway::types::{FetchResult, Request};
use crate::gateway::{Fetch, Gateway};

/// Control directives from the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate the configured version immediately instead of waiting
  SkipWaiting,
}

/// Platform lifecycle signals as typed event descriptors.
#[derive(Debug)]
pub enum LifecycleEvent {
  Install,
  Activate,
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<FetchResult>,
  },
  Sync {
    tag: String,
  },
  Message(ControlMessage),
}

/// Routes lifecycle events to the gateway.
///
/// Intercepted fetches run as their own tasks, so a slow page request never
/// blocks a sync signal queued behind it. Lifecycle transitions (install,
/// activate, sync, message) run in order on the router task; in particular,
/// an `Activate` queued after a failed `Install` is skipped, so a version
/// that never populated can never evict the one still serving.
#[derive(Clone)]
pub struct EventRouter {
  tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventRouter {
  pub fn spawn<S>(gateway: Arc<Gateway<S>>) -> Self
  where
    S: CacheStorage + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut install_failed = false;

      while let Some(event) = rx.recv().await {
        match event {
          LifecycleEvent::Install => match gateway.handle_install().await {
            Ok(()) => install_failed = false,
            Err(e) => {
              install_failed = true;
              error!(error = %e, "install failed, version not populated");
            }
          },
          LifecycleEvent::Activate => {
            if install_failed {
              warn!("skipping activation after failed install");
            } else if let Err(e) = gateway.handle_activate().await {
              error!(error = %e, "activation failed");
            }
          }
          LifecycleEvent::Fetch { request, respond_to } => {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
              let result = gateway.handle_fetch(request).await;
              // The requester may be gone by now; nothing to do then
              let _ = respond_to.send(result);
            });
          }
          LifecycleEvent::Sync { tag } => match gateway.handle_sync(&tag).await {
            Ok(report) => {
              debug!(
                delivered = report.delivered,
                remaining = report.remaining,
                "drain finished"
              );
            }
            Err(e) => warn!(error = %e, "drain failed"),
          },
          LifecycleEvent::Message(message) => {
            if let Err(e) = gateway.handle_message(message).await {
              warn!(error = %e, "control message handling failed");
            }
          }
        }
      }
    });

    Self { tx }
  }

  pub fn send(&self, event: LifecycleEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Event router is no longer running"))
  }

  /// Intercept a request and await its resolution.
  pub async fn fetch(&self, request: Request) -> Result<FetchResult> {
    let (respond_to, rx) = oneshot::channel();
    self.send(LifecycleEvent::Fetch { request, respond_to })?;
    rx.await
      .map_err(|_| eyre!("Fetch task dropped before responding"))
  }
}

/// Reconstructs the platform reconnect signal by polling.
///
/// Probes the origin with HEAD at the given interval and emits a `Sync`
/// event on every offline-to-online transition. The watcher starts assuming
/// offline, so a reachable origin on the first probe also triggers a sync
/// and drains anything left over from a previous session.
pub fn spawn_reconnect_watcher(
  router: EventRouter,
  probe: Arc<dyn Fetch>,
  origin: Url,
  tag: String,
  interval: Duration,
) {
  tokio::spawn(async move {
    let mut online = false;
    loop {
      let now_online = probe.fetch(Request::head(origin.clone())).await.is_ok();

      if now_online && !online {
        debug!("connectivity restored, signaling sync");
        if router
          .send(LifecycleEvent::Sync { tag: tag.clone() })
          .is_err()
        {
          break;
        }
      }
      online = now_online;

      tokio::time::sleep(interval).await;
    }
  });
}
