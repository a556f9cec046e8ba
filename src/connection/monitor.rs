//! Watches a connection for inactivity.
//!
//! After `activity_timeout` with no inbound traffic a keepalive `ping` is
//! sent; if `response_timeout` then passes with still nothing received, the
//! connection is forcibly closed and the lifecycle manager takes over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::connection::pipeline::Connection;
use crate::consts::DEFAULT_RESPONSE_TIMEOUT;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Quiet period before a keepalive is sent. `None` disables monitoring.
    pub activity_timeout: Option<Duration>,
    /// How long after the keepalive to wait for traffic before closing.
    pub response_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> MonitorConfig {
        MonitorConfig {
            activity_timeout: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

pub(crate) struct InactivityMonitor {
    activity: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl InactivityMonitor {
    /// Starts the watch task, or returns `None` when no activity timeout is
    /// configured.
    pub(crate) fn start(config: MonitorConfig, conn: Connection) -> Option<InactivityMonitor> {
        let timeout = config.activity_timeout?;
        let activity = Arc::new(AtomicU64::new(0));

        let counter = activity.clone();
        let task = tokio::spawn(async move {
            let mut seen = 0u64;
            loop {
                tokio::time::sleep(timeout).await;
                let now = counter.load(Ordering::Relaxed);
                if now != seen {
                    seen = now;
                    continue;
                }

                debug!("connection quiet for {:?}, sending keepalive", timeout);
                conn.send_keepalive();

                tokio::time::sleep(config.response_timeout).await;
                let after = counter.load(Ordering::Relaxed);
                if after == seen {
                    warn!(
                        "no traffic within {:?} of keepalive, closing connection",
                        config.response_timeout
                    );
                    conn.close();
                    return;
                }
                seen = after;
            }
        });

        Some(InactivityMonitor { activity, task })
    }

    /// Records inbound traffic, resetting the activity window.
    pub(crate) fn touch(&self) {
        self.activity.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}
