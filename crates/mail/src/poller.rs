use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use triago_core::domain::{InboundMessage, ProcessingResult};

use crate::transport::{MailboxTransport, ReconnectPolicy, TransportError};

/// Seam between the mailbox and the triage engine. The server wires
/// the step orchestrator in behind this trait.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        message: InboundMessage,
        shutdown: watch::Receiver<bool>,
    ) -> ProcessingResult;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub max_concurrent_runs: u32,
    /// How long in-flight runs get to finish once shutdown is signalled.
    pub graceful_shutdown: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrent_runs: 4,
            graceful_shutdown: Duration::from_secs(15),
        }
    }
}

/// Pulls inbound messages and fans them out to the processor, at most
/// `max_concurrent_runs` at a time. A message is marked handled only
/// when its run succeeds; failed and interrupted runs leave it in the
/// inbox for a later poll.
pub struct MailPoller {
    transport: Arc<dyn MailboxTransport>,
    processor: Arc<dyn MessageProcessor>,
    reconnect: ReconnectPolicy,
    settings: PollerSettings,
}

impl MailPoller {
    pub fn new(
        transport: Arc<dyn MailboxTransport>,
        processor: Arc<dyn MessageProcessor>,
        reconnect: ReconnectPolicy,
        settings: PollerSettings,
    ) -> Self {
        Self { transport, processor, reconnect, settings }
    }

    /// Runs until shutdown flips or the reconnect budget is spent.
    /// Transport trouble degrades the poller, it never crashes the
    /// process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.settings.max_concurrent_runs.max(1) as usize));
        let mut runs: JoinSet<()> = JoinSet::new();
        let mut attempt = 0u32;

        while !*shutdown.borrow() {
            if let Err(error) = self.transport.connect().await {
                warn!(
                    event_name = "mail.poller.connect_failed",
                    attempt,
                    error = %error,
                    "mailbox connect failed"
                );
                if !self.wait_before_retry(&mut attempt, &mut shutdown).await {
                    break;
                }
                continue;
            }
            info!(event_name = "mail.poller.connected", "mailbox transport connected");

            match self.pump(&mut shutdown, &mut attempt, &limiter, &mut runs).await {
                Ok(()) => break,
                Err(error) => {
                    warn!(
                        event_name = "mail.poller.transport_failed",
                        error = %error,
                        "mailbox transport failed mid-stream"
                    );
                    let _ = self.transport.disconnect().await;
                    if !self.wait_before_retry(&mut attempt, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain(&mut runs).await;
        if let Err(error) = self.transport.disconnect().await {
            debug!(error = %error, "mailbox disconnect failed during shutdown");
        }
        info!(event_name = "mail.poller.stopped", "mail poller stopped");
        Ok(())
    }

    /// Pulls and dispatches until shutdown (`Ok`) or a transport
    /// failure (`Err`). A successful pull proves the connection is
    /// healthy again and resets the reconnect budget.
    async fn pump(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
        limiter: &Arc<Semaphore>,
        runs: &mut JoinSet<()>,
    ) -> Result<(), TransportError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let pulled = tokio::select! {
                pulled = self.transport.next_message() => pulled?,
                _ = shutdown.changed() => continue,
            };

            let Some(message) = pulled else {
                // Inbox drained; idle until the next poll tick.
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            *attempt = 0;

            let permit = match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            info!(
                event_name = "mail.poller.message_pulled",
                message_id = %message.message_id,
                sender = %message.sender,
                "pulled inbound message"
            );

            let transport = Arc::clone(&self.transport);
            let processor = Arc::clone(&self.processor);
            let run_shutdown = shutdown.clone();
            runs.spawn(async move {
                let message_id = message.message_id.clone();
                let result = processor.process(message, run_shutdown).await;

                if !result.success {
                    info!(
                        event_name = "mail.poller.message_left_unhandled",
                        message_id = %message_id,
                        reason = result.failure_reason().unwrap_or("unknown"),
                        "run failed; message stays in the inbox for a later poll"
                    );
                } else if let Err(error) = transport.mark_handled(&message_id).await {
                    warn!(
                        event_name = "mail.poller.mark_handled_failed",
                        message_id = %message_id,
                        error = %error,
                        "could not mark message handled"
                    );
                } else {
                    debug!(
                        event_name = "mail.poller.message_handled",
                        message_id = %message_id,
                        "marked message handled"
                    );
                }
                drop(permit);
            });

            // Reap finished runs without blocking the pull loop.
            while runs.try_join_next().is_some() {}
        }
    }

    /// Returns false when the retry budget is spent or shutdown fired
    /// during the backoff.
    async fn wait_before_retry(
        &self,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if *attempt >= self.reconnect.max_retries {
            warn!(
                event_name = "mail.poller.retries_exhausted",
                max_retries = self.reconnect.max_retries,
                "mailbox retries exhausted; stopping poller without crash"
            );
            return false;
        }
        let delay = self.reconnect.backoff(*attempt);
        *attempt += 1;
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }

    async fn drain(&self, runs: &mut JoinSet<()>) {
        if runs.is_empty() {
            return;
        }
        info!(
            event_name = "mail.poller.draining",
            in_flight = runs.len(),
            deadline_secs = self.settings.graceful_shutdown.as_secs(),
            "waiting for in-flight runs"
        );
        let drained = tokio::time::timeout(self.settings.graceful_shutdown, async {
            while runs.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                event_name = "mail.poller.drain_timed_out",
                aborted = runs.len(),
                "graceful drain deadline passed; aborting remaining runs"
            );
            runs.shutdown().await;
        }
    }
}
