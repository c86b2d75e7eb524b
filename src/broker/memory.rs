//! In-process stream for tests. One queue per subject, latest-wins on
//! overwrite-publishes, nak puts the message back at the front. Push mode
//! runs the same bounded hand-off as the broker binding, with the timeout
//! adjustable and delayed naks recorded so stalls are observable. No broker
//! required.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::errors::{ConnectionError, PullError, Result, SubscriptionError};
use crate::trace::TraceContext;

use super::{Message, MsgCh, HANDOFF_TIMEOUT, NAK_DELAY};

#[derive(Clone, Debug)]
struct Stored {
    subject: String,
    payload: Bytes,
    trace: Option<TraceContext>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, VecDeque<Stored>>>,
    notify: Notify,
    delayed_naks: Mutex<Vec<Duration>>,
}

pub struct MemoryStream {
    shared: Arc<Shared>,
    prefix: String,
    push_subjects: Vec<String>,
    handoff_timeout: Duration,
    open: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl MemoryStream {
    /// Pull-style double: deliveries come from `pull_one`.
    pub fn new(prefix: impl Into<String>) -> MemoryStream {
        MemoryStream {
            shared: Arc::new(Shared::default()),
            prefix: prefix.into(),
            push_subjects: Vec::new(),
            handoff_timeout: HANDOFF_TIMEOUT,
            open: false,
            tasks: Vec::new(),
        }
    }

    /// Push-style double: `subscribe` bridges the given subjects into one
    /// shared channel. The channel holds a single message so a consumer
    /// that stops draining stalls the hand-off immediately.
    pub fn push(prefix: impl Into<String>, push_subjects: Vec<String>) -> MemoryStream {
        MemoryStream {
            push_subjects,
            ..MemoryStream::new(prefix)
        }
    }

    pub fn handoff_timeout(mut self, timeout: Duration) -> MemoryStream {
        self.handoff_timeout = timeout;
        self
    }

    /// Messages currently queued on a subject.
    pub async fn depth(&self, subject: &str) -> usize {
        let queues = self.shared.queues.lock().await;
        queues.get(subject).map(VecDeque::len).unwrap_or_default()
    }

    /// Delays of every nak issued for a stalled hand-off so far.
    pub async fn delayed_naks(&self) -> Vec<Duration> {
        self.shared.delayed_naks.lock().await.clone()
    }

    async fn enqueue(&self, trace: &TraceContext, suffix: &str, payload: &[u8], overwrite: bool) {
        let subject = format!("{}.{}", self.prefix, suffix);
        let stored = Stored {
            subject: subject.clone(),
            payload: Bytes::copy_from_slice(payload),
            trace: Some(trace.clone()),
        };

        let mut queues = self.shared.queues.lock().await;
        let queue = queues.entry(subject).or_default();
        if overwrite {
            queue.clear();
        }
        queue.push_back(stored);
        drop(queues);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl super::Stream for MemoryStream {
    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(ConnectionError::AlreadyOpen.into());
        }
        self.open = true;
        Ok(())
    }

    async fn publish(&self, trace: &TraceContext, suffix: &str, payload: &[u8]) -> Result<()> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        self.enqueue(trace, suffix, payload, false).await;
        Ok(())
    }

    async fn publish_overwrite(
        &self,
        trace: &TraceContext,
        suffix: &str,
        payload: &[u8],
    ) -> Result<()> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        self.enqueue(trace, suffix, payload, true).await;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<Option<MsgCh>> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        if self.push_subjects.is_empty() {
            return Ok(None);
        }

        let (tx, rx) = mpsc::channel::<Box<dyn Message>>(1);
        for subject in self.push_subjects.clone() {
            let shared = Arc::clone(&self.shared);
            let tx = tx.clone();
            let handoff = self.handoff_timeout;
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let notified = shared.notify.notified();
                    let next = {
                        let mut queues = shared.queues.lock().await;
                        queues.get_mut(&subject).and_then(VecDeque::pop_front)
                    };
                    let Some(stored) = next else {
                        notified.await;
                        continue;
                    };

                    let boxed: Box<dyn Message> = Box::new(MemoryMessage {
                        shared: Arc::clone(&shared),
                        stored,
                    });
                    match tx.send_timeout(boxed, handoff).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(stalled)) => {
                            let _ = stalled.nak_with_delay(NAK_DELAY).await;
                        }
                        Err(SendTimeoutError::Closed(_)) => break,
                    }
                }
            }));
        }
        Ok(Some(rx))
    }

    async fn pull_one(&self, subject: &str, timeout: Duration) -> Result<Box<dyn Message>> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        if !subject.starts_with(&format!("{}.", self.prefix)) {
            return Err(SubscriptionError::NoMatch(subject.to_string()).into());
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue
            // between check and wait is not missed.
            let notified = self.shared.notify.notified();

            let mut queues = self.shared.queues.lock().await;
            if let Some(stored) = queues.get_mut(subject).and_then(VecDeque::pop_front) {
                return Ok(Box::new(MemoryMessage {
                    shared: Arc::clone(&self.shared),
                    stored,
                }));
            }
            drop(queues);

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => return Err(PullError::DeadlineExceeded.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.open = false;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryMessage {
    shared: Arc<Shared>,
    stored: Stored,
}

impl MemoryMessage {
    async fn requeue(&self) {
        let mut queues = self.shared.queues.lock().await;
        queues
            .entry(self.stored.subject.clone())
            .or_default()
            .push_front(self.stored.clone());
        drop(queues);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Message for MemoryMessage {
    fn subject(&self) -> &str {
        &self.stored.subject
    }

    fn data(&self) -> &[u8] {
        &self.stored.payload
    }

    fn trace_context(&self) -> Option<TraceContext> {
        self.stored.trace.clone()
    }

    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.requeue().await;
        Ok(())
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.shared.delayed_naks.lock().await.push(delay);
        self.requeue().await;
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        Ok(())
    }
}
