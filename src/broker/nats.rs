//! NATS JetStream binding for the [`Stream`](super::Stream) trait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_nats::jetstream::consumer::{self, pull, push, AckPolicy, DeliverPolicy};
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::{self, stream, AckKind};
use async_nats::{HeaderMap, HeaderValue};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::errors::{
    ConfigError, ConnectionError, ConsumerError, Error, ErrorKind, PullError, Result, StreamError,
    SubscriptionError,
};
use crate::trace::TraceContext;

use super::{
    ConsumerSpec, DeliveryMode, Message, MsgCh, Retention, StreamSpec, CONSUMER_MAX_DELIVER,
    HANDOFF_BUFFER, HANDOFF_TIMEOUT, NAK_DELAY,
};

const NATS_ERROR_COUNTER: &str = "corral_nats_errors_total";

const ROLLUP_HEADER: &str = "Nats-Rollup";
const ROLLUP_SUBJECT: &str = "sub";

const PUBLISH_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Connection and topology declaration for one broker endpoint.
#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub url: String,
    pub app_name: String,
    pub connect_timeout: Duration,
    pub credentials: Option<Credentials>,
    /// Publishes go to `<prefix>.<suffix>`.
    pub publisher_subject_prefix: String,
    pub stream: StreamSpec,
    pub consumer: Option<ConsumerSpec>,
}

impl NatsOptions {
    pub fn new(url: impl Into<String>, app_name: impl Into<String>, stream: StreamSpec) -> Self {
        let prefix = stream.name.clone();
        NatsOptions {
            url: url.into(),
            app_name: app_name.into(),
            connect_timeout: Duration::from_secs(10),
            credentials: None,
            publisher_subject_prefix: prefix,
            stream,
            consumer: None,
        }
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn publisher_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.publisher_subject_prefix = prefix.into();
        self
    }

    pub fn consumer(mut self, consumer: ConsumerSpec) -> Self {
        self.consumer = Some(consumer);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingUrl.into());
        }
        if self.stream.subjects.is_empty() {
            return Err(ConfigError::MissingSubjects.into());
        }
        if let Some(consumer) = &self.consumer {
            if consumer.durable.is_empty() {
                return Err(ConfigError::MissingDurable.into());
            }
            if consumer.subscribe_subjects.iter().any(String::is_empty)
                || consumer.subscribe_subjects.is_empty()
            {
                return Err(ConfigError::MissingSubscribeSubjects.into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Credentials {
    File(PathBuf),
    UserPassword { user: String, password: String },
}

struct OpenState {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: stream::Stream,
    /// Pull subscriptions keyed by the subjects `pull_one` accepts.
    pulls: HashMap<String, consumer::Consumer<pull::Config>>,
    push_tasks: Vec<JoinHandle<()>>,
}

/// A JetStream client bound to one declared stream.
pub struct JetStreamBroker {
    options: NatsOptions,
    state: Option<OpenState>,
}

impl JetStreamBroker {
    pub fn new(options: NatsOptions) -> JetStreamBroker {
        JetStreamBroker {
            options,
            state: None,
        }
    }

    /// JetStream context of the open connection, for KV bucket access.
    pub fn jetstream(&self) -> Result<&jetstream::Context> {
        self.state
            .as_ref()
            .map(|s| &s.context)
            .ok_or_else(|| ConnectionError::NotOpen.into())
    }

    async fn connect(&self) -> Result<async_nats::Client> {
        let mut opts = async_nats::ConnectOptions::new()
            .name(&self.options.app_name)
            .connection_timeout(self.options.connect_timeout);

        match &self.options.credentials {
            Some(Credentials::File(path)) => {
                opts = opts
                    .credentials_file(path)
                    .await
                    .map_err(|e| ConfigError::Credentials(e.into()))?;
            }
            Some(Credentials::UserPassword { user, password }) => {
                opts = opts.user_and_password(user.clone(), password.clone());
            }
            None => {}
        }

        opts.connect(&self.options.url)
            .await
            .map_err(|e| ConnectionError::Failed(e.into()).into())
    }

    /// Converge the broker's stream to the declared shape: create when
    /// absent, overwrite otherwise.
    async fn reconcile_stream(&self, context: &jetstream::Context) -> Result<stream::Stream> {
        let spec = &self.options.stream;
        let config = stream_config(spec);

        if context.get_stream(&spec.name).await.is_ok() {
            context
                .update_stream(&config)
                .await
                .map_err(|e| StreamError::Update(e.into()))?;
            debug!("updated stream {}", spec.name);
        } else {
            context
                .create_stream(config)
                .await
                .map_err(|e| StreamError::Create(e.into()))?;
            info!("created stream {}", spec.name);
        }

        context
            .get_stream(&spec.name)
            .await
            .map_err(|e| StreamError::Lookup(e.into()).into())
    }

    /// Converge the durable consumers. Matching configuration is left alone
    /// so an unchanged worker restart touches nothing.
    async fn reconcile_consumers(&self, stream: &stream::Stream) -> Result<()> {
        let Some(spec) = &self.options.consumer else {
            return Ok(());
        };

        for desired in desired_consumer_configs(spec) {
            let durable = desired.durable_name.clone().unwrap_or_default();
            match stream.get_consumer::<consumer::Config>(&durable).await {
                Ok(mut existing) => {
                    let current = existing
                        .info()
                        .await
                        .map_err(|e| ConsumerError::Update(e.into()))?;
                    if !consumer_config_matches(&current.config, &desired) {
                        stream
                            .create_consumer(desired)
                            .await
                            .map_err(|e| ConsumerError::Update(e.into()))?;
                        info!("updated consumer {durable}");
                    }
                }
                Err(e) if lookup_says_missing(&e.to_string()) => {
                    stream
                        .create_consumer(desired)
                        .await
                        .map_err(|e| ConsumerError::Create(e.into()))?;
                    info!("created consumer {durable}");
                }
                Err(e) => return Err(ConsumerError::Lookup(e.into()).into()),
            }
        }
        Ok(())
    }

    async fn publish_with(
        &self,
        trace: &TraceContext,
        suffix: &str,
        payload: &[u8],
        rollup: bool,
    ) -> Result<()> {
        let state = self.state.as_ref().ok_or(ConnectionError::NotOpen)?;

        let subject = format!("{}.{}", self.options.publisher_subject_prefix, suffix);
        let mut headers = HeaderMap::new();
        trace.inject(&mut headers);
        if rollup {
            headers.insert(ROLLUP_HEADER, HeaderValue::from(ROLLUP_SUBJECT));
        }
        let payload = Bytes::copy_from_slice(payload);

        loop {
            let outcome = state
                .context
                .publish_with_headers(subject.clone(), headers.clone(), payload.clone())
                .await;
            let err = match outcome {
                Ok(ack) => match ack.await {
                    Ok(_) => return Ok(()),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if err.kind() == PublishErrorKind::TimedOut {
                counter!(NATS_ERROR_COUNTER, "op" => "publish_timeout").increment(1);
                warn!("publish to {subject} timed out, retrying");
                sleep(PUBLISH_RETRY_WAIT).await;
                continue;
            }

            counter!(NATS_ERROR_COUNTER, "op" => "publish").increment(1);
            return Err(Error::with_message(
                ErrorKind::Publish,
                format!("publish to {subject} failed"),
                Some(err),
            ));
        }
    }
}

#[async_trait]
impl super::Stream for JetStreamBroker {
    async fn open(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(ConnectionError::AlreadyOpen.into());
        }
        self.options.validate()?;

        let client = self.connect().await?;
        let context = jetstream::new(client.clone());
        let stream = self.reconcile_stream(&context).await?;
        self.reconcile_consumers(&stream).await?;

        self.state = Some(OpenState {
            client,
            context,
            stream,
            pulls: HashMap::new(),
            push_tasks: Vec::new(),
        });
        Ok(())
    }

    async fn publish(&self, trace: &TraceContext, suffix: &str, payload: &[u8]) -> Result<()> {
        self.publish_with(trace, suffix, payload, false).await
    }

    async fn publish_overwrite(
        &self,
        trace: &TraceContext,
        suffix: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.publish_with(trace, suffix, payload, true).await
    }

    async fn subscribe(&mut self) -> Result<Option<MsgCh>> {
        let Some(spec) = self.options.consumer.clone() else {
            return Err(ConfigError::MissingParameters.into());
        };
        let state = self.state.as_mut().ok_or(ConnectionError::NotOpen)?;

        match spec.mode {
            DeliveryMode::Pull => {
                let consumer = state
                    .stream
                    .get_consumer::<pull::Config>(&spec.durable)
                    .await
                    .map_err(|e| SubscriptionError::Failed {
                        subject: spec.durable.clone(),
                        source: e.into(),
                    })?;
                for subject in &spec.subscribe_subjects {
                    state.pulls.insert(subject.clone(), consumer.clone());
                }
                Ok(None)
            }
            DeliveryMode::Push => {
                // One consumer and dispatch task per subject, all feeding
                // the same bounded channel.
                let (tx, rx) = mpsc::channel::<Box<dyn Message>>(HANDOFF_BUFFER);
                for (index, subject) in spec.subscribe_subjects.iter().enumerate() {
                    let durable = push_durable(&spec.durable, index);
                    let consumer = state
                        .stream
                        .get_consumer::<push::Config>(&durable)
                        .await
                        .map_err(|e| SubscriptionError::Failed {
                            subject: subject.clone(),
                            source: e.into(),
                        })?;
                    let mut messages =
                        consumer
                            .messages()
                            .await
                            .map_err(|e| SubscriptionError::Failed {
                                subject: subject.clone(),
                                source: e.into(),
                            })?;

                    let tx = tx.clone();
                    let task = tokio::spawn(async move {
                        while let Some(next) = messages.next().await {
                            let msg = match next {
                                Ok(msg) => msg,
                                Err(e) => {
                                    counter!(NATS_ERROR_COUNTER, "op" => "push_delivery")
                                        .increment(1);
                                    warn!("push delivery error: {e}");
                                    continue;
                                }
                            };
                            let boxed: Box<dyn Message> = Box::new(NatsMessage { inner: msg });
                            match tx.send_timeout(boxed, HANDOFF_TIMEOUT).await {
                                Ok(()) => {}
                                Err(SendTimeoutError::Timeout(stalled)) => {
                                    // Consumer is not draining the channel.
                                    // Hand the message back for delayed
                                    // redelivery rather than block the
                                    // dispatch loop.
                                    counter!(NATS_ERROR_COUNTER, "op" => "handoff_timeout")
                                        .increment(1);
                                    if let Err(e) = stalled.nak_with_delay(NAK_DELAY).await {
                                        warn!("nak after stalled hand-off failed: {e}");
                                    }
                                }
                                Err(SendTimeoutError::Closed(_)) => break,
                            }
                        }
                    });
                    state.push_tasks.push(task);
                }
                Ok(Some(rx))
            }
        }
    }

    async fn pull_one(&self, subject: &str, timeout: Duration) -> Result<Box<dyn Message>> {
        let state = self.state.as_ref().ok_or(ConnectionError::NotOpen)?;

        if matches!(&self.options.consumer, Some(c) if c.mode == DeliveryMode::Push) {
            return Err(SubscriptionError::NotPull(subject.to_string()).into());
        }
        let consumer = state
            .pulls
            .get(subject)
            .ok_or_else(|| SubscriptionError::NoMatch(subject.to_string()))?;

        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| PullError::Fetch(e.into()))?;

        match batch.next().await {
            Some(Ok(msg)) => Ok(Box::new(NatsMessage { inner: msg })),
            Some(Err(e)) => Err(PullError::Fetch(e.into()).into()),
            None => Err(PullError::DeadlineExceeded.into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };

        for task in state.push_tasks {
            task.abort();
        }
        if let Err(e) = state.client.drain().await {
            counter!(NATS_ERROR_COUNTER, "op" => "drain").increment(1);
            return Err(ConnectionError::Drain(e.to_string()).into());
        }
        Ok(())
    }
}

fn stream_config(spec: &StreamSpec) -> stream::Config {
    stream::Config {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        retention: match spec.retention {
            Retention::Limits => stream::RetentionPolicy::Limits,
            Retention::Interest => stream::RetentionPolicy::Interest,
            Retention::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        max_age: spec.max_age,
        duplicate_window: spec.duplicate_window,
        // Overwrite-publishes roll up per subject.
        allow_rollup: true,
        ..Default::default()
    }
}

fn deliver_subject(durable: &str) -> String {
    format!("_DELIVER.{durable}")
}

/// Durable name of the push consumer for the nth subscribe subject. The
/// first keeps the declared name so single-subject deployments read naturally.
pub(crate) fn push_durable(durable: &str, index: usize) -> String {
    if index == 0 {
        durable.to_string()
    } else {
        format!("{durable}-{index}")
    }
}

/// Whether a consumer lookup failure means the consumer does not exist, as
/// opposed to the broker being unreachable. The client surfaces both through
/// the same error type, so this goes by the server's wording.
pub(crate) fn lookup_says_missing(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not found") || message.contains("10014")
}

fn base_consumer_config(spec: &ConsumerSpec) -> consumer::Config {
    consumer::Config {
        durable_name: Some(spec.durable.clone()),
        deliver_policy: DeliverPolicy::All,
        ack_policy: AckPolicy::Explicit,
        ack_wait: spec.ack_wait,
        max_deliver: CONSUMER_MAX_DELIVER,
        max_ack_pending: spec.max_ack_pending,
        ..Default::default()
    }
}

/// The full consumer configurations implied by a spec plus the fixed policy
/// constants (explicit ack, deliver-all, bounded redelivery). Pull mode is
/// one consumer filtering on every subject; push mode is one consumer per
/// subject.
pub(crate) fn desired_consumer_configs(spec: &ConsumerSpec) -> Vec<consumer::Config> {
    match spec.mode {
        DeliveryMode::Pull => {
            let mut config = base_consumer_config(spec);
            if spec.subscribe_subjects.len() == 1 {
                config.filter_subject = spec.subscribe_subjects[0].clone();
            } else {
                config.filter_subjects = spec.subscribe_subjects.clone();
            }
            vec![config]
        }
        DeliveryMode::Push => spec
            .subscribe_subjects
            .iter()
            .enumerate()
            .map(|(index, subject)| {
                let durable = push_durable(&spec.durable, index);
                let mut config = base_consumer_config(spec);
                config.durable_name = Some(durable.clone());
                config.filter_subject = subject.clone();
                config.deliver_subject = Some(deliver_subject(&durable));
                config.deliver_group = spec.queue_group.clone();
                config
            })
            .collect(),
    }
}

/// Field-by-field comparison of the policy surface this crate manages. A
/// mismatch on any field triggers a declarative overwrite.
pub(crate) fn consumer_config_matches(
    current: &consumer::Config,
    desired: &consumer::Config,
) -> bool {
    let mut current_subjects = current.filter_subjects.clone();
    let mut desired_subjects = desired.filter_subjects.clone();
    current_subjects.sort();
    desired_subjects.sort();

    current.durable_name == desired.durable_name
        && current.deliver_policy == desired.deliver_policy
        && current.ack_policy == desired.ack_policy
        && current.ack_wait == desired.ack_wait
        && current.max_deliver == desired.max_deliver
        && current.max_ack_pending == desired.max_ack_pending
        && current.deliver_subject == desired.deliver_subject
        && current.deliver_group == desired.deliver_group
        && current.filter_subject == desired.filter_subject
        && current_subjects == desired_subjects
}

#[derive(Debug)]
struct NatsMessage {
    inner: jetstream::Message,
}

impl NatsMessage {
    async fn control(&self, op: &'static str, kind: AckKind) -> Result<()> {
        self.inner.ack_with(kind).await.map_err(|e| {
            counter!(NATS_ERROR_COUNTER, "op" => op).increment(1);
            Error::with_message(ErrorKind::Ack, format!("{op} failed"), Some(e))
        })
    }
}

#[async_trait]
impl Message for NatsMessage {
    fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    fn data(&self) -> &[u8] {
        &self.inner.payload
    }

    fn trace_context(&self) -> Option<TraceContext> {
        self.inner.headers.as_ref().and_then(TraceContext::extract)
    }

    async fn ack(&self) -> Result<()> {
        self.control("ack", AckKind::Ack).await
    }

    async fn nak(&self) -> Result<()> {
        self.control("nak", AckKind::Nak(None)).await
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.control("nak_delayed", AckKind::Nak(Some(delay))).await
    }

    async fn in_progress(&self) -> Result<()> {
        self.control("in_progress", AckKind::Progress).await
    }

    async fn term(&self) -> Result<()> {
        self.control("term", AckKind::Term).await
    }
}
