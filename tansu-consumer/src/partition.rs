// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Partition Consumer
//!
//! A long poll fetch loop for one partition on behalf of one group, pushing
//! messages into a bounded queue. A full queue blocks the loop.

use std::{
    fmt::Debug,
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tokio::{
    sync::{mpsc, watch},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, Level, debug, span, warn};

use crate::{
    Broker, Config, Error, METER, Message, OffsetReset, Result, Topition, join_within, retry,
};

static FETCHED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_fetched_messages")
        .with_description("consumer fetched messages")
        .build()
});

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PartitionState {
    #[default]
    Initializing,
    Fetching,
    Stopped,
    Errored,
}

/// Observes partition consumers, notified once with the offset of the
/// first message each one fetches.
pub trait FetchObserver: Debug + Send + Sync {
    fn first_fetched(&self, group: &str, topition: &Topition, offset: i64);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl FetchObserver for NoopObserver {
    fn first_fetched(&self, _group: &str, _topition: &Topition, _offset: i64) {}
}

#[derive(Clone, Debug)]
pub struct PartitionConsumer {
    group: String,
    topition: Topition,
    state: watch::Receiver<PartitionState>,
    cancellation: CancellationToken,
    handle: Arc<Mutex<Option<AbortOnDropHandle<Result<()>>>>>,
    shutdown_timeout: Duration,
}

impl PartitionConsumer {
    pub fn spawn<B>(
        group: &str,
        topition: &Topition,
        offset: i64,
        config: &Config,
        broker: B,
        observer: Arc<dyn FetchObserver>,
    ) -> (Self, mpsc::Receiver<Message>)
    where
        B: Broker,
    {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let (state, watcher) = watch::channel(PartitionState::Initializing);
        let cancellation = CancellationToken::new();

        let fetcher = Fetcher {
            group: group.to_owned(),
            topition: topition.to_owned(),
            offset,
            config: config.clone(),
            broker,
            observer,
            state,
            messages: sender,
        };

        let handle = tokio::spawn({
            let cancellation = cancellation.clone();
            let span = span!(Level::DEBUG, "partition", group, %topition);

            async move { fetcher.run(cancellation).await }.instrument(span)
        });

        (
            Self {
                group: group.to_owned(),
                topition: topition.to_owned(),
                state: watcher,
                cancellation,
                handle: Arc::new(Mutex::new(Some(AbortOnDropHandle::new(handle)))),
                shutdown_timeout: config.shutdown_timeout,
            },
            receiver,
        )
    }

    pub fn state(&self) -> PartitionState {
        *self.state.borrow()
    }

    pub fn topition(&self) -> &Topition {
        &self.topition
    }

    pub async fn stop(&self) -> Result<()> {
        self.cancellation.cancel();

        let handle = self.handle.lock().map(|mut handle| handle.take())?;

        if let Some(handle) = handle {
            debug!(group = %self.group, topition = %self.topition);
            join_within(handle, self.shutdown_timeout, "partition").await
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Fetcher<B> {
    group: String,
    topition: Topition,
    offset: i64,
    config: Config,
    broker: B,
    observer: Arc<dyn FetchObserver>,
    state: watch::Sender<PartitionState>,
    messages: mpsc::Sender<Message>,
}

impl<B> Fetcher<B>
where
    B: Broker,
{
    async fn run(self, cancellation: CancellationToken) -> Result<()> {
        let outcome = tokio::select! {
            biased;

            _ = cancellation.cancelled() => Ok(()),

            outcome = self.fetch() => outcome,
        };

        let state = if outcome.is_ok() {
            PartitionState::Stopped
        } else {
            PartitionState::Errored
        };

        debug!(?state, ?outcome);
        _ = self.state.send_replace(state);

        outcome
    }

    async fn fetch(&self) -> Result<()> {
        let mut offset = self.resolve(self.offset).await?;
        _ = self.state.send_replace(PartitionState::Fetching);

        let attributes = [
            KeyValue::new("group", self.group.clone()),
            KeyValue::new("topic", self.topition.topic().to_owned()),
        ];

        let mut first = true;
        let mut attempt = 0;

        loop {
            match self
                .broker
                .fetch(&self.topition, offset, self.config.fetch_max_wait)
                .await
            {
                Ok(batch) => {
                    attempt = 0;

                    // a batch may begin before the requested offset
                    let requested = offset;

                    for message in batch
                        .into_iter()
                        .filter(|message| message.offset >= requested)
                    {
                        if first {
                            first = false;
                            self.observer
                                .first_fetched(&self.group, &self.topition, message.offset);
                        }

                        offset = message.offset + 1;
                        FETCHED.add(1, &attributes);

                        if self.messages.send(message).await.is_err() {
                            debug!(offset, "closed");
                            return Ok(());
                        }
                    }
                }

                Err(Error::OffsetOutOfRange { offset: requested, .. }) => {
                    offset = self.resolve(requested).await?;
                }

                Err(error) if error.is_retryable() => {
                    let delay = self.config.backoff(attempt);
                    warn!(?error, offset, attempt, ?delay);

                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }

                Err(error) => return Err(error),
            }
        }
    }

    /// Apply the out of range policy to `offset`.
    async fn resolve(&self, offset: i64) -> Result<i64> {
        let broker = &self.broker;
        let topition = &self.topition;

        let oldest = retry(&self.config, "oldest_offset", move || {
            broker.oldest_offset(topition)
        })
        .await?;

        let newest = retry(&self.config, "newest_offset", move || {
            broker.newest_offset(topition)
        })
        .await?;

        let resolved = if offset < oldest {
            match self.config.offset_reset {
                OffsetReset::Oldest => oldest,
                OffsetReset::Newest => newest,
            }
        } else if offset > newest {
            newest
        } else {
            offset
        };

        if resolved != offset {
            warn!(offset, resolved, oldest, newest);
        }

        Ok(resolved)
    }
}
