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

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};
use tracing::{debug, instrument};

use crate::{Broker, Error, Message, Result, Topition};

use super::take_fault;

const MAX_BATCH: usize = 64;

#[derive(Clone, Debug, Default)]
struct Log {
    base: i64,
    messages: VecDeque<Message>,
}

impl Log {
    fn newest(&self) -> i64 {
        self.base + self.messages.len() as i64
    }
}

/// A partitioned log held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<BTreeMap<String, Vec<Log>>>>,
    produced: Arc<Notify>,
    faults: Arc<AtomicU32>,
}

impl MemoryBroker {
    /// Create a topic, adding partitions when it already exists with fewer.
    pub fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        if partitions < 1 {
            return Err(Error::Message(format!(
                "{topic}: invalid partition count: {partitions}"
            )));
        }

        self.topics.lock().map_err(Into::into).map(|mut topics| {
            let logs = topics.entry(topic.to_owned()).or_default();
            logs.resize_with(logs.len().max(partitions as usize), Log::default);
        })
    }

    /// Append a message, returning its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<i64> {
        let topition = Topition::new(topic, partition);

        let offset = self
            .topics
            .lock()
            .map_err(Error::from)
            .and_then(|mut topics| {
                let log = log_mut(&mut topics, &topition)?;
                let offset = log.newest();

                log.messages
                    .push_back(Message::new(&topition, offset).key(key).value(value));

                Ok(offset)
            })?;

        self.produced.notify_waiters();
        Ok(offset)
    }

    /// Discard every message before `offset`, as retention would.
    pub fn truncate(&self, topition: &Topition, offset: i64) -> Result<()> {
        self.topics
            .lock()
            .map_err(Error::from)
            .and_then(|mut topics| {
                let log = log_mut(&mut topics, topition)?;
                let offset = offset.min(log.newest());

                while log.base < offset {
                    _ = log.messages.pop_front();
                    log.base += 1;
                }

                Ok(())
            })
    }

    /// The next `faults` fetches fail with a transient error.
    pub fn fail_fetches(&self, faults: u32) {
        self.faults.store(faults, Ordering::SeqCst);
    }

    fn with_log<T>(&self, topition: &Topition, f: impl FnOnce(&Log) -> Result<T>) -> Result<T> {
        self.topics.lock().map_err(Error::from).and_then(|topics| {
            topics
                .get(topition.topic())
                .and_then(|logs| {
                    usize::try_from(topition.partition())
                        .ok()
                        .and_then(|partition| logs.get(partition))
                })
                .ok_or_else(|| Error::UnknownTopicOrPartition(topition.to_owned()))
                .and_then(f)
        })
    }
}

fn log_mut<'a>(
    topics: &'a mut BTreeMap<String, Vec<Log>>,
    topition: &Topition,
) -> Result<&'a mut Log> {
    topics
        .get_mut(topition.topic())
        .and_then(|logs| {
            usize::try_from(topition.partition())
                .ok()
                .and_then(|partition| logs.get_mut(partition))
        })
        .ok_or_else(|| Error::UnknownTopicOrPartition(topition.to_owned()))
}

#[async_trait]
impl Broker for MemoryBroker {
    #[instrument(skip_all, fields(%topition, offset = offset))]
    async fn fetch(
        &self,
        topition: &Topition,
        offset: i64,
        max_wait: Duration,
    ) -> Result<Vec<Message>> {
        if take_fault(&self.faults) {
            debug!("injected fault");
            return Err(Error::Transient(format!("fetch: {topition}")));
        }

        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.produced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.with_log(topition, |log| {
                if offset < log.base || offset > log.newest() {
                    return Err(Error::OffsetOutOfRange {
                        topition: topition.to_owned(),
                        offset,
                    });
                }

                Ok(log
                    .messages
                    .iter()
                    .skip((offset - log.base) as usize)
                    .take(MAX_BATCH)
                    .cloned()
                    .collect::<Vec<_>>())
            })?;

            if !batch.is_empty() {
                return Ok(batch);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn oldest_offset(&self, topition: &Topition) -> Result<i64> {
        self.with_log(topition, |log| Ok(log.base))
    }

    async fn newest_offset(&self, topition: &Topition) -> Result<i64> {
        self.with_log(topition, |log| Ok(log.newest()))
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.topics.lock().map_err(Into::into).map(|topics| {
            topics
                .get(topic)
                .map(|logs| (0..logs.len() as i32).collect())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn produce_fetch() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 2)?;

        let topition = Topition::new("abc", 1);

        assert_eq!(0, broker.produce("abc", 1, None, Some(Bytes::from_static(b"a")))?);
        assert_eq!(1, broker.produce("abc", 1, None, Some(Bytes::from_static(b"b")))?);

        let batch = broker.fetch(&topition, 1, Duration::from_millis(10)).await?;
        assert_eq!(1, batch.len());
        assert_eq!(1, batch[0].offset);
        assert_eq!(Some(Bytes::from_static(b"b")), batch[0].value);

        assert_eq!(vec![0, 1], broker.partitions("abc").await?);
        assert!(broker.partitions("pqr").await?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_produce() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;

        let topition = Topition::new("abc", 0);

        let fetch = tokio::spawn({
            let broker = broker.clone();
            let topition = topition.clone();
            async move { broker.fetch(&topition, 0, Duration::from_secs(60)).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        _ = broker.produce("abc", 0, None, None)?;

        let batch = fetch.await??;
        assert_eq!(1, batch.len());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn empty_after_max_wait() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;

        let batch = broker
            .fetch(&Topition::new("abc", 0), 0, Duration::from_millis(250))
            .await?;
        assert!(batch.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn truncated() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;

        for _ in 0..5 {
            _ = broker.produce("abc", 0, None, None)?;
        }

        let topition = Topition::new("abc", 0);
        broker.truncate(&topition, 3)?;

        assert_eq!(3, broker.oldest_offset(&topition).await?);
        assert_eq!(5, broker.newest_offset(&topition).await?);

        assert!(matches!(
            broker.fetch(&topition, 1, Duration::ZERO).await,
            Err(Error::OffsetOutOfRange { offset: 1, .. })
        ));

        assert!(matches!(
            broker.fetch(&topition, 6, Duration::ZERO).await,
            Err(Error::OffsetOutOfRange { offset: 6, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn injected_faults() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;
        broker.fail_fetches(1);

        let topition = Topition::new("abc", 0);

        assert!(matches!(
            broker.fetch(&topition, 0, Duration::ZERO).await,
            Err(Error::Transient(_))
        ));
        assert!(broker.fetch(&topition, 0, Duration::ZERO).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown() {
        let broker = MemoryBroker::default();

        assert!(matches!(
            broker.newest_offset(&Topition::new("pqr", 0)).await,
            Err(Error::UnknownTopicOrPartition(_))
        ));
    }
}
