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

//! Offset Manager
//!
//! Serialises the commits of one group for one partition. Submissions
//! between commit ticks collapse into a single commit of the highest offset.
//! A group without a committed offset starts at the head of the partition,
//! which is committed on the first tick.

use std::{
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, Level, debug, span, warn};

use crate::{Broker, Config, METER, OffsetStore, Result, Topition, join_within, retry};

static COMMITS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_offset_commits")
        .with_description("consumer offset commits")
        .build()
});

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Submitted {
    offset: i64,
    metadata: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OffsetManager {
    group: String,
    topition: Topition,
    initial: i64,
    submitted: Arc<watch::Sender<Option<Submitted>>>,
    committed: watch::Receiver<Option<i64>>,
    cancellation: CancellationToken,
    handle: Arc<Mutex<Option<AbortOnDropHandle<Result<()>>>>>,
    shutdown_timeout: Duration,
}

impl OffsetManager {
    /// Fetch the committed offset of `group` for `topition` and start committing.
    pub async fn spawn<B, O>(
        group: &str,
        topition: &Topition,
        config: &Config,
        broker: &B,
        store: &O,
    ) -> Result<Self>
    where
        B: Broker,
        O: OffsetStore,
    {
        let fetched = retry(config, "fetch_offset", move || {
            store.fetch_offset(group, topition)
        })
        .await?;

        let head = if fetched.is_none() {
            retry(config, "newest_offset", move || broker.newest_offset(topition))
                .await
                .map(Some)?
        } else {
            None
        };

        let initial = fetched.or(head).unwrap_or_default();
        debug!(group, %topition, ?fetched, ?head, initial);

        let (submitted, pending) = watch::channel(None);
        let (committed, watcher) = watch::channel(fetched);
        let cancellation = CancellationToken::new();

        let committer = Committer {
            group: group.to_owned(),
            topition: topition.to_owned(),
            head,
            pending,
            committed,
            config: config.clone(),
            store: store.clone(),
        };

        let handle = tokio::spawn({
            let cancellation = cancellation.clone();
            let span = span!(Level::DEBUG, "offset", group, %topition);

            async move { committer.run(cancellation).await }.instrument(span)
        });

        Ok(Self {
            group: group.to_owned(),
            topition: topition.to_owned(),
            initial,
            submitted: Arc::new(submitted),
            committed: watcher,
            cancellation,
            handle: Arc::new(Mutex::new(Some(AbortOnDropHandle::new(handle)))),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Where a partition consumer for this group should start.
    pub fn initial_offset(&self) -> i64 {
        self.initial
    }

    /// The last offset successfully written by this manager.
    pub fn committed_offset(&self) -> Option<i64> {
        *self.committed.borrow()
    }

    /// Submit the offset of the next message to be consumed.
    ///
    /// Only the highest offset submitted since spawn is committed, the first
    /// submission replaces any stale committed offset.
    pub fn submit_offset(&self, offset: i64, metadata: Option<&str>) {
        _ = self.submitted.send_if_modified(|current| match current {
            Some(submitted) if submitted.offset >= offset => false,

            _ => {
                *current = Some(Submitted {
                    offset,
                    metadata: metadata.map(ToOwned::to_owned),
                });

                true
            }
        });
    }

    /// Flush any pending commit and stop committing.
    pub async fn stop(&self) -> Result<()> {
        self.cancellation.cancel();

        let handle = self.handle.lock().map(|mut handle| handle.take())?;

        if let Some(handle) = handle {
            debug!(group = %self.group, topition = %self.topition);
            join_within(handle, self.shutdown_timeout, "offset").await
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Committer<O> {
    group: String,
    topition: Topition,
    head: Option<i64>,
    pending: watch::Receiver<Option<Submitted>>,
    committed: watch::Sender<Option<i64>>,
    config: Config,
    store: O,
}

impl<O> Committer<O>
where
    O: OffsetStore,
{
    async fn run(self, cancellation: CancellationToken) -> Result<()> {
        let mut interval = time::interval(self.config.commit_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => break,

                _ = interval.tick() => {
                    if let Err(error) = self.commit().await {
                        warn!(?error);
                    }
                }
            }
        }

        retry(&self.config, "flush", || self.commit())
            .await
            .inspect_err(|error| warn!(?error, "discarding"))
    }

    fn target(&self) -> Option<Submitted> {
        self.pending.borrow().clone().or_else(|| {
            self.head.map(|offset| Submitted {
                offset,
                metadata: None,
            })
        })
    }

    async fn commit(&self) -> Result<()> {
        let Some(target) = self.target() else {
            return Ok(());
        };

        if *self.committed.borrow() == Some(target.offset) {
            return Ok(());
        }

        self.store
            .commit_offset(
                &self.group,
                &self.topition,
                target.offset,
                target.metadata.as_deref(),
            )
            .await?;

        debug!(offset = target.offset);

        _ = self.committed.send_replace(Some(target.offset));

        COMMITS.add(
            1,
            &[
                KeyValue::new("group", self.group.clone()),
                KeyValue::new("topic", self.topition.topic().to_owned()),
            ],
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Error,
        memory::{MemoryBroker, MemoryOffsetStore},
    };
    use pretty_assertions::assert_eq;

    const GROUP: &str = "g1";

    fn setup(messages: usize) -> Result<(MemoryBroker, MemoryOffsetStore, Topition)> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;

        for _ in 0..messages {
            _ = broker.produce("abc", 0, None, None)?;
        }

        Ok((broker, MemoryOffsetStore::default(), Topition::new("abc", 0)))
    }

    #[tokio::test(start_paused = true)]
    async fn new_group_starts_at_head() -> Result<()> {
        let (broker, store, topition) = setup(5)?;
        let config = Config::default();

        let om = OffsetManager::spawn(GROUP, &topition, &config, &broker, &store).await?;
        assert_eq!(5, om.initial_offset());
        assert_eq!(None, om.committed_offset());

        time::sleep(config.commit_interval).await;
        assert_eq!(Some(5), store.committed(GROUP, &topition)?);
        assert_eq!(Some(5), om.committed_offset());

        om.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_committed() -> Result<()> {
        let (broker, store, topition) = setup(5)?;
        store.commit_offset(GROUP, &topition, 2, None).await?;

        let om =
            OffsetManager::spawn(GROUP, &topition, &Config::default(), &broker, &store).await?;
        assert_eq!(2, om.initial_offset());
        assert_eq!(Some(2), om.committed_offset());

        om.stop().await?;
        assert_eq!(Some(2), store.committed(GROUP, &topition)?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_collapse_to_highest() -> Result<()> {
        let (broker, store, topition) = setup(0)?;
        let config = Config::default();

        let om = OffsetManager::spawn(GROUP, &topition, &config, &broker, &store).await?;
        time::sleep(config.commit_interval / 2).await;

        om.submit_offset(1, None);
        om.submit_offset(3, Some("m1"));
        om.submit_offset(2, None);

        time::sleep(config.commit_interval).await;
        assert_eq!(Some(3), store.committed(GROUP, &topition)?);
        assert_eq!(Some("m1".to_owned()), store.metadata(GROUP, &topition)?);

        om.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn first_submission_replaces_stale_commit() -> Result<()> {
        let (broker, store, topition) = setup(10)?;
        store.commit_offset(GROUP, &topition, 1_000, None).await?;

        let om =
            OffsetManager::spawn(GROUP, &topition, &Config::default(), &broker, &store).await?;
        om.submit_offset(11, None);
        om.stop().await?;

        assert_eq!(Some(11), store.committed(GROUP, &topition)?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes() -> Result<()> {
        let (broker, store, topition) = setup(0)?;
        let config = Config::default().commit_interval(Duration::from_secs(60));

        let om = OffsetManager::spawn(GROUP, &topition, &config, &broker, &store).await?;
        time::sleep(Duration::from_secs(1)).await;

        om.submit_offset(7, None);
        om.stop().await?;
        assert_eq!(Some(7), store.committed(GROUP, &topition)?);

        om.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn transient_commit_failures_are_retried() -> Result<()> {
        let (broker, store, topition) = setup(0)?;
        let config = Config::default().commit_interval(Duration::from_secs(60));

        let om = OffsetManager::spawn(GROUP, &topition, &config, &broker, &store).await?;
        time::sleep(Duration::from_secs(1)).await;

        store.fail_commits(2);
        om.submit_offset(4, None);
        om.stop().await?;

        assert_eq!(Some(4), store.committed(GROUP, &topition)?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_stop() -> Result<()> {
        let (broker, store, topition) = setup(0)?;
        let config = Config::default()
            .commit_interval(Duration::from_secs(60))
            .max_retries(2);

        let om = OffsetManager::spawn(GROUP, &topition, &config, &broker, &store).await?;
        time::sleep(Duration::from_secs(1)).await;

        store.fail_commits(u32::MAX);
        om.submit_offset(4, None);

        assert!(matches!(om.stop().await, Err(Error::Transient(_))));
        assert_eq!(Some(0), store.committed(GROUP, &topition)?);

        om.stop().await
    }
}
