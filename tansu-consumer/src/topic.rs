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

//! Topic Consumer
//!
//! Serves consume requests for one group and topic from the partitions of
//! the topic assigned to this member. Each owned partition is a tier: a
//! claim in the registry, an [`OffsetManager`] and a [`PartitionConsumer`].
//! Tiers start and stop as the assignment changes, a tier for a partition
//! still being torn down waits for the teardown to complete.
//!
//! A tier tears down one phase at a time, each bounded by the shutdown
//! timeout, finishing with the release of its claim. A tier abandoned part
//! way through still releases its claim, and its partition stays leased
//! within this member until it has.
//!
//! The offset of a message is submitted for commit once it has been handed
//! to a caller.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::pending,
    mem,
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use futures::future::select_all;
use opentelemetry::{KeyValue, metrics::Counter};
use rand::{rng, seq::SliceRandom as _};
use tokio::{
    sync::{
        Mutex as AsyncMutex, OwnedMutexGuard,
        mpsc::{
            self,
            error::{TryRecvError, TrySendError},
        },
        oneshot,
    },
    runtime::Handle,
    task::JoinSet,
    time::{Instant, sleep, sleep_until, timeout, timeout_at},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, Level, Span, debug, span, warn};

use crate::{
    Broker, Config, Context, Error, METER, Message, OffsetStore, Registry, Result, Topition,
    group::{GroupRegistrator, assignor},
    join_within,
    offset::OffsetManager,
    partition::PartitionConsumer,
    retry,
};

static REQUEST_TIMEOUTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_request_timeouts")
        .with_description("consume requests without a message before their deadline")
        .build()
});

/// Claims held elsewhere are retried with at most this backoff exponent.
const MAX_CLAIM_ATTEMPT: u32 = 3;

/// Teardown phases of a tier (fetching, flushing and the claim), each bounded
/// by the shutdown timeout.
const TIER_PHASES: u32 = 3;

/// How long a tier has to tear down before it is abandoned.
fn tier_patience(config: &Config) -> Duration {
    config.shutdown_timeout.saturating_mul(TIER_PHASES + 1)
}

/// How long a topic consumer has to tear down before it is abandoned: its
/// tiers in parallel, then unsubscribing.
fn topic_patience(config: &Config) -> Duration {
    config.shutdown_timeout.saturating_mul(TIER_PHASES + 2)
}

/// Partitions leased to the tiers of one dispatcher. A tier holds the lease
/// of its partition from before it claims until after it has released, so
/// that a successor in this member never overlaps it.
#[derive(Clone, Debug, Default)]
pub(crate) struct Leases(Arc<Mutex<BTreeMap<(String, Topition), Arc<AsyncMutex<()>>>>>);

impl Leases {
    async fn acquire(&self, group: &str, topition: &Topition) -> Result<OwnedMutexGuard<()>> {
        let lease = self.0.lock().map(|mut leases| {
            leases.retain(|_, lease| Arc::strong_count(lease) > 1);

            leases
                .entry((group.to_owned(), topition.clone()))
                .or_default()
                .clone()
        })?;

        if let Ok(guard) = lease.clone().try_lock_owned() {
            Ok(guard)
        } else {
            debug!(group, %topition, "awaiting lease");
            Ok(lease.lock_owned().await)
        }
    }

    #[cfg(test)]
    fn len(&self) -> Result<usize> {
        self.0.lock().map(|leases| leases.len()).map_err(Into::into)
    }
}

#[derive(Debug)]
struct Request {
    deadline: Instant,
    reply: oneshot::Sender<Result<Message>>,
}

/// Consume requests for one group and topic.
#[derive(Clone, Debug)]
pub struct TopicConsumer {
    group: String,
    topic: String,
    requests: mpsc::Sender<Request>,
    cancellation: CancellationToken,
    handle: Arc<Mutex<Option<AbortOnDropHandle<Result<()>>>>>,
    shutdown_timeout: Duration,
    patience: Duration,
}

impl TopicConsumer {
    /// Spawn a topic consumer, starting once `predecessor` has released
    /// every partition it owned.
    pub(crate) fn spawn<B, R, O>(
        context: &Context<B, R, O>,
        group: &str,
        topic: &str,
        registrator: GroupRegistrator,
        predecessor: Option<TopicConsumer>,
    ) -> Self
    where
        B: Broker,
        R: Registry,
        O: OffsetStore,
    {
        let (requests, receiver) = mpsc::channel(context.config.channel_buffer_size);
        let (ready, feeds) = mpsc::channel(context.config.channel_buffer_size);
        let cancellation = CancellationToken::new();

        let fanin = Fanin {
            context: context.clone(),
            group: group.to_owned(),
            topic: topic.to_owned(),
            registrator,
            tiers: BTreeMap::new(),
            feeds: BTreeMap::new(),
            stopping: JoinSet::new(),
            stopping_partitions: BTreeSet::new(),
            pending: BTreeSet::new(),
            assigned: BTreeSet::new(),
            ready,
            generation: 0,
            current: None,
            stash: None,
            last_request: Instant::now(),
        };

        let handle = tokio::spawn({
            let cancellation = cancellation.clone();
            let span = span!(Level::DEBUG, "topic", group, topic);

            async move {
                fanin
                    .run(receiver, feeds, cancellation, predecessor)
                    .await
            }
            .instrument(span)
        });

        Self {
            group: group.to_owned(),
            topic: topic.to_owned(),
            requests,
            cancellation,
            handle: Arc::new(Mutex::new(Some(AbortOnDropHandle::new(handle)))),
            shutdown_timeout: context.config.shutdown_timeout,
            patience: topic_patience(&context.config),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The next message from any partition owned by this member, waiting at
    /// most `timeout` for one to arrive.
    pub async fn next_message(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let (reply, response) = oneshot::channel();

        self.requests
            .try_send(Request { deadline, reply })
            .map_err(|error| match error {
                TrySendError::Full(_) => Error::BufferOverflow {
                    group: self.group.clone(),
                    topic: self.topic.clone(),
                },

                TrySendError::Closed(_) => Error::SubscriptionExpired {
                    group: self.group.clone(),
                    topic: self.topic.clone(),
                },
            })?;

        match timeout_at(deadline + self.shutdown_timeout, response).await {
            Ok(Ok(outcome)) => outcome,

            Ok(Err(_)) | Err(_) => Err(Error::RequestTimeout {
                group: self.group.clone(),
                topic: self.topic.clone(),
            }),
        }
    }

    /// No longer accepting requests, following inactivity or a stop.
    pub fn is_expired(&self) -> bool {
        self.requests.is_closed()
    }

    /// Finished, or being joined elsewhere.
    pub(crate) fn is_finished(&self) -> Result<bool> {
        self.handle
            .lock()
            .map(|handle| handle.as_ref().is_none_or(AbortOnDropHandle::is_finished))
            .map_err(Into::into)
    }

    async fn join(&self) -> Result<()> {
        let handle = self.handle.lock().map(|mut handle| handle.take())?;

        if let Some(handle) = handle {
            join_within(handle, self.patience, "topic").await
        } else {
            Ok(())
        }
    }

    /// Stop consuming, releasing every owned partition. Requests not yet
    /// answered fail with [`Error::Stopped`].
    pub async fn stop(&self) -> Result<()> {
        self.cancellation.cancel();

        debug!(group = %self.group, topic = %self.topic);
        self.join().await
    }
}

/// A partition being served, or starting to be.
#[derive(Debug)]
struct Running {
    generation: u64,
    cancellation: CancellationToken,
    handle: AbortOnDropHandle<Result<()>>,
}

/// The messages of a started partition.
#[derive(Debug)]
struct Feed {
    partition: i32,
    generation: u64,
    messages: mpsc::Receiver<Message>,
    offsets: OffsetManager,
}

#[derive(Debug)]
struct Fanin<B, R, O> {
    context: Context<B, R, O>,
    group: String,
    topic: String,
    registrator: GroupRegistrator,

    tiers: BTreeMap<i32, Running>,
    feeds: BTreeMap<i32, Feed>,
    stopping: JoinSet<i32>,
    stopping_partitions: BTreeSet<i32>,

    // partitions to start once their predecessor has stopped
    pending: BTreeSet<i32>,
    assigned: BTreeSet<i32>,

    ready: mpsc::Sender<Feed>,
    generation: u64,

    current: Option<Request>,
    stash: Option<Message>,
    last_request: Instant,
}

impl<B, R, O> Fanin<B, R, O>
where
    B: Broker,
    R: Registry,
    O: OffsetStore,
{
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut ready: mpsc::Receiver<Feed>,
        cancellation: CancellationToken,
        predecessor: Option<TopicConsumer>,
    ) -> Result<()> {
        if let Some(predecessor) = predecessor {
            if let Err(error) = predecessor.join().await {
                warn!(?error);
            }
        }

        let mut assignment = match self.registrator.subscribe(&self.topic).await {
            Ok(assignment) => assignment,

            Err(error) => {
                warn!(?error);
                self.refuse(&mut requests, cancellation.is_cancelled());
                return Ok(());
            }
        };

        let desired = assignment.borrow_and_update().clone();
        self.reconcile(desired);

        loop {
            let expiry = self.last_request + self.context.config.registration_timeout;
            let deadline = self
                .current
                .as_ref()
                .map_or(expiry, |request| request.deadline);

            tokio::select! {
                biased;

                _ = cancellation.cancelled() => break,

                Some(joined) = self.stopping.join_next(), if !self.stopping.is_empty() => {
                    match joined {
                        Ok(partition) => self.stopped(partition),
                        Err(error) => warn!(?error),
                    }
                }

                Some(feed) = ready.recv() => self.feed(feed),

                changed = assignment.changed() => {
                    if changed.is_err() {
                        debug!("assignment closed");
                        break;
                    }

                    let desired = assignment.borrow_and_update().clone();
                    self.reconcile(desired);
                }

                request = requests.recv(), if self.current.is_none() => {
                    if let Some(request) = request {
                        self.request(request);
                    } else {
                        break;
                    }
                }

                (partition, message) = recv_any(&mut self.feeds), if self.current.is_some() => {
                    if let Some(message) = message {
                        self.deliver(message);
                    } else {
                        self.restart(partition);
                    }
                }

                _ = sleep_until(deadline) => {
                    if let Some(request) = self.current.take() {
                        REQUEST_TIMEOUTS.add(
                            1,
                            &[
                                KeyValue::new("group", self.group.clone()),
                                KeyValue::new("topic", self.topic.clone()),
                            ],
                        );

                        _ = request.reply.send(Err(Error::RequestTimeout {
                            group: self.group.clone(),
                            topic: self.topic.clone(),
                        }));
                    } else {
                        debug!(inactive = ?self.context.config.registration_timeout);
                        break;
                    }
                }
            }
        }

        self.refuse(&mut requests, cancellation.is_cancelled());

        let running = self.tiers.keys().copied().collect::<Vec<_>>();
        for partition in running {
            _ = self.stop_partition(partition, Duration::ZERO);
        }

        while let Some(joined) = self.stopping.join_next().await {
            debug!(?joined);
        }

        match timeout(
            self.context.config.shutdown_timeout,
            self.registrator.unsubscribe(&self.topic),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(error)) => debug!(?error),
            Err(elapsed) => warn!(?elapsed, "unsubscribe"),
        }

        Ok(())
    }

    /// Refuse further requests, failing those not yet answered. Following
    /// expiry a caller may try again with a successor.
    fn refuse(&mut self, requests: &mut mpsc::Receiver<Request>, stopped: bool) {
        requests.close();

        let mut leftovers = self.current.take().into_iter().collect::<Vec<_>>();

        while let Ok(request) = requests.try_recv() {
            leftovers.push(request);
        }

        debug!(leftovers = leftovers.len(), stopped);

        for request in leftovers {
            _ = request.reply.send(Err(if stopped {
                Error::Stopped
            } else {
                Error::SubscriptionExpired {
                    group: self.group.clone(),
                    topic: self.topic.clone(),
                }
            }));
        }
    }

    fn request(&mut self, request: Request) {
        self.last_request = Instant::now();
        self.registrator.touch(&self.topic);

        if request.reply.is_closed() {
            debug!("caller vanished");
            return;
        }

        self.current = Some(request);

        if let Some(message) = self.stash.take() {
            self.deliver(message);
        }
    }

    fn deliver(&mut self, message: Message) {
        let Some(request) = self.current.take() else {
            self.stash = Some(message);
            return;
        };

        let partition = message.partition;
        let offset = message.offset;

        match request.reply.send(Ok(message)) {
            Ok(()) => {
                if let Some(feed) = self.feeds.get(&partition) {
                    feed.offsets.submit_offset(offset + 1, None);
                } else {
                    debug!(partition, offset, "delivered without a feed");
                }
            }

            Err(Ok(message)) => {
                debug!(partition, offset, "caller vanished");
                self.stash = Some(message);
            }

            Err(Err(_)) => (),
        }
    }

    fn feed(&mut self, feed: Feed) {
        if self
            .tiers
            .get(&feed.partition)
            .is_some_and(|running| running.generation == feed.generation)
        {
            debug!(partition = feed.partition, initial = feed.offsets.initial_offset());
            _ = self.feeds.insert(feed.partition, feed);
        } else {
            debug!(partition = feed.partition, generation = feed.generation, "stale");
        }
    }

    fn reconcile(&mut self, desired: BTreeSet<i32>) {
        let running = self
            .tiers
            .keys()
            .chain(self.pending.iter())
            .copied()
            .collect::<BTreeSet<_>>();

        let outcome = assignor::reconcile(&desired, &running);
        self.assigned = desired;

        if outcome.is_empty() {
            return;
        }

        debug!(assigned = ?self.assigned, ?running, ?outcome);

        for partition in outcome.stop {
            if !self.pending.remove(&partition) {
                _ = self.stop_partition(partition, Duration::ZERO);
            }
        }

        for partition in outcome.start {
            self.start_partition(partition);
        }
    }

    fn start_partition(&mut self, partition: i32) {
        if self.stopping_partitions.contains(&partition) {
            debug!(partition, "awaiting predecessor");
            _ = self.pending.insert(partition);
            return;
        }

        self.generation += 1;

        let topition = Topition::new(self.topic.as_str(), partition);
        let cancellation = CancellationToken::new();

        let tier = Tier {
            context: self.context.clone(),
            group: self.group.clone(),
            topition: topition.clone(),
            generation: self.generation,
            cancellation: cancellation.clone(),
            ready: self.ready.clone(),
        };

        let span = span!(
            Level::DEBUG,
            "tier",
            group = %self.group,
            %topition,
            generation = self.generation
        );

        let handle = AbortOnDropHandle::new(tokio::spawn(tier.serve().instrument(span)));

        _ = self.tiers.insert(
            partition,
            Running {
                generation: self.generation,
                cancellation,
                handle,
            },
        );
    }

    /// Stop serving `partition`, returning false when it was not running.
    fn stop_partition(&mut self, partition: i32, linger: Duration) -> bool {
        _ = self.feeds.remove(&partition);

        if self
            .stash
            .as_ref()
            .is_some_and(|message| message.partition == partition)
        {
            debug!(partition, "discarding stash");
            self.stash = None;
        }

        let Some(running) = self.tiers.remove(&partition) else {
            return false;
        };

        debug!(partition, generation = running.generation);

        running.cancellation.cancel();
        _ = self.stopping_partitions.insert(partition);

        let patience = tier_patience(&self.context.config);

        _ = self.stopping.spawn(async move {
            if let Err(error) = join_within(running.handle, patience, "tier").await {
                warn!(partition, ?error);
            }

            sleep(linger).await;
            partition
        });

        true
    }

    fn stopped(&mut self, partition: i32) {
        debug!(partition);

        _ = self.stopping_partitions.remove(&partition);

        if self.pending.remove(&partition) && self.assigned.contains(&partition) {
            self.start_partition(partition);
        }
    }

    /// The messages of a partition ended, start it again after a pause.
    fn restart(&mut self, partition: i32) {
        debug!(partition, "feed ended");

        let linger = self.context.config.retry_backoff;

        if self.stop_partition(partition, linger) {
            if self.assigned.contains(&partition) {
                _ = self.pending.insert(partition);
            }
        } else if self.assigned.contains(&partition) {
            self.start_partition(partition);
        }
    }
}

/// Receive from any feed, choosing at random between those ready.
async fn recv_any(feeds: &mut BTreeMap<i32, Feed>) -> (i32, Option<Message>) {
    if feeds.is_empty() {
        return pending().await;
    }

    let mut order = feeds.keys().copied().collect::<Vec<_>>();
    order.shuffle(&mut rng());

    for partition in order {
        if let Some(feed) = feeds.get_mut(&partition) {
            match feed.messages.try_recv() {
                Ok(message) => return (partition, Some(message)),
                Err(TryRecvError::Disconnected) => return (partition, None),
                Err(TryRecvError::Empty) => (),
            }
        }
    }

    select_all(feeds.iter_mut().map(|(partition, feed)| {
        Box::pin(async move { (*partition, feed.messages.recv().await) })
    }))
    .await
    .0
}

/// Serves one partition: claims it, starts committing and fetching, then
/// tears all of that down in reverse when cancelled.
#[derive(Debug)]
struct Tier<B, R, O> {
    context: Context<B, R, O>,
    group: String,
    topition: Topition,
    generation: u64,
    cancellation: CancellationToken,
    ready: mpsc::Sender<Feed>,
}

impl<B, R, O> Tier<B, R, O>
where
    B: Broker,
    R: Registry,
    O: OffsetStore,
{
    async fn serve(self) -> Result<()> {
        let Some((claim, offsets)) = self.acquire().await? else {
            return Ok(());
        };

        let (partition, messages) = PartitionConsumer::spawn(
            &self.group,
            &self.topition,
            offsets.initial_offset(),
            &self.context.config,
            self.context.broker.clone(),
            self.context.observer.clone(),
        );

        let feed = Feed {
            partition: self.topition.partition(),
            generation: self.generation,
            messages,
            offsets: offsets.clone(),
        };

        tokio::select! {
            biased;

            _ = self.cancellation.cancelled() => (),

            sent = self.ready.send(feed) => {
                if sent.is_ok() {
                    self.cancellation.cancelled().await;
                }
            }
        }

        if let Err(error) = partition.stop().await {
            warn!(?error);
        }

        let flushed = offsets.stop().await;
        debug!(?flushed, committed = ?offsets.committed_offset());

        claim.release().await;
        flushed
    }

    /// Lease and claim the partition, then start committing, giving up when
    /// cancelled.
    async fn acquire(&self) -> Result<Option<(Claim<R>, OffsetManager)>> {
        let member = self.context.member();

        let lease = tokio::select! {
            biased;

            _ = self.cancellation.cancelled() => return Ok(None),

            lease = self.context.leases.acquire(&self.group, &self.topition) => lease?,
        };

        let mut attempt = 0;

        loop {
            let claimed = tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => return Ok(None),

                claimed = self.context.registry.claim(&self.group, &self.topition, member) => claimed,
            };

            match claimed {
                Ok(true) => break,
                Ok(false) => debug!(attempt, "claimed by another member"),
                Err(error) => warn!(?error, attempt),
            }

            if self.pause(attempt.min(MAX_CLAIM_ATTEMPT)).await {
                return Ok(None);
            }

            attempt += 1;
        }

        let claim = Claim {
            registry: self.context.registry.clone(),
            group: self.group.clone(),
            topition: self.topition.clone(),
            member: member.to_owned(),
            config: self.context.config.clone(),
            lease: Some(lease),
        };

        attempt = 0;

        loop {
            let spawned = tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => None,

                spawned = OffsetManager::spawn(
                    &self.group,
                    &self.topition,
                    &self.context.config,
                    &self.context.broker,
                    &self.context.store,
                ) => Some(spawned),
            };

            match spawned {
                Some(Ok(offsets)) => return Ok(Some((claim, offsets))),

                Some(Err(error)) => {
                    warn!(?error, attempt);

                    if !self.pause(attempt).await {
                        attempt += 1;
                        continue;
                    }
                }

                None => (),
            }

            claim.release().await;
            return Ok(None);
        }
    }

    /// Sleep for a backoff, returning true when cancelled instead.
    async fn pause(&self, attempt: u32) -> bool {
        tokio::select! {
            biased;

            _ = self.cancellation.cancelled() => true,

            _ = sleep(self.context.config.backoff(attempt)) => false,
        }
    }
}

/// A partition claimed by this member together with its lease. Released
/// when dropped without having been released already.
#[derive(Debug)]
struct Claim<R: Registry> {
    registry: R,
    group: String,
    topition: Topition,
    member: String,
    config: Config,
    lease: Option<OwnedMutexGuard<()>>,
}

impl<R: Registry> Claim<R> {
    async fn release(mut self) {
        release(
            &self.registry,
            &self.group,
            &self.topition,
            &self.member,
            &self.config,
        )
        .await;

        drop(self.lease.take());
    }
}

impl<R: Registry> Drop for Claim<R> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let Ok(runtime) = Handle::try_current() else {
            warn!(group = %self.group, topition = %self.topition, "no runtime to release claim");
            return;
        };

        warn!(group = %self.group, topition = %self.topition, "releasing abandoned claim");

        let registry = self.registry.clone();
        let group = mem::take(&mut self.group);
        let topition = mem::take(&mut self.topition);
        let member = mem::take(&mut self.member);
        let config = self.config.clone();

        _ = runtime.spawn(
            async move {
                release(&registry, &group, &topition, &member, &config).await;
                drop(lease);
            }
            .instrument(Span::current()),
        );
    }
}

/// Release a claim, retrying transient failures for at most the shutdown
/// timeout.
async fn release<R: Registry>(
    registry: &R,
    group: &str,
    topition: &Topition,
    member: &str,
    config: &Config,
) {
    match timeout(
        config.shutdown_timeout,
        retry(config, "release", || registry.release(group, topition, member)),
    )
    .await
    {
        Ok(Ok(())) => debug!(group, %topition, "released"),
        Ok(Err(error)) => warn!(group, %topition, ?error),
        Err(elapsed) => warn!(group, %topition, ?elapsed, "release"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use pretty_assertions::assert_eq;

    const GROUP: &str = "g1";

    #[tokio::test(start_paused = true)]
    async fn lease_waits_for_holder() -> Result<()> {
        let leases = Leases::default();
        let topition = Topition::new("abc", 0);

        let held = leases.acquire(GROUP, &topition).await?;

        let waiting = tokio::spawn({
            let leases = leases.clone();
            let topition = topition.clone();
            async move { leases.acquire(GROUP, &topition).await.map(drop) }
        });

        sleep(Duration::from_secs(1)).await;
        assert!(!waiting.is_finished());

        drop(held);
        waiting.await??;

        _ = leases.acquire(GROUP, &Topition::new("abc", 1)).await?;
        assert_eq!(1, leases.len()?);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_claim_is_released() -> Result<()> {
        let registry = MemoryRegistry::default();
        let leases = Leases::default();
        let topition = Topition::new("abc", 0);
        let config = Config::default().client_id("c1");

        registry
            .register(
                GROUP,
                "c1",
                &BTreeSet::from(["abc".to_owned()]),
                config.registration_timeout,
            )
            .await?;

        let lease = leases.acquire(GROUP, &topition).await?;
        assert!(registry.claim(GROUP, &topition, "c1").await?);

        drop(Claim {
            registry: registry.clone(),
            group: GROUP.into(),
            topition: topition.clone(),
            member: "c1".into(),
            config,
            lease: Some(lease),
        });

        let lease = leases.acquire(GROUP, &topition).await?;
        assert_eq!(None, registry.claimant(GROUP, &topition)?);
        drop(lease);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn released_claim_is_not_released_again() -> Result<()> {
        let registry = MemoryRegistry::default();
        let leases = Leases::default();
        let topition = Topition::new("abc", 0);
        let config = Config::default().client_id("c1");

        registry
            .register(
                GROUP,
                "c1",
                &BTreeSet::from(["abc".to_owned()]),
                config.registration_timeout,
            )
            .await?;

        let claim = Claim {
            registry: registry.clone(),
            group: GROUP.into(),
            topition: topition.clone(),
            member: "c1".into(),
            config: config.clone(),
            lease: Some(leases.acquire(GROUP, &topition).await?),
        };

        assert!(registry.claim(GROUP, &topition, "c1").await?);
        claim.release().await;
        assert_eq!(None, registry.claimant(GROUP, &topition)?);

        // a successor within this member
        let _lease = leases.acquire(GROUP, &topition).await?;
        assert!(registry.claim(GROUP, &topition, "c1").await?);

        sleep(config.shutdown_timeout).await;
        assert_eq!(Some("c1".into()), registry.claimant(GROUP, &topition)?);

        Ok(())
    }
}
