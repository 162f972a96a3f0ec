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

//! Group Registrator
//!
//! Keeps the registration record of this member in a group up to date with
//! the topics it consumes, follows the membership of the group and publishes
//! the partitions of each topic owned by this member.
//!
//! A registrator lives while a [`GroupRegistrator`] refers to it, holding a
//! [`WeakGroupRegistrator`] does not keep it alive. Once the last reference
//! is dropped it deregisters from the group and stops.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, Level, debug, span, warn};

use crate::{
    Broker, Config, Context, Error, METER, Membership, Registry, Result, join_within, retry,
};

pub mod assignor;

static REBALANCES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_rebalances")
        .with_description("consumer partition assignment changes")
        .build()
});

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MemberState {
    #[default]
    Joining,
    Registered,
    Deregistering,
    Expired,
}

#[derive(Debug)]
enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<watch::Receiver<BTreeSet<i32>>>,
    },

    Touch {
        topic: String,
    },

    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<()>,
    },
}

/// The task behind a registrator, shared by strong and weak references.
#[derive(Clone, Debug)]
struct Lifecycle {
    cancellation: CancellationToken,
    handle: Arc<Mutex<Option<AbortOnDropHandle<Result<()>>>>>,
    shutdown_timeout: Duration,
}

impl Lifecycle {
    fn is_finished(&self) -> Result<bool> {
        self.handle
            .lock()
            .map(|handle| handle.as_ref().is_none_or(AbortOnDropHandle::is_finished))
            .map_err(Into::into)
    }

    async fn join(&self) -> Result<()> {
        let handle = self.handle.lock().map(|mut handle| handle.take())?;

        if let Some(handle) = handle {
            join_within(handle, self.shutdown_timeout, "group").await
        } else {
            Ok(())
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancellation.cancel();
        self.join().await
    }
}

/// Membership of this process in one group.
#[derive(Clone, Debug)]
pub struct GroupRegistrator {
    group: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<MemberState>,
    lifecycle: Lifecycle,
}

/// A reference to a registrator that does not keep it alive.
#[derive(Clone, Debug)]
pub struct WeakGroupRegistrator {
    group: String,
    commands: mpsc::WeakSender<Command>,
    state: watch::Receiver<MemberState>,
    lifecycle: Lifecycle,
}

impl WeakGroupRegistrator {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The registrator, unless every [`GroupRegistrator`] referring to it
    /// has been dropped.
    pub fn upgrade(&self) -> Option<GroupRegistrator> {
        self.commands.upgrade().map(|commands| GroupRegistrator {
            group: self.group.clone(),
            commands,
            state: self.state.clone(),
            lifecycle: self.lifecycle.clone(),
        })
    }

    /// Deregistered and stopped, or being stopped elsewhere.
    pub fn is_finished(&self) -> Result<bool> {
        self.lifecycle.is_finished()
    }

    /// Deregister from the group.
    pub async fn stop(&self) -> Result<()> {
        debug!(group = %self.group);
        self.lifecycle.stop().await
    }
}

impl GroupRegistrator {
    /// Spawn a registrator that registers once `predecessor`, a registrator
    /// of this member in the same group, has deregistered.
    pub(crate) fn spawn<B, R, O>(
        context: &Context<B, R, O>,
        group: &str,
        predecessor: Option<WeakGroupRegistrator>,
    ) -> Self
    where
        B: Broker,
        R: Registry,
    {
        let (commands, receiver) = mpsc::channel(context.config.channel_buffer_size);
        let (state, watcher) = watch::channel(MemberState::Joining);
        let cancellation = CancellationToken::new();

        let registrator = Registrator {
            group: group.to_owned(),
            member: context.member().to_owned(),
            config: context.config.clone(),
            broker: context.broker.clone(),
            registry: context.registry.clone(),
            subscriptions: BTreeMap::new(),
            partitions: BTreeMap::new(),
            membership: Membership::default(),
            registered: None,
            state,
        };

        let handle = tokio::spawn({
            let cancellation = cancellation.clone();
            let span = span!(
                Level::DEBUG,
                "group",
                namespace = %context.namespace,
                group,
                member = context.member()
            );

            async move {
                if let Some(predecessor) = predecessor {
                    debug!("awaiting predecessor");

                    if let Err(error) = predecessor.lifecycle.join().await {
                        warn!(?error);
                    }
                }

                registrator.run(receiver, cancellation).await
            }
            .instrument(span)
        });

        Self {
            group: group.to_owned(),
            commands,
            state: watcher,
            lifecycle: Lifecycle {
                cancellation,
                handle: Arc::new(Mutex::new(Some(AbortOnDropHandle::new(handle)))),
                shutdown_timeout: context.config.shutdown_timeout,
            },
        }
    }

    pub fn downgrade(&self) -> WeakGroupRegistrator {
        WeakGroupRegistrator {
            group: self.group.clone(),
            commands: self.commands.downgrade(),
            state: self.state.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> MemberState {
        *self.state.borrow()
    }

    /// Add `topic` to the subscriptions of this member, following the
    /// partitions of it that are assigned to this member.
    pub async fn subscribe(&self, topic: &str) -> Result<watch::Receiver<BTreeSet<i32>>> {
        let (reply, assignment) = oneshot::channel();

        self.commands
            .send(Command::Subscribe {
                topic: topic.to_owned(),
                reply,
            })
            .await
            .map_err(|_| Error::Stopped)?;

        assignment.await.map_err(|_| Error::Stopped)
    }

    /// Note that `topic` is still being consumed.
    pub fn touch(&self, topic: &str) {
        if let Err(error) = self.commands.try_send(Command::Touch {
            topic: topic.to_owned(),
        }) {
            debug!(topic, ?error);
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let (reply, done) = oneshot::channel();

        self.commands
            .send(Command::Unsubscribe {
                topic: topic.to_owned(),
                reply,
            })
            .await
            .map_err(|_| Error::Stopped)?;

        done.await.map_err(|_| Error::Stopped)
    }

    /// Deregister from the group.
    pub async fn stop(&self) -> Result<()> {
        debug!(group = %self.group);
        self.lifecycle.stop().await
    }
}

#[derive(Debug)]
struct Registrator<B, R> {
    group: String,
    member: String,
    config: Config,
    broker: B,
    registry: R,
    subscriptions: BTreeMap<String, watch::Sender<BTreeSet<i32>>>,
    partitions: BTreeMap<String, Vec<i32>>,
    membership: Membership,
    registered: Option<Instant>,
    state: watch::Sender<MemberState>,
}

impl<B, R> Registrator<B, R>
where
    B: Broker,
    R: Registry,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let mut view = self.watch().await?;

        self.register().await;
        self.membership = view.borrow_and_update().clone();
        self.rebalance().await;

        let heartbeat = self.config.heartbeat_interval();
        let mut interval = time::interval_at(Instant::now() + heartbeat, heartbeat);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => break,

                command = commands.recv() => {
                    if let Some(command) = command {
                        self.command(command).await;
                    } else {
                        debug!("unreferenced");
                        break;
                    }
                }

                changed = view.changed() => {
                    if changed.is_err() {
                        warn!("membership closed");
                        view = self.watch().await?;
                    }

                    self.membership = view.borrow_and_update().clone();
                    debug!(membership = ?self.membership);

                    if !self.membership.contains(&self.member) {
                        debug!(member = %self.member, "missing from membership");
                        self.register().await;
                    }

                    self.rebalance().await;
                }

                _ = interval.tick() => {
                    self.register().await;
                    self.refresh(true).await;
                    self.rebalance().await;
                }
            }
        }

        self.deregister().await
    }

    async fn command(&mut self, command: Command) {
        debug!(?command);

        match command {
            Command::Subscribe { topic, reply } => {
                let assignment = if let Some(sender) = self.subscriptions.get(&topic) {
                    sender.subscribe()
                } else {
                    let (sender, assignment) = watch::channel(BTreeSet::new());
                    _ = self.subscriptions.insert(topic, sender);

                    self.register().await;
                    self.rebalance().await;

                    assignment
                };

                _ = reply.send(assignment);
            }

            Command::Touch { topic } => {
                if !self.subscriptions.contains_key(&topic) {
                    debug!(topic, "resubscribing");

                    _ = self
                        .subscriptions
                        .insert(topic, watch::channel(BTreeSet::new()).0);

                    self.register().await;
                    self.rebalance().await;
                }
            }

            Command::Unsubscribe { topic, reply } => {
                if self.subscriptions.remove(&topic).is_some() {
                    _ = self.partitions.remove(&topic);

                    self.register().await;
                    self.rebalance().await;
                }

                _ = reply.send(());
            }
        }
    }

    async fn watch(&self) -> Result<watch::Receiver<Membership>> {
        let registry = &self.registry;
        let group = self.group.as_str();

        retry(&self.config, "watch", move || registry.watch(group)).await
    }

    async fn register(&mut self) {
        let registry = &self.registry;
        let group = self.group.as_str();
        let member = self.member.as_str();
        let topics = &self.subscriptions.keys().cloned().collect::<BTreeSet<_>>();
        let ttl = self.config.registration_timeout;

        match retry(&self.config, "register", move || {
            registry.register(group, member, topics, ttl)
        })
        .await
        {
            Ok(()) => {
                self.registered = Some(Instant::now());
                self.transition(MemberState::Registered);
            }

            Err(error) => {
                warn!(?error, ?self.registered);

                if self
                    .registered
                    .is_none_or(|registered| registered.elapsed() >= ttl)
                {
                    self.transition(MemberState::Expired);
                }
            }
        }
    }

    async fn deregister(&mut self) -> Result<()> {
        self.transition(MemberState::Deregistering);

        let registry = &self.registry;
        let group = self.group.as_str();
        let member = self.member.as_str();

        // closes the assignment of every topic consumer still following one
        self.subscriptions.clear();

        retry(&self.config, "deregister", move || {
            registry.deregister(group, member)
        })
        .await
    }

    fn transition(&self, state: MemberState) {
        _ = self.state.send_if_modified(|current| {
            if *current != state {
                debug!(from = ?current, to = ?state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Fetch the partitions of subscribed topics, all of them when `all`
    /// otherwise only those not yet known.
    async fn refresh(&mut self, all: bool) {
        let broker = &self.broker;

        for topic in self.subscriptions.keys() {
            if !all && self.partitions.get(topic).is_some_and(|known| !known.is_empty()) {
                continue;
            }

            match retry(&self.config, "partitions", move || broker.partitions(topic)).await {
                Ok(partitions) => {
                    if partitions.is_empty() {
                        debug!(topic, "no partitions");
                    }

                    _ = self.partitions.insert(topic.to_owned(), partitions);
                }

                Err(error) => warn!(topic, ?error),
            }
        }

        let subscriptions = &self.subscriptions;
        self.partitions
            .retain(|topic, _| subscriptions.contains_key(topic));
    }

    async fn rebalance(&mut self) {
        self.refresh(false).await;

        let assignment = assignor::assign(&self.membership, &self.partitions);

        for (topic, sender) in &self.subscriptions {
            let owned = assignor::owned(&assignment, topic, &self.member);

            let changed = sender.send_if_modified(|current| {
                if *current != owned {
                    debug!(topic, ?current, ?owned);
                    *current = owned;
                    true
                } else {
                    false
                }
            });

            if changed {
                REBALANCES.add(
                    1,
                    &[
                        KeyValue::new("group", self.group.clone()),
                        KeyValue::new("topic", topic.clone()),
                    ],
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        NoopObserver,
        memory::{MemoryBroker, MemoryOffsetStore, MemoryRegistry},
        topic::Leases,
    };
    use pretty_assertions::assert_eq;

    fn context(
        member: &str,
        broker: &MemoryBroker,
        registry: &MemoryRegistry,
    ) -> Context<MemoryBroker, MemoryRegistry, MemoryOffsetStore> {
        Context {
            namespace: "test".into(),
            config: Config::default()
                .client_id(member)
                .registration_timeout(Duration::from_secs(3)),
            broker: broker.clone(),
            registry: registry.clone(),
            store: MemoryOffsetStore::default(),
            observer: Arc::new(NoopObserver),
            leases: Leases::default(),
        }
    }

    async fn settled(assignment: &mut watch::Receiver<BTreeSet<i32>>) -> BTreeSet<i32> {
        time::sleep(Duration::from_millis(100)).await;
        assignment.borrow_and_update().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn members_share_partitions() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 4)?;
        let registry = MemoryRegistry::default();

        let m1 = GroupRegistrator::spawn(&context("m1", &broker, &registry), "g1", None);
        let mut a1 = m1.subscribe("abc").await?;
        assert_eq!(BTreeSet::from([0, 1, 2, 3]), settled(&mut a1).await);
        assert_eq!(MemberState::Registered, m1.state());

        let m2 = GroupRegistrator::spawn(&context("m2", &broker, &registry), "g1", None);
        let mut a2 = m2.subscribe("abc").await?;

        assert_eq!(BTreeSet::from([0, 2]), settled(&mut a1).await);
        assert_eq!(BTreeSet::from([1, 3]), settled(&mut a2).await);

        m2.stop().await?;
        assert_eq!(BTreeSet::from([0, 1, 2, 3]), settled(&mut a1).await);
        assert!(a2.changed().await.is_err());

        m1.stop().await?;
        m1.stop().await?;
        assert!(registry.membership("g1")?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_registration_alive() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;
        let registry = MemoryRegistry::default();

        let m1 = GroupRegistrator::spawn(&context("m1", &broker, &registry), "g1", None);
        let _assignment = m1.subscribe("abc").await?;

        time::sleep(Duration::from_secs(30)).await;
        assert!(registry.membership("g1")?.contains("m1"));

        m1.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_releases_topic() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 2)?;
        let registry = MemoryRegistry::default();

        let m1 = GroupRegistrator::spawn(&context("m1", &broker, &registry), "g1", None);
        let m2 = GroupRegistrator::spawn(&context("m2", &broker, &registry), "g1", None);

        let mut a1 = m1.subscribe("abc").await?;
        let mut a2 = m2.subscribe("abc").await?;
        assert_eq!(BTreeSet::from([0]), settled(&mut a1).await);
        assert_eq!(BTreeSet::from([1]), settled(&mut a2).await);

        m1.unsubscribe("abc").await?;
        assert_eq!(BTreeSet::from([0, 1]), settled(&mut a2).await);
        assert!(a1.changed().await.is_err());

        m1.stop().await?;
        m2.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_topic_is_retried_on_heartbeat() -> Result<()> {
        let broker = MemoryBroker::default();
        let registry = MemoryRegistry::default();

        let m1 = GroupRegistrator::spawn(&context("m1", &broker, &registry), "g1", None);
        let mut assignment = m1.subscribe("abc").await?;
        assert!(settled(&mut assignment).await.is_empty());

        broker.create_topic("abc", 2)?;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(BTreeSet::from([0, 1]), settled(&mut assignment).await);

        m1.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn deregisters_once_unreferenced() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;
        let registry = MemoryRegistry::default();

        let m1 = GroupRegistrator::spawn(&context("m1", &broker, &registry), "g1", None);
        let mut assignment = m1.subscribe("abc").await?;
        assert_eq!(BTreeSet::from([0]), settled(&mut assignment).await);

        let weak = m1.downgrade();
        assert!(weak.upgrade().is_some());

        drop(m1);
        assert!(assignment.changed().await.is_err());

        time::sleep(Duration::from_millis(100)).await;
        assert!(weak.upgrade().is_none());
        assert!(weak.is_finished()?);
        assert!(registry.membership("g1")?.is_empty());

        weak.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn successor_registers_after_predecessor_deregisters() -> Result<()> {
        let broker = MemoryBroker::default();
        broker.create_topic("abc", 1)?;
        let registry = MemoryRegistry::default();
        let context = context("m1", &broker, &registry);

        let predecessor = GroupRegistrator::spawn(&context, "g1", None);
        let _assignment = predecessor.subscribe("abc").await?;
        let weak = predecessor.downgrade();
        drop(predecessor);

        let successor = GroupRegistrator::spawn(&context, "g1", Some(weak));
        let mut assignment = successor.subscribe("abc").await?;
        assert_eq!(BTreeSet::from([0]), settled(&mut assignment).await);

        assert!(registry.membership("g1")?.contains("m1"));
        assert_eq!(MemberState::Registered, successor.state());

        successor.stop().await
    }
}
