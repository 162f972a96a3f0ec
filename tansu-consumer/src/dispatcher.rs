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
    collections::{BTreeMap, BTreeSet},
    marker::PhantomData,
    mem,
    sync::{Arc, LazyLock, Mutex},
};

use futures::future::join_all;
use opentelemetry::{KeyValue, metrics::Counter};
use tracing::{debug, instrument, warn};

use crate::{
    Broker, Config, Context, Error, FetchObserver, METER, Message, NoopObserver, OffsetStore,
    Registry, Result,
    group::{GroupRegistrator, WeakGroupRegistrator},
    topic::{Leases, TopicConsumer},
};

static CONSUME_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_requests")
        .with_description("consume requests")
        .build()
});

static BUFFER_OVERFLOWS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_buffer_overflows")
        .with_description("consume requests refused with a full request buffer")
        .build()
});

#[derive(Debug, Default)]
struct State {
    // a registrator lives while a topic consumer of its group does
    groups: BTreeMap<String, WeakGroupRegistrator>,
    topics: BTreeMap<(String, String), TopicConsumer>,
    stopped: bool,
}

impl State {
    /// Forget topic consumers and registrators that have finished.
    fn prune(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        self.topics.retain(|_, consumer| {
            consumer
                .is_finished()
                .map(|finished| !finished)
                .unwrap_or_else(|error| {
                    outcome = Err(error);
                    true
                })
        });

        self.groups.retain(|_, registrator| {
            registrator
                .is_finished()
                .map(|finished| !finished)
                .unwrap_or_else(|error| {
                    outcome = Err(error);
                    true
                })
        });

        outcome
    }
}

/// Routes consume requests to a topic consumer for each group and topic,
/// creating them on first use.
#[derive(Clone, Debug)]
pub struct Dispatcher<B, R, O> {
    context: Context<B, R, O>,
    state: Arc<Mutex<State>>,
}

impl Dispatcher<(), (), ()> {
    pub fn builder() -> PhantomBuilder {
        Builder::default()
    }
}

impl<B, R, O> Dispatcher<B, R, O>
where
    B: Broker,
    R: Registry,
    O: OffsetStore,
{
    pub fn spawn(
        namespace: impl Into<String>,
        config: Config,
        broker: B,
        registry: R,
        store: O,
    ) -> Result<Self> {
        Dispatcher::builder()
            .namespace(namespace)
            .config(config)
            .broker(broker)
            .registry(registry)
            .store(store)
            .build()
    }

    pub fn namespace(&self) -> &str {
        &self.context.namespace
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// The next message of `topic` for `group`, waiting at most the long
    /// polling timeout for one.
    #[instrument(skip(self))]
    pub async fn consume(&self, group: &str, topic: &str) -> Result<Message> {
        let attributes = [
            KeyValue::new("group", group.to_owned()),
            KeyValue::new("topic", topic.to_owned()),
        ];

        CONSUME_REQUESTS.add(1, &attributes);

        let timeout = self.context.config.long_polling_timeout;

        let outcome = match self.topic_consumer(group, topic)?.next_message(timeout).await {
            Err(Error::SubscriptionExpired { .. }) => {
                debug!("subscription expired");
                self.topic_consumer(group, topic)?
                    .next_message(timeout)
                    .await
            }

            otherwise => otherwise,
        };

        match outcome {
            Err(Error::SubscriptionExpired { group, topic }) => {
                Err(Error::RequestTimeout { group, topic })
            }

            Err(error @ Error::BufferOverflow { .. }) => {
                BUFFER_OVERFLOWS.add(1, &attributes);
                Err(error)
            }

            otherwise => otherwise,
        }
    }

    fn topic_consumer(&self, group: &str, topic: &str) -> Result<TopicConsumer> {
        self.state.lock().map_err(Error::from).and_then(|mut state| {
            if state.stopped {
                return Err(Error::Stopped);
            }

            let key = (group.to_owned(), topic.to_owned());

            if let Some(existing) = state
                .topics
                .get(&key)
                .filter(|existing| !existing.is_expired())
            {
                return Ok(existing.clone());
            }

            let predecessor = state.topics.remove(&key);
            state.prune()?;

            let registrator = if let Some(registrator) = state
                .groups
                .get(group)
                .and_then(WeakGroupRegistrator::upgrade)
            {
                registrator
            } else {
                let predecessor = state.groups.remove(group);
                debug!(group, predecessor = predecessor.is_some(), "registering");

                let registrator = GroupRegistrator::spawn(&self.context, group, predecessor);
                _ = state
                    .groups
                    .insert(group.to_owned(), registrator.downgrade());
                registrator
            };

            debug!(group, topic, predecessor = predecessor.is_some());

            let consumer =
                TopicConsumer::spawn(&self.context, group, topic, registrator, predecessor);
            _ = state.topics.insert(key, consumer.clone());

            Ok(consumer)
        })
    }

    /// Groups in which this dispatcher is registered, or deregistering.
    pub fn active_groups(&self) -> Result<BTreeSet<String>> {
        self.state.lock().map_err(Error::from).and_then(|state| {
            let mut active = BTreeSet::new();

            for (group, registrator) in &state.groups {
                if !registrator.is_finished()? {
                    _ = active.insert(group.clone());
                }
            }

            Ok(active)
        })
    }

    /// Stop every topic consumer and then deregister from every group.
    pub async fn stop(&self) -> Result<()> {
        let (topics, groups) = self.state.lock().map(|mut state| {
            state.stopped = true;
            (mem::take(&mut state.topics), mem::take(&mut state.groups))
        })?;

        debug!(topics = topics.len(), groups = groups.len());

        for outcome in join_all(topics.values().map(TopicConsumer::stop)).await {
            if let Err(error) = outcome {
                warn!(?error);
            }
        }

        for outcome in join_all(groups.values().map(WeakGroupRegistrator::stop)).await {
            if let Err(error) = outcome {
                warn!(?error);
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Builder<N, C, B, R, O> {
    namespace: N,
    config: C,
    broker: B,
    registry: R,
    store: O,
    observer: Option<Arc<dyn FetchObserver>>,
}

type PhantomBuilder = Builder<
    PhantomData<String>,
    PhantomData<Config>,
    PhantomData<()>,
    PhantomData<()>,
    PhantomData<()>,
>;

impl<N, C, B, R, O> Builder<N, C, B, R, O> {
    pub fn namespace(self, namespace: impl Into<String>) -> Builder<String, C, B, R, O> {
        Builder {
            namespace: namespace.into(),
            config: self.config,
            broker: self.broker,
            registry: self.registry,
            store: self.store,
            observer: self.observer,
        }
    }

    pub fn config(self, config: Config) -> Builder<N, Config, B, R, O> {
        Builder {
            namespace: self.namespace,
            config,
            broker: self.broker,
            registry: self.registry,
            store: self.store,
            observer: self.observer,
        }
    }

    pub fn broker<T: Broker>(self, broker: T) -> Builder<N, C, T, R, O> {
        Builder {
            namespace: self.namespace,
            config: self.config,
            broker,
            registry: self.registry,
            store: self.store,
            observer: self.observer,
        }
    }

    pub fn registry<T: Registry>(self, registry: T) -> Builder<N, C, B, T, O> {
        Builder {
            namespace: self.namespace,
            config: self.config,
            broker: self.broker,
            registry,
            store: self.store,
            observer: self.observer,
        }
    }

    pub fn store<T: OffsetStore>(self, store: T) -> Builder<N, C, B, R, T> {
        Builder {
            namespace: self.namespace,
            config: self.config,
            broker: self.broker,
            registry: self.registry,
            store,
            observer: self.observer,
        }
    }

    /// Notified with the first offset fetched by each partition consumer.
    pub fn observer(self, observer: Arc<dyn FetchObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..self
        }
    }
}

impl<B, R, O> Builder<String, Config, B, R, O>
where
    B: Broker,
    R: Registry,
    O: OffsetStore,
{
    pub fn build(self) -> Result<Dispatcher<B, R, O>> {
        self.config.validate()?;
        debug!(namespace = %self.namespace, config = ?self.config);

        Ok(Dispatcher {
            context: Context {
                namespace: self.namespace,
                config: self.config,
                broker: self.broker,
                registry: self.registry,
                store: self.store,
                observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
                leases: Leases::default(),
            },
            state: Arc::new(Mutex::new(State::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{MemoryBroker, MemoryOffsetStore, MemoryRegistry};

    #[test]
    fn invalid_config_is_refused_at_spawn() {
        assert!(matches!(
            Dispatcher::spawn(
                "test",
                Config::default().long_polling_timeout(Duration::ZERO),
                MemoryBroker::default(),
                MemoryRegistry::default(),
                MemoryOffsetStore::default(),
            ),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped() -> Result<()> {
        let dispatcher = Dispatcher::spawn(
            "test",
            Config::default(),
            MemoryBroker::default(),
            MemoryRegistry::default(),
            MemoryOffsetStore::default(),
        )?;

        dispatcher.stop().await?;
        dispatcher.stop().await?;

        assert!(matches!(
            dispatcher.consume("g1", "abc").await,
            Err(Error::Stopped)
        ));

        Ok(())
    }
}
