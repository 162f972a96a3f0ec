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

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use tansu_consumer::{
    Config, Dispatcher, Error, FetchObserver, Message, Result, Topition,
    memory::{MemoryBroker, MemoryOffsetStore, MemoryRegistry},
};
use tokio::sync::mpsc;
use tracing::{debug, subscriber::DefaultGuard};
use tracing_subscriber::EnvFilter;

pub(crate) type MemoryDispatcher = Dispatcher<MemoryBroker, MemoryRegistry, MemoryOffsetStore>;

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_target(true)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    format!("{}=debug", env!("CARGO_PKG_NAME").replace("-", "_"))
                        .parse()
                        .map_err(|error| Error::Message(format!("{error}")))?,
                ),
            )
            .with_test_writer()
            .finish(),
    ))
}

/// Notified with the first offset fetched by each partition consumer.
#[derive(Debug)]
pub(crate) struct ChannelObserver(mpsc::UnboundedSender<(String, Topition, i64)>);

impl ChannelObserver {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Topition, i64)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self(sender)), receiver)
    }
}

impl FetchObserver for ChannelObserver {
    fn first_fetched(&self, group: &str, topition: &Topition, offset: i64) {
        _ = self.0.send((group.to_owned(), topition.clone(), offset));
    }
}

/// The collaborators shared by every member of a test.
#[derive(Clone, Debug, Default)]
pub(crate) struct Cluster {
    pub(crate) broker: MemoryBroker,
    pub(crate) registry: MemoryRegistry,
    pub(crate) store: MemoryOffsetStore,
}

impl Cluster {
    pub(crate) fn new(topics: &[(&str, i32)]) -> Result<Self> {
        let cluster = Self::default();

        for (topic, partitions) in topics {
            cluster.broker.create_topic(topic, *partitions)?;
        }

        Ok(cluster)
    }

    pub(crate) fn member(&self, client_id: &str) -> Result<MemoryDispatcher> {
        self.member_with(Config::default().client_id(client_id))
    }

    pub(crate) fn member_with(&self, config: Config) -> Result<MemoryDispatcher> {
        Dispatcher::spawn(
            "test",
            config,
            self.broker.clone(),
            self.registry.clone(),
            self.store.clone(),
        )
    }

    pub(crate) fn observed_member(
        &self,
        config: Config,
        observer: Arc<dyn FetchObserver>,
    ) -> Result<MemoryDispatcher> {
        Dispatcher::builder()
            .namespace("test")
            .config(config)
            .broker(self.broker.clone())
            .registry(self.registry.clone())
            .store(self.store.clone())
            .observer(observer)
            .build()
    }

    /// Produce `n` messages to a partition, each valued with its topic,
    /// partition and offset.
    pub(crate) fn produce(&self, topic: &str, partition: i32, n: usize) -> Result<Vec<i64>> {
        let mut offsets = Vec::with_capacity(n);

        for i in 0..n {
            let offset = self.broker.produce(
                topic,
                partition,
                Some(Bytes::from(format!("{i}"))),
                Some(Bytes::from(format!("{topic}-{partition}-{i}"))),
            )?;

            offsets.push(offset);
        }

        Ok(offsets)
    }
}

/// A consume that is expected to find nothing, leaving the member
/// subscribed with every owned partition fetching from its head.
pub(crate) async fn warm_up(dispatcher: &MemoryDispatcher, group: &str, topic: &str) -> Result<()> {
    match dispatcher.consume(group, topic).await {
        Err(Error::RequestTimeout { .. }) => Ok(()),

        Ok(message) => Err(Error::Message(format!("unexpected: {message:?}"))),

        Err(error) => Err(error),
    }
}

/// Consume until `n` messages have arrived or `patience` consecutive
/// requests have timed out.
pub(crate) async fn consume(
    dispatcher: &MemoryDispatcher,
    group: &str,
    topic: &str,
    n: usize,
    patience: usize,
) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(n);
    let mut timeouts = 0;

    while messages.len() < n && timeouts < patience {
        match dispatcher.consume(group, topic).await {
            Ok(message) => {
                timeouts = 0;
                messages.push(message);
            }

            Err(Error::RequestTimeout { .. }) => {
                debug!(group, topic, received = messages.len());
                timeouts += 1;
            }

            Err(error) => return Err(error),
        }
    }

    Ok(messages)
}

/// Members take turns to consume until `n` messages have arrived between
/// them or `patience` consecutive rounds have timed out for every member.
pub(crate) async fn consume_round_robin(
    members: &[&MemoryDispatcher],
    group: &str,
    topic: &str,
    n: usize,
    patience: usize,
) -> Result<Vec<Vec<Message>>> {
    let mut received = vec![Vec::new(); members.len()];
    let mut idle = 0;

    while received.iter().map(Vec::len).sum::<usize>() < n && idle < patience {
        let mut progress = false;

        for (member, messages) in members.iter().zip(received.iter_mut()) {
            match member.consume(group, topic).await {
                Ok(message) => {
                    progress = true;
                    messages.push(message);
                }

                Err(Error::RequestTimeout { .. }) => (),

                Err(error) => return Err(error),
            }
        }

        idle = if progress { 0 } else { idle + 1 };
    }

    Ok(received)
}

pub(crate) fn topitions(messages: &[Message]) -> Vec<(Topition, i64)> {
    messages
        .iter()
        .map(|message| (message.topition(), message.offset))
        .collect()
}

pub(crate) async fn first_fetched(
    receiver: &mut mpsc::UnboundedReceiver<(String, Topition, i64)>,
) -> Result<(String, Topition, i64)> {
    receiver
        .recv()
        .await
        .ok_or_else(|| Error::Message("observer closed".into()))
}
