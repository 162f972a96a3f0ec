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
//
//! Tansu Consumer
//!
//! A consumer group dispatch and rebalancing engine for a proxy sitting in
//! front of a partitioned, offset addressed log. Clients make a blocking
//! [`Dispatcher::consume`] call for a group and topic, while the engine takes
//! care of group membership, partition assignment, fetching and committing
//! offsets.
//!
//! The engine is a tree of actors:
//!
//! - [`Dispatcher`] routes consume calls to a topic consumer per group and topic.
//! - [`topic::TopicConsumer`] fans in messages from the partitions it owns.
//! - [`group::GroupRegistrator`] registers this member, watches the group and
//!   computes which partitions this member owns.
//! - [`partition::PartitionConsumer`] runs a long poll fetch loop for one partition.
//! - [`offset::OffsetManager`] commits delivered offsets for one partition.
//!
//! The broker, the coordination store and the offset store are collaborators
//! behind the [`Broker`], [`Registry`] and [`OffsetStore`] traits, with
//! in-memory implementations in [`memory`]:
//!
//! ```
//! # use tansu_consumer::{Config, Dispatcher, Error, memory::{MemoryBroker, MemoryOffsetStore, MemoryRegistry}};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let broker = MemoryBroker::default();
//! broker.create_topic("abc", 3)?;
//!
//! let dispatcher = Dispatcher::builder()
//!     .namespace("proxy")
//!     .config(Config::default().client_id("consumer-1"))
//!     .broker(broker)
//!     .registry(MemoryRegistry::default())
//!     .store(MemoryOffsetStore::default())
//!     .build()?;
//!
//! dispatcher.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    future::Future,
    result,
    sync::{Arc, LazyLock, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinError,
    time::{sleep, timeout},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, warn};

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod group;
pub mod memory;
pub mod offset;
pub mod partition;
pub mod registry;
pub mod store;
pub mod topic;

pub use broker::Broker;
pub use config::{Config, OffsetReset};
pub use dispatcher::Dispatcher;
pub use partition::{FetchObserver, NoopObserver};
pub use registry::{Membership, Registry};
pub use store::OffsetStore;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

/// Consumer Errors
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    BufferOverflow {
        group: String,
        topic: String,
    },
    InvalidConfig(String),
    Join(Arc<JoinError>),
    Message(String),
    OffsetOutOfRange {
        topition: Topition,
        offset: i64,
    },
    Poison,
    RequestTimeout {
        group: String,
        topic: String,
    },
    ShutdownTimeout(String),
    Stopped,
    SubscriptionExpired {
        group: String,
        topic: String,
    },
    Transient(String),
    UnknownTopicOrPartition(Topition),
}

impl Error {
    /// Errors that are worth trying again after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            error => write!(f, "{error:?}"),
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Self::Join(Arc::new(value))
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Topic Partition (topition)
///
/// A topic partition pair.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Topition {
    topic: String,
    partition: i32,
}

impl Topition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        Self { topic, partition }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for Topition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A message fetched from a partition and handed to a consumer.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Message {
    pub fn new(topition: &Topition, offset: i64) -> Self {
        Self {
            topic: topition.topic.clone(),
            partition: topition.partition,
            offset,
            ..Default::default()
        }
    }

    pub fn key(self, key: Option<Bytes>) -> Self {
        Self { key, ..self }
    }

    pub fn value(self, value: Option<Bytes>) -> Self {
        Self { value, ..self }
    }

    pub fn topition(&self) -> Topition {
        Topition::new(self.topic.as_str(), self.partition)
    }
}

/// Shared by every actor spawned on behalf of one [`Dispatcher`].
#[derive(Clone, Debug)]
pub(crate) struct Context<B, R, O> {
    pub(crate) namespace: String,
    pub(crate) config: Config,
    pub(crate) broker: B,
    pub(crate) registry: R,
    pub(crate) store: O,
    pub(crate) observer: Arc<dyn FetchObserver>,
    pub(crate) leases: topic::Leases,
}

impl<B, R, O> Context<B, R, O> {
    pub(crate) fn member(&self) -> &str {
        self.config.client_id.as_str()
    }
}

/// Retry `f` while it fails with a retryable error, pausing between attempts
/// and giving up after [`Config::max_retries`].
pub(crate) async fn retry<T, F, Fut>(config: &Config, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),

            Err(error) if error.is_retryable() && attempt < config.max_retries => {
                let delay = config.backoff(attempt);
                warn!(what, ?error, attempt, ?delay);

                sleep(delay).await;
                attempt += 1;
            }

            Err(error) => return Err(error),
        }
    }
}

/// Wait for an actor to reach a terminal state, aborting it when it does not
/// within `patience`.
///
/// Actors are held by an [`AbortOnDropHandle`], so abandoning an actor also
/// abandons every actor it was waiting on. Returns once the abandoned actor
/// can no longer run.
pub(crate) async fn join_within<T>(
    mut handle: AbortOnDropHandle<Result<T>>,
    patience: Duration,
    actor: &str,
) -> Result<T> {
    match timeout(patience, &mut handle).await {
        Ok(joined) => joined.map_err(Into::into).and_then(|outcome| outcome),

        Err(elapsed) => {
            error!(actor, ?elapsed, "abandoned");
            handle.abort();

            if let Err(error) = handle.await {
                debug!(actor, ?error);
            }

            Err(Error::ShutdownTimeout(actor.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn abandoned_actor_is_aborted() {
        let (sender, receiver) = oneshot::channel::<()>();

        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            let _sender = sender;
            pending::<Result<()>>().await
        }));

        assert!(matches!(
            join_within(handle, Duration::from_secs(1), "stuck").await,
            Err(Error::ShutdownTimeout(actor)) if actor == "stuck"
        ));

        assert!(receiver.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoning_a_parent_aborts_its_children() {
        let (sender, receiver) = oneshot::channel::<()>();

        let child = AbortOnDropHandle::new(tokio::spawn(async move {
            let _sender = sender;
            pending::<Result<()>>().await
        }));

        let parent = AbortOnDropHandle::new(tokio::spawn(join_within(
            child,
            Duration::from_secs(3_600),
            "child",
        )));

        assert!(matches!(
            join_within(parent, Duration::from_secs(1), "parent").await,
            Err(Error::ShutdownTimeout(actor)) if actor == "parent"
        ));

        assert!(receiver.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn joined_within_patience() {
        let handle = AbortOnDropHandle::new(tokio::spawn(async {
            sleep(Duration::from_millis(500)).await;
            Ok(6)
        }));

        assert!(matches!(
            join_within(handle, Duration::from_secs(1), "quick").await,
            Ok(6)
        ));
    }
}
