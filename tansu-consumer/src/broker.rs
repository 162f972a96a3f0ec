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

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

use crate::{Message, Result, Topition};

/// Broker
///
/// The read side of a partitioned log that partition consumers fetch from.
#[async_trait]
pub trait Broker: Clone + Debug + Send + Sync + 'static {
    /// Long poll fetch of messages at or after `offset`, returning an empty
    /// batch when nothing arrives within `max_wait`.
    ///
    /// Fails with [`crate::Error::OffsetOutOfRange`] when `offset` is no
    /// longer (or not yet) held by the partition.
    async fn fetch(
        &self,
        topition: &Topition,
        offset: i64,
        max_wait: Duration,
    ) -> Result<Vec<Message>>;

    /// The offset of the oldest message still held by the partition.
    async fn oldest_offset(&self, topition: &Topition) -> Result<i64>;

    /// The offset that the next produced message will be given.
    async fn newest_offset(&self, topition: &Topition) -> Result<i64>;

    /// The partitions of a topic, empty when the topic is unknown.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;
}
