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

use std::fmt::Debug;

use async_trait::async_trait;

use crate::{Result, Topition};

/// Offset Store
///
/// Durable committed offsets of consumer groups. A committed offset is the
/// offset of the next message the group will consume.
#[async_trait]
pub trait OffsetStore: Clone + Debug + Send + Sync + 'static {
    async fn commit_offset(
        &self,
        group: &str,
        topition: &Topition,
        offset: i64,
        metadata: Option<&str>,
    ) -> Result<()>;

    /// The committed offset, if the group has ever committed one.
    async fn fetch_offset(&self, group: &str, topition: &Topition) -> Result<Option<i64>>;
}
