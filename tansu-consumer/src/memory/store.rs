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
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::{Error, OffsetStore, Result, Topition};

use super::take_fault;

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Committed {
    offset: i64,
    metadata: Option<String>,
}

/// Committed offsets held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Arc<Mutex<BTreeMap<(String, Topition), Committed>>>,
    faults: Arc<AtomicU32>,
}

impl MemoryOffsetStore {
    /// The next `faults` commits fail with a transient error.
    pub fn fail_commits(&self, faults: u32) {
        self.faults.store(faults, Ordering::SeqCst);
    }

    pub fn committed(&self, group: &str, topition: &Topition) -> Result<Option<i64>> {
        self.offsets.lock().map_err(Into::into).map(|offsets| {
            offsets
                .get(&(group.to_owned(), topition.to_owned()))
                .map(|committed| committed.offset)
        })
    }

    pub fn metadata(&self, group: &str, topition: &Topition) -> Result<Option<String>> {
        self.offsets.lock().map_err(Into::into).map(|offsets| {
            offsets
                .get(&(group.to_owned(), topition.to_owned()))
                .and_then(|committed| committed.metadata.clone())
        })
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    #[instrument(skip(self))]
    async fn commit_offset(
        &self,
        group: &str,
        topition: &Topition,
        offset: i64,
        metadata: Option<&str>,
    ) -> Result<()> {
        if take_fault(&self.faults) {
            debug!("injected fault");
            return Err(Error::Transient(format!("commit: {group}: {topition}")));
        }

        self.offsets.lock().map_err(Into::into).map(|mut offsets| {
            _ = offsets.insert(
                (group.to_owned(), topition.to_owned()),
                Committed {
                    offset,
                    metadata: metadata.map(ToOwned::to_owned),
                },
            );
        })
    }

    async fn fetch_offset(&self, group: &str, topition: &Topition) -> Result<Option<i64>> {
        self.committed(group, topition)
    }
}
