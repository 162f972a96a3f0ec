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
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::watch,
    time::{Instant, sleep},
};
use tracing::{debug, instrument};

use crate::{Error, Membership, Registry, Result, Topition};

#[derive(Clone, Debug)]
struct Record {
    topics: BTreeSet<String>,
    expires: Instant,
}

#[derive(Debug)]
struct Group {
    members: BTreeMap<String, Record>,
    claims: BTreeMap<Topition, String>,
    membership: watch::Sender<Membership>,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
            claims: BTreeMap::new(),
            membership: watch::channel(Membership::default()).0,
        }
    }
}

impl Group {
    /// Drop expired records and notify watchers when the live view changed.
    fn publish(&mut self, now: Instant) {
        self.members.retain(|member, record| {
            let live = record.expires > now;

            if !live {
                debug!(member, "expired");
            }

            live
        });

        let latest = self
            .members
            .iter()
            .map(|(member, record)| (member.clone(), record.topics.clone()))
            .collect::<Membership>();

        _ = self.membership.send_if_modified(|current| {
            if *current != latest {
                *current = latest;
                true
            } else {
                false
            }
        });
    }
}

/// Registration records with a time to live, held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    groups: Arc<Mutex<BTreeMap<String, Group>>>,
}

impl MemoryRegistry {
    fn sweep(&self, group: &str) -> Result<()> {
        self.groups.lock().map_err(Into::into).map(|mut groups| {
            if let Some(group) = groups.get_mut(group) {
                group.publish(Instant::now())
            }
        })
    }

    /// The live membership of a group.
    pub fn membership(&self, group: &str) -> Result<Membership> {
        let now = Instant::now();

        self.groups.lock().map_err(Into::into).map(|mut groups| {
            let group = groups.entry(group.to_owned()).or_default();
            group.publish(now);
            group.membership.borrow().clone()
        })
    }

    /// The member holding a live claim on a partition.
    pub fn claimant(&self, group: &str, topition: &Topition) -> Result<Option<String>> {
        let now = Instant::now();

        self.groups.lock().map_err(Into::into).map(|mut groups| {
            groups.get_mut(group).and_then(|group| {
                group.publish(now);

                group
                    .claims
                    .get(topition)
                    .filter(|member| group.members.contains_key(member.as_str()))
                    .cloned()
            })
        })
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    #[instrument(skip(self, topics))]
    async fn register(
        &self,
        group: &str,
        member: &str,
        topics: &BTreeSet<String>,
        ttl: Duration,
    ) -> Result<()> {
        let now = Instant::now();

        self.groups.lock().map_err(Error::from).map(|mut groups| {
            let entry = groups.entry(group.to_owned()).or_default();

            _ = entry.members.insert(
                member.to_owned(),
                Record {
                    topics: topics.clone(),
                    expires: now + ttl,
                },
            );

            entry.publish(now);
        })?;

        _ = tokio::spawn({
            let registry = self.clone();
            let group = group.to_owned();

            async move {
                sleep(ttl).await;
                registry.sweep(&group)
            }
        });

        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister(&self, group: &str, member: &str) -> Result<()> {
        let now = Instant::now();

        self.groups.lock().map_err(Into::into).map(|mut groups| {
            if let Some(group) = groups.get_mut(group) {
                _ = group.members.remove(member);
                group.claims.retain(|_, claimant| claimant.as_str() != member);
                group.publish(now);
            }
        })
    }

    async fn watch(&self, group: &str) -> Result<watch::Receiver<Membership>> {
        let now = Instant::now();

        self.groups.lock().map_err(Into::into).map(|mut groups| {
            let group = groups.entry(group.to_owned()).or_default();
            group.publish(now);
            group.membership.subscribe()
        })
    }

    #[instrument(skip(self))]
    async fn claim(&self, group: &str, topition: &Topition, member: &str) -> Result<bool> {
        let now = Instant::now();

        self.groups.lock().map_err(Into::into).map(|mut groups| {
            let group = groups.entry(group.to_owned()).or_default();
            group.publish(now);

            let held_elsewhere = group.claims.get(topition).is_some_and(|claimant| {
                claimant != member && group.members.contains_key(claimant.as_str())
            });

            if held_elsewhere {
                debug!(claimant = ?group.claims.get(topition));
                false
            } else {
                _ = group.claims.insert(topition.to_owned(), member.to_owned());
                true
            }
        })
    }

    #[instrument(skip(self))]
    async fn release(&self, group: &str, topition: &Topition, member: &str) -> Result<()> {
        self.groups.lock().map_err(Into::into).map(|mut groups| {
            if let Some(group) = groups.get_mut(group) {
                if group
                    .claims
                    .get(topition)
                    .is_some_and(|claimant| claimant == member)
                {
                    _ = group.claims.remove(topition);
                }
            }
        })
    }
}
