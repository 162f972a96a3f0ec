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

use std::collections::{BTreeMap, BTreeSet};

use crate::{Membership, Topition};

/// Assign the partitions of each topic round robin over the members
/// subscribed to it, both in ascending order.
///
/// Every member computing this from the same membership and partitions
/// arrives at the same assignment. When partitions do not divide evenly the
/// members with the lowest ids receive one more.
pub fn assign(
    membership: &Membership,
    partitions: &BTreeMap<String, Vec<i32>>,
) -> BTreeMap<Topition, String> {
    partitions
        .iter()
        .flat_map(|(topic, partitions)| {
            let subscribers = membership.subscribers(topic);

            let mut partitions = partitions.clone();
            partitions.sort_unstable();
            partitions.dedup();

            partitions
                .into_iter()
                .enumerate()
                .filter_map(move |(i, partition)| {
                    subscribers.get(i % subscribers.len().max(1)).map(|member| {
                        (
                            Topition::new(topic.as_str(), partition),
                            (*member).to_owned(),
                        )
                    })
                })
        })
        .collect()
}

/// The partitions of `topic` assigned to `member`.
pub fn owned(assignment: &BTreeMap<Topition, String>, topic: &str, member: &str) -> BTreeSet<i32> {
    assignment
        .iter()
        .filter(|(topition, owner)| topition.topic() == topic && owner.as_str() == member)
        .map(|(topition, _)| topition.partition())
        .collect()
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reconciliation {
    pub start: BTreeSet<i32>,
    pub stop: BTreeSet<i32>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty()
    }
}

/// The partitions to start and stop for `running` to become `desired`.
pub fn reconcile(desired: &BTreeSet<i32>, running: &BTreeSet<i32>) -> Reconciliation {
    Reconciliation {
        start: desired.difference(running).copied().collect(),
        stop: running.difference(desired).copied().collect(),
    }
}
