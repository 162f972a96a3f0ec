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
    fmt::Debug,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{Result, Topition};

/// The live members of a group with the topics each is subscribed to.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Membership(BTreeMap<String, BTreeSet<String>>);

impl Membership {
    pub fn new(members: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self(members)
    }

    /// Members subscribed to `topic` in member id order.
    pub fn subscribers(&self, topic: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(member, _)| member.as_str())
            .collect()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.0.contains_key(member)
    }

    pub fn topics(&self, member: &str) -> Option<&BTreeSet<String>> {
        self.0.get(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, BTreeSet<String>)> for Membership {
    fn from_iter<T: IntoIterator<Item = (String, BTreeSet<String>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Registry
///
/// A coordination store holding group registration records and partition
/// claims.
#[async_trait]
pub trait Registry: Clone + Debug + Send + Sync + 'static {
    /// Create or refresh the record of `member` in `group`, expiring after `ttl`.
    async fn register(
        &self,
        group: &str,
        member: &str,
        topics: &BTreeSet<String>,
        ttl: Duration,
    ) -> Result<()>;

    /// Remove the record of `member` and any claims it holds.
    async fn deregister(&self, group: &str, member: &str) -> Result<()>;

    /// Follow the live membership of `group`.
    async fn watch(&self, group: &str) -> Result<watch::Receiver<Membership>>;

    /// Claim exclusive consumption of a partition, returning false while
    /// another live member holds it.
    async fn claim(&self, group: &str, topition: &Topition, member: &str) -> Result<bool>;

    /// Release a claim held by `member`.
    async fn release(&self, group: &str, topition: &Topition, member: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribers_in_member_order() {
        let membership = Membership::from_iter([
            ("m3".to_owned(), BTreeSet::from(["abc".to_owned()])),
            ("m1".to_owned(), BTreeSet::from(["abc".to_owned(), "pqr".to_owned()])),
            ("m2".to_owned(), BTreeSet::from(["pqr".to_owned()])),
        ]);

        assert_eq!(vec!["m1", "m3"], membership.subscribers("abc"));
        assert_eq!(vec!["m1", "m2"], membership.subscribers("pqr"));
        assert!(membership.subscribers("xyz").is_empty());
        assert!(membership.contains("m2"));
        assert!(!membership.contains("m4"));
    }
}
