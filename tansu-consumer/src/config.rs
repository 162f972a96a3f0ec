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

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Where to resume when a stored offset is no longer held by the log.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Oldest,
    Newest,
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" | "earliest" => Ok(Self::Oldest),
            "newest" | "latest" => Ok(Self::Newest),
            otherwise => Err(Error::InvalidConfig(format!("offset reset: {otherwise}"))),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(default)]
pub struct Config {
    /// member id of this process within every group it joins
    pub client_id: String,

    /// how long a consume call waits for a message
    pub long_polling_timeout: Duration,

    /// a registration or subscription not refreshed within this is expired
    pub registration_timeout: Duration,

    /// queued consume requests per group and topic, also the per partition
    /// message queue depth
    pub channel_buffer_size: usize,

    pub offset_reset: OffsetReset,
    pub commit_interval: Duration,
    pub fetch_max_wait: Duration,
    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            long_polling_timeout: Duration::from_secs(3),
            registration_timeout: Duration::from_secs(20),
            channel_buffer_size: 256,
            offset_reset: OffsetReset::default(),
            commit_interval: Duration::from_millis(500),
            fetch_max_wait: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(100),
            max_retries: 5,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    const MAX_BACKOFF_SHIFT: u32 = 6;

    pub fn client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..self
        }
    }

    pub fn long_polling_timeout(self, long_polling_timeout: Duration) -> Self {
        Self {
            long_polling_timeout,
            ..self
        }
    }

    pub fn registration_timeout(self, registration_timeout: Duration) -> Self {
        Self {
            registration_timeout,
            ..self
        }
    }

    pub fn channel_buffer_size(self, channel_buffer_size: usize) -> Self {
        Self {
            channel_buffer_size,
            ..self
        }
    }

    pub fn offset_reset(self, offset_reset: OffsetReset) -> Self {
        Self {
            offset_reset,
            ..self
        }
    }

    pub fn commit_interval(self, commit_interval: Duration) -> Self {
        Self {
            commit_interval,
            ..self
        }
    }

    pub fn fetch_max_wait(self, fetch_max_wait: Duration) -> Self {
        Self {
            fetch_max_wait,
            ..self
        }
    }

    pub fn retry_backoff(self, retry_backoff: Duration) -> Self {
        Self {
            retry_backoff,
            ..self
        }
    }

    pub fn max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn shutdown_timeout(self, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("long_polling_timeout", self.long_polling_timeout),
            ("registration_timeout", self.registration_timeout),
            ("commit_interval", self.commit_interval),
            ("fetch_max_wait", self.fetch_max_wait),
            ("retry_backoff", self.retry_backoff),
            ("shutdown_timeout", self.shutdown_timeout),
        ];

        if let Some((name, _)) = durations.iter().find(|(_, duration)| duration.is_zero()) {
            return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
        }

        if self.client_id.is_empty() {
            return Err(Error::InvalidConfig("client_id must not be empty".into()));
        }

        if self.channel_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "channel_buffer_size must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Registration records are refreshed three times per timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.registration_timeout / 3
    }

    /// Exponential backoff from `retry_backoff`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1 << attempt.min(Self::MAX_BACKOFF_SHIFT))
    }
}
