//! Node configuration.

use serde::{Deserialize, Serialize};

use crate::dead_letter::DEFAULT_DEAD_LETTER_CAPACITY;

/// How messages for identities on other processes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Push onto the target's broker queue, then publish a wake signal.
    /// Messages survive until the target logs in somewhere.
    #[default]
    Queued,
    /// Publish the envelope on the target's channel. Lost if nobody owns
    /// the target at that moment.
    FireAndForget,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Delivery mode for non-local targets.
    pub mode: DeliveryMode,
    /// Prefix applied to broker queue keys and channel names.
    pub key_prefix: String,
    /// Credential presented to every broker client at startup.
    pub broker_credential: Option<String>,
    /// Dead letters kept in memory.
    pub dead_letter_capacity: usize,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Queued,
            key_prefix: String::new(),
            broker_credential: None,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            event_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Configuration with the given delivery mode and defaults elsewhere.
    #[must_use]
    pub fn with_mode(mode: DeliveryMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}
