//! Process-wide connectivity state.
//!
//! The monitor does not originate connectivity events; hosts feed it
//! (`set_online`, fetch timings, platform hints) and every other component
//! reads or subscribes to the derived [`NetworkState`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

const SPEED_SAMPLE_WINDOW: usize = 5;
const DEFAULT_SLOW_FETCH: Duration = Duration::from_millis(1500);
const SLOW_NETWORK_STALENESS_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSpeed {
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub is_online: bool,
    pub speed: NetworkSpeed,
    pub is_syncing: bool,
    pub is_validating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

#[derive(Debug, Default)]
struct SpeedInputs {
    samples: VecDeque<Duration>,
    hint: Option<NetworkSpeed>,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<NetworkState>>,
    inputs: Arc<Mutex<SpeedInputs>>,
    slow_threshold: Duration,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(NetworkState {
            is_online: initially_online,
            speed: NetworkSpeed::Fast,
            is_syncing: false,
            is_validating: false,
        });
        Self {
            state: Arc::new(tx),
            inputs: Arc::new(Mutex::new(SpeedInputs::default())),
            slow_threshold: DEFAULT_SLOW_FETCH,
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn speed(&self) -> NetworkSpeed {
        self.state.borrow().speed
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    /// Returns the transition when the online flag actually flipped.
    pub fn set_online(&self, online: bool) -> Option<Transition> {
        let changed = self.state.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            state.is_online = online;
            true
        });
        if !changed {
            return None;
        }
        if online {
            info!("network: online");
            Some(Transition::CameOnline)
        } else {
            info!("network: offline");
            Some(Transition::WentOffline)
        }
    }

    /// Feeds the latency of a completed backend fetch into the rolling
    /// speed estimate.
    pub fn record_fetch(&self, elapsed: Duration) {
        let speed = {
            let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
            inputs.samples.push_back(elapsed);
            while inputs.samples.len() > SPEED_SAMPLE_WINDOW {
                inputs.samples.pop_front();
            }
            classify(&inputs, self.slow_threshold)
        };
        self.publish_speed(speed);
    }

    /// Accepts a platform "effective connection type" hint such as `4g` or
    /// `slow-2g`. Unknown values clear the hint.
    pub fn set_connection_hint(&self, effective_type: &str) {
        let hint = match effective_type.trim().to_ascii_lowercase().as_str() {
            "slow-2g" | "2g" => Some(NetworkSpeed::Slow),
            "3g" | "4g" | "5g" | "wifi" | "ethernet" => Some(NetworkSpeed::Fast),
            _ => None,
        };
        let speed = {
            let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
            inputs.hint = hint;
            classify(&inputs, self.slow_threshold)
        };
        self.publish_speed(speed);
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_syncing != syncing;
            state.is_syncing = syncing;
            changed
        });
    }

    pub fn set_validating(&self, validating: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_validating != validating;
            state.is_validating = validating;
            changed
        });
    }

    /// Staleness budget adjusted for the current speed: the caller's value on
    /// fast networks, a multiple of it on slow ones to favour availability.
    pub fn effective_max_age(&self, max_age: Duration) -> Duration {
        match self.speed() {
            NetworkSpeed::Fast => max_age,
            NetworkSpeed::Slow => max_age.saturating_mul(SLOW_NETWORK_STALENESS_FACTOR),
        }
    }

    fn publish_speed(&self, speed: NetworkSpeed) {
        let changed = self.state.send_if_modified(|state| {
            let changed = state.speed != speed;
            state.speed = speed;
            changed
        });
        if changed {
            debug!(?speed, "network speed classification changed");
        }
    }
}

fn classify(inputs: &SpeedInputs, slow_threshold: Duration) -> NetworkSpeed {
    if inputs.hint == Some(NetworkSpeed::Slow) {
        return NetworkSpeed::Slow;
    }
    if inputs.samples.is_empty() {
        return inputs.hint.unwrap_or(NetworkSpeed::Fast);
    }
    let total: Duration = inputs.samples.iter().sum();
    let mean = total / inputs.samples.len() as u32;
    if mean > slow_threshold {
        NetworkSpeed::Slow
    } else {
        NetworkSpeed::Fast
    }
}
