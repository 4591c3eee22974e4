//! Per-device rng seed state.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::device::Device;
use crate::ir::Value;

pub(crate) const DEFAULT_RNG_SEED: u64 = 101;

// Linear congruence applied at each step boundary; keeps per-step streams
// distinct while staying reproducible from the initial seed.
const SEED_ADD: u64 = 1012031;
const SEED_MUL: u64 = 7012063;

struct SeedState {
    seed: u64,
    node: Value,
}

impl SeedState {
    fn new(seed: u64) -> Self {
        SeedState {
            seed,
            node: Value::seed(seed),
        }
    }
}

/// Seed integer plus its graph embedding, per device.
///
/// Stochastic ops consume the node, never the raw integer, so a recorded
/// graph keeps the seed it saw even after the stored state moves on.
pub(crate) struct RngSeedStore {
    devices: Mutex<HashMap<Device, SeedState>>,
}

impl RngSeedStore {
    pub(crate) fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Current seed node for `device`, created on first access.
    pub(crate) fn seed_value(&self, device: &Device) -> Value {
        let mut devices = self.devices.lock().expect("rng seed store poisoned");
        devices
            .entry(*device)
            .or_insert_with(|| SeedState::new(DEFAULT_RNG_SEED))
            .node
            .clone()
    }

    pub(crate) fn running_seed(&self, device: &Device) -> u64 {
        let mut devices = self.devices.lock().expect("rng seed store poisoned");
        devices
            .entry(*device)
            .or_insert_with(|| SeedState::new(DEFAULT_RNG_SEED))
            .seed
    }

    /// Replaces the seed and regenerates the seed node. Nodes handed out
    /// earlier are untouched.
    pub(crate) fn set_seed(&self, device: &Device, seed: u64) {
        let mut devices = self.devices.lock().expect("rng seed store poisoned");
        devices.insert(*device, SeedState::new(seed));
    }

    /// Advances the seed at a step boundary.
    pub(crate) fn advance(&self, device: &Device) {
        let mut devices = self.devices.lock().expect("rng seed store poisoned");
        let state = devices
            .entry(*device)
            .or_insert_with(|| SeedState::new(DEFAULT_RNG_SEED));
        *state = SeedState::new(SEED_ADD.wrapping_add(state.seed.wrapping_mul(SEED_MUL)));
    }
}
