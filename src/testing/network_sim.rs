//! Network condition simulation for testing

use rand::Rng;

/// Network condition simulator
#[derive(Clone, Debug)]
pub struct NetworkSimulator {
    /// Packet loss probability (0.0 to 1.0)
    pub loss_rate: f64,
    /// Probability of delivering a packet twice
    pub duplicate_rate: f64,
}

impl NetworkSimulator {
    /// Perfect network (no issues)
    #[must_use]
    pub fn perfect() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
        }
    }

    /// Should this packet be dropped?
    #[must_use]
    pub fn should_drop(&self) -> bool {
        if self.loss_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.loss_rate.min(1.0))
    }

    /// Should this packet be delivered twice?
    #[must_use]
    pub fn should_duplicate(&self) -> bool {
        if self.duplicate_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.duplicate_rate.min(1.0))
    }
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::perfect()
    }
}
