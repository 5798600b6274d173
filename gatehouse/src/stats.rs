//! Process-wide relay accounting, exposed on the admin endpoint.

use crate::relay::{Direction, Family};

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Serialize)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub accepted: u64,
    pub active: u64,
    pub relays: u64,
    pub ipv4: Traffic,
    pub ipv6: Traffic,

    /// Final decisions by kind.
    pub decisions: BTreeMap<&'static str, u64>,

    pub violations: u64,
    pub upstream_failures: u64,
    pub idle_reaped: u64,
}

impl Stats {
    pub fn count_bytes(&mut self, family: Family, direction: Direction, n: usize) {
        let traffic = match family {
            Family::V4 => &mut self.ipv4,
            Family::V6 => &mut self.ipv6,
        };

        match direction {
            Direction::Upstream => traffic.up += n as u64,
            Direction::Downstream => traffic.down += n as u64,
        }
    }

    pub fn count_decision(&mut self, name: &'static str) {
        *self.decisions.entry(name).or_default() += 1;
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_snapshot() {
        let mut stats = Stats::default();
        stats.accepted = 3;
        stats.count_bytes(Family::V4, Direction::Downstream, 100);
        stats.count_bytes(Family::V6, Direction::Upstream, 7);
        stats.count_decision("permit");
        stats.count_decision("permit");

        let value: serde_json::Value = serde_json::from_slice(&stats.to_json()).unwrap();
        assert_eq!(value["accepted"], 3);
        assert_eq!(value["ipv4"]["down"], 100);
        assert_eq!(value["ipv6"]["up"], 7);
        assert_eq!(value["decisions"]["permit"], 2);
    }
}
