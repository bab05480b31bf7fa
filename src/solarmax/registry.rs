use crate::solarmax::model::InverterType;

use serde::Serialize;
use std::collections::BTreeMap;

/// What detection learned about one inverter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct InverterInfo {
    pub model: InverterType,
    /// Installed power as reported by the inverter (PIN), watts.
    pub installed_power: f64,
}

impl InverterInfo {
    pub fn description(&self) -> &'static str {
        self.model.description()
    }
}

/// The inverters a gateway is expected to serve, and the ones that have
/// actually answered a detection pass.
#[derive(Clone, Debug, Default)]
pub struct InverterRegistry {
    expected: Vec<u8>,
    discovered: BTreeMap<u8, InverterInfo>,
}

impl InverterRegistry {
    pub fn new(expected: Vec<u8>) -> Self {
        Self {
            expected,
            discovered: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> &[u8] {
        &self.expected
    }

    pub fn set_expected(&mut self, expected: Vec<u8>) {
        self.expected = expected;
    }

    pub fn clear(&mut self) {
        self.discovered.clear();
    }

    pub fn record(&mut self, address: u8, info: InverterInfo) {
        self.discovered.insert(address, info);
    }

    pub fn get(&self, address: u8) -> Option<&InverterInfo> {
        self.discovered.get(&address)
    }

    pub fn contains_expected(&self, address: u8) -> bool {
        self.expected.contains(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &InverterInfo)> {
        self.discovered.iter().map(|(a, i)| (*a, i))
    }

    pub fn len(&self) -> usize {
        self.discovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.discovered.len() == self.expected.len()
    }
}
