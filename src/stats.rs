//! Run counters, printed as a summary at shutdown

use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Stats {
    counters: BTreeMap<String, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, value: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += value;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn summary_json(&self) -> String {
        serde_json::to_string_pretty(&json!(self.counters)).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn print_summary(&self) {
        println!("--- Execution Summary ---");
        println!("{}", self.summary_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut stats = Stats::new();
        stats.increment("harvested");
        stats.add("harvested", 4);
        assert_eq!(stats.get("harvested"), 5);
        assert_eq!(stats.get("unknown"), 0);
    }

    #[test]
    fn test_summary_is_json() {
        let mut stats = Stats::new();
        stats.add("latency_passed", 3);
        let summary = stats.summary_json();
        let parsed: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed["latency_passed"], 3);
    }
}
