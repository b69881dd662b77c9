//! Selector and the per-Node Marker.
//!
//! A `Selector` picks one live Node from a Hop's pool by running a
//! FailFilter, then a BackupFilter, then a load-balancing Strategy; a
//! `Marker` is the per-Node mutable fail-count/backoff state the filters
//! consult.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// Per-Node mutable failure state. The only part of a Node that changes
/// after construction.
#[derive(Debug)]
pub struct Marker {
    fail_count: AtomicU32,
    last_failed_at: Mutex<Option<Instant>>,
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

impl Marker {
    pub fn new() -> Self {
        Self {
            fail_count: AtomicU32::new(0),
            last_failed_at: Mutex::new(None),
        }
    }

    /// Resets the Marker after a successful use.
    pub fn on_success(&self) {
        self.fail_count.store(0, Ordering::SeqCst);
        *self.last_failed_at.lock().unwrap() = None;
    }

    /// Records a failed use: `failCount++`, `lastFailedAt = now`.
    pub fn on_failure(&self) {
        self.fail_count.fetch_add(1, Ordering::SeqCst);
        *self.last_failed_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::SeqCst)
    }

    /// A Node is "failed" iff `failCount >= maxFails` and the last failure
    /// happened less than `failTimeout` ago.
    pub fn is_failed(&self, max_fails: u32, fail_timeout: Duration) -> bool {
        if self.fail_count() < max_fails {
            return false;
        }
        match *self.last_failed_at.lock().unwrap() {
            Some(t) => t.elapsed() < fail_timeout,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    Fifo,
    Hash,
}

impl Strategy {
    pub fn parse(s: &str) -> Strategy {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Strategy::Random,
            "fifo" => Strategy::Fifo,
            "hash" => Strategy::Hash,
            _ => Strategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub strategy: Strategy,
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            max_fails: 1,
            fail_timeout: Duration::from_secs(30),
        }
    }
}

/// Anything the Selector needs to know about a candidate node. Implemented
/// by `chain::Node`; kept as a trait here so the Selector has no dependency
/// on the Chain module's concrete type.
pub trait Candidate {
    fn marker(&self) -> &Marker;
    fn is_backup(&self) -> bool;
    fn addr(&self) -> &str;
}

pub struct Selector {
    opts: SelectorOptions,
    counter: AtomicU64,
}

impl Selector {
    pub fn new(opts: SelectorOptions) -> Self {
        Self {
            opts,
            counter: AtomicU64::new(0),
        }
    }

    /// Runs the FailFilter -> BackupFilter -> Strategy pipeline and returns
    /// the index of the chosen candidate, if any.
    pub fn select<'a, C: Candidate>(&self, nodes: &'a [C], addr_hint: &str) -> Option<&'a C> {
        if nodes.is_empty() {
            return None;
        }

        let healthy: Vec<&C> = nodes
            .iter()
            .filter(|n| !n.marker().is_failed(self.opts.max_fails, self.opts.fail_timeout))
            .collect();
        let fail_filtered: Vec<&C> = if healthy.is_empty() {
            nodes.iter().collect()
        } else {
            healthy
        };

        let any_primary_live = fail_filtered.iter().any(|n| !n.is_backup());
        let candidates: Vec<&C> = if any_primary_live {
            fail_filtered.into_iter().filter(|n| !n.is_backup()).collect()
        } else {
            fail_filtered
        };

        if candidates.is_empty() {
            return None;
        }

        let idx = match self.opts.strategy {
            Strategy::Fifo => 0,
            Strategy::Random => rand::rng().random_range(0..candidates.len()),
            Strategy::RoundRobin => {
                (self.counter.fetch_add(1, Ordering::Relaxed) as usize) % candidates.len()
            }
            Strategy::Hash => {
                let mut hasher = DefaultHasher::new();
                addr_hint.hash(&mut hasher);
                (hasher.finish() as usize) % candidates.len()
            }
        };

        Some(candidates[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        addr: String,
        backup: bool,
        marker: Marker,
    }

    impl Candidate for Node {
        fn marker(&self) -> &Marker {
            &self.marker
        }
        fn is_backup(&self) -> bool {
            self.backup
        }
        fn addr(&self) -> &str {
            &self.addr
        }
    }

    fn node(addr: &str, backup: bool) -> Node {
        Node {
            addr: addr.to_string(),
            backup,
            marker: Marker::new(),
        }
    }

    #[test]
    fn marker_monotonicity() {
        let m = Marker::new();
        assert_eq!(m.fail_count(), 0);
        m.on_failure();
        m.on_failure();
        assert_eq!(m.fail_count(), 2);
        m.on_success();
        assert_eq!(m.fail_count(), 0);
    }

    #[test]
    fn fail_filter_falls_back_when_all_failed() {
        let nodes = vec![node("a", false), node("b", false)];
        for n in &nodes {
            n.marker.on_failure();
        }
        let sel = Selector::new(SelectorOptions {
            max_fails: 1,
            fail_timeout: Duration::from_secs(30),
            ..Default::default()
        });
        // All failed -> pass-through, Selector still returns a node.
        assert!(sel.select(&nodes, "x").is_some());
    }

    #[test]
    fn backup_filter_prefers_primary() {
        let nodes = vec![node("primary", false), node("backup", true)];
        let sel = Selector::new(SelectorOptions {
            strategy: Strategy::Fifo,
            ..Default::default()
        });
        let picked = sel.select(&nodes, "x").unwrap();
        assert_eq!(picked.addr, "primary");
    }

    #[test]
    fn backup_filter_falls_over_when_primary_failed() {
        let nodes = vec![node("primary", false), node("backup", true)];
        nodes[0].marker.on_failure();
        let sel = Selector::new(SelectorOptions {
            strategy: Strategy::Fifo,
            max_fails: 1,
            fail_timeout: Duration::from_secs(30),
        });
        let picked = sel.select(&nodes, "x").unwrap();
        assert_eq!(picked.addr, "backup");
    }

    #[test]
    fn round_robin_cycles() {
        let nodes = vec![node("a", false), node("b", false)];
        let sel = Selector::new(SelectorOptions {
            strategy: Strategy::RoundRobin,
            ..Default::default()
        });
        let first = sel.select(&nodes, "x").unwrap().addr.clone();
        let second = sel.select(&nodes, "x").unwrap().addr.clone();
        assert_ne!(first, second);
    }
}
