use kube::Client;
use owo_colors::OwoColorize;
use std::collections::{HashMap, HashSet};

use baton_types::{Baton, same_spec};

use super::runner::StrategyRunner;
use crate::util::colors::{FG1, FG2};

/// State token identifying a Baton across observations.
pub fn workload_key(baton: &Baton) -> String {
    format!(
        "{}-{}",
        baton.metadata.namespace.as_deref().unwrap_or_default(),
        baton.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// Runner bookkeeping for every managed workload. The map is owned by the
/// dispatcher task alone and is only ever reached through it, so no lock
/// exists to take.
pub struct RunnerManager {
    client: Client,
    runners: HashMap<String, StrategyRunner>,
}

impl RunnerManager {
    pub fn new(client: Client) -> Self {
        RunnerManager {
            client,
            runners: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_managed(&self, baton: &Baton) -> bool {
        self.runners.contains_key(&workload_key(baton))
    }

    /// True when the stored snapshot differs from `baton` in workload,
    /// strategy set, interval, or monitor timeout.
    pub fn is_spec_changed(&self, baton: &Baton) -> bool {
        match self.runners.get(&workload_key(baton)) {
            Some(runner) => !same_spec(runner.spec(), &baton.spec),
            None => false,
        }
    }

    /// Starts a runner for the Baton. A second add for a managed key is an
    /// upstream bookkeeping error and is refused.
    pub fn add(&mut self, baton: &Baton) {
        let key = workload_key(baton);
        if self.runners.contains_key(&key) {
            eprintln!(
                "{}",
                format!("refusing to start a second runner for {key}").red()
            );
            return;
        }
        println!(
            "🏁 {}{}",
            key.color(FG2),
            " starting strategy runner".color(FG1)
        );
        self.runners
            .insert(key, StrategyRunner::spawn(self.client.clone(), baton.clone()));
    }

    /// Stops the runner and forgets it, waiting for the loop to
    /// acknowledge. An absent key is a no-op.
    pub async fn delete(&mut self, baton: &Baton) {
        if let Some(runner) = self.runners.remove(&workload_key(baton)) {
            runner.stop().await;
        }
    }

    /// Drops every runner whose Baton no longer appears in the listing.
    pub async fn reap_missing(&mut self, current: &[Baton]) {
        let expected: HashSet<String> = current.iter().map(workload_key).collect();
        let stale: Vec<String> = self
            .runners
            .keys()
            .filter(|key| !expected.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(runner) = self.runners.remove(&key) {
                println!(
                    "🧹 {}{}",
                    key.color(FG2),
                    " reaping runner for removed Baton".color(FG1)
                );
                runner.stop().await;
            }
        }
    }

    /// Stops every runner; used on leadership loss and process shutdown.
    pub async fn shutdown(&mut self) {
        for (_, runner) in self.runners.drain() {
            runner.stop().await;
        }
    }
}
