//! Test run sequencing
//!
//! Cases of one testee run strictly one after another, each on a fresh
//! connection. Testees run one after another too, unless the spec opts
//! into running them in parallel. Observers see every result and a final
//! "no more cases" event per testee.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;

use crate::case_id::CaseId;
use crate::catalog::{CaseCatalog, CaseDescriptor};
use crate::error::Result;
use crate::results::{CaseResult, ResultSink, ResultsIndex, RunStore};
use crate::spec::{Spec, Testee};

/// Runs one case against one testee on a fresh connection
#[async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn run_case(
        &self,
        testee: &Testee,
        index: usize,
        descriptor: Arc<CaseDescriptor>,
    ) -> Result<Arc<CaseResult>>;
}

/// One step of a run as reported to observers
#[derive(Debug, Clone)]
pub struct Progress {
    pub run_id: String,
    pub testee: String,
    /// `None` on the terminal event
    pub case: Option<CaseId>,
    pub result: Option<Arc<CaseResult>>,
    pub remaining: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.case.is_none()
    }
}

pub trait RunObserver: Send + Sync {
    fn progress(&self, event: &Progress);
}

impl RunObserver for ResultsIndex {
    fn progress(&self, event: &Progress) {
        if let Some(result) = &event.result {
            self.log_case(result.clone());
        }
    }
}

/// Persists results; closes the run once the last testee is done
pub struct StoreObserver {
    store: Arc<RunStore>,
    testees: usize,
    finished: parking_lot::Mutex<usize>,
}

impl StoreObserver {
    pub fn new(store: Arc<RunStore>, testees: usize) -> Self {
        Self {
            store,
            testees,
            finished: parking_lot::Mutex::new(0),
        }
    }
}

impl RunObserver for StoreObserver {
    fn progress(&self, event: &Progress) {
        let outcome = match &event.result {
            Some(result) => self.store.save_result(&event.run_id, result.clone()),
            None if event.is_done() => {
                let mut finished = self.finished.lock();
                *finished += 1;
                if *finished < self.testees {
                    return;
                }
                self.store.close_run(&event.run_id)
            }
            None => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::warn!(run = %event.run_id, error = %e, "could not store result");
        }
    }
}

/// Drives testees through their case lists
pub struct TestRunSequencer {
    catalog: Arc<CaseCatalog>,
    executor: Arc<dyn CaseExecutor>,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl TestRunSequencer {
    pub fn new(catalog: Arc<CaseCatalog>, executor: Arc<dyn CaseExecutor>) -> Self {
        Self {
            catalog,
            executor,
            observers: Vec::new(),
        }
    }

    pub fn observe(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    fn notify(&self, event: Progress) {
        for observer in &self.observers {
            observer.progress(&event);
        }
    }

    /// Run `cases` against `testee`, one connection at a time
    ///
    /// The order is shuffled once up front when `randomize` is set. A case
    /// whose connection fails is recorded as a failed result.
    pub async fn run_sequential(
        &self,
        run_id: &str,
        testee: &Testee,
        mut cases: Vec<CaseId>,
        randomize: bool,
    ) -> Vec<Arc<CaseResult>> {
        if randomize {
            fastrand::shuffle(&mut cases);
        }
        let agent = testee.agent().to_string();
        tracing::info!(agent = %agent, url = %testee.url, cases = cases.len(), "testing testee");

        let total = cases.len();
        let mut results = Vec::with_capacity(total);
        for (i, id) in cases.into_iter().enumerate() {
            let Some(descriptor) = self.catalog.get(&id).cloned() else {
                tracing::warn!(case = %id, "case vanished from the catalog");
                continue;
            };
            let started = Utc::now();
            let result = match self.executor.run_case(testee, i + 1, descriptor.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(case = %id, agent = %agent, error = %e, "case connection failed");
                    Arc::new(CaseResult::connection_failed(i + 1, &descriptor, &agent, started, &e))
                }
            };
            self.notify(Progress {
                run_id: run_id.to_string(),
                testee: agent.clone(),
                case: Some(id),
                result: Some(result.clone()),
                remaining: total - i - 1,
            });
            results.push(result);
        }

        self.notify(Progress {
            run_id: run_id.to_string(),
            testee: agent,
            case: None,
            result: None,
            remaining: 0,
        });
        results
    }

    /// Run every testee of `spec`; agent name → results
    pub async fn run(&self, run_id: &str, spec: &Spec) -> Result<BTreeMap<String, Vec<Arc<CaseResult>>>> {
        let mut plans = Vec::with_capacity(spec.servers.len());
        for testee in &spec.servers {
            let cases = spec.cases_for(&self.catalog, testee.agent())?;
            plans.push((testee, cases, spec.randomize_for(testee)));
        }

        let mut all = BTreeMap::new();
        if spec.parallel {
            let runs = plans.into_iter().map(|(testee, cases, randomize)| async move {
                let results = self.run_sequential(run_id, testee, cases, randomize).await;
                (testee.agent().to_string(), results)
            });
            all.extend(join_all(runs).await);
        } else {
            for (testee, cases, randomize) in plans {
                let results = self.run_sequential(run_id, testee, cases, randomize).await;
                all.insert(testee.agent().to_string(), results);
            }
        }
        Ok(all)
    }
}
