//! Fuzzing client
//!
//! Connects to each testee server once per case. The sequencer drives the
//! case order; this module only knows how to run one case on one fresh
//! connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::catalog::{CaseCatalog, CaseDescriptor};
use crate::error::{Error, Result};
use crate::report::{write_reports, ReportFiles, ResultTable};
use crate::results::{CaseResult, RunStore};
use crate::runner::{CaseRunner, FuzzingContext};
use crate::sequencer::{CaseExecutor, StoreObserver, TestRunSequencer};
use crate::session::{self, SessionConfig, DEFAULT_AGENT};
use crate::spec::{Mode, Spec, Testee};

/// Runs cases as the client role against testee servers
pub struct FuzzingClient {
    ctx: Arc<FuzzingContext>,
    spec: Arc<Spec>,
}

impl FuzzingClient {
    pub fn new(ctx: Arc<FuzzingContext>, spec: Arc<Spec>) -> Self {
        Self { ctx, spec }
    }
}

#[async_trait]
impl CaseExecutor for FuzzingClient {
    async fn run_case(
        &self,
        testee: &Testee,
        index: usize,
        descriptor: Arc<CaseDescriptor>,
    ) -> Result<Arc<CaseResult>> {
        let url = Url::parse(&testee.url)
            .map_err(|e| Error::HandshakeFailed(format!("invalid testee url '{}': {}", testee.url, e)))?;
        let options = self.spec.options_for(testee);
        let config = SessionConfig::from_options(&options, DEFAULT_AGENT);
        let id = descriptor.id.clone();
        let mut runner = CaseRunner::for_case(self.ctx.clone(), index, descriptor, testee.agent(), &options)?;

        tracing::debug!(case = %id, agent = testee.agent(), url = %url, "connecting");
        session::connect(&url, config, &mut runner).await?;
        runner
            .take_result()
            .ok_or_else(|| Error::CaseInternal(format!("case {} finished without a result", id)))
    }
}

/// Everything a finished client run produced
#[derive(Debug)]
pub struct ClientRun {
    pub run_id: String,
    pub results: BTreeMap<String, Vec<Arc<CaseResult>>>,
    pub reports: ReportFiles,
}

/// Run every testee of `spec` and write the reports
pub async fn run_fuzzing_client(spec: Spec, catalog: Arc<CaseCatalog>) -> Result<ClientRun> {
    spec.check(Mode::FuzzingClient, &catalog)?;
    let ctx = Arc::new(FuzzingContext::from_spec(&spec, Mode::FuzzingClient, catalog.clone())?);
    let spec = Arc::new(spec);

    let store = Arc::new(RunStore::new());
    let run_id = store.new_run(Mode::FuzzingClient.as_str(), Mode::FuzzingClient);

    let executor = Arc::new(FuzzingClient::new(ctx.clone(), spec.clone()));
    let mut sequencer = TestRunSequencer::new(catalog.clone(), executor);
    sequencer.observe(ctx.results.clone());
    sequencer.observe(Arc::new(StoreObserver::new(store.clone(), spec.servers.len())));

    let results = sequencer.run(&run_id, &spec).await?;

    let mut table = ResultTable::new();
    for result in store.results(&run_id)? {
        table
            .entry(result.agent.clone())
            .or_default()
            .insert(result.id.clone(), result);
    }
    let reports = write_reports(&ctx.outdir, &catalog, &table)?;
    tracing::info!(run = %run_id, summary = %reports.summary.display(), "fuzzing client finished");

    Ok(ClientRun {
        run_id,
        results,
        reports,
    })
}
