//! # sockudo-wstest
//!
//! A WebSocket conformance fuzzing harness. It runs a catalog of RFC 6455
//! test cases against an implementation under test, either as a fuzzing
//! server that testee clients connect to or as a fuzzing client that
//! connects to testee servers, and classifies every case as `OK`,
//! `NON_STRICT`, `FAILED` and so on. A second case set exercises WAMPv1
//! brokers over the `wamp` subprotocol; see [`wamp`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sockudo_wstest::{CaseCatalog, FuzzingServer, Spec, Mode};
//!
//! # async fn run() -> sockudo_wstest::Result<()> {
//! let catalog = Arc::new(CaseCatalog::standard()?);
//! let spec = Spec::template(Mode::FuzzingServer);
//! FuzzingServer::bind(&spec, catalog).await?.run().await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod case_id;
pub mod cases;
pub mod catalog;
pub mod client;
pub mod command;
pub mod compression;
pub mod connection;
pub mod corpus;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod logging;
pub mod mask;
pub mod outcome;
pub mod pattern;
pub mod report;
pub mod results;
pub mod runner;
pub mod script;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod spec;
pub mod testee;
pub mod timer;
pub mod trace;
pub mod utf8;
pub mod wamp;

pub use case_id::CaseId;
pub use catalog::{CaseCatalog, CaseDescriptor};
pub use client::{run_fuzzing_client, FuzzingClient};
pub use error::{Error, Result};
pub use outcome::{CloseOutcomeTag, OutcomeTag};
pub use results::{CaseResult, ResultsIndex, RunStore};
pub use server::FuzzingServer;
pub use spec::{Mode, Spec};
