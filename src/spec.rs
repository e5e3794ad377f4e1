//! Test run specification
//!
//! A spec is the JSON document that tells a fuzzing server or client which
//! cases to run, against whom, and with which protocol options. Parsing is
//! lenient (unknown keys are ignored); [`Spec::validate`] then checks the
//! document for the selected mode in one pass and reports every problem it
//! finds instead of stopping at the first.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::case_id::CaseId;
use crate::catalog::CaseCatalog;
use crate::error::{ConfigurationError, ConfigurationErrors, Error, Result};
use crate::pattern::{AgentExclusion, PatternResolver};

/// Default fuzzing server endpoint
pub const DEFAULT_URL: &str = "ws://127.0.0.1:9001";

/// What the process does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept testee clients and run cases against them
    FuzzingServer,
    /// Connect to testee servers and run cases against them
    FuzzingClient,
    /// Echo server used as a testee
    TesteeServer,
    /// Echo client used as a testee
    TesteeClient,
    /// Connect to WAMP testee brokers and run the WAMP case set
    FuzzingWampClient,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::FuzzingServer => "fuzzingserver",
            Mode::FuzzingClient => "fuzzingclient",
            Mode::TesteeServer => "testeeserver",
            Mode::TesteeClient => "testeeclient",
            Mode::FuzzingWampClient => "fuzzingwampclient",
        }
    }

    /// Default report directory for the mode
    pub fn default_outdir(&self) -> &'static str {
        match self {
            Mode::FuzzingServer | Mode::TesteeClient => "./reports/clients",
            Mode::FuzzingClient | Mode::TesteeServer => "./reports/servers",
            Mode::FuzzingWampClient => "./reports/wampservers",
        }
    }

    /// Case set the mode runs
    pub fn case_set(&self) -> &'static str {
        match self {
            Mode::FuzzingWampClient => WAMP_CASE_SET,
            _ => CASE_SET,
        }
    }

    /// Whether the mode connects out to testees listed under `servers`
    pub fn connects_out(&self) -> bool {
        matches!(self, Mode::FuzzingClient | Mode::TesteeClient | Mode::FuzzingWampClient)
    }

    /// File name the template for this mode is written to
    pub fn template_file(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fuzzingserver" => Ok(Mode::FuzzingServer),
            "fuzzingclient" => Ok(Mode::FuzzingClient),
            "testeeserver" => Ok(Mode::TesteeServer),
            "testeeclient" => Ok(Mode::TesteeClient),
            "fuzzingwampclient" => Ok(Mode::FuzzingWampClient),
            other => Err(ConfigurationError::UnknownMode(other.to_string())),
        }
    }
}

/// Protocol options passed to every connection of a run
///
/// Every field is optional so spec-level and per-testee options can be
/// layered with [`ProtocolOptions::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOptions {
    /// Fail connections by dropping TCP instead of sending a close frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_by_drop: Option<bool>,
    /// Seconds allowed for the opening handshake
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_handshake_timeout: Option<f64>,
    /// Seconds to wait for the peer to answer our close
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_handshake_timeout: Option<f64>,
    /// Client role: seconds to wait for the server to drop TCP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_connection_drop_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_payload_size: Option<usize>,
    /// Report durations for every case, not just timed ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtts: Option<bool>,
    /// Shuffle this testee's case order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randomize: Option<bool>,
    /// WAMP cases: expected round-trip time in seconds, scales every wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    /// Options this build does not interpret, kept for round trips
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ProtocolOptions {
    /// Default close-handshake and server-drop timeout
    pub const DEFAULT_CLOSE_TIMEOUT: f64 = 1.0;
    pub const DEFAULT_OPEN_TIMEOUT: f64 = 5.0;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
    pub const DEFAULT_RTT: f64 = 0.2;

    /// `self` with every option set in `over` replaced
    pub fn merged(&self, over: &ProtocolOptions) -> ProtocolOptions {
        let mut extra = self.extra.clone();
        extra.extend(over.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        ProtocolOptions {
            fail_by_drop: over.fail_by_drop.or(self.fail_by_drop),
            open_handshake_timeout: over.open_handshake_timeout.or(self.open_handshake_timeout),
            close_handshake_timeout: over.close_handshake_timeout.or(self.close_handshake_timeout),
            server_connection_drop_timeout: over
                .server_connection_drop_timeout
                .or(self.server_connection_drop_timeout),
            max_message_payload_size: over.max_message_payload_size.or(self.max_message_payload_size),
            rtts: over.rtts.or(self.rtts),
            randomize: over.randomize.or(self.randomize),
            rtt: over.rtt.or(self.rtt),
            extra,
        }
    }

    pub fn fail_by_drop(&self) -> bool {
        self.fail_by_drop.unwrap_or(false)
    }

    pub fn open_handshake_timeout(&self) -> Duration {
        secs(self.open_handshake_timeout, Self::DEFAULT_OPEN_TIMEOUT)
    }

    pub fn close_handshake_timeout(&self) -> Duration {
        secs(self.close_handshake_timeout, Self::DEFAULT_CLOSE_TIMEOUT)
    }

    pub fn server_connection_drop_timeout(&self) -> Duration {
        secs(self.server_connection_drop_timeout, Self::DEFAULT_CLOSE_TIMEOUT)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_payload_size
            .unwrap_or(Self::DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn rtts(&self) -> bool {
        self.rtts.unwrap_or(false)
    }

    /// `factor` round-trip times
    pub fn rtt(&self, factor: f64) -> Duration {
        crate::timer::delay(factor * self.rtt.unwrap_or(Self::DEFAULT_RTT))
    }

    fn check(&self, field: &str, errors: &mut Vec<ConfigurationError>) {
        let timeouts = [
            ("openHandshakeTimeout", self.open_handshake_timeout),
            ("closeHandshakeTimeout", self.close_handshake_timeout),
            ("serverConnectionDropTimeout", self.server_connection_drop_timeout),
            ("rtt", self.rtt),
        ];
        for (name, value) in timeouts {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    errors.push(ConfigurationError::InvalidValue {
                        field: format!("{}.{}", field, name),
                        reason: format!("{} is not a non-negative number of seconds", v),
                    });
                }
            }
        }
        if self.max_message_payload_size == Some(0) {
            errors.push(ConfigurationError::InvalidValue {
                field: format!("{}.maxMessagePayloadSize", field),
                reason: "must be positive".into(),
            });
        }
    }
}

fn secs(value: Option<f64>, default: f64) -> Duration {
    crate::timer::delay(value.unwrap_or(default))
}

/// One implementation under test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Testee {
    /// Agent name used in reports and exclusion rules
    #[serde(alias = "agent", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub options: ProtocolOptions,
}

impl Testee {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Agent name, or the URL when the entry names none
    pub fn agent(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

fn default_cases() -> Vec<String> {
    vec!["*".to_string()]
}

/// A fuzzing run description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// Fuzzing server listen URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdir: Option<PathBuf>,
    /// Port serving the report directory over HTTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webport: Option<u16>,
    #[serde(default)]
    pub options: ProtocolOptions,
    #[serde(default = "default_cases")]
    pub cases: Vec<String>,
    #[serde(default, rename = "exclude-cases")]
    pub exclude_cases: Vec<String>,
    #[serde(default, rename = "exclude-agent-cases")]
    pub exclude_agent_cases: BTreeMap<String, Vec<String>>,
    /// Testee servers (fuzzing client mode)
    #[serde(default, alias = "testees", skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Testee>,
    /// Run testees concurrently
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    /// Shuffle each testee's case order once
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub randomize: bool,
    /// Directory holding the compression corpora
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testdata: Option<PathBuf>,
    /// Name of the case set to run
    #[serde(default, rename = "caseset", skip_serializing_if = "Option::is_none")]
    pub case_set: Option<String>,
}

/// RFC 6455 case set
pub const CASE_SET: &str = "websocket";

/// WAMPv1 broker case set
pub const WAMP_CASE_SET: &str = "wamp";

impl Default for Spec {
    fn default() -> Self {
        Self {
            url: None,
            outdir: None,
            webport: None,
            options: ProtocolOptions::default(),
            cases: default_cases(),
            exclude_cases: Vec::new(),
            exclude_agent_cases: BTreeMap::new(),
            servers: Vec::new(),
            parallel: false,
            randomize: false,
            testdata: None,
            case_set: None,
        }
    }
}

impl Spec {
    /// Default spec for a mode, as written when none is given
    pub fn template(mode: Mode) -> Spec {
        let mut spec = Spec {
            outdir: Some(PathBuf::from(mode.default_outdir())),
            options: ProtocolOptions {
                fail_by_drop: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        match mode {
            Mode::FuzzingServer | Mode::TesteeServer => {
                spec.url = Some(DEFAULT_URL.to_string());
            }
            Mode::FuzzingClient | Mode::TesteeClient => {
                spec.servers = vec![Testee {
                    name: Some("AutobahnServer".to_string()),
                    url: DEFAULT_URL.to_string(),
                    ..Default::default()
                }];
            }
            Mode::FuzzingWampClient => {
                spec.servers = vec![Testee {
                    name: Some("AutobahnPython".to_string()),
                    url: DEFAULT_URL.to_string(),
                    ..Default::default()
                }];
                spec.case_set = Some(WAMP_CASE_SET.to_string());
                spec.options.rtt = Some(ProtocolOptions::DEFAULT_RTT);
            }
        }
        spec
    }

    pub fn from_json(text: &str) -> Result<Spec> {
        serde_json::from_str(text)
            .map_err(|e| Error::from(ConfigurationError::MalformedSpec(e.to_string())))
    }

    /// Read and parse a spec file
    pub fn load(path: impl AsRef<Path>) -> Result<Spec> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::from(ConfigurationError::MalformedSpec(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        })?;
        let spec = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), cases = spec.cases.len(), "spec loaded");
        Ok(spec)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn outdir(&self, mode: Mode) -> PathBuf {
        self.outdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(mode.default_outdir()))
    }

    /// Options in effect for one testee
    pub fn options_for(&self, testee: &Testee) -> ProtocolOptions {
        self.options.merged(&testee.options)
    }

    /// Whether `testee`'s case order should be shuffled
    pub fn randomize_for(&self, testee: &Testee) -> bool {
        testee.options.randomize.unwrap_or(self.randomize)
    }

    /// Check the spec for `mode` against `catalog`; empty when usable
    pub fn validate(&self, mode: Mode, catalog: &CaseCatalog) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();

        if let Some(name) = &self.case_set {
            if name != mode.case_set() {
                errors.push(ConfigurationError::UnsupportedCaseSet(name.clone()));
            }
        }

        match mode {
            Mode::FuzzingServer | Mode::TesteeServer => match &self.url {
                Some(url) => check_url("url", url, &mut errors),
                None => errors.push(ConfigurationError::MissingField("url".into())),
            },
            Mode::FuzzingClient | Mode::TesteeClient | Mode::FuzzingWampClient => {
                if self.servers.is_empty() {
                    errors.push(ConfigurationError::MissingField("servers".into()));
                }
                for (i, testee) in self.servers.iter().enumerate() {
                    let field = format!("servers[{}]", i);
                    if mode != Mode::TesteeClient && testee.name.as_deref().map_or(true, str::is_empty) {
                        errors.push(ConfigurationError::MissingField(format!("{}.agent", field)));
                    }
                    if testee.url.is_empty() {
                        errors.push(ConfigurationError::MissingField(format!("{}.url", field)));
                    } else {
                        check_url(&format!("{}.url", field), &testee.url, &mut errors);
                    }
                    testee.options.check(&format!("{}.options", field), &mut errors);
                }
            }
        }

        self.options.check("options", &mut errors);

        if let Some(dir) = &self.testdata {
            if !dir.is_dir() {
                errors.push(ConfigurationError::InvalidValue {
                    field: "testdata".into(),
                    reason: format!("{} is not a directory", dir.display()),
                });
            }
        }

        let resolver = PatternResolver::new(catalog);
        collect(resolver.resolve(&self.cases).map(drop), &mut errors);
        collect(resolver.resolve_excludes(&self.exclude_cases).map(drop), &mut errors);
        collect(
            resolver
                .resolve_agent_excludes(&self.exclude_agent_cases)
                .map(drop),
            &mut errors,
        );
        errors
    }

    /// [`Spec::validate`] as a `Result`
    pub fn check(&self, mode: Mode, catalog: &CaseCatalog) -> Result<()> {
        ConfigurationErrors::check(self.validate(mode, catalog))
    }

    pub fn agent_rules(&self, catalog: &CaseCatalog) -> Result<Vec<AgentExclusion>> {
        PatternResolver::new(catalog).resolve_agent_excludes(&self.exclude_agent_cases)
    }

    /// Cases a fuzzing server offers; per-agent rules apply when a case runs
    pub fn server_cases(&self, catalog: &CaseCatalog) -> Result<Vec<CaseId>> {
        PatternResolver::new(catalog).resolve_for_agent(&self.cases, &self.exclude_cases, &[], "")
    }

    /// Ordered cases one testee runs
    pub fn cases_for(&self, catalog: &CaseCatalog, agent: &str) -> Result<Vec<CaseId>> {
        let resolver = PatternResolver::new(catalog);
        let rules = resolver.resolve_agent_excludes(&self.exclude_agent_cases)?;
        resolver.resolve_for_agent(&self.cases, &self.exclude_cases, &rules, agent)
    }
}

fn check_url(field: &str, raw: &str, errors: &mut Vec<ConfigurationError>) {
    match Url::parse(raw) {
        Ok(url) => {
            let reason = match url.scheme() {
                "ws" if url.host_str().is_none() => Some("URL has no host".to_string()),
                "ws" => None,
                "wss" => Some("TLS endpoints are not supported".to_string()),
                other => Some(format!("unsupported scheme '{}'", other)),
            };
            if let Some(reason) = reason {
                errors.push(ConfigurationError::InvalidValue {
                    field: field.to_string(),
                    reason,
                });
            }
        }
        Err(e) => errors.push(ConfigurationError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn collect(result: Result<()>, errors: &mut Vec<ConfigurationError>) {
    if let Err(Error::Configuration(found)) = result {
        errors.extend(found.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CaseCatalog {
        CaseCatalog::standard().unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("fuzzingclient".parse::<Mode>().unwrap(), Mode::FuzzingClient);
        assert_eq!(
            "wamp".parse::<Mode>(),
            Err(ConfigurationError::UnknownMode("wamp".into()))
        );
    }

    #[test]
    fn test_wamp_mode_selects_case_set() {
        let mode: Mode = "fuzzingwampclient".parse().unwrap();
        assert_eq!(mode, Mode::FuzzingWampClient);
        assert_eq!(mode.case_set(), WAMP_CASE_SET);
        assert_eq!(Mode::FuzzingClient.case_set(), CASE_SET);
        assert!(mode.connects_out());

        let wamp = CaseCatalog::wamp().unwrap();
        let spec = Spec::template(mode);
        assert!(spec.validate(mode, &wamp).is_empty());
        assert_eq!(spec.outdir(mode), PathBuf::from("./reports/wampservers"));
        assert_eq!(
            spec.validate(Mode::FuzzingClient, &catalog()),
            vec![ConfigurationError::UnsupportedCaseSet("wamp".into())]
        );
    }

    #[test]
    fn test_rtt_option() {
        let options = ProtocolOptions::default();
        assert_eq!(options.rtt(2.5), Duration::from_millis(500));
        let options = options.merged(&ProtocolOptions {
            rtt: Some(1.0),
            ..Default::default()
        });
        assert_eq!(options.rtt(3.0), Duration::from_secs(3));

        let spec = Spec::from_json(r#"{"url": "ws://127.0.0.1:9001", "options": {"rtt": -0.5}}"#).unwrap();
        assert!(spec.validate(Mode::FuzzingServer, &catalog()).iter().any(|e| matches!(
            e,
            ConfigurationError::InvalidValue { field, .. } if field == "options.rtt"
        )));
    }

    #[test]
    fn test_parse_full_spec() {
        let spec = Spec::from_json(
            r#"{
                "outdir": "./reports/servers",
                "options": {"failByDrop": true, "someEngineFlag": 3},
                "servers": [
                    {"agent": "AutobahnPython", "url": "ws://127.0.0.1:9000", "options": {"version": 18}},
                    {"name": "Other", "url": "ws://127.0.0.1:9002", "options": {"failByDrop": false}}
                ],
                "cases": ["1.*", "9.1.1"],
                "exclude-cases": ["1.1.8"],
                "exclude-agent-cases": {"Other*": ["9.*"]},
                "unknown-key": null
            }"#,
        )
        .unwrap();
        assert_eq!(spec.servers[0].agent(), "AutobahnPython");
        assert_eq!(spec.options.extra.get("someEngineFlag"), Some(&serde_json::json!(3)));
        assert!(spec.options_for(&spec.servers[0]).fail_by_drop());
        assert!(!spec.options_for(&spec.servers[1]).fail_by_drop());
        assert!(spec.validate(Mode::FuzzingClient, &catalog()).is_empty());

        let c = catalog();
        let python = spec.cases_for(&c, "AutobahnPython").unwrap();
        let other = spec.cases_for(&c, "Other").unwrap();
        assert!(python.contains(&"9.1.1".parse().unwrap()));
        assert!(!other.contains(&"9.1.1".parse().unwrap()));
        assert!(!python.contains(&"1.1.8".parse().unwrap()));
    }

    #[test]
    fn test_testees_alias() {
        let spec = Spec::from_json(r#"{"testees": [{"name": "x", "url": "ws://h:1"}]}"#).unwrap();
        assert_eq!(spec.servers.len(), 1);
        assert_eq!(spec.cases, vec!["*"]);
    }

    #[test]
    fn test_malformed_json() {
        let err = Spec::from_json("{ not json").unwrap_err();
        let Error::Configuration(errors) = err else {
            panic!("expected configuration error");
        };
        assert!(matches!(errors.0[0], ConfigurationError::MalformedSpec(_)));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let spec = Spec::from_json(
            r#"{
                "servers": [{"url": "http://x"}, {"agent": "b", "url": "not a url"}],
                "cases": ["9.x", "99.9.9"],
                "options": {"closeHandshakeTimeout": -1},
                "caseset": "wsperf"
            }"#,
        )
        .unwrap();
        let errors = spec.validate(Mode::FuzzingClient, &catalog());
        assert!(errors.contains(&ConfigurationError::UnsupportedCaseSet("wsperf".into())));
        assert!(errors.contains(&ConfigurationError::MissingField("servers[0].agent".into())));
        assert!(errors.contains(&ConfigurationError::InvalidPattern("9.x".into())));
        assert!(errors.contains(&ConfigurationError::UnknownCase("99.9.9".into())));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigurationError::InvalidValue { field, .. } if field == "servers[1].url"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigurationError::InvalidValue { field, .. } if field == "options.closeHandshakeTimeout"
        )));
        assert!(spec.check(Mode::FuzzingClient, &catalog()).is_err());
    }

    #[test]
    fn test_server_needs_url() {
        let spec = Spec::default();
        assert_eq!(
            spec.validate(Mode::FuzzingServer, &catalog()),
            vec![ConfigurationError::MissingField("url".into())]
        );
        let spec = Spec {
            url: Some("wss://127.0.0.1:9001".into()),
            ..Default::default()
        };
        assert_eq!(spec.validate(Mode::FuzzingServer, &catalog()).len(), 1);
    }

    #[test]
    fn test_templates_validate() {
        let c = catalog();
        for mode in [Mode::FuzzingServer, Mode::FuzzingClient] {
            let spec = Spec::template(mode);
            assert!(spec.validate(mode, &c).is_empty(), "{}", mode);
            let json = spec.to_json_pretty().unwrap();
            assert!(json.contains("\"failByDrop\": false"));
            assert!(json.contains("\"exclude-agent-cases\": {}"));
            assert_eq!(Spec::from_json(&json).unwrap(), spec);
        }
        assert_eq!(
            Spec::template(Mode::FuzzingServer).outdir(Mode::FuzzingServer),
            PathBuf::from("./reports/clients")
        );
    }

    #[test]
    fn test_option_defaults_and_merge() {
        let base = ProtocolOptions {
            fail_by_drop: Some(true),
            rtts: Some(true),
            ..Default::default()
        };
        let over = ProtocolOptions {
            fail_by_drop: Some(false),
            close_handshake_timeout: Some(2.5),
            ..Default::default()
        };
        let merged = base.merged(&over);
        assert!(!merged.fail_by_drop());
        assert!(merged.rtts());
        assert_eq!(merged.close_handshake_timeout(), Duration::from_millis(2500));
        assert_eq!(merged.server_connection_drop_timeout(), Duration::from_secs(1));
        assert_eq!(merged.max_message_size(), 64 * 1024 * 1024);
    }
}
