//! Deciding whether to intercept a TLS connection.
//!
//! Every strategy keeps a bounded history of outcomes per destination host.
//! The TLS layer records exactly one outcome per connection through an
//! [`Attempt`].

use std::{
    collections::{
        BTreeSet,
        HashMap,
        VecDeque,
    },
    fmt::Debug,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use ferret_util::error::ResultExt;
use parking_lot::Mutex;
use rand::Rng;
use regex::{
    Regex,
    RegexBuilder,
};
use rustls::AlertDescription;
use serde::{
    Deserialize,
    Serialize,
};

use super::Error;
use crate::config::{
    StrategyConfig,
    StrategyKind,
};

/// Hosts known to pin their certificates. They never work when intercepted.
const KNOWN_PINNED_HOSTS: &[&str] = &[
    r".*\.apple\.com",
    r".*\.icloud\.com",
    r".*\.itunes\.com",
    r".*\.mzstatic\.com",
    r".*\.apple-cloudkit\.com",
    r".*\.googleapis\.com",
    r"accounts\.google\.com",
];

/// Failure messages that indicate the client rejected our certificate.
const PINNING_INDICATORS: &[&str] = &[
    "certificate verify failed",
    "unknown ca",
    "bad certificate",
    "certificate_unknown",
    "self signed certificate",
    "unable to get local issuer certificate",
    "client disconnected during the handshake",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureReason(pub String);

impl FailureReason {
    /// Describes why a client handshake failed.
    pub fn from_handshake_error(error: &std::io::Error) -> Self {
        let rustls_error = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>());

        let reason = match rustls_error {
            Some(rustls::Error::AlertReceived(alert)) => {
                match alert {
                    AlertDescription::BadCertificate => "bad certificate".to_owned(),
                    AlertDescription::UnknownCA => "unknown ca".to_owned(),
                    AlertDescription::CertificateUnknown => "certificate_unknown".to_owned(),
                    alert => format!("received alert: {alert:?}"),
                }
            }
            Some(error) => error.to_string(),
            None if crate::util::io::is_disconnect(error) => {
                "client disconnected during the handshake".to_owned()
            }
            None => error.to_string(),
        };

        Self(reason)
    }

    pub fn looks_like_pinning(&self) -> bool {
        let reason = self.0.to_lowercase();
        PINNING_INDICATORS
            .iter()
            .any(|indicator| reason.contains(indicator))
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The client accepted our certificate.
    Success,
    /// The client handshake failed.
    Failure(FailureReason),
    /// The connection was not intercepted.
    Skipped,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

pub trait InterceptionStrategy: Debug + Send + Sync + 'static {
    fn should_intercept(&self, host: &str) -> bool;

    fn record(&self, host: &str, outcome: Outcome);

    /// Recent outcomes for `host`, oldest first.
    fn history(&self, host: &str) -> Vec<Outcome>;
}

/// Ring buffers of outcomes, one per host.
#[derive(Debug)]
pub struct History {
    length: usize,
    entries: Mutex<HashMap<String, VecDeque<Outcome>>>,
}

impl History {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, host: &str, outcome: Outcome) {
        let mut entries = self.entries.lock();
        let history = entries
            .entry(host.to_owned())
            .or_insert_with(|| VecDeque::with_capacity(self.length));
        if history.len() == self.length {
            history.pop_front();
        }
        history.push_back(outcome);
    }

    pub fn any(&self, host: &str, f: impl Fn(&Outcome) -> bool) -> bool {
        self.entries
            .lock()
            .get(host)
            .map_or(false, |history| history.iter().any(f))
    }

    pub fn get(&self, host: &str) -> Vec<Outcome> {
        self.entries
            .lock()
            .get(host)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Intercepts unless an earlier attempt for the same host failed.
#[derive(Debug)]
pub struct Conservative {
    history: History,
}

impl Conservative {
    pub fn new(history_length: usize) -> Self {
        Self {
            history: History::new(history_length),
        }
    }
}

impl InterceptionStrategy for Conservative {
    fn should_intercept(&self, host: &str) -> bool {
        !self.history.any(host, Outcome::is_failure)
    }

    fn record(&self, host: &str, outcome: Outcome) {
        self.history.push(host, outcome);
    }

    fn history(&self, host: &str) -> Vec<Outcome> {
        self.history.get(host)
    }
}

/// Intercepts with a fixed probability.
#[derive(Debug)]
pub struct Probabilistic {
    probability: f64,
    history: History,
}

impl Probabilistic {
    pub fn new(probability: f64, history_length: usize) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            history: History::new(history_length),
        }
    }
}

impl InterceptionStrategy for Probabilistic {
    fn should_intercept(&self, _host: &str) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }

    fn record(&self, host: &str, outcome: Outcome) {
        self.history.push(host, outcome);
    }

    fn history(&self, host: &str) -> Vec<Outcome> {
        self.history.get(host)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PassthroughCacheFile {
    #[serde(default)]
    learned_hosts: BTreeSet<String>,
}

/// Passes through hosts known to pin certificates, and learns new ones from
/// failed handshakes. Learned hosts survive restarts if a cache file is set.
#[derive(Debug)]
pub struct PassthroughCache {
    known: Vec<Regex>,
    learned: Arc<Mutex<BTreeSet<String>>>,
    path: Option<PathBuf>,
    history: History,
}

impl PassthroughCache {
    /// `pinned_hosts` are patterns matched against the whole host name, in
    /// addition to the built-in list.
    pub fn new(path: Option<PathBuf>, pinned_hosts: &[String], history_length: usize) -> Result<Self, Error> {
        let known = KNOWN_PINNED_HOSTS
            .iter()
            .copied()
            .chain(pinned_hosts.iter().map(String::as_str))
            .map(|pattern| {
                RegexBuilder::new(&format!("^(?:{pattern})$"))
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let learned = match &path {
            Some(path) => load_learned_hosts(path)?,
            None => BTreeSet::new(),
        };
        if !learned.is_empty() {
            tracing::info!(count = learned.len(), "loaded learned pinned hosts");
        }

        Ok(Self {
            known,
            learned: Arc::new(Mutex::new(learned)),
            path,
            history: History::new(history_length),
        })
    }

    pub fn is_known_pinned(&self, host: &str) -> bool {
        self.known.iter().any(|regex| regex.is_match(host))
    }

    pub fn learned_hosts(&self) -> BTreeSet<String> {
        self.learned.lock().clone()
    }

    /// Writes the learned hosts to the cache file.
    pub fn save(&self) -> Result<(), Error> {
        if let Some(path) = &self.path {
            save_learned_hosts(path, self.learned_hosts())?;
        }
        Ok(())
    }

    fn persist(&self) {
        let Some(path) = self.path.clone()
        else {
            return;
        };
        let learned_hosts = self.learned_hosts();

        // don't block the connection on file io if we're running in a runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    save_learned_hosts(&path, learned_hosts)
                        .log_error_with_message("failed to persist learned hosts")
                });
            }
            Err(_) => {
                let _ = save_learned_hosts(&path, learned_hosts)
                    .log_error_with_message("failed to persist learned hosts");
            }
        }
    }
}

impl InterceptionStrategy for PassthroughCache {
    fn should_intercept(&self, host: &str) -> bool {
        if self.is_known_pinned(host) {
            tracing::debug!(host, "passthrough for known pinned host");
            return false;
        }
        if self.learned.lock().contains(host) {
            tracing::debug!(host, "passthrough for learned pinned host");
            return false;
        }
        true
    }

    fn record(&self, host: &str, outcome: Outcome) {
        if let Outcome::Failure(reason) = &outcome {
            if reason.looks_like_pinning() && self.learned.lock().insert(host.to_owned()) {
                tracing::warn!(host, %reason, "certificate pinning detected, future connections will be passed through");
                self.persist();
            }
        }
        self.history.push(host, outcome);
    }

    fn history(&self, host: &str) -> Vec<Outcome> {
        self.history.get(host)
    }
}

fn load_learned_hosts(path: &Path) -> Result<BTreeSet<String>, Error> {
    match std::fs::read(path) {
        Ok(data) => {
            let file: PassthroughCacheFile =
                serde_json::from_slice(&data).map_err(|error| {
                    Error::PassthroughCache {
                        error,
                        path: path.to_owned(),
                    }
                })?;
            Ok(file.learned_hosts)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(error) => Err(error.into()),
    }
}

fn save_learned_hosts(path: &Path, learned_hosts: BTreeSet<String>) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(&PassthroughCacheFile { learned_hosts }).map_err(
        |error| {
            Error::PassthroughCache {
                error,
                path: path.to_owned(),
            }
        },
    )?;
    std::fs::write(path, data)?;
    Ok(())
}

pub fn from_config(config: &StrategyConfig) -> Result<Arc<dyn InterceptionStrategy>, Error> {
    let strategy: Arc<dyn InterceptionStrategy> = match config.kind {
        StrategyKind::Conservative => Arc::new(Conservative::new(config.history_length)),
        StrategyKind::Probabilistic => {
            Arc::new(Probabilistic::new(
                config.probability,
                config.history_length,
            ))
        }
        StrategyKind::PassthroughCache => {
            Arc::new(PassthroughCache::new(
                config.passthrough_cache_file.clone(),
                &config.pinned_hosts,
                config.history_length,
            )?)
        }
    };
    Ok(strategy)
}

/// One interception attempt. Records exactly one outcome: the one passed to
/// [`Attempt::record`], or [`Outcome::Skipped`] if it is dropped without.
#[derive(Debug)]
pub struct Attempt {
    strategy: Arc<dyn InterceptionStrategy>,
    host: String,
    recorded: bool,
}

impl Attempt {
    pub fn new(strategy: Arc<dyn InterceptionStrategy>, host: impl Into<String>) -> Self {
        Self {
            strategy,
            host: host.into(),
            recorded: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn record(mut self, outcome: Outcome) {
        self.recorded = true;
        self.strategy.record(&self.host, outcome);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.recorded {
            self.strategy.record(&self.host, Outcome::Skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        Attempt,
        Conservative,
        FailureReason,
        InterceptionStrategy,
        Outcome,
        PassthroughCache,
        Probabilistic,
    };
    use crate::{
        config::{
            StrategyConfig,
            StrategyKind,
        },
        tls::strategy::from_config,
    };

    fn failure(reason: &str) -> Outcome {
        Outcome::Failure(FailureReason(reason.to_owned()))
    }

    #[test]
    fn it_bounds_the_history() {
        let strategy = Conservative::new(3);
        for _ in 0..10 {
            strategy.record("example.com", failure("unknown ca"));
        }
        assert_eq!(strategy.history("example.com").len(), 3);
    }

    #[test]
    fn it_passes_through_after_a_failure() {
        let strategy: Arc<dyn InterceptionStrategy> = Arc::new(Conservative::new(10));
        assert!(strategy.should_intercept("pinned.example.com"));

        Attempt::new(strategy.clone(), "pinned.example.com")
            .record(failure("client disconnected during the handshake"));

        assert!(!strategy.should_intercept("pinned.example.com"));
        assert!(strategy.should_intercept("other.example.com"));
    }

    #[test]
    fn it_records_skipped_attempts_once() {
        let strategy: Arc<dyn InterceptionStrategy> = Arc::new(Conservative::new(10));
        drop(Attempt::new(strategy.clone(), "example.com"));
        Attempt::new(strategy.clone(), "example.com").record(Outcome::Success);
        assert_eq!(
            strategy.history("example.com"),
            vec![Outcome::Skipped, Outcome::Success]
        );
    }

    #[test]
    fn it_honors_the_probability_extremes() {
        let always = Probabilistic::new(1.0, 10);
        let never = Probabilistic::new(0.0, 10);
        for _ in 0..20 {
            assert!(always.should_intercept("example.com"));
            assert!(!never.should_intercept("example.com"));
        }
    }

    #[test]
    fn it_detects_pinning_indicators() {
        assert!(FailureReason("Certificate verify failed".into()).looks_like_pinning());
        assert!(FailureReason("bad certificate".into()).looks_like_pinning());
        assert!(!FailureReason("connection refused".into()).looks_like_pinning());
    }

    #[test]
    fn it_passes_through_known_pinned_hosts() {
        let strategy = PassthroughCache::new(None, &[], 10).unwrap();
        assert!(!strategy.should_intercept("gateway.icloud.com"));
        assert!(!strategy.should_intercept("ACCOUNTS.google.com"));
        assert!(strategy.should_intercept("example.com"));
        assert!(strategy.should_intercept("notapple.com"));
    }

    #[test]
    fn it_passes_through_configured_pinned_hosts() {
        let config = StrategyConfig {
            kind: StrategyKind::PassthroughCache,
            pinned_hosts: vec![r".*\.bank\.example".to_owned()],
            ..Default::default()
        };
        let strategy = from_config(&config).unwrap();
        assert!(!strategy.should_intercept("login.bank.example"));
        assert!(!strategy.should_intercept("gateway.icloud.com"));
        assert!(strategy.should_intercept("bank.example.org"));
    }

    #[test]
    fn it_persists_learned_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passthrough.json");

        let strategy = PassthroughCache::new(Some(path.clone()), &[], 10).unwrap();
        strategy.record("b.example", failure("unknown ca"));
        strategy.record("a.example", failure("bad certificate"));
        strategy.record("c.example", failure("connection refused"));
        assert!(!strategy.should_intercept("a.example"));
        assert!(strategy.should_intercept("c.example"));

        let data = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(
            json["learned_hosts"],
            serde_json::json!(["a.example", "b.example"])
        );

        let reloaded = PassthroughCache::new(Some(path), &[], 10).unwrap();
        assert!(!reloaded.should_intercept("b.example"));
    }
}
