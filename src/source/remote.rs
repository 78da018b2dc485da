//! SPARQL protocol client exposed as a source adapter.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{SourceError, SourceErrorKind};
use crate::model::vocab::xsd;
use crate::model::{Binding, GraphPattern, Iri, Literal, QuadPattern, Term, TermPattern, Variable};
use crate::source::{Capabilities, QuadScan, SourceAdapter};

const RESULTS_JSON: &str = "application/sparql-results+json";

/// Failure of one HTTP exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable detail.
    pub message: String,
    /// Whether retrying the same request may succeed.
    pub transient: bool,
}

impl TransportError {
    /// Error worth retrying (timeouts, connection resets, 5xx, 429).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Error that will not go away on retry.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Minimal HTTP surface the endpoint client needs.
pub trait HttpTransport: Send + Sync {
    /// Sends `query` to `endpoint` with a SPARQL protocol GET and returns the
    /// response body.
    fn get(
        &self,
        endpoint: &str,
        query: &str,
        accept: &str,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError>;
}

/// Blocking `reqwest` transport.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Builds a client with default TLS settings.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("sparrow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::fatal(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(
        &self,
        endpoint: &str,
        query: &str,
        accept: &str,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let url = reqwest::Url::parse_with_params(endpoint, &[("query", query)])
            .map_err(|err| TransportError::fatal(format!("invalid endpoint url: {err}")))?;
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, accept);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().map_err(|err| {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                TransportError::transient(err.to_string())
            } else {
                TransportError::fatal(err.to_string())
            }
        })?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::transient(format!("endpoint answered {status}")));
        }
        if !status.is_success() {
            return Err(TransportError::fatal(format!("endpoint answered {status}")));
        }
        response
            .text()
            .map_err(|err| TransportError::transient(err.to_string()))
    }
}

/// Paging, retry and timeout settings of a remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteOptions {
    /// Rows requested per page.
    pub page_size: usize,
    /// Retries after a transient failure.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Per-request HTTP timeout. Also caps a single retry delay.
    pub timeout: Option<Duration>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            retries: 2,
            retry_backoff: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RemoteOptions {
    /// Caps the HTTP timeout by a query's time budget.
    pub fn bounded_by(mut self, budget: Option<Duration>) -> Self {
        if let Some(budget) = budget {
            self.timeout = Some(self.timeout.map_or(budget, |timeout| timeout.min(budget)));
        }
        self
    }

    /// Delay before retry number `attempt` (starting at 1).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.retry_backoff.saturating_mul(factor);
        self.timeout.map_or(delay, |timeout| delay.min(timeout))
    }
}

struct Client {
    name: String,
    endpoint: String,
    options: RemoteOptions,
    transport: Arc<dyn HttpTransport>,
}

impl Client {
    fn error(&self, message: impl Into<String>) -> SourceError {
        SourceError::new(&self.name, SourceErrorKind::Remote, message)
    }

    fn fetch(&self, query: &str) -> Result<Vec<HashMap<String, JsonTerm>>, SourceError> {
        let mut attempt = 0;
        let body = loop {
            match self
                .transport
                .get(&self.endpoint, query, RESULTS_JSON, self.options.timeout)
            {
                Ok(body) => break body,
                Err(err) if err.transient && attempt < self.options.retries => {
                    attempt += 1;
                    let delay = self.options.retry_delay(attempt);
                    warn!(
                        source = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "source.remote.retry"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(self.error(err.message)),
            }
        };
        let results: JsonResults = serde_json::from_str(&body)
            .map_err(|err| self.error(format!("malformed results document: {err}")))?;
        Ok(results.results.bindings)
    }
}

#[derive(Deserialize)]
struct JsonResults {
    results: JsonBindings,
}

#[derive(Deserialize)]
struct JsonBindings {
    bindings: Vec<HashMap<String, JsonTerm>>,
}

#[derive(Deserialize)]
struct JsonTerm {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(rename = "xml:lang")]
    lang: Option<String>,
    datatype: Option<String>,
}

impl JsonTerm {
    fn into_term(self) -> Option<Term> {
        Some(match self.kind.as_str() {
            "uri" => Term::iri(self.value),
            "bnode" => Term::blank(self.value),
            "literal" | "typed-literal" => Term::Literal(match (self.lang, self.datatype) {
                (Some(lang), _) => Literal::lang(self.value, &lang),
                (None, Some(datatype)) if datatype != xsd::STRING => {
                    Literal::typed(self.value, Iri::new(datatype))
                }
                _ => Literal::simple(self.value),
            }),
            _ => return None,
        })
    }
}

/// Remote SPARQL endpoint queried one pattern at a time.
///
/// Scans page through results with `LIMIT`/`OFFSET` under a stable
/// `ORDER BY`; estimates come from `COUNT(*)`. Remote scans are treated as
/// unbounded, so the planner never materialises them for a hash join.
#[derive(Clone)]
pub struct SparqlEndpoint {
    client: Arc<Client>,
}

impl std::fmt::Debug for SparqlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparqlEndpoint")
            .field("endpoint", &self.client.endpoint)
            .field("options", &self.client.options)
            .finish()
    }
}

impl SparqlEndpoint {
    /// Client for `endpoint` over the default `reqwest` transport.
    pub fn new(endpoint: impl Into<String>, options: RemoteOptions) -> Result<Self, SourceError> {
        let endpoint = endpoint.into();
        let transport = ReqwestTransport::new()
            .map_err(|err| SourceError::new(&endpoint, SourceErrorKind::Resolution, err.message))?;
        Ok(Self::with_transport(endpoint, options, Arc::new(transport)))
    }

    /// Client for `endpoint` over a caller-supplied transport.
    pub fn with_transport(
        endpoint: impl Into<String>,
        options: RemoteOptions,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            client: Arc::new(Client {
                name: endpoint.clone(),
                endpoint,
                options,
                transport,
            }),
        }
    }

    /// Settings in effect.
    pub fn options(&self) -> &RemoteOptions {
        &self.client.options
    }
}

impl SourceAdapter for SparqlEndpoint {
    fn name(&self) -> &str {
        &self.client.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full_scan()
    }

    fn count(&self, pattern: &QuadPattern) -> Result<u64, SourceError> {
        let Some(remote) = RemotePattern::new(pattern) else {
            return Ok(0);
        };
        let query = format!("SELECT (COUNT(*) AS ?count) WHERE {{ {} }}", remote.group);
        let rows = self.client.fetch(&query)?;
        rows.into_iter()
            .next()
            .and_then(|mut row| row.remove("count"))
            .and_then(|term| term.value.parse::<u64>().ok())
            .ok_or_else(|| self.client.error("count query returned no number"))
    }

    fn scan(&self, pattern: &QuadPattern) -> Result<QuadScan, SourceError> {
        let Some(remote) = RemotePattern::new(pattern) else {
            debug!(source = %self.client.name, "source.remote.blank_constant");
            return Ok(Box::new(std::iter::empty()));
        };
        let mut query = format!("SELECT * WHERE {{ {} }}", remote.group);
        if !remote.variables.is_empty() {
            query.push_str(" ORDER BY");
            for (name, _) in &remote.variables {
                let _ = write!(query, " ?{name}");
            }
        }
        Ok(Box::new(RemoteScan {
            client: Arc::clone(&self.client),
            query,
            variables: remote.variables,
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn is_bounded(&self) -> bool {
        false
    }
}

/// A pattern rewritten as a SPARQL group with portable variable names.
struct RemotePattern {
    group: String,
    /// Remote name and the pattern variable it stands for.
    variables: Vec<(String, Variable)>,
}

impl RemotePattern {
    /// `None` when a slot holds a blank node, whose label means nothing to
    /// the endpoint.
    fn new(pattern: &QuadPattern) -> Option<Self> {
        let mut variables: Vec<(String, Variable)> = Vec::new();
        let mut slot = |slot: &TermPattern| -> Option<String> {
            match slot {
                TermPattern::Term(term) => term_syntax(term),
                TermPattern::Variable(var) => Some(format!("?{}", remote_name(&mut variables, var))),
            }
        };
        let triple = format!(
            "{} {} {} .",
            slot(&pattern.subject)?,
            slot(&pattern.predicate)?,
            slot(&pattern.object)?
        );
        let group = match &pattern.graph {
            GraphPattern::DefaultGraph => triple,
            GraphPattern::Named(iri) => format!("GRAPH <{}> {{ {triple} }}", iri.as_str()),
            GraphPattern::Variable(var) => {
                format!("GRAPH ?{} {{ {triple} }}", remote_name(&mut variables, var))
            }
        };
        Some(Self { group, variables })
    }
}

fn remote_name(variables: &mut Vec<(String, Variable)>, var: &Variable) -> String {
    if let Some((name, _)) = variables.iter().find(|(_, known)| known == var) {
        return name.clone();
    }
    let name = format!("v{}", variables.len());
    variables.push((name.clone(), var.clone()));
    name
}

fn term_syntax(term: &Term) -> Option<String> {
    match term {
        Term::Iri(iri) => Some(format!("<{}>", iri.as_str())),
        Term::BlankNode(_) => None,
        Term::Literal(literal) => {
            let mut out = String::with_capacity(literal.value().len() + 2);
            out.push('"');
            for ch in literal.value().chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(ch),
                }
            }
            out.push('"');
            match literal.language() {
                Some(lang) => {
                    out.push('@');
                    out.push_str(lang);
                }
                None if literal.datatype().as_str() != xsd::STRING => {
                    let _ = write!(out, "^^<{}>", literal.datatype().as_str());
                }
                None => {}
            }
            Some(out)
        }
    }
}

struct RemoteScan {
    client: Arc<Client>,
    query: String,
    variables: Vec<(String, Variable)>,
    offset: usize,
    buffer: VecDeque<Binding>,
    done: bool,
}

impl RemoteScan {
    fn fetch_page(&mut self) -> Result<(), SourceError> {
        let page_size = self.client.options.page_size.max(1);
        let query = format!("{} LIMIT {page_size} OFFSET {}", self.query, self.offset);
        let rows = self.client.fetch(&query)?;
        debug!(
            source = %self.client.name,
            offset = self.offset,
            rows = rows.len(),
            "source.remote.page"
        );
        if rows.len() < page_size {
            self.done = true;
        }
        self.offset += rows.len();
        for mut row in rows {
            let mut binding = Binding::new();
            for (name, var) in &self.variables {
                let term = row
                    .remove(name)
                    .and_then(JsonTerm::into_term)
                    .ok_or_else(|| self.client.error(format!("result row lacks ?{name}")))?;
                binding.insert(var.clone(), term);
            }
            self.buffer.push_back(binding);
        }
        Ok(())
    }
}

impl Iterator for RemoteScan {
    type Item = Result<Binding, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.done {
            if let Err(err) = self.fetch_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Transport answering from a script of canned responses.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<String, TransportError>>>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn get(
            &self,
            _endpoint: &str,
            query: &str,
            _accept: &str,
            _timeout: Option<Duration>,
        ) -> Result<String, TransportError> {
            self.queries.lock().push(query.to_owned());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::fatal("script exhausted")))
        }
    }

    fn page(subjects: &[&str]) -> Result<String, TransportError> {
        let bindings: Vec<_> = subjects
            .iter()
            .map(|s| serde_json::json!({ "v0": { "type": "uri", "value": s } }))
            .collect();
        Ok(serde_json::json!({
            "head": { "vars": ["v0"] },
            "results": { "bindings": bindings }
        })
        .to_string())
    }

    fn typed_pattern() -> QuadPattern {
        QuadPattern::new(
            TermPattern::Variable(Variable::hidden("b", 0)),
            Term::iri("http://www.w3.org/1999/02/22-rdf-syntax-ns#type"),
            Term::iri("http://ex/Person"),
        )
    }

    fn endpoint(transport: Arc<ScriptedTransport>, page_size: usize) -> SparqlEndpoint {
        let options = RemoteOptions {
            page_size,
            retries: 1,
            retry_backoff: Duration::from_millis(1),
            timeout: None,
        };
        SparqlEndpoint::with_transport("http://remote/sparql", options, transport)
    }

    #[test]
    fn pages_until_short_page() {
        let transport = ScriptedTransport::new(vec![
            page(&["http://ex/a", "http://ex/b"]),
            page(&["http://ex/c"]),
        ]);
        let source = endpoint(Arc::clone(&transport), 2);
        let rows = source
            .scan(&typed_pattern())
            .expect("scan")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get(&Variable::hidden("b", 0)), Some(&Term::iri("http://ex/c")));
        let queries = transport.queries.lock();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].ends_with("ORDER BY ?v0 LIMIT 2 OFFSET 0"));
        assert!(queries[1].ends_with("LIMIT 2 OFFSET 2"));
    }

    #[test]
    fn transient_failure_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::transient("connection reset")),
            page(&["http://ex/a"]),
        ]);
        let source = endpoint(transport, 10);
        let rows: Vec<_> = source.scan(&typed_pattern()).expect("scan").collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_ok());
    }

    #[test]
    fn exhausted_retries_end_scan_with_error() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::transient("503")),
            Err(TransportError::transient("503")),
        ]);
        let source = endpoint(transport, 10);
        let mut scan = source.scan(&typed_pattern()).expect("scan");
        let err = scan.next().expect("item").expect_err("failure");
        assert_eq!(err.kind, SourceErrorKind::Remote);
        assert!(scan.next().is_none());
    }

    #[test]
    fn count_reads_count_binding() {
        let body = serde_json::json!({
            "results": { "bindings": [ { "count": {
                "type": "literal",
                "value": "42",
                "datatype": "http://www.w3.org/2001/XMLSchema#integer"
            } } ] }
        })
        .to_string();
        let transport = ScriptedTransport::new(vec![Ok(body)]);
        let source = endpoint(Arc::clone(&transport), 10);
        assert_eq!(source.count(&typed_pattern()).expect("count"), 42);
        assert!(transport.queries.lock()[0].starts_with("SELECT (COUNT(*) AS ?count)"));
    }

    #[test]
    fn literals_are_escaped_in_patterns() {
        let pattern = QuadPattern::new(
            TermPattern::Variable(Variable::new("s")),
            Term::iri("http://ex/says"),
            Term::Literal(Literal::simple("a \"quoted\" word")),
        );
        let remote = RemotePattern::new(&pattern).expect("no blank nodes");
        assert_eq!(
            remote.group,
            "?v0 <http://ex/says> \"a \\\"quoted\\\" word\" ."
        );
    }

    #[test]
    fn retry_delay_doubles_within_timeout() {
        let options = RemoteOptions {
            retry_backoff: Duration::from_millis(100),
            timeout: Some(Duration::from_millis(350)),
            ..RemoteOptions::default()
        };
        assert_eq!(options.retry_delay(1), Duration::from_millis(100));
        assert_eq!(options.retry_delay(2), Duration::from_millis(200));
        assert_eq!(options.retry_delay(3), Duration::from_millis(350));
        assert_eq!(options.retry_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn retries_wait_before_asking_again() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::transient("connection reset")),
            page(&["http://ex/a"]),
        ]);
        let options = RemoteOptions {
            page_size: 10,
            retries: 1,
            retry_backoff: Duration::from_millis(40),
            timeout: None,
        };
        let source = SparqlEndpoint::with_transport("http://remote/sparql", options, transport);
        let started = std::time::Instant::now();
        let rows: Vec<_> = source.scan(&typed_pattern()).expect("scan").collect();
        assert_eq!(rows.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn timeout_is_capped_by_budget() {
        let options = RemoteOptions::default().bounded_by(Some(Duration::from_secs(2)));
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    }
}
