use std::{sync::Arc, time::Duration};

use mastr_client::domain::{Extension, Technology};
use reqwest::header::CONTENT_TYPE;

use super::xml::{envelope, parse_records, RawRecord};
use crate::{
    config::MastrConfig,
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

#[derive(thiserror::Error, Debug)]
pub enum SoapError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("soap fault {code}: {message}")]
    Fault { code: String, message: String },
    #[error("malformed response: {0}")]
    Xml(String),
}

impl SoapError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Fault { code, .. } => is_server_fault(code),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Xml(_) => false,
        }
    }
}

/// Server-side fault codes: SOAP 1.1 `Server` (and dotted subcodes such as
/// `Server.Busy`) or SOAP 1.2 `Receiver`, with any namespace prefix.
fn is_server_fault(code: &str) -> bool {
    let local = code.rsplit(':').next().unwrap_or(code);
    let class = local.split('.').next().unwrap_or(local);
    class.eq_ignore_ascii_case("Server") || class.eq_ignore_ascii_case("Receiver")
}

/// One list request's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Batch(Vec<RawRecord>),
    End,
}

/// Client for the registry's SOAP service. Requests run one at a time;
/// transient failures are retried with linear backoff.
pub struct MastrSoapClient {
    http: reqwest::Client,
    endpoint: String,
    namespace: String,
    api_key: String,
    market_actor: String,
    list_operation: String,
    list_record_tag: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl MastrSoapClient {
    pub fn new(cfg: &MastrConfig) -> Result<Self, SoapError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            namespace: cfg.namespace.clone(),
            api_key: cfg.api_key.clone(),
            market_actor: cfg.market_actor.clone(),
            list_operation: cfg.list_operation.clone(),
            list_record_tag: cfg.list_record_tag.clone(),
            max_retries: cfg.max_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        })
    }

    async fn call_once(
        &self,
        operation: &str,
        params: &[(&str, &str)],
        record_tag: &str,
    ) -> Result<Vec<RawRecord>, SoapError> {
        let mut all = vec![("apiKey", self.api_key.as_str()), ("marktakteurMastrNummer", self.market_actor.as_str())];
        all.extend_from_slice(params);
        let body = envelope(&self.namespace, operation, &all);

        metrics::counter!("mastr_soap_requests_total").increment(1);
        let resp = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}/{}\"", self.namespace, operation))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        // Faults usually arrive with status 500; prefer the fault message.
        if !status.is_success() {
            return match parse_records(&text, record_tag) {
                Err(fault @ SoapError::Fault { .. }) => Err(fault),
                _ => Err(SoapError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(200).collect(),
                }),
            };
        }

        parse_records(&text, record_tag)
    }

    async fn call(
        &self,
        operation: &str,
        params: &[(&str, &str)],
        record_tag: &str,
    ) -> Result<Vec<RawRecord>, SoapError> {
        let mut attempt: u32 = 0;
        loop {
            match self.call_once(operation, params, record_tag).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    metrics::counter!("mastr_soap_retries_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        operation,
                        attempt,
                        "registry request failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, operation, attempt, "registry request failed, giving up");
                    metrics::counter!("mastr_soap_errors_total").increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// List page `page_index` (zero-based) of units of `technology`.
    pub async fn fetch_page(
        &self,
        technology: Technology,
        page_index: usize,
        page_size: usize,
    ) -> Result<Page, SoapError> {
        let start = (page_index * page_size + 1).to_string();
        let limit = page_size.to_string();
        let params = [
            ("energietraeger", technology.energy_carrier()),
            ("startAb", start.as_str()),
            ("limit", limit.as_str()),
        ];

        let records = self
            .call(&self.list_operation, &params, &self.list_record_tag)
            .await?;
        if records.is_empty() {
            Ok(Page::End)
        } else {
            Ok(Page::Batch(records))
        }
    }

    /// Detail record for `key` from `operation` (e.g. `GetEinheitBiomasse`).
    pub async fn fetch_detail(
        &self,
        operation: &str,
        key_param: &str,
        key: &str,
    ) -> Result<Option<RawRecord>, SoapError> {
        let record_tag = format!("{operation}Response");
        let records = self.call(operation, &[(key_param, key)], &record_tag).await?;
        Ok(records.into_iter().next())
    }
}

/// Paginated list of all units of one technology.
pub struct PowerUnitListSource {
    client: Arc<MastrSoapClient>,
    technology: Technology,
    page_size: usize,
    limit: Option<usize>,
    max_consecutive_failures: u32,
}

impl PowerUnitListSource {
    pub fn new(client: Arc<MastrSoapClient>, technology: Technology, cfg: &MastrConfig) -> Self {
        Self {
            client,
            technology,
            page_size: cfg.page_size.max(1),
            limit: cfg.limit,
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
        }
    }
}

#[async_trait::async_trait]
impl Source<RawRecord> for PowerUnitListSource {
    async fn stream(&self) -> EnvelopeStream<RawRecord> {
        let client = self.client.clone();
        let technology = self.technology;
        let page_size = self.page_size;
        let limit = self.limit;
        let max_failures = self.max_consecutive_failures;

        let s = async_stream::stream! {
            let mut page_index: usize = 0;
            let mut emitted: usize = 0;
            let mut failures: u32 = 0;

            loop {
                if limit.is_some_and(|l| emitted >= l) {
                    break;
                }

                match client.fetch_page(technology, page_index, page_size).await {
                    Ok(Page::End) => break,
                    Ok(Page::Batch(records)) => {
                        failures = 0;
                        let n = records.len();
                        metrics::counter!("mastr_records_fetched_total").increment(n as u64);
                        tracing::info!(%technology, page = page_index, records = n, "fetched page");

                        for record in records {
                            if limit.is_some_and(|l| emitted >= l) {
                                break;
                            }
                            emitted += 1;
                            yield Ok(Envelope::new(record));
                        }
                        if n < page_size {
                            break;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        metrics::counter!("mastr_pages_skipped_total").increment(1);
                        tracing::warn!(%technology, page = page_index, error = %e, "page skipped");
                        yield Err(PipelineError::Source(format!("page {page_index} skipped: {e}")));

                        if failures >= max_failures {
                            tracing::error!(
                                %technology,
                                failures,
                                "too many consecutive page failures, stopping pagination"
                            );
                            break;
                        }
                    }
                }

                page_index += 1;
            }
        };

        Box::pin(s)
    }
}

/// One detail lookup per key. A returned record lacking its key column gets
/// the requested key filled in.
pub struct UnitDetailSource {
    client: Arc<MastrSoapClient>,
    operation: String,
    extension: Extension,
    keys: Vec<String>,
}

impl UnitDetailSource {
    pub fn new(client: Arc<MastrSoapClient>, technology: Technology, extension: Extension, keys: Vec<String>) -> Self {
        Self {
            client,
            operation: extension.operation(technology),
            extension,
            keys,
        }
    }
}

#[async_trait::async_trait]
impl Source<RawRecord> for UnitDetailSource {
    async fn stream(&self) -> EnvelopeStream<RawRecord> {
        let client = self.client.clone();
        let operation = self.operation.clone();
        let key_param = self.extension.key_param();
        let key_column = self.extension.key_column();
        let keys = self.keys.clone();

        let s = async_stream::stream! {
            for key in keys {
                match client.fetch_detail(&operation, key_param, &key).await {
                    Ok(Some(mut record)) => {
                        metrics::counter!("mastr_records_fetched_total").increment(1);
                        let slot = record.entry(key_column.to_string()).or_default();
                        if slot.trim().is_empty() {
                            *slot = key.clone();
                        }
                        yield Ok(Envelope::new(record));
                    }
                    Ok(None) => {
                        tracing::warn!(operation = %operation, key = %key, "no detail record returned");
                        yield Err(PipelineError::Source(format!("{operation}: no record for {key}")));
                    }
                    Err(e) => {
                        metrics::counter!("mastr_details_skipped_total").increment(1);
                        tracing::warn!(operation = %operation, key = %key, error = %e, "detail lookup skipped");
                        yield Err(PipelineError::Source(format!("{operation} {key} skipped: {e}")));
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn list_response(keys: &[&str]) -> String {
        let units: String = keys
            .iter()
            .map(|k| format!("<Einheiten><EinheitMastrNummer>{k}</EinheitMastrNummer></Einheiten>"))
            .collect();
        format!(
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\"><s:Body>\
             <GetGefilterteListeStromErzeugerResponse>{units}</GetGefilterteListeStromErzeugerResponse>\
             </s:Body></s:Envelope>"
        )
    }

    #[derive(Clone, Default)]
    struct Fake {
        calls: Arc<AtomicUsize>,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}/")
    }

    fn cfg(endpoint: String, page_size: usize) -> MastrConfig {
        MastrConfig {
            endpoint,
            api_key: "key".to_string(),
            market_actor: "SOM1".to_string(),
            page_size,
            max_retries: 1,
            retry_backoff_ms: 1,
            ..MastrConfig::default()
        }
    }

    async fn paged(State(f): State<Fake>, body: String) -> (StatusCode, String) {
        f.calls.fetch_add(1, Ordering::SeqCst);
        assert!(body.contains("<m:apiKey>key</m:apiKey>"));
        assert!(body.contains("<m:energietraeger>Biomasse</m:energietraeger>"));

        if body.contains("startAb>1<") {
            (StatusCode::OK, list_response(&["A", "B"]))
        } else if body.contains("startAb>3<") {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
        } else if body.contains("startAb>5<") {
            (StatusCode::OK, list_response(&["E"]))
        } else {
            (StatusCode::OK, list_response(&[]))
        }
    }

    #[tokio::test]
    async fn failed_page_is_skipped_and_pagination_continues() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(paged)).with_state(fake.clone())).await;
        let cfg = cfg(url, 2);
        let client = Arc::new(MastrSoapClient::new(&cfg).expect("client"));
        let source = PowerUnitListSource::new(client, Technology::Biomass, &cfg);

        let items: Vec<_> = source.stream().await.collect().await;
        let keys: Vec<String> = items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .map(|e| e.payload["EinheitMastrNummer"].clone())
            .collect();

        assert_eq!(keys, vec!["A", "B", "E"]);
        assert_eq!(items.iter().filter(|i| i.is_err()).count(), 1);
        // page 1, page 2 twice (one retry), page 3 (short, ends the listing)
        assert_eq!(fake.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn limit_truncates_listing() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(paged)).with_state(fake.clone())).await;
        let mut cfg = cfg(url, 2);
        cfg.limit = Some(1);
        let client = Arc::new(MastrSoapClient::new(&cfg).expect("client"));
        let source = PowerUnitListSource::new(client, Technology::Biomass, &cfg);

        let items: Vec<_> = source.stream().await.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    async fn flaky(State(f): State<Fake>) -> (StatusCode, String) {
        if f.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            (StatusCode::SERVICE_UNAVAILABLE, String::new())
        } else {
            (StatusCode::OK, list_response(&["A"]))
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(flaky)).with_state(fake.clone())).await;
        let client = MastrSoapClient::new(&cfg(url, 10)).expect("client");

        let page = client.fetch_page(Technology::Wind, 0, 10).await.expect("page");
        match page {
            Page::Batch(records) => assert_eq!(records[0]["EinheitMastrNummer"], "A"),
            Page::End => panic!("expected a batch"),
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    async fn always_failing(State(f): State<Fake>) -> StatusCode {
        f.calls.fetch_add(1, Ordering::SeqCst);
        StatusCode::BAD_GATEWAY
    }

    #[tokio::test]
    async fn consecutive_failures_stop_pagination() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(always_failing)).with_state(fake.clone())).await;
        let mut cfg = cfg(url, 2);
        cfg.max_retries = 0;
        cfg.max_consecutive_failures = 2;
        let client = Arc::new(MastrSoapClient::new(&cfg).expect("client"));
        let source = PowerUnitListSource::new(client, Technology::Solar, &cfg);

        let items: Vec<_> = source.stream().await.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_err()));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    async fn bad_request(State(f): State<Fake>) -> StatusCode {
        f.calls.fetch_add(1, Ordering::SeqCst);
        StatusCode::BAD_REQUEST
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(bad_request)).with_state(fake.clone())).await;
        let client = MastrSoapClient::new(&cfg(url, 10)).expect("client");

        let err = client.fetch_page(Technology::Hydro, 0, 10).await.unwrap_err();
        assert!(matches!(err, SoapError::Status { status: 400, .. }));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    async fn detail(State(f): State<Fake>, body: String) -> (StatusCode, String) {
        f.calls.fetch_add(1, Ordering::SeqCst);
        if body.contains("einheitMastrNummer>SEE1<") {
            (
                StatusCode::OK,
                "<Envelope><Body><GetEinheitBiomasseResponse>\
                 <Hauptbrennstoff>Biogas</Hauptbrennstoff></GetEinheitBiomasseResponse></Body></Envelope>"
                    .to_string(),
            )
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "<Envelope><Body><Fault><faultcode>s:Client</faultcode>\
                 <faultstring>unbekannte Einheit</faultstring></Fault></Body></Envelope>"
                    .to_string(),
            )
        }
    }

    #[tokio::test]
    async fn detail_source_skips_failed_keys() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(detail)).with_state(fake.clone())).await;
        let client = Arc::new(MastrSoapClient::new(&cfg(url, 10)).expect("client"));
        let source = UnitDetailSource::new(
            client.clone(),
            Technology::Biomass,
            Extension::Unit,
            vec!["SEE1".to_string(), "SEE404".to_string()],
        );

        let items: Vec<_> = source.stream().await.collect().await;
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().expect("first record");
        assert_eq!(first.payload["Hauptbrennstoff"], "Biogas");
        assert_eq!(first.payload["EinheitMastrNummer"], "SEE1");
        assert!(matches!(items[1], Err(PipelineError::Source(_))));

        let err = client
            .fetch_detail("GetEinheitBiomasse", "einheitMastrNummer", "SEE404")
            .await
            .unwrap_err();
        assert!(matches!(err, SoapError::Fault { ref message, .. } if message == "unbekannte Einheit"));
        // client faults are final: one call per unknown key, no retries
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    async fn busy_then_ok(State(f): State<Fake>) -> (StatusCode, String) {
        if f.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "<Envelope><Body><Fault><faultcode>soap:Server.Busy</faultcode>\
                 <faultstring>Dienst ausgelastet</faultstring></Fault></Body></Envelope>"
                    .to_string(),
            )
        } else {
            (StatusCode::OK, list_response(&["A"]))
        }
    }

    #[tokio::test]
    async fn server_fault_is_retried() {
        let fake = Fake::default();
        let url = serve(Router::new().route("/", post(busy_then_ok)).with_state(fake.clone())).await;
        let client = MastrSoapClient::new(&cfg(url, 10)).expect("client");

        let page = client.fetch_page(Technology::Biomass, 0, 10).await.expect("page");
        assert!(matches!(page, Page::Batch(ref r) if r.len() == 1));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fault_classes() {
        assert!(is_server_fault("soap:Server"));
        assert!(is_server_fault("Server.Overloaded"));
        assert!(is_server_fault("env:Receiver"));
        assert!(!is_server_fault("s:Client"));
        assert!(!is_server_fault(""));
    }
}
