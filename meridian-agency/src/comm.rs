//! Failover-aware agency client.
//!
//! Keeps a deque of known agency endpoints with the presumed leader at the
//! head. Requests rotate through endpoints on connection errors, adopt
//! leader hints and redirects, and — crucially — convert a timed-out write
//! into an inquiry by client id, so a write whose reply was lost is never
//! blindly resubmitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio::time::Instant;

use crate::agent::InquireResult;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::store::WriteTransaction;
use crate::LogIndex;

pub const API_READ: &str = "/_api/agency/read";
pub const API_WRITE: &str = "/_api/agency/write";
pub const API_TRANSACT: &str = "/_api/agency/transact";
pub const API_TRANSIENT: &str = "/_api/agency/transient";
pub const API_INQUIRE: &str = "/_api/agency/inquire";
pub const API_POLL: &str = "/_api/agency/poll";
pub const API_CONFIG: &str = "/_api/agency/config";
pub const API_STATE: &str = "/_api/agency/state";
pub const API_STORES: &str = "/_api/agency/stores";

/// What a timeout means for the request at hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// Idempotent; retry on any endpoint with a fresh attempt.
    Read,
    /// Effectful; a timeout switches to an inquiry by client id.
    Write,
    /// The caller handles timeouts itself.
    Custom,
}

/// Transport-level failures, distinguished because they drive different
/// recovery strategies.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("request timed out")]
    Timeout,
}

/// One transport-level response. Status codes follow the HTTP convention
/// without this layer doing any HTTP itself.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    /// Endpoint of the current leader, on a 503.
    pub leader_hint: Option<String>,
    /// Redirect target, on a 307.
    pub redirect: Option<String>,
    pub body: Value,
}

/// The seam to the actual request machinery (HTTP in production, an
/// in-process router in tests).
#[async_trait]
pub trait AgencyTransport: Send + Sync + 'static {
    async fn request(
        &self,
        endpoint: &str,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// The failover-aware client.
pub struct AsyncAgencyComm<T: AgencyTransport> {
    endpoints: Mutex<VecDeque<String>>,
    transport: Arc<T>,
}

impl<T: AgencyTransport> AsyncAgencyComm<T> {
    pub fn new(endpoints: Vec<String>, transport: Arc<T>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints.into()),
            transport,
        }
    }

    async fn current_endpoint(&self) -> AgencyResult<String> {
        let endpoints = self.endpoints.lock().await;
        endpoints.front().cloned().ok_or(AgencyError::NotLeader { leader: None })
    }

    /// Rotate the head endpoint to the back.
    async fn rotate(&self) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(head) = endpoints.pop_front() {
            endpoints.push_back(head);
        }
    }

    /// Make `endpoint` the new head, keeping the deque duplicate-free.
    async fn adopt_head(&self, endpoint: String) {
        let mut endpoints = self.endpoints.lock().await;
        endpoints.retain(|e| e != &endpoint);
        endpoints.push_front(endpoint);
    }

    /// The failover request loop.
    #[tracing::instrument(level = "debug", skip(self, body), fields(path = path, kind = ?request_type))]
    pub async fn send_with_failover(
        &self,
        path: &str,
        body: Value,
        timeout: Duration,
        request_type: RequestType,
        client_ids: &[String],
    ) -> AgencyResult<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(AgencyError::Timeout);
            }
            let endpoint = self.current_endpoint().await?;
            let attempt_timeout = deadline - now;

            match self.transport.request(&endpoint, path, body.clone(), attempt_timeout).await {
                Ok(res) if res.status == 200 => return Ok(res.body),
                Ok(res) if res.status == 503 => {
                    match res.leader_hint {
                        Some(hint) => {
                            tracing::debug!(hint = %hint, "adopting leader hint");
                            self.adopt_head(hint).await;
                        }
                        None => self.rotate().await,
                    }
                    sleep(Duration::from_millis(10)).await;
                }
                Ok(res) if res.status == 307 => match res.redirect {
                    Some(target) => {
                        tracing::debug!(target = %target, "following redirect");
                        self.adopt_head(target).await;
                    }
                    None => self.rotate().await,
                },
                Ok(res) if res.status == 403 => {
                    return Err(AgencyError::IdReassignmentDenied);
                }
                Ok(res) => {
                    return Err(AgencyError::MalformedTransaction(format!(
                        "unexpected status {} from agency",
                        res.status
                    )));
                }
                Err(TransportError::Connection(err)) => {
                    tracing::debug!(error = %err, endpoint = %endpoint, "connection error, rotating");
                    self.rotate().await;
                    sleep(Duration::from_millis(10)).await;
                }
                Err(TransportError::Timeout) => match request_type {
                    RequestType::Read => {
                        tracing::debug!("read timed out, retrying on next endpoint");
                        self.rotate().await;
                    }
                    RequestType::Write => {
                        tracing::debug!("write timed out, switching to inquiry");
                        return Box::pin(self.inquire_until(client_ids, deadline)).await;
                    }
                    RequestType::Custom => return Err(AgencyError::Timeout),
                },
            }
        }
    }

    /// The write-timeout recovery loop: ask the cluster which indexes the
    /// log holds for our client ids, and adopt whatever it reports.
    async fn inquire_until(&self, client_ids: &[String], deadline: Instant) -> AgencyResult<Value> {
        if client_ids.is_empty() {
            return Err(AgencyError::Timeout);
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(AgencyError::Timeout);
            }
            let body = json!(client_ids);
            match self
                .send_with_failover(API_INQUIRE, body, deadline - now, RequestType::Read, &[])
                .await
            {
                Ok(res) => {
                    let found = res
                        .get("indexes")
                        .and_then(Value::as_object)
                        .map(|m| !m.is_empty())
                        .unwrap_or(false);
                    if found {
                        return Ok(json!({ "inquired": true, "results": res["indexes"] }));
                    }
                    // The write may still be in flight somewhere; give it a
                    // moment before asking again.
                    sleep(Duration::from_millis(100)).await;
                }
                Err(AgencyError::Timeout) => return Err(AgencyError::Timeout),
                Err(err) => return Err(err),
            }
        }
    }

    /// Batch read.
    pub async fn read(&self, queries: Vec<Vec<String>>, timeout: Duration) -> AgencyResult<Value> {
        self.send_with_failover(API_READ, json!(queries), timeout, RequestType::Read, &[]).await
    }

    /// Submit write transactions, recovering lost replies by inquiry.
    pub async fn write(&self, trxs: Vec<WriteTransaction>, timeout: Duration) -> AgencyResult<Value> {
        let client_ids: Vec<String> = trxs.iter().filter_map(|t| t.client_id.clone()).collect();
        let body = Value::Array(trxs.iter().map(WriteTransaction::to_value).collect());
        self.send_with_failover(API_WRITE, body, timeout, RequestType::Write, &client_ids).await
    }

    /// Ask for the log indexes recorded for the given client ids.
    pub async fn inquire(&self, client_ids: Vec<String>, timeout: Duration) -> AgencyResult<InquireResult> {
        let res = self
            .send_with_failover(API_INQUIRE, json!(client_ids), timeout, RequestType::Read, &[])
            .await?;
        serde_json::from_value(res).map_err(|e| AgencyError::MalformedTransaction(e.to_string()))
    }

    /// Long-poll for log entries past `index`.
    pub async fn poll(&self, index: LogIndex, poll_timeout: Duration) -> AgencyResult<Value> {
        let body = json!({ "index": index, "timeout": poll_timeout.as_secs_f64() });
        self.send_with_failover(
            API_POLL,
            body,
            poll_timeout + Duration::from_secs(5),
            RequestType::Custom,
            &[],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;

    /// A transport whose behavior per endpoint is scripted.
    struct ScriptedTransport {
        script: StdMutex<Vec<(String, Result<TransportResponse, TransportError>)>>,
        log: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(&str, Result<TransportResponse, TransportError>)>) -> Self {
            Self {
                script: StdMutex::new(
                    script.into_iter().map(|(e, r)| (e.to_string(), r)).rev().collect(),
                ),
                log: StdMutex::new(Vec::new()),
            }
        }

        fn ok(body: Value) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                leader_hint: None,
                redirect: None,
                body,
            })
        }

        fn not_leader(hint: &str) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 503,
                leader_hint: Some(hint.to_string()),
                redirect: None,
                body: Value::Null,
            })
        }
    }

    #[async_trait]
    impl AgencyTransport for ScriptedTransport {
        async fn request(
            &self,
            endpoint: &str,
            _path: &str,
            _body: Value,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            self.log.lock().unwrap().push(endpoint.to_string());
            let mut script = self.script.lock().unwrap();
            let (expected, result) = script.pop().expect("transport script exhausted");
            assert_eq!(expected, endpoint, "unexpected endpoint order");
            result
        }
    }

    fn comm(transport: ScriptedTransport, endpoints: &[&str]) -> AsyncAgencyComm<ScriptedTransport> {
        AsyncAgencyComm::new(
            endpoints.iter().map(|s| s.to_string()).collect(),
            Arc::new(transport),
        )
    }

    #[tokio::test]
    async fn rotates_on_connection_error() {
        let transport = ScriptedTransport::new(vec![
            ("tcp://a", Err(TransportError::Connection("refused".into()))),
            ("tcp://b", ScriptedTransport::ok(json!({"v": 1}))),
        ]);
        let comm = comm(transport, &["tcp://a", "tcp://b"]);
        let res = comm
            .read(vec![vec!["/k".to_string()]], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(res, json!({"v": 1}));
    }

    #[tokio::test]
    async fn adopts_leader_hint_on_503() {
        let transport = ScriptedTransport::new(vec![
            ("tcp://a", ScriptedTransport::not_leader("tcp://c")),
            ("tcp://c", ScriptedTransport::ok(json!({"v": 2}))),
        ]);
        let comm = comm(transport, &["tcp://a", "tcp://b", "tcp://c"]);
        let res = comm
            .read(vec![vec!["/k".to_string()]], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(res, json!({"v": 2}));
        // The hinted leader stays at the head for the next request.
        assert_eq!(comm.current_endpoint().await.unwrap(), "tcp://c");
    }

    #[tokio::test]
    async fn write_timeout_switches_to_inquiry() {
        let transport = ScriptedTransport::new(vec![
            ("tcp://a", Err(TransportError::Timeout)),
            (
                "tcp://a",
                ScriptedTransport::ok(json!({"indexes": {"cid-1": [7]}})),
            ),
        ]);
        let comm = comm(transport, &["tcp://a"]);
        let trx = WriteTransaction::single_set("/k", json!("v")).with_client_id("cid-1");
        let res = comm.write(vec![trx], Duration::from_secs(5)).await.unwrap();
        assert_eq!(res["inquired"], json!(true));
        assert_eq!(res["results"]["cid-1"], json!([7]));
    }

    #[tokio::test]
    async fn custom_timeout_propagates() {
        let transport = ScriptedTransport::new(vec![("tcp://a", Err(TransportError::Timeout))]);
        let comm = comm(transport, &["tcp://a"]);
        let res = comm.poll(3, Duration::from_millis(50)).await;
        assert!(matches!(res, Err(AgencyError::Timeout)));
    }
}
