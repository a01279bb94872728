use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use churn_feedback_core::{ChurnLabel, FeedbackError, PredictionClient, PredictionResponse};
use serde_json::{json, Value};

pub const DEFAULT_PREDICTION_TIMEOUT_MS: u64 = 5_000;

/// Posts feature payloads to the external prediction service as JSON.
#[derive(Debug, Clone)]
pub struct HttpPredictionClient {
    url: String,
    agent: ureq::Agent,
}

impl HttpPredictionClient {
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when `url` is not an
    /// http(s) URL.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FeedbackError> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FeedbackError::Configuration(format!(
                "prediction url MUST start with http:// or https://, got '{url}'"
            )));
        }

        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }
}

impl PredictionClient for HttpPredictionClient {
    fn predict(&self, payload: &Value) -> Result<PredictionResponse, FeedbackError> {
        let request = self
            .agent
            .request("POST", &self.url)
            .set("content-type", "application/json");

        let body = match request.send_json(payload) {
            Ok(response) => response.into_json::<Value>().map_err(|err| {
                FeedbackError::Upstream(format!("prediction service returned non-JSON body: {err}"))
            })?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(FeedbackError::Upstream(format!(
                    "prediction service returned http status {code}"
                )));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(FeedbackError::Upstream(format!(
                    "prediction service transport failure: {err}"
                )));
            }
        };

        PredictionResponse::from_json(body)
    }
}

/// In-process stand-in for the prediction service.
#[derive(Debug, Default)]
pub struct StaticPredictionClient {
    body: Option<Value>,
    calls: AtomicU64,
}

impl StaticPredictionClient {
    /// Answers every request with the body shape the prediction service
    /// produces for `prediction`.
    #[must_use]
    pub fn new(prediction: ChurnLabel) -> Self {
        let body = if prediction == ChurnLabel::ONE {
            json!({
                "message": "No Churning",
                "prediction": 1,
                "explanation": [],
                "coupons": 0,
                "cashback": 0,
            })
        } else {
            json!({
                "message": "Churning Possible",
                "prediction": 0,
                "explanation": [],
                "coupons": 2,
                "cashback": 150,
            })
        };
        Self::with_body(body)
    }

    #[must_use]
    pub fn with_body(body: Value) -> Self {
        Self {
            body: Some(body),
            calls: AtomicU64::new(0),
        }
    }

    /// Fails every request as an unreachable service would.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PredictionClient for StaticPredictionClient {
    fn predict(&self, _payload: &Value) -> Result<PredictionResponse, FeedbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.body {
            Some(body) => PredictionResponse::from_json(body.clone()),
            None => Err(FeedbackError::Upstream(
                "prediction service transport failure: connection refused".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use super::*;

    const CHURNING_REPLY: &str = concat!(
        r#"{"message":"Churning Possible","prediction":0,"#,
        r#""explanation":[[0.2]],"coupons":3,"cashback":120}"#
    );

    /// Serves exactly one HTTP response and hands back the request body.
    fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(value) => value,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(value) => value,
            Err(err) => panic!("failed to read listener address: {err}"),
        };

        let handle = std::thread::spawn(move || {
            let (stream, _) = match listener.accept() {
                Ok(value) => value,
                Err(err) => panic!("failed to accept test connection: {err}"),
            };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0_usize;
            loop {
                let mut line = String::new();
                if let Err(err) = reader.read_line(&mut line) {
                    panic!("failed to read request line: {err}");
                }
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                if let Some((name, value)) = trimmed.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or_default();
                    }
                }
            }
            let mut request_body = vec![0_u8; content_length];
            if let Err(err) = reader.read_exact(&mut request_body) {
                panic!("failed to read request body: {err}");
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\n\
                 content-type: application/json\r\n\
                 content-length: {}\r\n\
                 connection: close\r\n\r\n{body}",
                body.len()
            );
            let mut stream = reader.into_inner();
            if let Err(err) = stream.write_all(response.as_bytes()) {
                panic!("failed to write test response: {err}");
            }
            String::from_utf8_lossy(&request_body).into_owned()
        });

        (format!("http://{addr}/predict"), handle)
    }

    fn client(url: &str) -> HttpPredictionClient {
        match HttpPredictionClient::new(url, Duration::from_millis(2_000)) {
            Ok(value) => value,
            Err(err) => panic!("failed to build client: {err}"),
        }
    }

    fn join(handle: JoinHandle<String>) -> String {
        match handle.join() {
            Ok(value) => value,
            Err(err) => panic!("test server panicked: {err:?}"),
        }
    }

    #[test]
    fn http_client_parses_prediction_and_forwards_payload() {
        let (url, server) = one_shot_server("200 OK", CHURNING_REPLY);

        let response = match client(&url).predict(&json!({"tenure": "4", "customer_id": 42})) {
            Ok(value) => value,
            Err(err) => panic!("prediction failed: {err}"),
        };
        assert_eq!(response.prediction, ChurnLabel::ZERO);
        assert_eq!(response.coupons, Some(3.0));
        assert_eq!(response.raw["message"], json!("Churning Possible"));

        let forwarded: Value = match serde_json::from_str(&join(server)) {
            Ok(value) => value,
            Err(err) => panic!("server saw invalid JSON: {err}"),
        };
        assert_eq!(forwarded["customer_id"], json!(42));
    }

    #[test]
    fn http_client_maps_error_status_to_upstream() {
        let (url, server) = one_shot_server("500 Internal Server Error", r#"{"error":"boom"}"#);
        let result = client(&url).predict(&json!({}));
        join(server);
        assert!(matches!(result, Err(FeedbackError::Upstream(message)) if message.contains("500")));
    }

    #[test]
    fn http_client_rejects_body_without_prediction() {
        let (url, server) = one_shot_server("200 OK", r#"{"error":"Missing fields: tenure"}"#);
        let result = client(&url).predict(&json!({}));
        join(server);
        assert!(matches!(result, Err(FeedbackError::Upstream(_))));
    }

    #[test]
    fn http_client_reports_transport_failure() {
        let reserved = TcpListener::bind("127.0.0.1:0").and_then(|listener| listener.local_addr());
        let addr = match reserved {
            Ok(value) => value,
            Err(err) => panic!("failed to reserve port: {err}"),
        };
        let result = client(&format!("http://{addr}/predict")).predict(&json!({}));
        assert!(matches!(result, Err(FeedbackError::Upstream(_))));
    }

    #[test]
    fn http_client_requires_http_url() {
        let result = HttpPredictionClient::new("ftp://models", Duration::from_secs(1));
        assert!(matches!(result, Err(FeedbackError::Configuration(_))));
    }

    #[test]
    fn static_client_mirrors_prediction_service_shape() {
        let churning = StaticPredictionClient::new(ChurnLabel::ZERO);
        let response = match churning.predict(&json!({})) {
            Ok(value) => value,
            Err(err) => panic!("static prediction failed: {err}"),
        };
        assert_eq!(response.raw["message"], json!("Churning Possible"));
        assert_eq!(churning.call_count(), 1);

        let unavailable = StaticPredictionClient::unavailable();
        assert!(matches!(
            unavailable.predict(&json!({})),
            Err(FeedbackError::Upstream(_))
        ));
    }
}
