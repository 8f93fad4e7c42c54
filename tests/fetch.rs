use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use taxon_enricher::error::ErrorClass;
use taxon_enricher::fetch::{
    FetchError, Fetcher, RawResponse, RetryPolicy, Transport, TransportError,
};

type Reply = Result<RawResponse, TransportError>;

/// Replays queued replies in order, then repeats `fallback` forever.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<usize>,
    posts: Mutex<Vec<(String, Value, Option<String>)>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: Mutex::new(0),
            posts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, _url: &str, _query: &[(&str, &str)]) -> Result<RawResponse, TransportError> {
        *self.calls.lock().unwrap() += 1;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<RawResponse, TransportError> {
        self.posts.lock().unwrap().push((
            url.to_string(),
            body.clone(),
            bearer.map(str::to_string),
        ));
        self.fallback.clone()
    }
}

fn status(code: u16) -> Reply {
    Ok(RawResponse {
        status: code,
        body: String::new(),
    })
}

fn body(code: u16, text: &str) -> Reply {
    Ok(RawResponse {
        status: code,
        body: text.to_string(),
    })
}

fn fetcher(transport: Arc<ScriptedTransport>) -> Fetcher {
    Fetcher::new(
        transport,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        },
    )
}

#[test]
fn not_found_is_not_retried() {
    let transport = ScriptedTransport::new(vec![], status(404));
    let err = fetcher(transport.clone())
        .get_json("https://api.gbif.org/v1/species/0", &[])
        .unwrap_err();

    assert_matches!(err, FetchError::NotFound { .. });
    assert_eq!(err.class(), ErrorClass::Terminal);
    assert_eq!(transport.calls(), 1);
}

#[test]
fn timeout_is_retried_up_to_max_attempts() {
    let transport = ScriptedTransport::new(
        vec![],
        Err(TransportError::Timeout("deadline elapsed".to_string())),
    );
    let err = fetcher(transport.clone())
        .get_text("https://api.inaturalist.org/v1/observations", &[])
        .unwrap_err();

    assert_matches!(err, FetchError::Transient { attempts: 3, .. });
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(transport.calls(), 3);
}

#[test]
fn server_error_then_success_recovers() {
    let transport = ScriptedTransport::new(
        vec![status(503), body(200, r#"{"key": 5219404}"#)],
        status(500),
    );
    let value = fetcher(transport.clone())
        .get_json("https://api.gbif.org/v1/species/5219404", &[])
        .unwrap();

    assert_eq!(value, json!({"key": 5219404}));
    assert_eq!(transport.calls(), 2);
}

#[test]
fn persistent_throttling_becomes_rate_limited() {
    let transport = ScriptedTransport::new(vec![], status(429));
    let err = fetcher(transport.clone())
        .get_text("https://eol.org/api/search/1.0.json", &[])
        .unwrap_err();

    assert_matches!(err, FetchError::RateLimited { attempts: 3, .. });
    assert_eq!(transport.calls(), 3);
}

#[test]
fn client_error_is_rejected_immediately() {
    let transport = ScriptedTransport::new(vec![], status(401));
    let err = fetcher(transport.clone())
        .get_text("https://apiv3.iucnredlist.org/api/v3/species/x", &[])
        .unwrap_err();

    assert_matches!(err, FetchError::Rejected { status: 401, .. });
    assert_eq!(transport.calls(), 1);
}

#[test]
fn malformed_json_is_a_decode_error() {
    let transport = ScriptedTransport::new(vec![], body(200, "<html>"));
    let err = fetcher(transport.clone())
        .get_json("https://commons.wikimedia.org/w/api.php", &[])
        .unwrap_err();

    assert_matches!(err, FetchError::Decode { .. });
    assert_eq!(transport.calls(), 1);
}

#[test]
fn post_carries_bearer_token() {
    let transport = ScriptedTransport::new(vec![], status(200));
    let code = fetcher(transport.clone())
        .post_json(
            "https://example.org/api/revalidate",
            &json!({"path": "/taxon/1"}),
            Some("secret"),
        )
        .unwrap();

    assert_eq!(code, 200);
    let posts = transport.posts.lock().unwrap();
    assert_eq!(posts[0].2.as_deref(), Some("secret"));
    assert_eq!(posts[0].1["path"], "/taxon/1");
}
