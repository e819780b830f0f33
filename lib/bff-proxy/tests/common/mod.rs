//! Shared harness for gateway integration tests
//!
//! Each test gets its own set of wiremock backends and its own gateway, so
//! rate-limit windows and mock expectations never leak between tests.

#![allow(dead_code)]

use bff_core::{BackendService, GatewayConfig, ServiceDirectory};
use bff_proxy::Gateway;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Request, StatusCode};
use serde_json::{json, Value};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "valid-token";
pub const USER_ID: &str = "u-1";

pub struct Backends {
    pub auth: MockServer,
    pub ai: MockServer,
    pub document: MockServer,
}

impl Backends {
    pub async fn start() -> Self {
        Self {
            auth: MockServer::start().await,
            ai: MockServer::start().await,
            document: MockServer::start().await,
        }
    }

    /// Auth service accepts `TOKEN` as `USER_ID` and rejects anything else
    pub async fn with_auth(self) -> Self {
        Mock::given(method("GET"))
            .and(path("/verify"))
            .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": USER_ID,
                "username": "alice",
                "email": "alice@example.com",
            })))
            .with_priority(1)
            .mount(&self.auth)
            .await;
        Mock::given(method("GET"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Invalid token"})))
            .with_priority(2)
            .mount(&self.auth)
            .await;
        self
    }

    pub fn directory(&self) -> ServiceDirectory {
        let mut directory = ServiceDirectory::new();
        directory.register(BackendService::Auth, &self.auth.uri());
        directory.register(BackendService::Ai, &self.ai.uri());
        directory.register(BackendService::Document, &self.document.uri());
        directory
    }

    pub fn gateway(&self, config: GatewayConfig) -> Arc<Gateway> {
        Arc::new(Gateway::with_directory(config, self.directory()).expect("gateway builds"))
    }
}

pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.timeouts.request = Duration::from_secs(2);
    config.timeouts.upload = Duration::from_secs(5);
    config.timeouts.stream = Duration::from_secs(5);
    config.timeouts.auth = Duration::from_secs(2);
    config.timeouts.health_check = Duration::from_millis(300);
    config
}

pub fn peer() -> Option<SocketAddr> {
    Some("127.0.0.1:40000".parse().expect("valid socket address"))
}

pub fn authed(builder: hyper::http::request::Builder) -> hyper::http::request::Builder {
    builder.header("authorization", format!("Bearer {}", TOKEN))
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.to_vec()).expect("response body is UTF-8")
    }
}

pub async fn send(gateway: &Arc<Gateway>, request: Request<Full<Bytes>>) -> TestResponse {
    let response = Arc::clone(gateway).handle(request, peer()).await;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.expect("body collects").to_bytes();
    TestResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

pub fn empty() -> Full<Bytes> {
    Full::new(Bytes::new())
}

pub fn json_body(value: &Value) -> Full<Bytes> {
    Full::new(Bytes::from(value.to_string()))
}

/// Multipart body with a single file part
pub fn multipart_file(boundary: &str, file_name: &str, content_type: &str, data: &str) -> Full<Bytes> {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: {ct}\r\n\r\n{d}\r\n--{b}--\r\n",
        b = boundary,
        f = file_name,
        ct = content_type,
        d = data
    );
    Full::new(Bytes::from(body))
}

/// `tracing` writer that keeps everything in memory
#[derive(Clone, Default)]
pub struct CapturedLogs(pub Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
