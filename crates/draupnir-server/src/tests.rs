use crate::client_ip::ClientIpConfig;
use crate::{create_app, AppState, VERSION};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use draupnir_engine::test_utils::{
    memory_engine, stage_artifact, test_config, FakeFirewall, FakeRuntime,
};
use draupnir_engine::{Engine, FirewallRule, RecordStore, Whitelister};
use std::net::SocketAddr;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "the-shared-secret";

struct TestApp {
    app: Router,
    engine: Arc<Engine>,
    runtime: Arc<FakeRuntime>,
    _dir: TempDir,
}

impl TestApp {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let engine = Arc::new(memory_engine(test_config(dir.path()), runtime.clone()).await);
        let app = create_app(AppState::new(engine.clone(), SECRET));
        Self {
            app,
            engine,
            runtime,
            _dir: dir,
        }
    }

    /// App with whitelisting on, trusting `10.0.0.0/8` as proxies
    async fn with_whitelisting() -> (Self, Arc<Whitelister>, Arc<FakeFirewall>) {
        let dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new();
        let engine = Arc::new(memory_engine(test_config(dir.path()), runtime.clone()).await);
        let firewall = FakeFirewall::new();
        let whitelister = Arc::new(Whitelister::new(engine.records(), firewall.clone()));
        let client_ip = ClientIpConfig {
            use_x_forwarded_for: true,
            trusted_proxies: vec!["10.0.0.0/8".parse().unwrap()],
        };
        let state = AppState::new(engine.clone(), SECRET).with_whitelisting(whitelister.clone(), client_ip);
        let app = Self {
            app: create_app(state),
            engine,
            runtime,
            _dir: dir,
        };
        (app, whitelister, firewall)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, headers, json)
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, _, json) = self.send(api_request(method, uri, body)).await;
        (status, json)
    }

    async fn ready_image(&self) -> u64 {
        let (status, json) = self
            .call(
                Method::POST,
                "/images",
                Some(json!({"data": {"type": "images", "attributes": {"backed_up_at": "2016-01-02T03:04:05Z"}}})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id: u64 = json["data"]["id"].as_str().unwrap().parse().unwrap();
        stage_artifact(&self.engine, id).await;
        let (status, _) = self.call(Method::POST, &format!("/images/{id}/done"), None).await;
        assert_eq!(status, StatusCode::OK);
        id
    }
}

fn api_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Draupnir-Version", VERSION)
        .header("Authorization", format!("Bearer {SECRET}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn test_image_and_instance_scenario() {
    let app = TestApp::new().await;

    let (status, json) = app
        .call(
            Method::POST,
            "/images",
            Some(json!({"data": {"type": "images", "attributes": {"backed_up_at": "2016-01-02T03:04:05Z"}}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["data"]["type"], "images");
    assert_eq!(json["data"]["attributes"]["backed_up_at"], "2016-01-02T03:04:05Z");
    assert_eq!(json["data"]["attributes"]["ready"], false);
    let image_id = json["data"]["id"].as_str().unwrap().to_string();

    stage_artifact(&app.engine, image_id.parse().unwrap()).await;
    let (status, json) = app
        .call(Method::POST, &format!("/images/{image_id}/done"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["attributes"]["ready"], true);

    let (status, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id}}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let instance_id = json["data"]["id"].as_str().unwrap().to_string();
    let port = json["data"]["attributes"]["port"].as_u64().unwrap();
    assert!((15433..=15532).contains(&port));
    assert_eq!(json["data"]["attributes"]["hostname"], "draupnir.test");
    assert_eq!(json["data"]["relationships"]["credentials"]["data"]["id"], instance_id.as_str());
    let credential = &json["included"][0];
    assert_eq!(credential["type"], "credentials");
    assert!(credential["attributes"]["ca_certificate"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(credential["attributes"]["client_certificate"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(credential["attributes"]["client_key"]
        .as_str()
        .unwrap()
        .contains("PRIVATE KEY"));
    assert!(app.runtime.is_running(instance_id.parse().unwrap()));

    let (status, json) = app.call(Method::GET, "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = json["data"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], instance_id.as_str());
    assert!(json.get("included").is_none());
    assert!(!json.to_string().contains("PRIVATE KEY"));

    let (status, json) = app.call(Method::DELETE, &format!("/instances/{instance_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(json, Value::Null);

    let (status, json) = app.call(Method::GET, "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], json!([]));

    let (status, json) = app.call(Method::DELETE, &format!("/images/{image_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(json, Value::Null);

    let (status, _) = app.call(Method::GET, &format!("/images/{image_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_instance_detail_never_returns_key() {
    let app = TestApp::new().await;
    let image_id = app.ready_image().await;

    let (status, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id}}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let instance_id = json["data"]["id"].as_str().unwrap().to_string();

    let (status, json) = app.call(Method::GET, &format!("/instances/{instance_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["relationships"]["credentials"]["data"]["type"], "credentials");
    assert_eq!(json["included"][0]["id"], instance_id.as_str());
    assert!(json["included"][0]["attributes"]["client_certificate"].is_string());
    assert!(json["included"][0]["attributes"].get("client_key").is_none());
}

#[tokio::test]
async fn test_provision_against_pending_image_is_unprocessable() {
    let app = TestApp::new().await;
    let (_, json) = app
        .call(
            Method::POST,
            "/images",
            Some(json!({"data": {"type": "images", "attributes": {"backed_up_at": "2016-01-02T03:04:05Z"}}})),
        )
        .await;
    let image_id = json["data"]["id"].as_str().unwrap().to_string();

    let (status, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id}}})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["status"], "422");
    assert_eq!(json["code"], "unprocessable_entity");
    assert_eq!(json["source"]["parameter"], "image_id");

    let (_, json) = app.call(Method::GET, "/instances", None).await;
    assert_eq!(json["data"], json!([]));
    assert!(app.runtime.running().is_empty());
}

#[tokio::test]
async fn test_image_with_instances_cannot_be_deleted() {
    let app = TestApp::new().await;
    let image_id = app.ready_image().await;
    let (_, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id}}})),
        )
        .await;
    let instance_id = json["data"]["id"].as_str().unwrap().to_string();

    let (status, json) = app.call(Method::DELETE, &format!("/images/{image_id}"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["title"], "Image Has Instances");

    app.call(Method::DELETE, &format!("/instances/{instance_id}"), None).await;
    let (status, _) = app.call(Method::DELETE, &format!("/images/{image_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_finalize_without_artifact_is_not_found() {
    let app = TestApp::new().await;
    let (_, json) = app
        .call(
            Method::POST,
            "/images",
            Some(json!({"data": {"type": "images", "attributes": {"backed_up_at": "2016-01-02T03:04:05Z"}}})),
        )
        .await;
    let image_id = json["data"]["id"].as_str().unwrap().to_string();

    let (status, json) = app.call(Method::POST, &format!("/images/{image_id}/done"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "resource_not_found");

    let (_, json) = app.call(Method::GET, &format!("/images/{image_id}"), None).await;
    assert_eq!(json["data"]["attributes"]["ready"], false);
}

#[tokio::test]
async fn test_unknown_image_on_provision() {
    let app = TestApp::new().await;
    let (status, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": 404}}})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["title"], "Image Not Found");
}

#[tokio::test]
async fn test_bad_image_id() {
    let app = TestApp::new().await;
    let (status, json) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": "abc"}}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["source"]["parameter"], "image_id");
}

#[tokio::test]
async fn test_invalid_json() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/images")
        .header("Draupnir-Version", VERSION)
        .header("Authorization", format!("Bearer {SECRET}"))
        .body(Body::from("{\"data\": "))
        .unwrap();
    let (status, _, json) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["title"], "Invalid JSON");

    let (status, json) = app
        .call(Method::POST, "/images", Some(json!({"data": {"attributes": {"backed_up_at": "yesterday"}}})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "bad_request");
}

#[tokio::test]
async fn test_non_numeric_path_id_is_not_found() {
    let app = TestApp::new().await;
    let (status, json) = app.call(Method::GET, "/images/latest", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "resource_not_found");

    let (status, _) = app.call(Method::DELETE, "/instances/-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_requires_bearer_token() {
    let app = TestApp::new().await;

    let missing = Request::builder()
        .uri("/images")
        .header("Draupnir-Version", VERSION)
        .body(Body::empty())
        .unwrap();
    let (status, _, json) = app.send(missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "unauthorized");

    let wrong = Request::builder()
        .uri("/images")
        .header("Draupnir-Version", VERSION)
        .header("Authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = app.send(wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_version_checks() {
    let app = TestApp::new().await;

    let missing = Request::builder()
        .uri("/images")
        .header("Authorization", format!("Bearer {SECRET}"))
        .body(Body::empty())
        .unwrap();
    let (status, headers, json) = app.send(missing).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "missing_api_version_header");
    assert_eq!(headers["Draupnir-Version"], VERSION);

    let incompatible = Request::builder()
        .uri("/images")
        .header("Draupnir-Version", "999.0.0")
        .header("Authorization", format!("Bearer {SECRET}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, json) = app.send(incompatible).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_api_version");
    assert!(json["detail"].as_str().unwrap().contains("999.0.0"));
}

#[tokio::test]
async fn test_health_check_needs_no_headers() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .uri("/health_check")
        .body(Body::empty())
        .unwrap();
    let (status, headers, json) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"status": "ok"}));
    assert_eq!(headers["Draupnir-Version"], VERSION);
}

#[tokio::test]
async fn test_unknown_route() {
    let app = TestApp::new().await;
    let (status, headers, json) = app
        .send(api_request(Method::GET, "/snapshots", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "resource_not_found");
    assert_eq!(headers["Draupnir-Version"], VERSION);
}

fn from_peer(mut request: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

#[tokio::test]
async fn test_instance_callers_are_whitelisted() {
    let (app, whitelister, firewall) = TestApp::with_whitelisting().await;
    let image_id = app.ready_image().await;

    // Behind the load balancer: the forwarded client address is recorded
    let mut request = api_request(
        Method::POST,
        "/instances",
        Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id.to_string()}}})),
    );
    request
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.7, 10.0.0.9".parse().unwrap());
    let (status, _, json) = app.send(from_peer(request, "10.0.0.2:40000")).await;
    assert_eq!(status, StatusCode::CREATED);
    let instance_id: u64 = json["data"]["id"].as_str().unwrap().parse().unwrap();
    let port = json["data"]["attributes"]["port"].as_u64().unwrap() as u16;

    // Direct connection: the peer address is recorded
    let request = api_request(Method::GET, &format!("/instances/{instance_id}"), None);
    let (status, _, _) = app.send(from_peer(request, "198.51.100.20:51000")).await;
    assert_eq!(status, StatusCode::OK);

    let addresses = app.engine.records().list_whitelisted_addresses().await.unwrap();
    let mut ips: Vec<String> = addresses.iter().map(|a| a.ip_address.to_string()).collect();
    ips.sort();
    assert_eq!(ips, vec!["198.51.100.20", "203.0.113.7"]);

    whitelister.reconcile("test").await.unwrap();
    let expected: Vec<FirewallRule> = ["198.51.100.20", "203.0.113.7"]
        .iter()
        .map(|ip| FirewallRule {
            source: ip.parse().unwrap(),
            port,
            instance_id,
        })
        .collect();
    assert_eq!(firewall.rules_now(), expected);

    let (status, _) = app
        .call(Method::DELETE, &format!("/instances/{instance_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.engine.records().list_whitelisted_addresses().await.unwrap().is_empty());
    whitelister.reconcile("test").await.unwrap();
    assert!(firewall.rules_now().is_empty());
}

#[tokio::test]
async fn test_unknown_client_address_does_not_fail_request() {
    let (app, _whitelister, firewall) = TestApp::with_whitelisting().await;
    let image_id = app.ready_image().await;

    // No connection info and no forwarding header
    let (status, _) = app
        .call(
            Method::POST,
            "/instances",
            Some(json!({"data": {"type": "instances", "attributes": {"image_id": image_id.to_string()}}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(app.engine.records().list_whitelisted_addresses().await.unwrap().is_empty());
    assert!(firewall.rules_now().is_empty());
}
