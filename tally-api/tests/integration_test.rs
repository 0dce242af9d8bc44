use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use tally_api::middleware::auth::{issue_session, ROLE_ADMIN, ROLE_CUSTOMER};
use tally_api::{app, AppState, AuthConfig};
use tally_notify::templates::{EmailContent, WhatsAppTemplate};
use tally_notify::{
    DispatcherMetrics, DispatcherSettings, EmailProvider, MemoryQueue, NotificationDispatcher,
    ProviderError, WhatsAppProvider,
};
use tally_order::{ApprovalTokenService, MachineSettings, OrderStateMachine, ReceiptPolicy};
use tally_shared::{Channel, NotificationEvent};
use tally_store::{LocalStore, MemoryRateLimiter};

const BASE_URL: &str = "http://tally.test";
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R'];

struct Provider {
    fail: bool,
}

impl Provider {
    fn reply(&self) -> Result<String, ProviderError> {
        if self.fail {
            Err(ProviderError::Transient("502 Bad Gateway".to_string()))
        } else {
            Ok(format!("msg-{}", Uuid::new_v4()))
        }
    }
}

#[async_trait]
impl EmailProvider for Provider {
    async fn send(&self, _: &str, _: &EmailContent) -> Result<String, ProviderError> {
        self.reply()
    }
}

#[async_trait]
impl WhatsAppProvider for Provider {
    async fn send_template(&self, _: &str, _: &WhatsAppTemplate) -> Result<String, ProviderError> {
        self.reply()
    }

    async fn send_text(&self, _: &str, _: &str) -> Result<String, ProviderError> {
        self.reply()
    }
}

struct TestApp {
    router: Router,
    queue: Arc<MemoryQueue>,
    dispatcher: Arc<NotificationDispatcher>,
    customer: String,
    stranger: String,
    admin: String,
}

fn setup_with(providers_fail: bool, upload_attempts: i64) -> TestApp {
    let store = Arc::new(LocalStore::in_memory());
    let queue = Arc::new(MemoryQueue::new());
    let provider = Arc::new(Provider { fail: providers_fail });

    let registry = prometheus::Registry::new();
    let metrics = DispatcherMetrics::register(&registry).unwrap();
    let dispatcher = Arc::new(
        NotificationDispatcher::new(
            queue.clone(),
            store.clone(),
            provider.clone(),
            provider,
            DispatcherSettings {
                max_attempts: 2,
                base_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                ..Default::default()
            },
        )
        .with_metrics(metrics),
    );

    let orders = Arc::new(OrderStateMachine::new(
        store.clone(),
        Arc::new(ApprovalTokenService::new(b"integration-approval-secret", 24)),
        dispatcher.clone(),
        MachineSettings {
            admin_email: "admin@shop.example".to_string(),
            admin_origin: "203.0.113.7".to_string(),
            public_base_url: BASE_URL.to_string(),
            currency: "PKR".to_string(),
            receipts: ReceiptPolicy::default(),
        },
    ));

    let auth = AuthConfig {
        secret: "integration-session-secret".to_string(),
        expiration: 3600,
    };
    let customer = issue_session(&auth, "cust-1", "ayesha@example.com", ROLE_CUSTOMER).unwrap();
    let stranger = issue_session(&auth, "cust-2", "bilal@example.com", ROLE_CUSTOMER).unwrap();
    let admin = issue_session(&auth, "admin-1", "admin@shop.example", ROLE_ADMIN).unwrap();

    let state = AppState {
        store,
        orders,
        dispatcher: dispatcher.clone(),
        upload_limiter: Arc::new(MemoryRateLimiter::new(upload_attempts, Duration::from_secs(3600))),
        upload_body_limit: 6 * 1024 * 1024,
        auth,
        registry,
    };

    TestApp {
        router: app(state),
        queue,
        dispatcher,
        customer,
        stranger,
        admin,
    }
}

fn setup() -> TestApp {
    setup_with(false, 10)
}

fn multipart(file_name: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = "tally-test-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"receipt\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get(&self, uri: &str, session: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::get(uri).header("x-forwarded-for", "198.51.100.4");
        if let Some(token) = session {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, session: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", session))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn upload(&self, order_id: &str, session: &str, file_name: &str, bytes: &[u8]) -> (StatusCode, Value) {
        let (content_type, body) = multipart(file_name, bytes);
        let req = Request::post(format!("/orders/{}/receipt", order_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", session))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    async fn create_product(&self, stock: i64) -> String {
        let (status, body) = self
            .post("/admin/products", &self.admin, json!({ "name": "Lawn Suit", "price": 450000, "stock": stock }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["product_id"].as_str().unwrap().to_string()
    }

    async fn product(&self, product_id: &str) -> (i64, i64) {
        let (status, body) = self.get(&format!("/admin/products/{}", product_id), Some(&self.admin)).await;
        assert_eq!(status, StatusCode::OK);
        (body["stock"].as_i64().unwrap(), body["reserved_stock"].as_i64().unwrap())
    }

    async fn create_order(&self, product_id: &str, quantity: i64, method: &str) -> (StatusCode, Value) {
        self.post("/orders", &self.customer, order_body(product_id, quantity, method)).await
    }

    /// The approve and reject links exactly as mailed to the admin, minus the host.
    async fn admin_links(&self, order_id: &str) -> (String, String) {
        let job = self
            .queue
            .jobs()
            .await
            .into_iter()
            .find(|j| j.event == NotificationEvent::AdminApprovalRequested && j.payload.order_id.to_string() == order_id)
            .expect("admin approval e-mail was queued");
        let strip = |url: Option<String>| url.unwrap().trim_start_matches(BASE_URL).to_string();
        (strip(job.payload.approve_url), strip(job.payload.reject_url))
    }
}

fn order_body(product_id: &str, quantity: i64, method: &str) -> Value {
    json!({
        "customer_name": "Ayesha Khan",
        "phone": "+923001234567",
        "items": [{ "product_id": product_id, "quantity": quantity }],
        "shipping_address": {
            "full_name": "Ayesha Khan",
            "phone": "+923001234567",
            "line1": "House 12, Street 4",
            "line2": null,
            "city": "Lahore",
            "postal_code": "54000",
            "country": "PK"
        },
        "payment_method": method
    })
}

#[tokio::test]
async fn test_bank_transfer_approval_flow() {
    let t = setup();
    let product = t.create_product(5).await;

    let (status, order) = t.create_order(&product, 2, "bank_transfer").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "pending");
    assert_eq!(order["awaiting_admin"], true);
    assert!(order.get("approval_token").is_none());
    assert_eq!(t.product(&product).await, (5, 2));

    let order_id = order["id"].as_str().unwrap();
    let (approve, _) = t.admin_links(order_id).await;

    let (status, first) = t.get(&approve, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["already_processed"], false);
    assert_eq!(first["order"]["status"], "approved");
    assert_eq!(first["order"]["is_approved"], true);
    assert_eq!(t.product(&product).await, (3, 0));

    let (status, second) = t.get(&approve, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["already_processed"], true);
    assert_eq!(t.product(&product).await, (3, 0));

    let (_, audit) = t.get(&format!("/admin/orders/{}/audit", order_id), Some(&t.admin)).await;
    let outcomes: Vec<&str> = audit.as_array().unwrap().iter().map(|e| e["outcome"].as_str().unwrap()).collect();
    assert_eq!(outcomes, vec!["applied", "already_resolved"]);
    assert_eq!(audit[0]["origin"], "198.51.100.4");
    assert_eq!(audit[0]["admin_email"], "admin@shop.example");
}

#[tokio::test]
async fn test_bad_links_are_forbidden_and_audited() {
    let t = setup();
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 1, "mobile_wallet").await;
    let order_id = order["id"].as_str().unwrap();
    let (approve, _) = t.admin_links(order_id).await;

    // Inside the signature, clear of the trailing padding bits
    let mut chars: Vec<char> = approve.chars().collect();
    let i = chars.len() - 5;
    chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
    let tampered: String = chars.into_iter().collect();

    let (status, body) = t.get(&tampered, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, missing) = t.get(&format!("/orders/{}/approve", order_id), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    // Every refusal reads the same
    assert_eq!(body, missing);

    let token = approve.split("token=").nth(1).unwrap();
    let (status, _) = t.get(&format!("/orders/{}/approve?token={}", Uuid::new_v4(), token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, audit) = t.get(&format!("/admin/orders/{}/audit", order_id), Some(&t.admin)).await;
    let entries = audit.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["outcome"] == "refused"));
    assert_eq!(t.product(&product).await, (5, 1));
}

#[tokio::test]
async fn test_reject_link_releases_stock() {
    let t = setup();
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 3, "bank_transfer").await;
    let order_id = order["id"].as_str().unwrap();
    let (approve, reject) = t.admin_links(order_id).await;

    let (status, body) = t.get(&reject, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["status"], "rejected");
    assert_eq!(t.product(&product).await, (5, 0));

    let (status, _) = t.get(&approve, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(t.product(&product).await, (5, 0));
}

#[tokio::test]
async fn test_insufficient_stock_names_product_and_deficit() {
    let t = setup();
    let product = t.create_product(5).await;

    let (status, body) = t.create_order(&product, 7, "bank_transfer").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["product_name"], "Lawn Suit");
    assert_eq!(body["deficit"], 2);
    assert_eq!(t.product(&product).await, (5, 0));

    let (status, check) = t
        .post("/stock/check", &t.customer, json!({ "items": [{ "product_id": product, "quantity": 7 }] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["available"], false);
    assert_eq!(check["shortfalls"][0]["deficit"], 2);
}

#[tokio::test]
async fn test_order_prices_come_from_catalog() {
    let t = setup();
    let product = t.create_product(5).await;

    let mut body = order_body(&product, 2, "bank_transfer");
    body["items"][0]["name"] = json!("Free Sample");
    body["items"][0]["unit_price"] = json!(0);
    let (status, order) = t.post("/orders", &t.customer, body).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["items"][0]["name"], "Lawn Suit");
    assert_eq!(order["items"][0]["unit_price"], 450000);
    assert_eq!(order["total_amount"], 900000);
}

#[tokio::test]
async fn test_overflowing_order_is_rejected_without_reserving() {
    let t = setup();
    let (status, body) = t
        .post(
            "/admin/products",
            &t.admin,
            json!({ "name": "Heirloom Gharara", "price": i64::MAX, "stock": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let product = body["product_id"].as_str().unwrap().to_string();

    let (status, _) = t.create_order(&product, 2, "bank_transfer").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(t.product(&product).await, (5, 0));

    let (status, body) = t.create_order(&product, i64::MAX, "bank_transfer").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["deficit"], i64::MAX - 5);
    assert_eq!(t.product(&product).await, (5, 0));
}

#[tokio::test]
async fn test_receipt_upload_and_download() {
    let t = setup();
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 1, "bank_transfer").await;
    let order_id = order["id"].as_str().unwrap();

    let (status, _) = t.upload(order_id, &t.customer, "receipt.jpg", b"<?php system('id'); ?>").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = t.upload(order_id, &t.customer, "receipt.exe", PNG).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = t.upload(order_id, &t.customer, "receipt.png", PNG).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "receipt_submitted");
    assert_eq!(body["receipt"]["content_type"], "image/png");

    let (status, _) = t.upload(order_id, &t.customer, "again.png", PNG).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let uri = format!("/orders/{}/receipt", order_id);
    let owner = t
        .router
        .clone()
        .oneshot(
            Request::get(&uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", t.customer))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);
    assert_eq!(owner.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(to_bytes(owner.into_body(), usize::MAX).await.unwrap().as_ref(), PNG);

    let (status, _) = t.get(&uri, Some(&t.stranger)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = t.get(&uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = t.get(&uri, Some(&t.admin)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_receipt_upload_is_rate_limited() {
    let t = setup_with(false, 2);
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 1, "bank_transfer").await;
    let order_id = order["id"].as_str().unwrap();

    for _ in 0..2 {
        let (status, _) = t.upload(order_id, &t.customer, "receipt.gif", PNG).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, _) = t.upload(order_id, &t.customer, "receipt.png", PNG).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_sessions_and_roles() {
    let t = setup();
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 1, "cash_on_delivery").await;
    let order_id = order["id"].as_str().unwrap();

    let (status, _) = t.get(&format!("/orders/{}", order_id), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = t.get(&format!("/orders/{}", order_id), Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = t.get(&format!("/orders/{}", order_id), Some(&t.stranger)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, mine) = t.get(&format!("/orders/{}", order_id), Some(&t.customer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["customer_email"], "ayesha@example.com");

    let (status, _) = t.get(&format!("/admin/products/{}", product), Some(&t.customer)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, list) = t.get("/orders", Some(&t.stranger)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cash_on_delivery_fulfillment_and_cancel() {
    let t = setup();
    let product = t.create_product(5).await;
    let (status, order) = t.create_order(&product, 2, "cash_on_delivery").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "approved");
    assert_eq!(t.product(&product).await, (3, 0));
    let order_id = order["id"].as_str().unwrap();

    let (status, body) = t
        .post(&format!("/orders/{}/fulfillment", order_id), &t.admin, json!({ "status": "processing" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["status"], "processing");

    let (status, _) = t
        .post(&format!("/orders/{}/fulfillment", order_id), &t.admin, json!({ "status": "delivered" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = t.post(&format!("/orders/{}/cancel", order_id), &t.customer, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = t.post(&format!("/orders/{}/cancel", order_id), &t.admin, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["status"], "cancelled");
    // Sold units stay sold
    assert_eq!(t.product(&product).await, (3, 0));
}

#[tokio::test]
async fn test_customer_cancel_releases_reservation() {
    let t = setup();
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 2, "bank_transfer").await;
    let order_id = order["id"].as_str().unwrap();

    let (status, body) = t.post(&format!("/orders/{}/reminder", order_id), &t.admin, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs_enqueued"], 2);

    let (status, _) = t.post(&format!("/orders/{}/cancel", order_id), &t.customer, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.product(&product).await, (5, 0));

    let (approve, _) = t.admin_links(order_id).await;
    let (status, _) = t.get(&approve, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_failed_notifications_dead_letter_and_replay() {
    let t = setup_with(true, 10);
    let product = t.create_product(5).await;
    let (_, order) = t.create_order(&product, 2, "bank_transfer").await;
    let order_id = order["id"].as_str().unwrap();
    let (approve, _) = t.admin_links(order_id).await;

    let (status, body) = t.get(&approve, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["status"], "approved");

    for channel in [Channel::Email, Channel::Whatsapp] {
        while t.dispatcher.process_next(channel).await.unwrap() {}
    }

    let (status, dead) = t.get("/admin/dead-letters/email", Some(&t.admin)).await;
    assert_eq!(status, StatusCode::OK);
    let approved = dead
        .as_array()
        .unwrap()
        .iter()
        .find(|j| j["event"] == "paymentApproved")
        .expect("payment approval e-mail is dead-lettered")
        .clone();
    assert_eq!(approved["status"], "dead_lettered");
    let job_id = approved["id"].as_str().unwrap();

    let (status, job) = t.get(&format!("/admin/jobs/{}", job_id), Some(&t.admin)).await;
    assert_eq!(status, StatusCode::OK);
    let outcomes: Vec<&str> = job["attempts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["failed", "failed", "dead_lettered"]);

    let (status, replayed) = t.post(&format!("/admin/jobs/{}/replay", job_id), &t.admin, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed["status"], "queued");
    assert_eq!(replayed["attempts"], 0);

    let (status, _) = t.post(&format!("/admin/jobs/{}/replay", job_id), &t.admin, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let response = t
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("notification_dead_letters_total"));
}
