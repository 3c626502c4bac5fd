use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_id::InstanceBuildId;
use fleet_server::{
    api::{self, auth::AuthGate},
    db::Database,
    notify::RecordingNotifier,
    state::AppState,
};
use tokio::net::TcpListener;

const OPERATOR_TOKEN: &str = "op-secret";

struct ApiFixture {
    base_url: String,
    db: Database,
    notifier: Arc<RecordingNotifier>,
    client: reqwest::Client,
}

impl ApiFixture {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

async fn start_api() -> ApiFixture {
    let db = Database::in_memory();
    let notifier = Arc::new(RecordingNotifier::new());
    let state = AppState::new(db.clone(), notifier.clone(), AuthGate::new(OPERATOR_TOKEN));
    let app = api::create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ApiFixture {
        base_url: format!("http://{addr}"),
        db,
        notifier,
        client: reqwest::Client::new(),
    }
}

fn build_request() -> serde_json::Value {
    serde_json::json!({
        "site": "org",
        "env": "prod",
        "instance_type": "c5.large",
        "queue": "docker",
        "role": "worker",
        "count": 2,
        "slack_channel": "#builds"
    })
}

#[tokio::test]
async fn health_endpoints_need_no_auth() {
    let f = start_api().await;
    for path in ["/healthz", "/readyz", "/livez"] {
        let resp = f.client.get(f.url(path)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200, "{path}");
    }
}

#[tokio::test]
async fn responses_carry_request_id() {
    let f = start_api().await;
    let resp = f.client.get(f.url("/livez")).send().await.unwrap();
    let id = resp.headers()["x-request-id"].to_str().unwrap();
    assert!(id.starts_with("req_"));

    let resp = f
        .client
        .get(f.url("/livez"))
        .header("x-request-id", "req_caller")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "req_caller");
}

#[tokio::test]
async fn missing_credentials_get_challenge() {
    let f = start_api().await;
    let resp = f.client.get(f.url("/instances")).send().await.unwrap();

    assert_eq!(resp.status().as_u16(), 401);
    assert!(resp.headers().contains_key("www-authenticate"));
    assert_eq!(resp.headers()["content-type"], "application/problem+json");
}

#[tokio::test]
async fn bad_credentials_are_forbidden() {
    let f = start_api().await;

    let wrong_token = f
        .client
        .get(f.url("/instances"))
        .header("Authorization", "token nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_token.status().as_u16(), 403);

    // Basic credentials never reach operator routes.
    let basic_on_operator = f
        .client
        .get(f.url("/instances"))
        .header("Authorization", basic("x", OPERATOR_TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(basic_on_operator.status().as_u16(), 403);
}

#[tokio::test]
async fn operator_token_accepted_in_both_forms() {
    let f = start_api().await;
    for header in [format!("token {OPERATOR_TOKEN}"), format!("token={OPERATOR_TOKEN}")] {
        let resp = f
            .client
            .get(f.url("/instances"))
            .header("Authorization", header)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["items"], serde_json::json!([]));
    }
}

#[tokio::test]
async fn create_build_validates_and_enqueues() {
    let f = start_api().await;
    let auth = format!("token {OPERATOR_TOKEN}");

    let mut invalid = build_request();
    invalid["count"] = serde_json::json!(0);
    invalid["role"] = serde_json::json!("");
    let resp = f
        .client
        .post(f.url("/instance-builds"))
        .header("Authorization", &auth)
        .json(&invalid)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["details"].as_array().unwrap().len(), 2);
    assert_eq!(f.db.queue().depth("instance-builds").await.unwrap(), 0);

    let resp = f
        .client
        .post(f.url("/instance-builds"))
        .header("Authorization", &auth)
        .json(&build_request())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let build: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(build["state"], "pending");
    assert_eq!(f.db.queue().depth("instance-builds").await.unwrap(), 1);

    let id = InstanceBuildId::parse(build["id"].as_str().unwrap()).unwrap();
    assert!(f.db.builds().get(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn bootstrap_secret_unlocks_only_its_build() {
    let f = start_api().await;
    let auth = format!("token {OPERATOR_TOKEN}");

    let build: serde_json::Value = f
        .client
        .post(f.url("/instance-builds"))
        .header("Authorization", &auth)
        .json(&build_request())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = InstanceBuildId::parse(build["id"].as_str().unwrap()).unwrap();
    f.db.bootstrap()
        .store(&id, "boot-secret", "#!/usr/bin/env bash\necho hi\n")
        .await
        .unwrap();

    let resp = f
        .client
        .get(f.url(&format!("/init-scripts/{id}")))
        .header("Authorization", basic(&id.to_string(), "boot-secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], "text/x-shellscript");
    assert!(resp.text().await.unwrap().contains("echo hi"));

    let wrong = f
        .client
        .get(f.url(&format!("/init-scripts/{id}")))
        .header("Authorization", basic(&id.to_string(), "guess"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status().as_u16(), 403);

    let other = InstanceBuildId::new();
    let foreign = f
        .client
        .get(f.url(&format!("/init-scripts/{other}")))
        .header("Authorization", basic(&other.to_string(), "boot-secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status().as_u16(), 403);
}

#[tokio::test]
async fn build_state_only_moves_forward() {
    let f = start_api().await;
    let auth = format!("token {OPERATOR_TOKEN}");

    let build: serde_json::Value = f
        .client
        .post(f.url("/instance-builds"))
        .header("Authorization", &auth)
        .json(&build_request())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = InstanceBuildId::parse(build["id"].as_str().unwrap()).unwrap();
    f.db.bootstrap()
        .store(&id, "boot-secret", "#!/bin/sh")
        .await
        .unwrap();
    let creds = basic(&id.to_string(), "boot-secret");
    let patch = |state: &str| {
        f.client
            .patch(f.url(&format!("/instance-builds/{id}")))
            .header("Authorization", &creds)
            .json(&serde_json::json!({ "state": state }))
            .send()
    };

    assert_eq!(patch("started").await.unwrap().status().as_u16(), 200);
    assert_eq!(patch("started").await.unwrap().status().as_u16(), 200);
    assert_eq!(patch("pending").await.unwrap().status().as_u16(), 409);

    let finished = patch("finished").await.unwrap();
    assert_eq!(finished.status().as_u16(), 200);
    let body: serde_json::Value = finished.json().await.unwrap();
    assert_eq!(body["state"], "finished");

    // Finishing wipes the bootstrap secret, so the same credentials stop working.
    assert!(f.db.bootstrap().secret(&id).await.unwrap().is_none());
    assert_eq!(patch("finished").await.unwrap().status().as_u16(), 403);
    assert_eq!(f.notifier.messages().len(), 1);
}

#[tokio::test]
async fn delete_instance_enqueues_termination() {
    let f = start_api().await;
    let resp = f
        .client
        .delete(f.url("/instances/i-0abc"))
        .header("Authorization", format!("token {OPERATOR_TOKEN}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    assert_eq!(f.db.queue().depth("instance-terminations").await.unwrap(), 1);
}

#[tokio::test]
async fn subscription_confirmation_is_enqueued() {
    let f = start_api().await;
    let body = serde_json::json!({
        "Type": "SubscriptionConfirmation",
        "TopicArn": "arn:topic/lifecycle",
        "SubscribeURL": "https://sns.example.com/confirm?Token=abc",
        "Message": "You have chosen to subscribe"
    });
    let resp = f
        .client
        .post(f.url("/sns-messages"))
        .header("content-type", "text/plain; charset=UTF-8")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    assert_eq!(f.db.queue().depth("sns-messages").await.unwrap(), 1);

    let garbage = f
        .client
        .post(f.url("/sns-messages"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status().as_u16(), 400);
}
