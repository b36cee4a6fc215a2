use std::sync::Arc;
use std::time::Duration;

use epicrag_auth::{
    AssertionSigner, AuthClient, AuthError, Credentials, RetryPolicy, SigningKey, TokenCache,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY: &str = include_str!("fixtures/test_key.pem");

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(attempts)
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(40))
}

fn credentials(server: &MockServer) -> Credentials {
    Credentials::new(
        "client-123",
        "kid-1",
        &format!("{}/oauth2/token", server.uri()),
        &format!("{}/api/FHIR/R4", server.uri()),
        SigningKey::from_pem(TEST_KEY).unwrap(),
    )
    .unwrap()
}

fn cache_with(credentials: Credentials, retry: RetryPolicy) -> TokenCache {
    let signer = AssertionSigner::new(Arc::new(credentials));
    TokenCache::new(AuthClient::new(signer, retry).unwrap())
}

fn token_body(token: &str, expires_in: i64) -> serde_json::Value {
    json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "system/Patient.read system/Observation.read"
    })
}

#[tokio::test]
async fn cached_token_is_reused_within_lifetime() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains(
            "client_assertion_type=urn%3Aietf%3Aparams%3Aoauth%3Aclient-assertion-type%3Ajwt-bearer",
        ))
        .and(body_string_contains("client_assertion=ey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-1", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(3));

    let first = cache.get_valid_token().await.unwrap();
    let second = cache.get_valid_token().await.unwrap();

    assert_eq!(first.secret(), "token-1");
    assert_eq!(first, second);
    assert_eq!(cache.exchange_count(), 1);
    assert_eq!(
        first.scope(),
        Some("system/Patient.read system/Observation.read")
    );
}

#[tokio::test]
async fn token_near_expiry_is_refreshed() {
    let server = MockServer::start().await;
    // A 1s token has an effective margin of 500ms.
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("short-1", 1)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("long-2", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(3));

    let first = cache.get_valid_token().await.unwrap();
    assert_eq!(first.secret(), "short-1");
    assert!(first.is_usable(cache.margin()));

    tokio::time::sleep(Duration::from_millis(600)).await;

    let second = cache.get_valid_token().await.unwrap();
    assert_eq!(second.secret(), "long-2");
    assert!(second.is_usable(cache.margin()));
    assert_eq!(cache.exchange_count(), 2);
}

#[tokio::test]
async fn scope_is_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("scope=system%2FPatient.read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("scoped", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let creds = credentials(&server).with_scope("system/Patient.read");
    let cache = cache_with(creds, fast_retry(1));
    assert_eq!(cache.get_valid_token().await.unwrap().secret(), "scoped");
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_client"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(4));
    let err = cache.get_valid_token().await.unwrap_err();

    match err {
        AuthError::AuthRejected { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("invalid_client"));
        }
        other => panic!("expected AuthRejected, got {other:?}"),
    }
    assert!(cache.peek().await.is_none());
}

#[tokio::test]
async fn server_errors_are_retried_then_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(3));
    let err = cache.get_valid_token().await.unwrap_err();

    assert!(matches!(
        err,
        AuthError::AuthServerUnavailable { attempts: 3, .. }
    ));
    assert!(err.is_transient());
}

#[tokio::test]
async fn transient_failure_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("after-retry", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(3));
    assert_eq!(cache.get_valid_token().await.unwrap().secret(), "after-retry");
}

#[tokio::test]
async fn malformed_token_response_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(3));
    let err = cache.get_valid_token().await.unwrap_err();
    assert!(matches!(err, AuthError::TokenParse { .. }));
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    let server = MockServer::start().await;
    let creds = credentials(&server);
    drop(server);

    let cache = cache_with(creds, fast_retry(2));
    let err = cache.get_valid_token().await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::AuthServerUnavailable { attempts: 2, .. }
    ));
}

#[tokio::test]
async fn force_refresh_replaces_only_stale_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("first", 3600)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("second", 3600)))
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(1));
    let stale = cache.get_valid_token().await.unwrap();
    assert_eq!(stale.secret(), "first");

    let fresh = cache.force_refresh(&stale).await.unwrap();
    assert_eq!(fresh.secret(), "second");

    // A second caller holding the same stale token gets the replacement.
    let again = cache.force_refresh(&stale).await.unwrap();
    assert_eq!(again, fresh);
    assert_eq!(cache.exchange_count(), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("shared", 3600))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(cache_with(credentials(&server), fast_retry(1)));
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_valid_token().await })
        })
        .collect();

    for handle in handles {
        let token = handle.await.unwrap().unwrap();
        assert_eq!(token.secret(), "shared");
    }
    assert_eq!(cache.exchange_count(), 1);
}

#[tokio::test]
async fn invalidate_forces_new_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok", 3600)))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_with(credentials(&server), fast_retry(1));
    cache.get_valid_token().await.unwrap();
    cache.invalidate().await;
    assert!(cache.peek().await.is_none());
    cache.get_valid_token().await.unwrap();
}
