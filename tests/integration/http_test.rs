//! HTTP integration tests
//!
//! Drive the login routes through the router with a stub identity provider.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use secrecy::SecretString;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;
    use trustgate::auth::{
        AccessGrant, Direction, IdentityProvider, ProviderError, ProviderUser, UserIdentity,
    };
    use trustgate::cache::{ExpiringCache, MemoryCache};
    use trustgate::cli::AppConfig;
    use trustgate::server::{build_router, AppState};

    struct StubProvider;

    #[async_trait]
    impl IdentityProvider for StubProvider {
        fn authorize_url(&self, direction: &Direction) -> Result<String, ProviderError> {
            Ok(format!(
                "https://provider.test/authorize?redirect_uri={}&state={}",
                direction.redirect_uri, direction.state
            ))
        }

        async fn exchange_code(&self, code: &str) -> Result<AccessGrant, ProviderError> {
            match code {
                "good" => Ok(AccessGrant {
                    access_token: SecretString::new("AT".to_string()),
                    expires_in: 7200,
                    refresh_token: None,
                    openid: "U1".to_string(),
                    scope: "snsapi_userinfo".to_string(),
                }),
                _ => Err(ProviderError::Rejected {
                    code: 40029,
                    message: "invalid code".to_string(),
                }),
            }
        }

        async fn fetch_user(&self, grant: &AccessGrant) -> Result<ProviderUser, ProviderError> {
            let mut user = ProviderUser::new(grant.openid.clone());
            user.nickname = Some("ann".to_string());
            Ok(user)
        }
    }

    fn setup(api_key: Option<&str>) -> (Arc<MemoryCache>, Router) {
        setup_with(api_key, &[])
    }

    fn setup_with(api_key: Option<&str>, trusted_proxies: &[&str]) -> (Arc<MemoryCache>, Router) {
        let mut config = AppConfig::default();
        config.fast_auth.enabled = true;
        config.server.public_url = Some("https://login.test".to_string());
        config.server.api_key = api_key.map(|k| SecretString::new(k.to_string()));
        config.server.trusted_proxies = trusted_proxies.iter().map(|p| p.parse().unwrap()).collect();

        let cache = Arc::new(MemoryCache::new(1_000));
        let state = Arc::new(AppState::new(config, cache.clone(), Arc::new(StubProvider)));
        (cache, build_router(state))
    }

    /// Request arriving on a socket from `peer`.
    fn get(uri: &str, peer: &str, agent: Option<&str>) -> Request<Body> {
        forwarded(uri, peer, None, agent)
    }

    fn forwarded(
        uri: &str,
        peer: &str,
        forwarded_for: Option<&str>,
        agent: Option<&str>,
    ) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(forwarded_for) = forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded_for);
        }
        if let Some(agent) = agent {
            builder = builder.header(header::USER_AGENT, agent);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let peer: SocketAddr = format!("{}:40000", peer).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_begin_without_cached_identity_redirects() {
        let (_, app) = setup(None);
        let response = app
            .oneshot(get("/oauth/begin?state=abc", "1.2.3.4", Some("X")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://provider.test/authorize"));
        assert!(location.contains("redirect_uri=https://login.test/oauth/success"));
        assert!(location.contains("state=abc"));
    }

    #[tokio::test]
    async fn test_success_requires_code() {
        let (_, app) = setup(None);
        let response = app
            .oneshot(get("/oauth/success", "1.2.3.4", Some("X")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "code is empty");
    }

    #[tokio::test]
    async fn test_success_reports_provider_rejection() {
        let (_, app) = setup(None);
        let response = app
            .oneshot(get("/oauth/success?code=bad", "1.2.3.4", Some("X")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["message"].as_str().unwrap().contains("invalid code"));
    }

    #[tokio::test]
    async fn test_full_login_enables_fast_login() {
        let (cache, app) = setup(None);

        let response = app
            .clone()
            .oneshot(get("/oauth/success?code=good", "1.2.3.4", Some("Agent X")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["openid"], "U1");
        assert_eq!(body["fast"], false);

        assert_eq!(
            cache.get("openidweight:U1").await.unwrap().as_deref(),
            Some(&b"100"[..])
        );

        let response = app
            .clone()
            .oneshot(get("/oauth/begin", "1.2.3.4", Some("Agent X")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["fast"], true);
        let user: ProviderUser = serde_json::from_value(body["data"].clone()).unwrap();
        assert_eq!(user.identifier(), "U1");
        assert_eq!(user.nickname.as_deref(), Some("ann"));

        // Different agent from the same address is a different client.
        let response = app
            .oneshot(get("/oauth/begin", "1.2.3.4", Some("Agent Y")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_login_without_user_agent_is_not_cached() {
        let (cache, app) = setup(None);
        let response = app
            .clone()
            .oneshot(get("/oauth/success?code=good", "1.2.3.4", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!cache.exists("1.2.3.4").await.unwrap());

        let response = app
            .oneshot(get("/oauth/begin", "1.2.3.4", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_forwarded_for_from_untrusted_peer_is_ignored() {
        let (_, app) = setup(None);
        let response = app
            .clone()
            .oneshot(get("/oauth/success?code=good", "10.0.0.5", Some("Agent X")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Another host claims the logged-in client's address.
        let response = app
            .oneshot(forwarded(
                "/oauth/begin",
                "203.0.113.9",
                Some("10.0.0.5"),
                Some("Agent X"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_forwarded_for_from_trusted_proxy_is_used() {
        let (cache, app) = setup_with(None, &["127.0.0.1"]);
        let response = app
            .clone()
            .oneshot(forwarded(
                "/oauth/success?code=good",
                "127.0.0.1",
                Some("10.0.0.5"),
                Some("Agent X"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(cache.exists("10.0.0.5").await.unwrap());
        assert!(!cache.exists("127.0.0.1").await.unwrap());

        let response = app
            .clone()
            .oneshot(forwarded(
                "/oauth/begin",
                "127.0.0.1",
                Some("10.0.0.5"),
                Some("Agent X"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["fast"], true);

        // Same client reaching the service directly is not behind the proxy.
        let response = app
            .oneshot(forwarded(
                "/oauth/begin",
                "203.0.113.9",
                Some("10.0.0.5"),
                Some("Agent X"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    fn corroboration(identifier: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/corroborations")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        builder
            .body(Body::from(
                serde_json::json!({ "identifier": identifier }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_corroboration_requires_api_key() {
        let (cache, app) = setup(Some("s3cret"));

        let response = app
            .clone()
            .oneshot(corroboration("U1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(corroboration("U1", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(corroboration("U1", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(cache.exists("wechatserver:U1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corroboration_rejects_empty_identifier() {
        let (_, app) = setup(None);
        let response = app.oneshot(corroboration("", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_routes_skip_api_key() {
        let (_, app) = setup(Some("s3cret"));
        let response = app
            .oneshot(get("/oauth/begin", "1.2.3.4", Some("X")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_cache() {
        let (_, app) = setup(None);
        let response = app
            .oneshot(get("/health", "127.0.0.1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["fast_auth"], true);
    }
}
