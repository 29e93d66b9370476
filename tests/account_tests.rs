// Account login flows against in-process identity and Resource Manager doubles


use azprofile::cache::{TokenCache, TokenCacheEntry, TokenQuery};
use azprofile::environment::CLI_CLIENT_ID;
use azprofile::subscriptions::UserType;
use azprofile::{AuthError, CloudEnvironment, LoginMode, Profile, ServicePrincipalSecret};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use test_helpers::*;

const USER: &str = "admin@contoso.com";

fn password_login() -> LoginMode {
    LoginMode::UsernamePassword {
        username: USER.to_string(),
        password: "hunter2".to_string(),
    }
}

fn two_tenants() -> FakeArm {
    FakeArm::new().with_tenant("t1", &["s1"]).with_tenant("t2", &["s2"])
}

#[tokio::test]
async fn test_common_tenant_enumerates_every_tenant_in_order() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());

    let result = harness.account.load(Some("common"), password_login()).await.unwrap();

    let ids: Vec<(&str, &str)> = result
        .subscriptions
        .iter()
        .map(|s| (s.id.as_str(), s.tenant_id.as_str()))
        .collect();
    assert_eq!(ids, vec![("s1", "t1"), ("s2", "t2")]);
    assert_eq!(result.tenant_ids, vec!["t1", "t2"]);
    assert_eq!(count(&harness.arm.tenant_calls), 1);
    assert_eq!(harness.arm.visited(), vec!["t1", "t2"]);

    let first = &result.subscriptions[0];
    assert_eq!(first.user.name, USER);
    assert_eq!(first.user.user_type, UserType::User);
    assert_eq!(first.environment_name, "AzureCloud");
    assert!(!first.is_default);
}

#[tokio::test]
async fn test_missing_tenant_hint_means_common() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());

    let result = harness.account.load(None, password_login()).await.unwrap();

    assert_eq!(result.subscriptions.len(), 2);
    assert_eq!(count(&harness.arm.tenant_calls), 1);
}

#[tokio::test]
async fn test_concrete_tenant_skips_tenant_listing() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());

    let result = harness.account.load(Some("t2"), password_login()).await.unwrap();

    assert_eq!(count(&harness.arm.tenant_calls), 0);
    assert_eq!(result.tenant_ids, vec!["t2"]);
    assert_eq!(result.subscriptions.len(), 1);
    assert_eq!(result.subscriptions[0].id, "s2");
    // The token from the password grant is reused as is
    assert_eq!(count(&harness.identity.refresh_calls), 0);
}

#[tokio::test]
async fn test_per_tenant_tokens_come_from_the_common_refresh_token() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());

    harness.account.load(None, password_login()).await.unwrap();

    assert_eq!(count(&harness.identity.password_calls), 1);
    assert_eq!(count(&harness.identity.refresh_calls), 2);

    let env = CloudEnvironment::default();
    for tenant in ["common", "t1", "t2"] {
        let cached = harness
            .cache
            .find(&TokenQuery::user(CLI_CLIENT_ID, USER, &env.authority_url(tenant)))
            .await
            .unwrap();
        assert_eq!(cached.len(), 1, "expected one token for {tenant}");
    }
}

#[tokio::test]
async fn test_second_load_with_warm_cache_is_stable() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());

    let first = harness.account.load(None, password_login()).await.unwrap();
    let refreshes = count(&harness.identity.refresh_calls);

    let second = harness.account.load(None, password_login()).await.unwrap();

    assert_eq!(first.subscriptions, second.subscriptions);
    assert_eq!(count(&harness.identity.refresh_calls), refreshes);
}

#[tokio::test]
async fn test_username_mismatch_stops_before_listing() {
    let harness = Harness::new(FakeIdentity::new("someone.else@contoso.com"), two_tenants());

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    match err {
        AuthError::UsernameMismatch { token_user, requested } => {
            assert_eq!(token_user, "someone.else@contoso.com");
            assert_eq!(requested, USER);
        }
        other => panic!("expected UsernameMismatch, got {other:?}"),
    }
    assert_eq!(count(&harness.arm.tenant_calls), 0);
    assert_eq!(count(&harness.arm.subscription_calls), 0);
}

#[tokio::test]
async fn test_username_case_from_identity_provider_wins() {
    let harness = Harness::new(FakeIdentity::new("Admin@Contoso.com"), two_tenants());

    let result = harness.account.load(Some("t1"), password_login()).await.unwrap();

    assert_eq!(result.subscriptions[0].user.name, "Admin@Contoso.com");
}

#[tokio::test]
async fn test_short_domain_is_expanded_before_login() {
    let harness = Harness::new(FakeIdentity::new("admin@contoso.onmicrosoft.com"), two_tenants());
    let mode = LoginMode::UsernamePassword {
        username: "admin@contoso".to_string(),
        password: "hunter2".to_string(),
    };

    let result = harness.account.load(Some("t1"), mode).await.unwrap();

    assert_eq!(result.subscriptions[0].user.name, "admin@contoso.onmicrosoft.com");
}

#[tokio::test]
async fn test_failing_tenant_fails_whole_enumeration() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants().failing_tenant("t2"));

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    match err {
        AuthError::SubscriptionListingFailed { tenant, .. } => assert_eq!(tenant, "t2"),
        other => panic!("expected SubscriptionListingFailed, got {other:?}"),
    }
    assert_eq!(harness.arm.visited(), vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_tenant_listing_failure() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants().failing_tenant_listing());

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    assert!(matches!(err, AuthError::TenantListingFailed(_)));
    assert_eq!(count(&harness.arm.subscription_calls), 0);
}

#[tokio::test]
async fn test_second_factor_error_asks_for_interactive_login() {
    let identity = FakeIdentity::new(USER)
        .failing_password("AADSTS50076: Due to a configuration change made by your administrator, you must use multi-factor authentication");
    let harness = Harness::new(identity, two_tenants());

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    assert!(err.warn_to_user_interactive());
    assert_eq!(count(&harness.arm.tenant_calls), 0);
}

#[tokio::test]
async fn test_microsoft_account_error_is_polished() {
    let identity = FakeIdentity::new(USER).failing_password("Server returned an unknown AccountType: undefined");
    let harness = Harness::new(identity, two_tenants());

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    assert!(err.warn_to_user_interactive());
    assert!(err.to_string().contains("interactive flow"));
}

#[tokio::test]
async fn test_wrong_password_is_not_tagged_interactive() {
    let identity = FakeIdentity::new(USER).failing_password("AADSTS50126: Invalid username or password");
    let harness = Harness::new(identity, two_tenants());

    let err = harness.account.load(None, password_login()).await.unwrap_err();

    assert!(!err.warn_to_user_interactive());
    assert!(err.to_string().contains("AADSTS50126"));
}

#[tokio::test]
async fn test_interactive_login_shows_user_code() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    let shown = Arc::new(AtomicBool::new(false));
    let flag = shown.clone();
    let Harness { account, identity, .. } = harness;
    let account = account.with_user_code_handler(move |code| {
        assert_eq!(code.user_code, "ABCD1234");
        flag.store(true, Ordering::SeqCst);
    });

    let result = account.load(None, LoginMode::Interactive).await.unwrap();

    assert!(shown.load(Ordering::SeqCst));
    assert_eq!(count(&identity.device_calls), 1);
    assert_eq!(count(&identity.password_calls), 0);
    assert_eq!(result.subscriptions.len(), 2);
}

#[tokio::test]
async fn test_service_principal_login_with_secret() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    let mode = LoginMode::ServicePrincipal {
        app_id: "app-1".to_string(),
        secret: ServicePrincipalSecret::Secret("s3cret".to_string()),
    };

    let result = harness.account.load(Some("t1"), mode).await.unwrap();

    assert_eq!(count(&harness.arm.tenant_calls), 0);
    assert_eq!(result.tenant_ids, vec!["t1"]);
    assert_eq!(result.subscriptions.len(), 1);
    assert_eq!(result.subscriptions[0].user.name, "app-1");
    assert_eq!(result.subscriptions[0].user.user_type, UserType::ServicePrincipal);

    let keys = harness
        .cache
        .find(&TokenQuery::service_principal("app-1", "t1"))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].access_token.as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn test_second_service_principal_load_reuses_app_token() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    let mode = || LoginMode::ServicePrincipal {
        app_id: "app-1".to_string(),
        secret: ServicePrincipalSecret::Secret("s3cret".to_string()),
    };

    let first = harness.account.load(Some("t1"), mode()).await.unwrap();
    assert_eq!(count(&harness.identity.client_calls), 1);

    let second = harness.account.load(Some("t1"), mode()).await.unwrap();

    assert_eq!(first.subscriptions, second.subscriptions);
    assert_eq!(count(&harness.identity.client_calls), 1);
}

#[tokio::test]
async fn test_service_principal_rejected_secret_is_removed() {
    let harness = Harness::new(FakeIdentity::new(USER).failing_client(), two_tenants());
    let mode = LoginMode::ServicePrincipal {
        app_id: "app-1".to_string(),
        secret: ServicePrincipalSecret::Secret("wrong".to_string()),
    };

    let err = harness.account.load(Some("t1"), mode).await.unwrap_err();

    assert!(matches!(err, AuthError::SubscriptionListingFailed { .. }));
    assert!(err.to_string().contains("Unable to acquire token"));
    assert!(harness.entries().await.is_empty());
}

#[tokio::test]
async fn test_cloud_console_tokens_are_imported() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    let arm_token = unsigned_jwt(&json!({
        "aud": "https://management.core.windows.net/",
        "tid": "t1",
        "unique_name": "live.com#alice@outlook.com",
        "oid": "object-7"
    }));
    let graph_token = unsigned_jwt(&json!({
        "aud": "https://graph.windows.net/",
        "tid": "t1",
        "unique_name": "live.com#alice@outlook.com"
    }));

    let mode = LoginMode::CloudConsole {
        tokens: vec![arm_token.clone(), graph_token],
    };
    let result = harness.account.load(None, mode).await.unwrap();

    assert_eq!(result.tenant_ids, vec!["t1"]);
    assert_eq!(result.subscriptions.len(), 1);
    assert_eq!(result.subscriptions[0].user.name, "alice@outlook.com");
    assert_eq!(harness.identity.token_calls(), 0);
    assert_eq!(count(&harness.arm.tenant_calls), 0);

    let entries = harness.entries().await;
    assert_eq!(entries.len(), 2);
    let arm_entry = entries
        .iter()
        .find(|e| e.resource == "https://management.core.windows.net/")
        .unwrap();
    assert_eq!(arm_entry.access_token.as_deref(), Some(arm_token.as_str()));
    assert_eq!(arm_entry.client_id.as_deref(), Some(CLI_CLIENT_ID));
    assert_eq!(arm_entry.oid.as_deref(), Some("object-7"));
    assert!(arm_entry.is_mrrt);
    assert!(arm_entry.expires_on.unwrap() > Utc::now() + Duration::hours(23));
}

#[tokio::test]
async fn test_cloud_console_keeps_tokens_for_other_resources() {
    let env = CloudEnvironment::default();
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    harness
        .cache
        .add(vec![TokenCacheEntry {
            client_id: Some(CLI_CLIENT_ID.to_string()),
            user_id: Some("alice@outlook.com".to_string()),
            authority: Some(env.authority_url("t1")),
            resource: "https://vault.azure.net".to_string(),
            access_token: Some("vault-token".to_string()),
            expires_on: Some(Utc::now() + Duration::hours(1)),
            ..TokenCacheEntry::default()
        }])
        .await
        .unwrap();

    let token = unsigned_jwt(&json!({
        "aud": "https://management.core.windows.net/",
        "tid": "t1",
        "unique_name": "alice@outlook.com"
    }));
    harness
        .account
        .load(None, LoginMode::CloudConsole { tokens: vec![token] })
        .await
        .unwrap();

    let resources: Vec<String> = harness.entries().await.into_iter().map(|e| e.resource).collect();
    assert!(resources.contains(&"https://vault.azure.net".to_string()));
    assert!(resources.contains(&"https://management.core.windows.net/".to_string()));
}

#[tokio::test]
async fn test_cloud_console_rejects_token_without_tenant() {
    let harness = Harness::new(FakeIdentity::new(USER), two_tenants());
    let token = unsigned_jwt(&json!({"aud": "https://management.core.windows.net/", "unique_name": "alice"}));

    let err = harness
        .account
        .load(None, LoginMode::CloudConsole { tokens: vec![token] })
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidToken(_)));
    assert!(harness.entries().await.is_empty());
}

#[tokio::test]
async fn test_login_with_file_cache_then_logout() {
    let env = TestEnvironment::new();
    let harness = Harness::with_cache(FakeIdentity::new(USER), two_tenants(), Arc::new(env.file_cache()));

    let result = harness.account.load(None, password_login()).await.unwrap();
    assert!(env.cache_file.exists());
    let raw = std::fs::read_to_string(&env.cache_file).unwrap();
    assert!(raw.contains("\"isMRRT\": true"));
    assert!(raw.contains(USER));

    let mut profile = Profile::load(&env.profile_file).unwrap();
    profile.add_subscriptions(result.subscriptions);
    profile.save(&env.profile_file).unwrap();
    assert_eq!(profile.default_subscription().unwrap().id, "s1");

    let mut profile = Profile::load(&env.profile_file).unwrap();
    let removed = profile.logout("ADMIN@contoso.com", harness.context()).await.unwrap();
    assert_eq!(removed, 2);
    assert!(profile.subscriptions.is_empty());
    assert!(harness.entries().await.is_empty());
}
