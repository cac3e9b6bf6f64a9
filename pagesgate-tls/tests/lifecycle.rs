//! Certificate lifecycle behavior across resolver, manager and store

mod common;

use common::*;
use pagesgate_core::config::CustomDomain;
use pagesgate_tls::cert_store::{
    CertStore, CertificateOrigin, MemoryCertStore, RETRY_BACKOFF_SECS, RenewalDecision, unix_now,
};
use pagesgate_tls::challenge::{ACME_TLS_ALPN_PROTOCOL, CHALLENGE_TTL};
use pagesgate_tls::manager::{CertError, CertificateManager, ObtainRequest};
use pagesgate_tls::mock::MOCK_VALIDITY;
use pagesgate_tls::rate_limit::TokenBucket;
use pagesgate_tls::resolver::{CertResolver, ResolveError, StaticDomainAuthority};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn authority() -> Arc<StaticDomainAuthority> {
    Arc::new(StaticDomainAuthority::new(&[CustomDomain {
        domain: "blog.example.com".to_string(),
        owner: "alice".to_string(),
        repo: "pages".to_string(),
        branch: "pages".to_string(),
        authorized: true,
    }]))
}

#[tokio::test]
async fn concurrent_handshakes_issue_once() {
    let ca = StubAuthority::with(Duration::from_millis(200), false);
    let manager = manager_with(Arc::new(MemoryCertStore::new()), Some(ca.clone()), None);
    let resolver = Arc::new(CertResolver::new(manager, authority()));

    let handshakes = (0..10).map(|_| {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve(Some("blog.example.com"), &[b"h2"]).await })
    });
    let keys = futures::future::join_all(handshakes).await;

    assert_eq!(ca.calls(), 1);
    let first = keys[0].as_ref().unwrap().as_ref().unwrap().cert[0].clone();
    for key in keys {
        assert_eq!(key.unwrap().unwrap().cert[0], first);
    }
}

#[tokio::test]
async fn failed_issuance_serves_persisted_mock() {
    let ca = StubAuthority::failing();
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), Some(ca.clone()), None);
    let resolver = CertResolver::new(manager, authority());

    let before = unix_now();
    resolver.resolve(Some("blog.example.com"), &[]).await.unwrap();

    let mock = store.get("blog.example.com").await.unwrap().unwrap();
    assert_eq!(mock.origin, CertificateOrigin::Mock);
    let expected = before + MOCK_VALIDITY.whole_seconds();
    assert!((mock.valid_till - expected).abs() <= 5, "valid_till {} vs {}", mock.valid_till, expected);
    assert_eq!(ca.calls(), 1);

    // the mock is not due for renewal for the next 6 hours
    assert_eq!(mock.renewal_decision(unix_now()), RenewalDecision::Valid);
    assert_eq!(
        mock.renewal_decision(unix_now() + RETRY_BACKOFF_SECS + 60),
        RenewalDecision::Due
    );
}

#[tokio::test]
async fn failed_renewal_keeps_previous_and_backs_off() {
    let ca = StubAuthority::failing();
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), Some(ca.clone()), None);

    let previous = issue(&["blog.example.com".to_string()], 2 * DAY);
    store.put("blog.example.com", &previous).await.unwrap();

    let now = unix_now();
    let handle = manager
        .schedule_renewal("blog.example.com", &previous, now)
        .expect("renewal is due");
    handle.await.unwrap();

    let stored = store.get("blog.example.com").await.unwrap().unwrap();
    assert_eq!(stored.origin, CertificateOrigin::Acme);
    assert_eq!(stored.certificate_chain, previous.certificate_chain);
    let retry_after = stored.retry_after.expect("retry_after stamped");
    assert!((retry_after - (now + RETRY_BACKOFF_SECS)).abs() <= 5);

    // inside the window nothing is scheduled
    assert_eq!(stored.renewal_decision(unix_now()), RenewalDecision::Backoff);
    assert!(manager.schedule_renewal("blog.example.com", &stored, unix_now()).is_none());
    // renew attempt plus the fresh order it falls back to
    assert_eq!(ca.calls(), 2);

    // after the window renewal is due again
    assert!(manager
        .schedule_renewal("blog.example.com", &stored, retry_after + 1)
        .is_some());
}

#[tokio::test]
async fn renewal_starts_inside_seven_days() {
    let ca = StubAuthority::new();
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), Some(ca.clone()), None);
    let now = unix_now();

    let fresh = issue(&["blog.example.com".to_string()], 8 * DAY);
    assert!(manager.schedule_renewal("blog.example.com", &fresh, now).is_none());

    let due = issue(&["blog.example.com".to_string()], 6 * DAY);
    store.put("blog.example.com", &due).await.unwrap();
    manager
        .schedule_renewal("blog.example.com", &due, now)
        .expect("renewal is due")
        .await
        .unwrap();

    assert_eq!(ca.calls(), 1);
    assert_eq!(ca.requests.lock()[0], vec!["blog.example.com".to_string()]);
    let renewed = store.get("blog.example.com").await.unwrap().unwrap();
    assert!(renewed.valid_till > now + 80 * DAY);
}

#[tokio::test]
async fn resolver_schedules_due_renewal_and_serves_stored() {
    let ca = StubAuthority::with(Duration::from_millis(50), false);
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), Some(ca.clone()), None);
    let resolver = CertResolver::new(manager.clone(), authority());

    let due = issue(&["blog.example.com".to_string()], 3 * DAY);
    store.put("blog.example.com", &due).await.unwrap();

    let key = resolver.resolve(Some("blog.example.com"), &[]).await.unwrap();
    assert_eq!(key.cert[0], due.to_certified_key().unwrap().cert[0]);

    // detached renewal runs under the obtain lock
    tokio::time::sleep(Duration::from_millis(10)).await;
    while manager.locks().is_locked("blog.example.com") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ca.calls(), 1);
}

#[tokio::test]
async fn primary_renews_inside_thirty_days() {
    let primary_ca = StubAuthority::with(Duration::ZERO, true);
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), None, Some(primary_ca.clone()));
    let now = unix_now();

    let domains = vec!["*.pages.example.org".to_string(), PRIMARY.to_string()];
    let healthy = issue(&domains, 31 * DAY);
    assert!(manager.schedule_primary_renewal(&healthy, now).is_none());

    let due = issue(&domains, 29 * DAY);
    store.put(".pages.example.org", &due).await.unwrap();
    manager
        .schedule_primary_renewal(&due, now)
        .expect("primary renewal")
        .await
        .unwrap();

    assert_eq!(primary_ca.calls(), 1);
    assert_eq!(primary_ca.requests.lock()[0], domains);
    let renewed = store.get("*.pages.example.org").await.unwrap().unwrap();
    assert!(renewed.valid_till > now + 80 * DAY);
}

#[tokio::test]
async fn primary_bootstrap_stores_under_primary_key() {
    let primary_ca = StubAuthority::with(Duration::ZERO, true);
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), None, Some(primary_ca.clone()));

    let primary = manager.ensure_primary_certificate().await.unwrap();
    assert_eq!(primary.domain, "*.pages.example.org");
    assert!(store.get(".pages.example.org").await.unwrap().is_some());
    assert!(store.get("*.PAGES.example.org").await.unwrap().is_some());

    // subdomains and the apex are served from it
    let resolver = CertResolver::new(manager, authority());
    assert!(resolver.resolve(Some("alice.pages.example.org"), &[]).await.is_ok());
    assert!(resolver.resolve(Some("pages.example.org"), &[]).await.is_ok());
    assert_eq!(primary_ca.calls(), 1);
}

#[tokio::test]
async fn unknown_domains_fall_back_to_primary() {
    let ca = StubAuthority::new();
    let primary_ca = StubAuthority::with(Duration::ZERO, true);
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = manager_with(store.clone(), Some(ca.clone()), Some(primary_ca));
    manager.ensure_primary_certificate().await.unwrap();

    let resolver = CertResolver::new(manager, authority());
    assert!(resolver.resolve(Some("stranger.example.net"), &[]).await.is_ok());
    assert_eq!(ca.calls(), 0);
    assert!(store.get("stranger.example.net").await.unwrap().is_none());
}

#[tokio::test]
async fn user_budget_exhaustion_falls_back_to_mock() {
    let ca = StubAuthority::new();
    let store: Arc<dyn CertStore> = Arc::new(MemoryCertStore::new());
    let manager = pagesgate_tls::CertificateManager::builder(store.clone(), PRIMARY)
        .general_authority(ca.clone())
        .build();

    for i in 0..10 {
        let req = ObtainRequest {
            domains: vec![format!("site{}.example.com", i)],
            user: Some("alice".to_string()),
            ..Default::default()
        };
        manager.obtain(req).await.unwrap();
    }
    let req = ObtainRequest {
        domains: vec!["site10.example.com".to_string()],
        user: Some("alice".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        manager.obtain(req).await,
        Err(CertError::UserRateLimitExceeded(_))
    ));
    assert_eq!(ca.calls(), 10);

    // the resolver turns the error into a mock
    let authority = Arc::new(StaticDomainAuthority::new(&[CustomDomain {
        domain: "site10.example.com".to_string(),
        owner: "alice".to_string(),
        repo: "pages".to_string(),
        branch: "pages".to_string(),
        authorized: true,
    }]));
    let resolver = CertResolver::new(manager, authority);
    assert!(resolver.resolve(Some("site10.example.com"), &[]).await.is_ok());
    let stored = store.get("site10.example.com").await.unwrap().unwrap();
    assert_eq!(stored.origin, CertificateOrigin::Mock);
}

#[tokio::test]
async fn wildcard_keys_share_a_record() {
    let store = MemoryCertStore::new();
    let resource = issue(&["*.example.com".to_string()], 90 * DAY);

    store.put("*.Example.com", &resource).await.unwrap();
    assert_eq!(store.get(".example.com").await.unwrap(), Some(resource.clone()));
    assert_eq!(store.get("*.example.com").await.unwrap(), Some(resource));

    store.delete(".EXAMPLE.com").await.unwrap();
    assert!(store.get("*.example.com").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn request_bucket_allows_five_per_second() {
    let bucket = TokenBucket::new(5, Duration::from_secs(1));
    for _ in 0..5 {
        assert!(bucket.ask());
    }
    assert!(!bucket.ask());

    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(bucket.ask());
    assert!(!bucket.ask());
}

/// Manager with the default CA budgets switched on
fn limited_manager(ca: Arc<StubAuthority>) -> Arc<CertificateManager> {
    CertificateManager::builder(Arc::new(MemoryCertStore::new()), PRIMARY)
        .general_authority(ca)
        .build()
}

#[tokio::test(start_paused = true)]
async fn fresh_issuance_spends_order_and_request_tokens() {
    let ca = StubAuthority::new();
    let manager = limited_manager(ca.clone());
    let start = Instant::now();

    for i in 0..5 {
        manager
            .obtain(ObtainRequest::new(vec![format!("site{}.example.com", i)]))
            .await
            .unwrap();
    }
    assert_eq!(start.elapsed(), Duration::ZERO);

    for i in 5..25 {
        manager
            .obtain(ObtainRequest::new(vec![format!("site{}.example.com", i)]))
            .await
            .unwrap();
    }
    // twenty more requests at 5/s
    let requests = start.elapsed();
    assert!(requests >= Duration::from_secs(3), "{:?}", requests);
    assert!(requests < Duration::from_secs(10), "{:?}", requests);

    // the 26th order waits for the order bucket (25 per 15 minutes)
    manager
        .obtain(ObtainRequest::new(vec!["site25.example.com".to_string()]))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(30), "{:?}", start.elapsed());
    assert_eq!(ca.calls(), 26);
}

#[tokio::test(start_paused = true)]
async fn failed_renewals_spend_failure_tokens() {
    let ca = StubAuthority::failing();
    let manager = limited_manager(ca.clone());
    let previous = issue(&["blog.example.com".to_string()], 2 * DAY);
    let request = || ObtainRequest {
        domains: vec!["blog.example.com".to_string()],
        previous: Some(previous.clone()),
        ..Default::default()
    };
    let start = Instant::now();

    for _ in 0..5 {
        let kept = manager.obtain(request()).await.unwrap();
        assert_eq!(kept.certificate_chain, previous.certificate_chain);
    }
    // renew and the fresh order each took a request token: ten at 5/s
    let five = start.elapsed();
    assert!(five >= Duration::from_millis(900), "{:?}", five);
    assert!(five < Duration::from_secs(2), "{:?}", five);

    // the sixth failure waits for the failure bucket (5 per hour)
    manager.obtain(request()).await.unwrap();
    assert!(start.elapsed() - five >= Duration::from_secs(10 * 60), "{:?}", start.elapsed());
    assert_eq!(ca.calls(), 12);
}

#[tokio::test]
async fn challenge_handshake_never_touches_store() {
    let store = Arc::new(CountingStore::default());
    let manager = manager_with(store.clone(), Some(StubAuthority::new()), None);
    manager
        .challenge_cache()
        .set("blog.example.com", "token.thumbprint".to_string(), CHALLENGE_TTL);
    let resolver = CertResolver::new(manager.clone(), authority());

    let alpn: &[&[u8]] = &[ACME_TLS_ALPN_PROTOCOL];
    assert!(resolver.resolve(Some("blog.example.com"), alpn).await.is_ok());
    assert!(matches!(
        resolver.resolve(Some("other.example.com"), alpn).await,
        Err(ResolveError::NoChallengeForDomain(_))
    ));

    assert_eq!(store.calls(), 0);
    assert!(manager.locks().is_empty());
}
