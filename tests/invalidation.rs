// Integration tests for tag-based invalidation after mutations

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use kinder_client::cache::CacheKey;
use kinder_client::endpoint::{Method, Tag};
use kinder_client::kindergarten::endpoints;
use kinder_client::kindergarten::models::{NewReview, School, SchoolId, SchoolStatus};
use kinder_client::transport::HttpResponse;
use kinder_client::transport::mock::MockTransport;
use kinder_client::{ApiClient, ClientConfig, QueryConfig};
use serde_json::{Value, json};

fn school_json(id: u64, status: &str) -> Value {
    json!({"data": {"id": id, "name": format!("school {id}"), "address": "Seoul", "status": status}})
}

fn client(mock: &MockTransport) -> ApiClient {
    client_with(mock, QueryConfig::default())
}

fn client_with(mock: &MockTransport, query: QueryConfig) -> ApiClient {
    ApiClient::builder()
        .config(
            ClientConfig::default()
                .with_base_url("http://localhost/api")
                .with_query(query),
        )
        .transport(mock.clone())
        .build()
        .expect("client builds")
}

/// School 42 answers with its status at the moment the GET is sent, after
/// 100ms. Publishing flips the status at once.
fn slow_school_with_publish(mock: &MockTransport) {
    let published = Arc::new(AtomicBool::new(false));
    let read = published.clone();
    mock.on_delayed(
        Method::Get,
        "/api/schools/42",
        Duration::from_millis(100),
        move |_| {
            let status = if read.load(Ordering::SeqCst) { "PUBLISHED" } else { "APPROVED" };
            Ok(HttpResponse::json(200, &school_json(42, status)))
        },
    );
    mock.on(Method::Post, "/api/owner/school/42/publish", move |_| {
        published.store(true, Ordering::SeqCst);
        Ok(HttpResponse::json(200, &school_json(42, "PUBLISHED")))
    });
}

#[tokio::test(start_paused = true)]
async fn test_publish_refetches_only_the_published_school() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    mock.on_sequence(
        Method::Get,
        "/api/schools/42",
        vec![
            Ok(HttpResponse::json(200, &school_json(42, "APPROVED"))),
            Ok(HttpResponse::json(200, &school_json(42, "PUBLISHED"))),
        ],
    );
    mock.on_json(
        Method::Post,
        "/api/owner/school/42/publish",
        200,
        school_json(42, "PUBLISHED"),
    );
    mock.on_json(
        Method::Post,
        "/api/owner/school/7/publish",
        200,
        school_json(7, "PUBLISHED"),
    );
    let client = client(&mock);

    let mut school = client.query(&endpoints::school(), SchoolId(42));
    let before = school.settled().await.expect("initial fetch settles");
    assert_eq!(before.data().map(|s| s.status), Some(SchoolStatus::Approved));

    // Another school's publish leaves School:42 alone.
    client.mutate(&endpoints::publish_school(), SchoolId(7)).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 1);
    let key = CacheKey::new("school", "42");
    assert!(!client.cache().lookup(&key).expect("entry cached").is_stale);

    client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;
    let stale = school.next().await.expect("stale state");
    assert!(stale.is_stale() || stale.is_fetching);
    assert_eq!(stale.data().map(|s| s.status), Some(SchoolStatus::Approved));

    let after = school.settled().await.expect("refetch settles");
    assert_eq!(after.data().map(|s| s.status), Some(SchoolStatus::Published));
    assert!(!after.is_stale());
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 2);
    Ok(())
}

#[tokio::test]
async fn test_mutation_evicts_unsubscribed_entries() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    mock.on_json(Method::Get, "/api/schools/42", 200, school_json(42, "APPROVED"));
    mock.on_json(
        Method::Post,
        "/api/owner/school/42/publish",
        200,
        school_json(42, "PUBLISHED"),
    );
    let client = client(&mock);

    client.fetch(&endpoints::school(), SchoolId(42)).await?;
    let key = CacheKey::new("school", "42");
    assert!(client.cache().contains(&key));

    client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;
    assert!(!client.cache().contains(&key));
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 1);

    // The next read goes to the server.
    client.fetch(&endpoints::school(), SchoolId(42)).await?;
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_mutation_invalidates_nothing() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    mock.on_json(Method::Get, "/api/schools/42", 200, school_json(42, "APPROVED"));
    mock.on_json(
        Method::Post,
        "/api/owner/school/42/publish",
        409,
        json!({"error": {"code": "NOT_APPROVED", "message": "school is not approved"}}),
    );
    let client = client(&mock);

    client.fetch(&endpoints::school(), SchoolId(42)).await?;
    let err = client
        .mutate(&endpoints::publish_school(), SchoolId(42))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(409));
    assert!(client.cache().contains(&CacheKey::new("school", "42")));
    Ok(())
}

#[tokio::test]
async fn test_invalidate_without_match_is_noop() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    mock.on_json(Method::Get, "/api/schools/42", 200, school_json(42, "APPROVED"));
    let client = client(&mock);

    let mut school = client.query(&endpoints::school(), SchoolId(42));
    school.settled().await.expect("settles");

    let outcome = client.invalidate_tags(&[Tag::with_id("School", 7), Tag::new("Review")]);
    assert!(outcome.is_empty());
    assert_eq!(client.cache().len(), 1);
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 1);

    let outcome = client.invalidate_tags(&[Tag::new("School")]);
    assert_eq!(outcome.refetched, vec![CacheKey::new("school", "42")]);
    Ok(())
}

#[tokio::test]
async fn test_new_review_refreshes_reviews_and_school() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    let review = json!({
        "id": 9, "schoolId": 3, "author": "kim", "rating": 4,
        "content": "friendly staff", "status": "VISIBLE"
    });
    mock.on_sequence(
        Method::Get,
        "/api/schools/3/reviews",
        vec![
            Ok(HttpResponse::json(200, &json!({"data": []}))),
            Ok(HttpResponse::json(200, &json!({"data": [review.clone()]}))),
        ],
    );
    mock.on_json(Method::Get, "/api/schools/3", 200, school_json(3, "PUBLISHED"));
    mock.on_json(Method::Post, "/api/schools/3/reviews", 201, json!({"data": review}));
    let client = client(&mock);

    let mut reviews = client.query(&endpoints::school_reviews(), SchoolId(3));
    let mut school = client.query(&endpoints::school(), SchoolId(3));
    assert_eq!(reviews.settled().await.and_then(|r| r.data().map(Vec::len)), Some(0));
    school.settled().await.expect("school settles");

    let created = client
        .mutate(
            &endpoints::create_review(),
            NewReview {
                school_id: SchoolId(3),
                rating: 4,
                content: "friendly staff".to_string(),
            },
        )
        .await?;
    assert_eq!(created.rating, 4);

    assert_eq!(reviews.settled().await.and_then(|r| r.data().map(Vec::len)), Some(1));
    school.settled().await.expect("school refetch settles");
    assert_eq!(mock.call_count(Method::Get, "/api/schools/3/reviews"), 2);
    assert_eq!(mock.call_count(Method::Get, "/api/schools/3"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_publish_during_first_fetch_refetches_pending_query() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    slow_school_with_publish(&mock);
    let client = client(&mock);

    let mut school = client.query(&endpoints::school(), SchoolId(42));
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;

    let settled = school.settled().await.expect("stream settles");
    assert_eq!(settled.data().map(|s| s.status), Some(SchoolStatus::Published));
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_publish_during_unsubscribed_fetch_returns_fresh_value() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    slow_school_with_publish(&mock);
    let client = client(&mock);

    let reader = client.clone();
    let pending =
        tokio::spawn(async move { reader.fetch(&endpoints::school(), SchoolId(42)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;

    let school = pending.await??;
    assert_eq!(school.status, SchoolStatus::Published);

    // The cache holds the fresh value, so this read needs no request.
    let cached = client.fetch(&endpoints::school(), SchoolId(42)).await?;
    assert_eq!(cached.status, SchoolStatus::Published);
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_evicted_entry_is_not_restored_by_its_running_fetch() -> color_eyre::Result<()> {
    let mock = MockTransport::new();
    slow_school_with_publish(&mock);
    let client = client_with(
        &mock,
        QueryConfig::new(Duration::from_millis(10), Duration::from_secs(60)),
    );

    client.fetch(&endpoints::school(), SchoolId(42)).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The entry is stale and tagged, so the publish evicts it while its
    // background refetch is on the wire.
    let reader = client.clone();
    let refetch =
        tokio::spawn(async move { reader.fetch(&endpoints::school(), SchoolId(42)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.mutate(&endpoints::publish_school(), SchoolId(42)).await?;

    assert_eq!(refetch.await??.status, SchoolStatus::Published);
    let key = CacheKey::new("school", "42");
    let entry = client.cache().lookup(&key).expect("fresh value cached");
    assert_eq!(
        entry.data_as::<School>().map(|school| school.status),
        Some(SchoolStatus::Published)
    );
    assert_eq!(mock.call_count(Method::Get, "/api/schools/42"), 3);
    Ok(())
}
