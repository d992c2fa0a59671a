use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use curtain_client::config::Config;
use curtain_client::db::Repository;
use curtain_client::error::AppError;
use curtain_client::models::{Credentials, Site};
use curtain_client::App;

fn config_for(server: &MockServer) -> Config {
    Config {
        fallback_base_url: format!("{}/", server.uri()),
        frontend_base_url: "https://curtain.proteo.info/".to_string(),
        connect_timeout_secs: 5,
        read_timeout_secs: 5,
        ..Config::default()
    }
}

async fn app_for(server: &MockServer) -> App {
    let repository = Repository::in_memory().await.unwrap();
    App::with_repository(&config_for(server), repository)
        .await
        .unwrap()
}

fn dataset_json(link_id: &str) -> serde_json::Value {
    json!({
        "id": 1,
        "link_id": link_id,
        "created": "2024-02-01T08:00:00Z",
        "file": format!("https://files.example/media/{}.json", link_id),
        "description": format!("Experiment {}", link_id),
        "enable": true,
        "curtain_type": "TP"
    })
}

#[tokio::test]
async fn sync_registers_fallback_site_and_follows_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "next": null,
            "results": [dataset_json("c3")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "next": format!("{}/curtain/?page=2", server.uri()),
            "results": [dataset_json("c1"), dataset_json("c2")]
        })))
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    assert_eq!(app.sync_datasets().await.unwrap(), 3);

    let site = app.repository.get_site(&server.uri()).await.unwrap().unwrap();
    assert!(!site.active);
    assert!(site.last_sync.is_some());

    let stored = app.repository.get_dataset("c2").await.unwrap().unwrap();
    assert_eq!(stored.source_site, server.uri());
    assert_eq!(
        stored.frontend_link.as_deref(),
        Some("https://curtain.proteo.info/#/c2")
    );
}

#[tokio::test]
async fn looping_pagination_stops_at_a_seen_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "next": format!("{}/curtain/", server.uri()),
            "results": [dataset_json("l2")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "next": format!("{}/curtain/?page=2", server.uri()),
            "results": [dataset_json("l1")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    assert_eq!(app.sync_datasets().await.unwrap(), 2);
    server.verify().await;
}

#[tokio::test]
async fn switching_site_routes_sync_and_clears_credentials() {
    let fallback = MockServer::start().await;
    let other = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([dataset_json("o1")])))
        .expect(1)
        .mount(&other)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&fallback)
        .await;

    let app = app_for(&fallback).await;
    app.credentials.set(Credentials::new("a", "r"));
    app.sites.register(Site::new(other.uri())).await.unwrap();
    app.switch_site(&other.uri()).await.unwrap();

    assert!(app.credentials.current().is_none());
    assert_eq!(app.sync_datasets().await.unwrap(), 1);
    assert_eq!(
        app.repository.get_dataset("o1").await.unwrap().unwrap().source_site,
        other.uri()
    );
    other.verify().await;
    fallback.verify().await;
}

#[tokio::test]
async fn deleting_active_site_from_cache_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([dataset_json("f1")])))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    let mut dead = Site::new("http://127.0.0.1:9");
    dead.active = true;
    app.sites.register(dead).await.unwrap();
    assert!(app.sites.get_active_base_address().is_some());

    assert!(app.repository.delete_site("http://127.0.0.1:9").await.unwrap());
    assert!(app.sites.get_active_base_address().is_none());

    assert_eq!(app.sync_datasets().await.unwrap(), 1);
    assert_eq!(
        app.repository.get_dataset("f1").await.unwrap().unwrap().source_site,
        server.uri()
    );
    server.verify().await;
}

#[tokio::test]
async fn deactivating_site_in_cache_stops_routing_to_it() {
    let fallback = MockServer::start().await;
    let other = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([dataset_json("f2")])))
        .expect(1)
        .mount(&fallback)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&other)
        .await;

    let app = app_for(&fallback).await;
    let mut site = Site::new(other.uri());
    site.active = true;
    app.sites.register(site.clone()).await.unwrap();

    site.active = false;
    assert!(app.repository.update_site(site).await.unwrap());
    assert!(app.sites.active_hostname().is_none());

    assert_eq!(app.sync_datasets().await.unwrap(), 1);
    fallback.verify().await;
    other.verify().await;
}

#[tokio::test]
async fn expired_session_surfaces_as_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    app.credentials.set(Credentials::new("stale", "expired"));

    let err = app.sync_datasets().await.unwrap_err();
    assert!(err.needs_reauthentication(), "got {:?}", err);
    assert!(app.repository.get_all_datasets().await.unwrap().is_empty());
}

#[tokio::test]
async fn shared_link_fetches_the_dataset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/curtain/f4b009f3-ac3c-470a-a68b-55fcadf68d0f/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(dataset_json("f4b009f3-ac3c-470a-a68b-55fcadf68d0f")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(&server).await;

    let record = app
        .open_shared_link("https://curtain.proteo.info/#/f4b009f3-ac3c-470a-a68b-55fcadf68d0f")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.description, "Experiment f4b009f3-ac3c-470a-a68b-55fcadf68d0f");
    assert!(app.repository.get_dataset(&record.id).await.unwrap().is_some());

    assert!(app.open_shared_link("garbage").await.unwrap().is_none());
    server.verify().await;
}

#[tokio::test]
async fn missing_dataset_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    let err = app.fetch_dataset("nope").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn filter_lists_sync_by_category() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data_filter_list/"))
        .and(query_param("category", "Kinases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 2,
            "next": null,
            "results": [
                { "id": 4, "name": "Human kinome", "category": "Kinases", "data": "AKT1\nAKT2", "default": true, "user": null },
                { "id": 9, "name": "Mine", "category": "Kinases", "data": "MAPK1", "default": false, "user": 3 }
            ]
        })))
        .mount(&server)
        .await;

    let app = app_for(&server).await;
    assert_eq!(app.sync_filter_lists(Some("Kinases")).await.unwrap(), 2);

    let shared = app.repository.get_filter_list(4).await.unwrap().unwrap();
    assert!(shared.is_default);
    assert_eq!(shared.owner_id, None);
    assert_eq!(app.repository.get_filter_list(9).await.unwrap().unwrap().owner_id, Some(3));
}

#[tokio::test]
async fn payload_download_uses_cached_reference() {
    let api = MockServer::start().await;
    let files = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/d1.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"raw\": []}"))
        .expect(1)
        .mount(&files)
        .await;

    let app = app_for(&api).await;
    app.repository.upsert_site(Site::new("https://alpha.example")).await.unwrap();
    let mut record = serde_json::from_value::<curtain_client::services::DatasetDto>(dataset_json("d1"))
        .unwrap()
        .into_record("https://alpha.example", &url::Url::parse("https://curtain.proteo.info/").unwrap());
    record.payload_ref = format!("{}/media/d1.json", files.uri());
    app.repository.upsert_dataset(record).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = app.download_payload("d1", dir.path(), None).await.unwrap();

    assert_eq!(path, dir.path().join("d1.json"));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "{\"raw\": []}");
    files.verify().await;
}
