//! ArcGIS REST client against a mock feature service

use featurepipe_server::ingest::fetcher::{BatchFetcher, FetchOutcome};
use featurepipe_server::ingest::schema::build_schema;
use featurepipe_server::ingest::source::{AttachmentInfo, PageRequest, PortalCredentials};
use featurepipe_server::ingest::{
    ArcGisClient, Crs, FeatureSource, JobSpec, RetryPolicy, SourceError, TokenProvider,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::{
    matchers::{body_string_contains, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const LAYER_PATH: &str = "/arcgis/rest/services/Trees/FeatureServer/0";

fn client(server: &MockServer) -> ArcGisClient {
    let url = Url::parse(&format!("{}{}", server.uri(), LAYER_PATH)).unwrap();
    ArcGisClient::new(reqwest::Client::new(), url)
}

fn layer_json() -> serde_json::Value {
    json!({
        "name": "Trees",
        "geometryType": "esriGeometryPoint",
        "objectIdField": "OBJECTID",
        "globalIdField": "GlobalID",
        "hasAttachments": true,
        "maxRecordCount": 2000,
        "extent": {"spatialReference": {"wkid": 102100, "latestWkid": 3857}},
        "fields": [
            {"name": "OBJECTID", "type": "esriFieldTypeOID", "alias": "OBJECTID"},
            {"name": "Species", "type": "esriFieldTypeString", "length": 64},
            {"name": "Planted", "type": "esriFieldTypeDate"},
            {"name": "GlobalID", "type": "esriFieldTypeGlobalID"}
        ]
    })
}

fn features_json(first: i64, count: i64) -> serde_json::Value {
    let features: Vec<_> = (first..first + count)
        .map(|oid| {
            json!({
                "attributes": {"OBJECTID": oid, "Species": "Quercus"},
                "geometry": {"x": -8_237_000.0 + oid as f64, "y": 4_970_000.0}
            })
        })
        .collect();
    json!({"features": features})
}

fn page(offset: u64, limit: u32) -> PageRequest {
    PageRequest {
        offset,
        limit,
        order_by: "OBJECTID".to_string(),
        return_geometry: true,
    }
}

// ============================================================================
// Metadata and paging
// ============================================================================

#[tokio::test]
async fn test_describe_layer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("f", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(layer_json()))
        .expect(1)
        .mount(&server)
        .await;

    let meta = client(&server).describe().await.unwrap();

    assert_eq!(meta.name.as_deref(), Some("Trees"));
    assert_eq!(meta.fields.len(), 4);
    assert_eq!(meta.geometry_type.as_deref(), Some("esriGeometryPoint"));
    assert_eq!(meta.object_id_field.as_deref(), Some("OBJECTID"));
    assert!(meta.has_attachments);
    assert_eq!(meta.declared_wkid(), Some(3857));
}

#[tokio::test]
async fn test_fetch_page_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/query", LAYER_PATH)))
        .and(query_param("f", "json"))
        .and(query_param("where", "1=1"))
        .and(query_param("outFields", "*"))
        .and(query_param("resultOffset", "1000"))
        .and(query_param("resultRecordCount", "500"))
        .and(query_param("orderByFields", "OBJECTID ASC"))
        .and(query_param("returnGeometry", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(features_json(1001, 500)))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server).fetch_page(&page(1000, 500)).await.unwrap();

    assert_eq!(result.records.len(), 500);
    assert!(!result.exceeded_transfer_limit);
    assert_eq!(result.records[0].attributes["OBJECTID"], json!(1001));
}

#[tokio::test]
async fn test_exceeded_transfer_limit() {
    let server = MockServer::start().await;
    let mut body = features_json(1, 3);
    body["exceededTransferLimit"] = json!(true);
    Mock::given(method("GET"))
        .and(path(format!("{}/query", LAYER_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let result = client(&server).fetch_page(&page(0, 10)).await.unwrap();
    assert_eq!(result.records.len(), 3);
    assert!(result.exceeded_transfer_limit);
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_service_error_in_ok_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/query", LAYER_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 400, "message": "Unable to complete operation.", "details": ["Invalid query"]}
        })))
        .mount(&server)
        .await;

    let err = client(&server).fetch_page(&page(0, 10)).await.unwrap_err();
    match &err {
        SourceError::Service { code, message } => {
            assert_eq!(*code, 400);
            assert!(message.contains("Invalid query"));
        },
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_http_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;

    let err = client(&server).describe().await.unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 503, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_non_json_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = client(&server).describe().await.unwrap_err();
    assert!(matches!(err, SourceError::Decode(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_fetcher_retries_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/query", LAYER_PATH)))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/query", LAYER_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(features_json(1, 4)))
        .expect(1)
        .mount(&server)
        .await;

    let meta: featurepipe_server::ingest::source::LayerMetadata =
        serde_json::from_value(layer_json()).unwrap();
    let spec = JobSpec::new(&format!("{}{}", server.uri(), LAYER_PATH), "trees").unwrap();
    let schema = build_schema(&meta, &spec, Crs::WGS84).unwrap().schema;
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    };
    let fetcher = BatchFetcher::new(Arc::new(client(&server)), &schema, 10, retry);

    match fetcher.fetch(0).await.unwrap() {
        FetchOutcome::Batch { batch, next } => {
            assert_eq!(batch.records.len(), 4);
            assert_eq!(next, None);
        },
        FetchOutcome::Done => panic!("expected a batch"),
    }
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_job_token_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("token", "job-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(layer_json()))
        .expect(1)
        .mount(&server)
        .await;

    let meta = client(&server).with_token("job-token").describe().await.unwrap();
    assert_eq!(meta.name.as_deref(), Some("Trees"));
}

#[tokio::test]
async fn test_portal_token_is_generated_once() {
    let server = MockServer::start().await;
    let expires = chrono::Utc::now().timestamp_millis() + 3_600_000;
    Mock::given(method("POST"))
        .and(path("/portal/sharing/rest/generateToken"))
        .and(body_string_contains("username=gis"))
        .and(body_string_contains("client=requestip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "portal-token", "expires": expires})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("token", "portal-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(layer_json()))
        .expect(2)
        .mount(&server)
        .await;

    let credentials = PortalCredentials {
        portal_url: Url::parse(&format!("{}/portal", server.uri())).unwrap(),
        username: "gis".to_string(),
        password: "secret".to_string(),
        expiration_minutes: 60,
    };
    let tokens = Arc::new(TokenProvider::portal(reqwest::Client::new(), credentials));
    let source = client(&server).with_token_provider(tokens);

    source.describe().await.unwrap();
    source.describe().await.unwrap();
}

#[tokio::test]
async fn test_rejected_portal_token_is_replaced() {
    let server = MockServer::start().await;
    let expires = chrono::Utc::now().timestamp_millis() + 3_600_000;
    Mock::given(method("POST"))
        .and(path("/portal/sharing/rest/generateToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "revoked-token", "expires": expires})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/portal/sharing/rest/generateToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "fresh-token", "expires": expires})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("token", "revoked-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 498, "message": "Invalid token.", "details": []}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("token", "fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(layer_json()))
        .expect(2)
        .mount(&server)
        .await;

    let credentials = PortalCredentials {
        portal_url: Url::parse(&format!("{}/portal", server.uri())).unwrap(),
        username: "gis".to_string(),
        password: "secret".to_string(),
        expiration_minutes: 60,
    };
    let tokens = Arc::new(TokenProvider::portal(reqwest::Client::new(), credentials));
    let source = client(&server).with_token_provider(tokens);

    let meta = source.describe().await.unwrap();
    assert_eq!(meta.name.as_deref(), Some("Trees"));
    source.describe().await.unwrap();
}

#[tokio::test]
async fn test_rejected_job_token_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 498, "message": "Invalid token.", "details": []}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).with_token("expired").describe().await.unwrap_err();
    assert!(err.is_token_rejected());
}

#[tokio::test]
async fn test_portal_rejection_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sharing/rest/generateToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 400, "message": "Unable to generate token.", "details": ["Invalid username or password."]}
        })))
        .mount(&server)
        .await;

    let credentials = PortalCredentials {
        portal_url: Url::parse(&server.uri()).unwrap(),
        username: "gis".to_string(),
        password: "wrong".to_string(),
        expiration_minutes: 60,
    };
    let tokens = TokenProvider::portal(reqwest::Client::new(), credentials);

    let err = tokens.token().await.unwrap_err();
    assert!(matches!(err, SourceError::Auth(ref m) if m.contains("Invalid username")));
}

// ============================================================================
// Attachments
// ============================================================================

#[tokio::test]
async fn test_query_attachments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/queryAttachments", LAYER_PATH)))
        .and(query_param("objectIds", "7,8"))
        .and(query_param("returnUrl", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "attachmentGroups": [{
                "parentObjectId": 7,
                "parentGlobalId": "{A1B2}",
                "attachmentInfos": [{
                    "id": 70,
                    "name": "bark.jpg",
                    "size": 5,
                    "contentType": "image/jpeg",
                    "keywords": "",
                    "exifInfo": null
                }]
            }]
        })))
        .mount(&server)
        .await;

    let groups = client(&server).query_attachments(&[7, 8]).await.unwrap();

    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].parent_object_id, 7);
    assert_eq!(groups[0].parent_global_id.as_deref(), Some("{A1B2}"));
    assert_eq!(groups[0].attachment_infos[0].id, 70);
    assert_eq!(groups[0].attachment_infos[0].name.as_deref(), Some("bark.jpg"));
}

#[tokio::test]
async fn test_fetch_attachment_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/7/attachments/70", LAYER_PATH)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(b"\xff\xd8\xff\xe0".to_vec()),
        )
        .mount(&server)
        .await;

    let info = AttachmentInfo {
        id: 70,
        name: Some("bark.jpg".to_string()),
        size: Some(4),
        content_type: Some("image/jpeg".to_string()),
        keywords: None,
        exif_info: None,
        url: None,
    };
    let data = client(&server).fetch_attachment(7, &info).await.unwrap();
    assert_eq!(data.as_ref(), b"\xff\xd8\xff\xe0");
}

#[tokio::test]
async fn test_missing_attachment_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/7/attachments/71", LAYER_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 404, "message": "Attachment not found"}
        })))
        .mount(&server)
        .await;

    let info = AttachmentInfo {
        id: 71,
        name: None,
        size: None,
        content_type: None,
        keywords: None,
        exif_info: None,
        url: None,
    };
    let err = client(&server).fetch_attachment(7, &info).await.unwrap_err();
    assert!(matches!(err, SourceError::Service { code: 404, .. }));
}
