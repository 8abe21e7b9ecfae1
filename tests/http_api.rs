use itho_wifi_tools::connection::{Error, HttpClient};
use itho_wifi_tools::speed::VirtualRemoteCommand;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpClient {
    let url = reqwest::Url::parse(&format!("{}/api.html", server.uri())).unwrap();
    HttpClient::from_api_url(url, None, None)
}

fn client_with_credentials(server: &MockServer) -> HttpClient {
    let url = reqwest::Url::parse(&format!("{}/api.html", server.uri())).unwrap();
    HttpClient::from_api_url(url, Some("admin"), Some("hunter2"))
}

#[tokio::test]
async fn get_speed_parses_the_raw_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .and(query_param("get", "currentspeed"))
        .respond_with(ResponseTemplate::new(200).set_body_string("127\n"))
        .expect(1)
        .mount(&server)
        .await;
    let speed = client(&server).get_speed().await.unwrap();
    assert_eq!(speed, 127);
}

#[tokio::test]
async fn get_speed_rejects_garbage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("whirr"))
        .mount(&server)
        .await;
    let error = client(&server).get_speed().await.unwrap_err();
    assert!(matches!(error, Error::UnparsableSpeed(ref s) if s == "whirr"), "{error:?}");
}

#[tokio::test]
async fn nok_responses_are_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("NOK"))
        .mount(&server)
        .await;
    let error = client(&server).set_speed(80).await.unwrap_err();
    assert!(matches!(error, Error::Nok), "{error:?}");
}

#[tokio::test]
async fn get_status_normalizes_unavailable_fields() {
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "temp": 21.5,
        "hum": "not available",
        "FanInfo": "medium",
    });
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .and(query_param("get", "ithostatus"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .mount(&server)
        .await;
    let status = client(&server).get_status().await.unwrap();
    assert_eq!(status.temperature(), Some(21.5));
    assert_eq!(status.humidity(), None);
    assert_eq!(status.fan_mode(), Some(VirtualRemoteCommand::Medium));
}

#[tokio::test]
async fn get_status_reports_malformed_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;
    let error = client(&server).get_status().await.unwrap_err();
    assert!(matches!(error, Error::Status(_)), "{error:?}");
}

#[tokio::test]
async fn set_speed_sends_the_raw_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .and(query_param("speed", "203"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;
    client(&server).set_speed(203).await.unwrap();
}

#[tokio::test]
async fn vremote_sends_the_button_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .and(query_param("vremote", "high"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;
    client(&server).set_virtual_remote(VirtualRemoteCommand::High).await.unwrap();
}

#[tokio::test]
async fn credentials_ride_along_as_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api.html"))
        .and(query_param("username", "admin"))
        .and(query_param("password", "hunter2"))
        .and(query_param("get", "currentspeed"))
        .respond_with(ResponseTemplate::new(200).set_body_string("0"))
        .expect(1)
        .mount(&server)
        .await;
    let speed = client_with_credentials(&server).get_speed().await.unwrap();
    assert_eq!(speed, 0);
}
