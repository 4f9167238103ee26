use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::endpoint::Endpoint;
use super::types::{LocationReport, LocationSample};
use crate::error::ApiError;

/// Pets backend API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  endpoint: Endpoint,
}

impl ApiClient {
  pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, ApiError> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("petrack/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| ApiError::Connection(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { http, endpoint })
  }

  pub fn endpoint(&self) -> &Endpoint {
    &self.endpoint
  }

  /// GET `path` and decode the JSON body
  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    let url = self.endpoint.join(path)?;
    let response = self.send(Method::GET, url.clone(), None::<&()>).await?;
    decode(response, &url).await
  }

  /// POST a JSON body to `path` and decode the JSON answer
  pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
    let url = self.endpoint.join(path)?;
    let response = self.send(Method::POST, url.clone(), Some(body)).await?;
    decode(response, &url).await
  }

  /// PUT a JSON body to `path` and decode the JSON answer
  pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
    let url = self.endpoint.join(path)?;
    let response = self.send(Method::PUT, url.clone(), Some(body)).await?;
    decode(response, &url).await
  }

  /// DELETE `path`; any body in the answer is ignored
  pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
    let url = self.endpoint.join(path)?;
    self.send(Method::DELETE, url, None::<&()>).await?;
    Ok(())
  }

  async fn send<B: Serialize>(&self, method: Method, url: Url, body: Option<&B>) -> Result<Response, ApiError> {
    debug!(%method, %url, "api request");

    let mut request = self
      .http
      .request(method, url.clone())
      .header(reqwest::header::ACCEPT, "application/json");
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(%url, %status, body = %body, "api error response");

    Err(match status {
      StatusCode::NOT_FOUND => ApiError::NotFound(url.path().to_string()),
      StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation(body),
      _ => ApiError::Status {
        status: status.as_u16(),
        body,
      },
    })
  }

  /// All stored locations, oldest first
  pub async fn list_locations(&self) -> Result<Vec<LocationSample>, ApiError> {
    let mut samples: Vec<LocationSample> = self.get("location/location_list").await?;
    sort_by_creation(&mut samples);
    Ok(samples)
  }

  /// Locations of one pet from the last `minutes` minutes, oldest first
  pub async fn recent_locations(&self, pet_id: i64, minutes: u32) -> Result<Vec<LocationSample>, ApiError> {
    let path = format!("location/{}/?minutos={}", pet_id, minutes);
    let mut samples: Vec<LocationSample> = self.get(&path).await?;
    sort_by_creation(&mut samples);
    Ok(samples)
  }

  /// Send one position to the ingestion endpoint
  pub async fn submit_location(&self, report: &LocationReport) -> Result<(), ApiError> {
    let url = self.endpoint.join("location/mobile/")?;
    let response = self.send(Method::POST, url, Some(report)).await?;

    // The acknowledgement is informational and not always JSON
    let ack = response.text().await.unwrap_or_default();
    debug!(pet_id = report.mascota, ack = %ack, "location accepted");
    Ok(())
  }
}

async fn decode<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, ApiError> {
  let bytes = response.bytes().await?;
  serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
    url: url.to_string(),
    message: e.to_string(),
  })
}

/// History is displayed oldest first, whatever order the server used
fn sort_by_creation(samples: &mut [LocationSample]) {
  samples.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::DecimalString;
  use httpmock::prelude::*;

  fn client(server: &MockServer) -> ApiClient {
    ApiClient::new(
      Endpoint::new(&server.base_url()).unwrap(),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_status_mapping() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(GET).path("/mascotas/mascotas_id/9");
        then.status(404).body(r#"{"message": "Mascota no encontrada"}"#);
      })
      .await;
    server
      .mock_async(|when, then| {
        when.method(POST).path("/mascotas/mascotas_create");
        then.status(400).body(r#"{"nombre": ["This field is required."]}"#);
      })
      .await;
    server
      .mock_async(|when, then| {
        when.method(GET).path("/mascotas/mascotas_list");
        then.status(503);
      })
      .await;

    let client = client(&server);

    let err = client.get::<serde_json::Value>("mascotas/mascotas_id/9").await.unwrap_err();
    assert!(err.is_not_found());

    let err = client
      .post::<_, serde_json::Value>("mascotas/mascotas_create", &serde_json::json!({}))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Validation(ref body) if body.contains("required")));
    assert!(!err.is_transient());

    let err = client.get::<serde_json::Value>("mascotas/mascotas_list").await.unwrap_err();
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_connection_refused_is_transient() {
    let client = ApiClient::new(
      Endpoint::new("http://127.0.0.1:1/").unwrap(),
      Duration::from_secs(2),
    )
    .unwrap();

    let err = client.get::<serde_json::Value>("dueño/dueños_list").await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err:?}");
  }

  #[tokio::test]
  async fn test_recent_locations_sorted_ascending() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when
          .method(GET)
          .path("/location/7/")
          .query_param("minutos", "30");
        then.status(200).json_body(serde_json::json!([
          {"id": 3, "mascota": 7, "latitude": "1.2146", "longitude": "-77.2821", "created_at": "2025-04-23T01:35:00Z"},
          {"id": 1, "mascota": 7, "latitude": "1.2136", "longitude": "-77.2811", "created_at": "2025-04-23T01:30:00Z"},
          {"id": 2, "mascota": 7, "latitude": "1.2140", "longitude": "-77.2815", "created_at": "2025-04-23T01:32:00Z"}
        ]));
      })
      .await;

    let samples = client(&server).recent_locations(7, 30).await.unwrap();
    mock.assert_async().await;

    let ids: Vec<i64> = samples.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_submit_location_sends_decimal_strings() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when
          .method(POST)
          .path("/location/mobile/")
          .json_body(serde_json::json!({
            "mascota": 7,
            "latitud": "1.211903872",
            "longitud": "-77.2811"
          }));
        then.status(201).body("Ubicación recibida");
      })
      .await;

    let report = LocationReport {
      mascota: 7,
      latitud: DecimalString::parse("1.211903872").unwrap(),
      longitud: DecimalString::parse("-77.2811").unwrap(),
    };
    client(&server).submit_location(&report).await.unwrap();
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_delete_accepts_empty_body() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when.method(DELETE).path("/mascotas/mascotas_delete/4");
        then.status(204);
      })
      .await;

    client(&server).delete("mascotas/mascotas_delete/4").await.unwrap();
    mock.assert_async().await;
  }
}
