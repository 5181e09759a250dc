//! The embedded OpenAPI document, served as YAML and JSON.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

pub const OPENAPI_YAML: &str = include_str!("../assets/openapi.yaml");

pub async fn openapi_yaml() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/yaml")],
        OPENAPI_YAML,
    )
        .into_response()
}

pub async fn openapi_json() -> Response {
    match serde_yaml::from_str::<serde_json::Value>(OPENAPI_YAML) {
        Ok(document) => Json(document).into_response(),
        Err(e) => {
            log::error!("Embedded OpenAPI document is invalid YAML: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_document_parses() {
        let document: serde_json::Value = serde_yaml::from_str(OPENAPI_YAML).unwrap();
        assert_eq!(document["openapi"], "3.0.3");
        assert!(document["paths"]["/api/v1/migrations/up"].is_object());
        assert!(document["paths"]["/health"].is_object());
    }
}
