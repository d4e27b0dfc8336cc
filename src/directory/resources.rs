use crate::error::PublishError;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

pub const JSONAPI_MEDIA_TYPE: &str = "application/vnd.api+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: &str, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(ResourceRef),
    Many(Vec<ResourceRef>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relationship {
    pub data: RelationshipData,
}

impl Relationship {
    pub fn one(reference: ResourceRef) -> Self {
        Self {
            data: RelationshipData::One(reference),
        }
    }

    pub fn many(references: Vec<ResourceRef>) -> Self {
        Self {
            data: RelationshipData::Many(references),
        }
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<&str> {
        match &self.data {
            RelationshipData::One(r) => vec![r.id.as_str()],
            RelationshipData::Many(rs) => rs.iter().map(|r| r.id.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedText {
    pub value: String,
    pub format: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoField {
    pub lat: f64,
    pub lng: f64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAttributes {
    pub title: String,
    pub body: Option<FormattedText>,
    pub field_deal_type: &'static str,
    pub field_reference_id: String,
    pub field_price: Option<String>,
    pub field_currency: Option<String>,
    pub field_bedrooms: Option<u32>,
    pub field_bathrooms: Option<u32>,
    pub field_covered_area: Option<f64>,
    pub field_plot_area: Option<f64>,
    pub field_address: Option<String>,
    pub field_geo: Option<GeoField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateResourceData {
    #[serde(rename = "type")]
    pub resource_type: &'static str,
    pub attributes: ResourceAttributes,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<&'static str, Relationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateResourceRequest {
    pub data: CreateResourceData,
}

#[derive(Debug, Clone)]
pub struct CreatedResource {
    pub id: String,
    pub raw: Value,
}

#[derive(Deserialize)]
struct CreatedEnvelope {
    data: CreatedData,
}

#[derive(Deserialize)]
struct CreatedData {
    id: String,
}

pub async fn create_resource(
    http: &Client,
    url: &str,
    request: &CreateResourceRequest,
    access_token: &str,
) -> Result<CreatedResource, PublishError> {
    let body = serde_json::to_vec(request)
        .map_err(|err| PublishError::validation(format!("unserialisable payload: {err}")))?;
    let response = http
        .post(url)
        .bearer_auth(access_token)
        .header(header::CONTENT_TYPE, JSONAPI_MEDIA_TYPE)
        .header(header::ACCEPT, JSONAPI_MEDIA_TYPE)
        .body(body)
        .send()
        .await
        .map_err(|err| PublishError::from_transport("create request", &err))?;

    let status = response.status();
    let raw = response
        .json::<Value>()
        .await
        .map_err(|err| PublishError::from_transport("create response", &err));
    if !status.is_success() {
        return Err(error_for_status(status.as_u16(), raw.unwrap_or(Value::Null)));
    }
    let raw = raw?;
    let created: CreatedEnvelope = serde_json::from_value(raw.clone()).map_err(|err| {
        PublishError::network(format!("create response missing data.id: {err}"))
            .with_status(status.as_u16())
            .with_raw(raw.clone())
    })?;
    Ok(CreatedResource {
        id: created.data.id,
        raw,
    })
}

/// Classifies a non-2xx directory answer.
pub fn error_for_status(status: u16, raw: Value) -> PublishError {
    let detail = jsonapi_error_message(&raw)
        .unwrap_or_else(|| format!("directory answered HTTP {status}"));
    let err = match status {
        401 | 403 => PublishError::oauth(detail),
        429 | 500..=599 => PublishError::network(detail),
        _ => PublishError::validation(detail),
    };
    err.with_status(status).with_raw(raw)
}

/// Joins every `{title, detail, source.pointer}` entry of a JSON:API error document.
pub fn jsonapi_error_message(raw: &Value) -> Option<String> {
    let errors = raw.get("errors")?.as_array()?;
    let parts: Vec<String> = errors
        .iter()
        .filter_map(|entry| {
            let title = entry.get("title").and_then(Value::as_str).unwrap_or("");
            let detail = entry.get("detail").and_then(Value::as_str).unwrap_or("");
            let pointer = entry
                .get("source")
                .and_then(|s| s.get("pointer"))
                .and_then(Value::as_str);
            let mut text = match (title.is_empty(), detail.is_empty() || detail == title) {
                (true, true) => return None,
                (false, true) => title.to_string(),
                (true, false) => detail.to_string(),
                (false, false) => format!("{title}: {detail}"),
            };
            if let Some(pointer) = pointer {
                text.push_str(&format!(" [{pointer}]"));
            }
            Some(text)
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
