//! JSON:API document shapes for images, instances and credentials

use chrono::{DateTime, SecondsFormat, Utc};
use draupnir_common::{ClientKey, CredentialRecord, Image, Instance};
use serde::{Deserialize, Deserializer, Serialize};

fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
pub struct Document<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource<CredentialAttributes>>,
}

impl<T> Document<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            included: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Resource<A> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub attributes: A,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Relationships>,
}

#[derive(Debug, Serialize)]
pub struct Relationships {
    pub credentials: Relationship,
}

#[derive(Debug, Serialize)]
pub struct Relationship {
    pub data: ResourceIdentifier,
}

#[derive(Debug, Serialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ImageAttributes {
    pub backed_up_at: String,
    pub ready: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct InstanceAttributes {
    pub hostname: String,
    pub image_id: u64,
    pub port: u16,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct CredentialAttributes {
    pub ca_certificate: String,
    pub client_certificate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

pub fn image_resource(image: &Image) -> Resource<ImageAttributes> {
    Resource {
        kind: "images",
        id: image.id.to_string(),
        attributes: ImageAttributes {
            backed_up_at: iso8601(&image.backed_up_at),
            ready: image.ready(),
            created_at: iso8601(&image.created_at),
            updated_at: iso8601(&image.updated_at),
        },
        relationships: None,
    }
}

pub fn instance_resource(instance: &Instance) -> Resource<InstanceAttributes> {
    Resource {
        kind: "instances",
        id: instance.id.to_string(),
        attributes: InstanceAttributes {
            hostname: instance.hostname.clone(),
            image_id: instance.image_id,
            port: instance.port,
            created_at: iso8601(&instance.created_at),
            updated_at: iso8601(&instance.updated_at),
        },
        relationships: instance.credential.as_ref().map(|credential| Relationships {
            credentials: Relationship {
                data: ResourceIdentifier {
                    kind: "credentials",
                    id: credential.id.to_string(),
                },
            },
        }),
    }
}

/// Credential resource. The key is only ever present in the provision response.
pub fn credential_resource(
    credential: &CredentialRecord,
    client_key: Option<ClientKey>,
) -> Resource<CredentialAttributes> {
    Resource {
        kind: "credentials",
        id: credential.id.to_string(),
        attributes: CredentialAttributes {
            ca_certificate: credential.ca_certificate.clone(),
            client_certificate: credential.client_certificate.clone(),
            client_key: client_key.map(ClientKey::into_pem),
        },
        relationships: None,
    }
}

// --- Requests ---

#[derive(Debug, Deserialize)]
pub struct RequestDocument<A> {
    pub data: RequestData<A>,
}

#[derive(Debug, Deserialize)]
pub struct RequestData<A> {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub attributes: A,
}

#[derive(Debug, Deserialize)]
pub struct CreateImageAttributes {
    pub backed_up_at: DateTime<Utc>,
    #[serde(default, alias = "anon")]
    pub anonymisation_script: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceAttributes {
    #[serde(deserialize_with = "string_or_number")]
    pub image_id: String,
}

/// Clients send the image id as either `"12"` or `12`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
