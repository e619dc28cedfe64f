//! The admission webhook for provisioner objects.
//!
//! Answers the admission-review v1 protocol over HTTPS, running the
//! schema validator in template-permissive mode plus the cross-field
//! rules. Template evaluation never happens here; admission only
//! decides whether the object may be stored.

pub mod tls;

use std::net::SocketAddr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::provisioner::PavProvisioner;
use crate::schema;

/// Result of reviewing one object.
pub enum AdmissionVerdict {
    Allow,
    Deny(String),
}

#[derive(Deserialize, Debug)]
#[serde(tag = "operation")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// `object` is the object from the incoming request. `old_object` is
/// the existing object, populated for DELETE and UPDATE requests.
pub enum AdmissionRequestOperation {
    Create {
        object: Value,
    },
    Update {
        object: Value,
        #[serde(rename = "oldObject")]
        #[allow(dead_code)]
        old_object: Value,
    },
    Delete {
        #[serde(rename = "oldObject")]
        #[allow(dead_code)]
        old_object: Value,
    },
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Identifier for the individual request/response pair.
    pub uid: Option<String>,
    #[serde(flatten)]
    pub operation: AdmissionRequestOperation,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewRequest {
    pub api_version: String,
    pub kind: String,
    pub request: AdmissionRequest,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AdmissionResponse {
    uid: Option<String>,
    allowed: bool,
    /// Extra detail on why a request was denied; not consulted when
    /// `allowed` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    api_version: String,
    kind: String,
    response: AdmissionResponse,
}

/// Validates a provisioner object on create/update. Deletion is always
/// allowed; the finalizer, not admission, guards in-use provisioners.
pub fn review_object(object: &Value) -> AdmissionVerdict {
    let provisioner: PavProvisioner = match serde_json::from_value(object.clone()) {
        Ok(provisioner) => provisioner,
        Err(e) => return AdmissionVerdict::Deny(format!("not a valid PavProvisioner: {}", e)),
    };

    let name = provisioner
        .metadata
        .name
        .clone()
        .unwrap_or_default();

    if let Err(e) = schema::validate_spec(&name, &provisioner.spec, schema::Mode::TemplatePermissive)
    {
        return AdmissionVerdict::Deny(e.to_string());
    }
    if let Err(e) = schema::validate_cross_field(&provisioner.spec) {
        return AdmissionVerdict::Deny(e.to_string());
    }

    AdmissionVerdict::Allow
}

pub fn review(request: AdmissionReviewRequest) -> AdmissionReviewResponse {
    let verdict = match &request.request.operation {
        AdmissionRequestOperation::Create { object }
        | AdmissionRequestOperation::Update { object, .. } => review_object(object),
        AdmissionRequestOperation::Delete { .. } => AdmissionVerdict::Allow,
    };

    let response = match verdict {
        AdmissionVerdict::Allow => {
            info!(uid = ?request.request.uid, "admission request allowed");
            AdmissionResponse {
                uid: request.request.uid,
                allowed: true,
                status: None,
            }
        }
        AdmissionVerdict::Deny(message) => {
            warn!(uid = ?request.request.uid, %message, "admission request denied");
            AdmissionResponse {
                uid: request.request.uid,
                allowed: false,
                status: Some(Status {
                    code: Some(400),
                    message: Some(message),
                    reason: Some("Invalid".to_owned()),
                    ..Default::default()
                }),
            }
        }
    };

    AdmissionReviewResponse {
        api_version: request.api_version,
        kind: request.kind,
        response,
    }
}

/// Serves the webhook endpoint until the process exits.
pub async fn endpoint(tls: tls::WebhookTls, addr: SocketAddr) {
    use warp::Filter;

    let routes = warp::any()
        .and(warp::post())
        .and(warp::body::json())
        .map(|request: AdmissionReviewRequest| warp::reply::json(&review(request)));

    warp::serve(routes)
        .tls()
        .cert(tls.cert_pem.as_bytes())
        .key(tls.key_pem.as_bytes())
        .run(addr)
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn valid_object() -> Value {
        json!({
            "apiVersion": "pav.dev/v1alpha1",
            "kind": "PavProvisioner",
            "metadata": { "name": "hello" },
            "spec": {
                "provisioningModes": ["Dynamic"],
                "volumeCreation": { "capacity": "{{ requestedMinCapacity }}" },
                "volumeStaging": { "podTemplate": { "spec": { "containers": [] } } }
            }
        })
    }

    fn review_request(operation: Value) -> AdmissionReviewRequest {
        let mut body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": { "uid": "req-1" }
        });
        body["request"]
            .as_object_mut()
            .unwrap()
            .extend(operation.as_object().unwrap().clone());
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn templated_provisioners_are_admitted() {
        assert!(matches!(
            review_object(&valid_object()),
            AdmissionVerdict::Allow
        ));
    }

    #[test]
    fn static_only_with_creation_is_denied() {
        let mut object = valid_object();
        object["spec"]["provisioningModes"] = json!(["Static"]);
        match review_object(&object) {
            AdmissionVerdict::Deny(message) => assert!(message.contains("volumeCreation")),
            AdmissionVerdict::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn unknown_fields_are_denied() {
        let mut object = valid_object();
        object["spec"]["volumeSnapshotting"] = json!({});
        assert!(matches!(review_object(&object), AdmissionVerdict::Deny(_)));
    }

    #[test]
    fn deletes_are_always_allowed() {
        let request = review_request(json!({
            "operation": "DELETE",
            "oldObject": valid_object()
        }));
        let response = review(request);
        assert!(response.response.allowed);
    }

    #[test]
    fn the_wire_shape_matches_admission_v1() {
        let request = review_request(json!({
            "operation": "CREATE",
            "object": { "metadata": { "name": "x" }, "spec": {} }
        }));
        let response = serde_json::to_value(review(request)).unwrap();
        assert_eq!(response["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(response["kind"], "AdmissionReview");
        assert_eq!(response["response"]["uid"], "req-1");
        assert_eq!(response["response"]["allowed"], false);
        assert!(response["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("PavProvisioner"));
    }

    #[test]
    fn update_requests_validate_the_new_object() {
        let mut new_object = valid_object();
        new_object["spec"]["provisioningModes"] = json!([]);
        let request = review_request(json!({
            "operation": "UPDATE",
            "object": new_object,
            "oldObject": valid_object()
        }));
        let response = review(request);
        assert!(!response.response.allowed);
    }
}
