//! TLS material for the admission webhook.
//!
//! The certificate is self-signed and regenerated on every controller
//! start; the validating-webhook configuration is then overwritten with
//! the fresh CA bundle so the cluster trusts the new serving cert the
//! moment the socket accepts connections.

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams};
use kube::Api;
use tracing::info;

/// Name of the pre-installed webhook configuration. Its bootstrap form
/// rejects every request until the controller replaces it here.
pub const WEBHOOK_CONFIG_NAME: &str = "pav-provisioners";

pub struct WebhookTls {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generates a fresh self-signed serving certificate for the webhook
/// service.
pub fn self_signed(service_name: &str, service_namespace: &str) -> anyhow::Result<WebhookTls> {
    let dns_names = vec![
        format!("{}.{}.svc", service_name, service_namespace),
        format!("{}.{}.svc.cluster.local", service_name, service_namespace),
    ];
    let cert = rcgen::generate_simple_self_signed(dns_names)?;
    Ok(WebhookTls {
        cert_pem: cert.serialize_pem()?,
        key_pem: cert.serialize_private_key_pem(),
    })
}

/// Overwrites the bootstrap webhook configuration with the real rules
/// and the just-generated CA bundle.
pub async fn install_webhook_config(
    client: kube::Client,
    tls: &WebhookTls,
    service_name: &str,
    service_namespace: &str,
) -> anyhow::Result<()> {
    let config = ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_owned()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("validate.{}", crate::API_GROUP),
            admission_review_versions: vec!["v1".to_owned()],
            side_effects: "None".to_owned(),
            failure_policy: Some("Fail".to_owned()),
            timeout_seconds: Some(10),
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(tls.cert_pem.as_bytes().to_vec())),
                service: Some(ServiceReference {
                    name: service_name.to_owned(),
                    namespace: service_namespace.to_owned(),
                    path: Some("/".to_owned()),
                    port: Some(443),
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec![crate::API_GROUP.to_owned()]),
                api_versions: Some(vec!["v1alpha1".to_owned()]),
                operations: Some(vec!["*".to_owned()]),
                resources: Some(vec!["pavprovisioners".to_owned()]),
                scope: Some("Cluster".to_owned()),
            }]),
            ..Default::default()
        }]),
    };

    let api: Api<ValidatingWebhookConfiguration> = Api::all(client);
    api.patch(
        WEBHOOK_CONFIG_NAME,
        &PatchParams::apply("pav-controller-agent").force(),
        &Patch::Apply(&config),
    )
    .await?;
    info!(config = WEBHOOK_CONFIG_NAME, "admission webhook configuration installed");
    Ok(())
}
