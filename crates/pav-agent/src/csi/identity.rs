//! The CSI identity service, shared by both plugins.

use k8s_csi::v1_3_0::identity_server::Identity;
use k8s_csi::v1_3_0::plugin_capability::service::Type as ServiceType;
use k8s_csi::v1_3_0::plugin_capability::{Service, Type as CapabilityType};
use k8s_csi::v1_3_0::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

#[derive(Clone)]
pub struct IdentityService {
    driver_name: String,
    /// Only the controller plugin advertises the controller service;
    /// the node plugin's socket serves publish/unpublish alone.
    with_controller_service: bool,
}

impl IdentityService {
    pub fn controller(driver_name: String) -> Self {
        IdentityService {
            driver_name,
            with_controller_service: true,
        }
    }

    pub fn node(driver_name: String) -> Self {
        IdentityService {
            driver_name,
            with_controller_service: false,
        }
    }
}

#[async_trait::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: tonic::Request<GetPluginInfoRequest>,
    ) -> Result<tonic::Response<GetPluginInfoResponse>, tonic::Status> {
        Ok(tonic::Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: tonic::Request<GetPluginCapabilitiesRequest>,
    ) -> Result<tonic::Response<GetPluginCapabilitiesResponse>, tonic::Status> {
        let mut capabilities = Vec::new();
        if self.with_controller_service {
            capabilities.push(PluginCapability {
                r#type: Some(CapabilityType::Service(Service {
                    r#type: ServiceType::ControllerService as i32,
                })),
            });
        }
        Ok(tonic::Response::new(GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn probe(
        &self,
        _request: tonic::Request<ProbeRequest>,
    ) -> Result<tonic::Response<ProbeResponse>, tonic::Status> {
        Ok(tonic::Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_csi::v1_3_0::identity_server::Identity as _;

    #[tokio::test]
    async fn the_node_identity_does_not_advertise_a_controller() {
        let identity = IdentityService::node("p.pav.dev".to_owned());
        let response = identity
            .get_plugin_capabilities(tonic::Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap();
        assert!(response.get_ref().capabilities.is_empty());
    }

    #[tokio::test]
    async fn plugin_info_reports_the_driver_name() {
        let identity = IdentityService::controller("p.pav.dev".to_owned());
        let response = identity
            .get_plugin_info(tonic::Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap();
        assert_eq!(response.get_ref().name, "p.pav.dev");
    }
}
