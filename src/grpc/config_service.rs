//! gRPC GrayConfigService implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::config::GrayConfig;
use crate::gray_api::gray_config_service_server::GrayConfigService;
use crate::gray_api::{
    DeploymentInfo, GetConfigRequest, GetConfigResponse, HealthRequest, HealthResponse,
    UpdateConfigRequest, UpdateConfigResponse,
};
use crate::store::ConfigStore;

/// gRPC service implementation for configuration management.
pub struct GrayConfigServiceImpl {
    store: Arc<ConfigStore>,
}

impl GrayConfigServiceImpl {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl GrayConfigService for GrayConfigServiceImpl {
    /// Validates and applies a configuration document.
    ///
    /// A rejected document is reported in the response body, not as a gRPC
    /// error, and the live generation is left untouched.
    async fn update_config(
        &self,
        request: Request<UpdateConfigRequest>,
    ) -> Result<Response<UpdateConfigResponse>, Status> {
        let req = request.into_inner();

        let config = match GrayConfig::from_json(&req.config_json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(version = req.version, error = %e, "Rejected configuration");
                return Ok(Response::new(UpdateConfigResponse {
                    success: false,
                    error: e.to_string(),
                    applied_version: self.store.version(),
                    deployment_count: 0,
                    weighted: false,
                }));
            }
        };

        let deployment_count = config.deployments().len() as u32;
        let weighted = config.is_weighted();
        let applied_version = self.store.update(config, req.version);

        tracing::info!(
            version = applied_version,
            deployments = deployment_count,
            weighted,
            "Configuration updated"
        );

        Ok(Response::new(UpdateConfigResponse {
            success: true,
            error: String::new(),
            applied_version,
            deployment_count,
            weighted,
        }))
    }

    async fn get_config(
        &self,
        _request: Request<GetConfigRequest>,
    ) -> Result<Response<GetConfigResponse>, Status> {
        let Some(generation) = self.store.snapshot() else {
            return Ok(Response::new(GetConfigResponse {
                version: 0,
                loaded: false,
                gray_key: String::new(),
                total_gray_weight: 0,
                deployments: vec![],
            }));
        };

        let config = &generation.config;
        let deployments = config
            .deployments()
            .iter()
            .map(|d| DeploymentInfo {
                name: d.name.clone(),
                version: d.version.clone(),
                backend_version: d.backend_version_or_empty().to_string(),
                weight: d.weight,
                is_base: d.is_base,
                condition_count: d.conditions.len() as u32,
            })
            .collect();

        Ok(Response::new(GetConfigResponse {
            version: generation.version,
            loaded: true,
            gray_key: config.gray_key.clone(),
            total_gray_weight: config.total_gray_weight(),
            deployments,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let status = if self.store.is_loaded() {
            "ready"
        } else {
            "no configuration"
        };

        Ok(Response::new(HealthResponse {
            healthy: true,
            status: status.to_string(),
            config_version: self.store.version(),
        }))
    }
}
