//! Naming server
//!
//! Hosts one [`NamingService`] behind its two contracts.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use super::contracts::{registration_table, service_table, RegistrationStub, ServiceStub};
use super::service::NamingService;
use crate::config::NamingConfig;
use crate::error::Result;
use crate::rpc::Skeleton;

pub struct NamingServer {
    service: Arc<NamingService>,
    service_skeleton: Skeleton<NamingService>,
    registration_skeleton: Skeleton<NamingService>,
}

impl NamingServer {
    pub fn new(config: NamingConfig) -> Self {
        let service = Arc::new(NamingService::new(config.replication_threshold));
        Self {
            service_skeleton: Skeleton::new(service_table(), service.clone(), config.service_addr),
            registration_skeleton: Skeleton::new(
                registration_table(),
                service.clone(),
                config.registration_addr,
            ),
            service,
        }
    }

    /// The naming state served by this server.
    pub fn service(&self) -> &Arc<NamingService> {
        &self.service
    }

    /// Start both contracts. Fails if either address cannot be bound or the
    /// server is already running.
    pub async fn start(&self) -> Result<()> {
        let service = self.service_skeleton.start().await?;
        let registration = match self.registration_skeleton.start().await {
            Ok(addr) => addr,
            Err(e) => {
                self.service_skeleton.stop().await;
                return Err(e);
            }
        };
        info!(%service, %registration, "Naming server started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.registration_skeleton.stop().await;
        self.service_skeleton.stop().await;
        info!("Naming server stopped");
    }

    pub fn service_address(&self) -> Option<SocketAddr> {
        self.service_skeleton.address()
    }

    pub fn registration_address(&self) -> Option<SocketAddr> {
        self.registration_skeleton.address()
    }

    /// Client stub for the running service contract.
    pub fn service_stub(&self) -> Result<ServiceStub> {
        ServiceStub::from_skeleton(&self.service_skeleton)
    }

    /// Registration stub for the running registration contract.
    pub fn registration_stub(&self) -> Result<RegistrationStub> {
        RegistrationStub::from_skeleton(&self.registration_skeleton)
    }
}
