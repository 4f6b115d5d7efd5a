//! Binding of one transport to one `Mux`, one `ServiceApi` and one `ServiceApp`.

use crate::api::ServiceApi;
use crate::app::{ExposedObject, ServiceApp};
use crate::config::{MuxOptions, ServiceApiOptions, ServiceAppOptions};
use crate::error::{Result, ServiceError};
use crate::mux::{LinkState, Mux};
use crate::transport::Transport;
use std::sync::OnceLock;

/// A transport endpoint that can expose an object and call the peer's.
///
/// The transport is taken by value, so it can never be bound twice.
#[derive(Debug)]
pub struct Service {
    mux: Mux,
    api: OnceLock<ServiceApi>,
    app: OnceLock<ServiceApp>,
}

impl Service {
    /// Bind `transport`. Must be called from within a tokio runtime.
    pub fn new(transport: impl Into<Transport>, options: MuxOptions) -> Self {
        Self {
            mux: Mux::new(transport, options),
            api: OnceLock::new(),
            app: OnceLock::new(),
        }
    }

    /// Create the outbound call registry. Fails if one already exists.
    pub fn create_service_api(&self, options: ServiceApiOptions) -> Result<ServiceApi> {
        let mut created = false;
        let api = self.api.get_or_init(|| {
            created = true;
            ServiceApi::new(self.mux.clone(), options)
        });
        if !created {
            return Err(ServiceError::instantiation(
                "A ServiceApi instance has already been instantiated for this Service.",
            ));
        }
        Ok(api.clone())
    }

    /// Expose `object` to the peer. Fails if an object is already exposed.
    pub fn create_service_app(
        &self,
        object: impl Into<ExposedObject>,
        options: ServiceAppOptions,
    ) -> Result<ServiceApp> {
        let mut created = false;
        let app = self.app.get_or_init(|| {
            created = true;
            ServiceApp::new(self.mux.clone(), object, options)
        });
        if !created {
            return Err(ServiceError::instantiation(
                "A ServiceApp instance has already been instantiated for this Service.",
            ));
        }
        Ok(app.clone())
    }

    pub fn api(&self) -> Option<&ServiceApi> {
        self.api.get()
    }

    pub fn app(&self) -> Option<&ServiceApp> {
        self.app.get()
    }

    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    /// End the link. Pending calls on either side are rejected.
    pub fn close(&self) {
        self.mux.close();
    }

    /// Wait for the link to end.
    pub async fn closed(&self) -> LinkState {
        self.mux.closed().await
    }
}

/// Bind `transport` to a new `Service`.
pub fn create_service(transport: impl Into<Transport>, options: MuxOptions) -> Service {
    Service::new(transport, options)
}
