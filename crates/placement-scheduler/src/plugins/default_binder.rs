//! Bind through the API client.

use crate::client::{Binding, ClientSet};
use crate::error::Result;
use crate::framework::{BindPlugin, CycleState, FrameworkHandle, Plugin, Status};
use async_trait::async_trait;
use placement_core::Pod;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Registered name.
pub const NAME: &str = "DefaultBinder";

/// Posts a [`Binding`] for the pod.
pub struct DefaultBinder {
    client: Arc<dyn ClientSet>,
}

impl fmt::Debug for DefaultBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultBinder").finish_non_exhaustive()
    }
}

impl Plugin for DefaultBinder {
    fn name(&self) -> &str {
        NAME
    }

    fn as_bind(&self) -> Option<&dyn BindPlugin> {
        Some(self)
    }
}

#[async_trait]
impl BindPlugin for DefaultBinder {
    async fn bind(&self, _state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        debug!(pod = %pod.full_name(), node = node_name, "Attempting to bind pod");
        match self.client.bind(&Binding::new(pod, node_name)).await {
            Ok(()) => Status::success(),
            Err(e) => Status::error(e.to_string()),
        }
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(DefaultBinder {
        client: Arc::clone(handle.client_set()),
    }))
}
