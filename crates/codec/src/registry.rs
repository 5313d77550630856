//! Component registry: creates and tracks codec components.
//!
//! The `ComponentRegistry` handles:
//! - Wrapping the driver-side [`ComponentManager`] factory
//! - Creating components by name and mapping failures to `DriverUnavailable`
//! - Tracking active components so every created component is destroyed once
//! - Listing the component names the driver offers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use hwc_common::{CodecError, CodecResult};

use crate::driver::{CodecCallbacks, CodecComponent, ComponentId, ComponentManager};

/// Tracks the components created through one [`ComponentManager`].
pub struct ComponentRegistry {
    manager: Arc<dyn ComponentManager>,
    /// Active components by id, with the name they were created under.
    active: Mutex<HashMap<ComponentId, String>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("active_components", &self.active.lock().len())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new(manager: Arc<dyn ComponentManager>) -> Self {
        Self {
            manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Names of the components the driver can create.
    pub fn component_names(&self) -> Vec<String> {
        self.manager.component_names()
    }

    /// Create a component.
    ///
    /// # Errors
    /// Returns `DriverUnavailable` if the driver cannot create `name`.
    pub fn create(
        &self,
        name: &str,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> CodecResult<(ComponentId, Arc<dyn CodecComponent>)> {
        let (id, component) = self
            .manager
            .create_component(name, callbacks)
            .map_err(|status| {
                warn!(component = name, status = %status, "Codec component creation failed");
                CodecError::DriverUnavailable {
                    component: name.to_string(),
                    status,
                }
            })?;

        self.active.lock().insert(id, name.to_string());
        info!(component = name, id, "Codec component created");
        Ok((id, component))
    }

    /// Destroy a component created by this registry.
    ///
    /// Destroying an id that is not active is a no-op.
    pub fn destroy(&self, id: ComponentId) -> CodecResult<()> {
        let Some(name) = self.active.lock().remove(&id) else {
            return Ok(());
        };
        self.manager.destroy_component(id).map_err(|status| {
            warn!(component = %name, id, status = %status, "Codec component destroy failed");
            CodecError::DriverCall {
                op: "DestroyComponent",
                status,
            }
        })?;
        info!(component = %name, id, "Codec component destroyed");
        Ok(())
    }

    /// Number of components created and not yet destroyed.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, id: ComponentId) -> bool {
        self.active.lock().contains_key(&id)
    }
}
