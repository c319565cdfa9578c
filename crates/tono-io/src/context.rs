//! Contexts: backend selection and device discovery.
//!
//! A [`Context`] walks a priority-ordered backend list and keeps the first
//! one whose `create_context` succeeds. Everything a context produces
//! (enumeration results, devices) belongs to that one backend; the context
//! must outlive the devices it opens, which the `Arc` in
//! [`Device::new`](crate::Device::new) enforces structurally.

use std::sync::Arc;

use tono_core::result::{Error, Result};
use tono_core::LogBus;

use crate::backend::{Backend, BackendContext, DeviceId, DeviceInfo, DeviceRole};
use crate::null_backend::NullBackend;

/// Configuration for [`Context::new`].
#[derive(Default)]
pub struct ContextConfig {
    /// Log bus shared by the context and every device it opens.
    pub log: LogBus,
}

/// An initialized audio context bound to one backend.
pub struct Context {
    backend_name: &'static str,
    backend: Box<dyn BackendContext>,
    log: LogBus,
}

/// The default backend priority list: the cpal OS port when the
/// `cpal-backend` feature is on, then the null backend as the always-on
/// fallback.
pub fn default_backends() -> Vec<Box<dyn Backend>> {
    let mut backends: Vec<Box<dyn Backend>> = Vec::new();
    #[cfg(feature = "cpal-backend")]
    backends.push(Box::new(crate::cpal_backend::CpalBackend::new()));
    backends.push(Box::new(NullBackend::new()));
    backends
}

impl Context {
    /// Initializes the first backend in `backends` that accepts. The
    /// failures of earlier candidates are logged at info level; if none
    /// accepts, [`Error::NoBackend`].
    pub fn new(backends: Vec<Box<dyn Backend>>, config: ContextConfig) -> Result<Arc<Self>> {
        for backend in backends {
            let info = backend.info();
            match backend.create_context(&config.log) {
                Ok(ctx) => {
                    config.log.info("context: backend initialized");
                    return Ok(Arc::new(Self {
                        backend_name: info.name,
                        backend: ctx,
                        log: config.log,
                    }));
                }
                Err(e) => {
                    config
                        .log
                        .info(&format!("context: backend {} refused: {e}", info.name));
                }
            }
        }
        Err(Error::NoBackend)
    }

    /// [`Context::new`] over [`default_backends`].
    pub fn with_defaults(config: ContextConfig) -> Result<Arc<Self>> {
        Self::new(default_backends(), config)
    }

    /// Name of the selected backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// The context's log bus.
    pub fn log(&self) -> &LogBus {
        &self.log
    }

    /// Calls `callback` once per device the backend knows about.
    pub fn enumerate_devices(
        &self,
        callback: &mut dyn FnMut(DeviceRole, &DeviceInfo),
    ) -> Result<()> {
        self.backend.enumerate_devices(callback)
    }

    /// Info for one device, or the role's default when `id` is `None`.
    pub fn device_info(&self, id: Option<&DeviceId>, role: DeviceRole) -> Result<DeviceInfo> {
        self.backend.device_info(id, role)
    }

    pub(crate) fn backend(&self) -> &dyn BackendContext {
        &*self.backend
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_list_always_yields_a_backend() {
        let context = Context::with_defaults(ContextConfig::default()).unwrap();
        assert!(!context.backend_name().is_empty());
    }

    #[test]
    fn empty_priority_list_is_no_backend() {
        let result = Context::new(Vec::new(), ContextConfig::default());
        assert!(matches!(result, Err(Error::NoBackend)));
    }

    #[test]
    fn null_backend_enumerates_both_roles() {
        let context = Context::new(
            vec![Box::new(NullBackend::new())],
            ContextConfig::default(),
        )
        .unwrap();

        let mut seen = Vec::new();
        context
            .enumerate_devices(&mut |role, info| seen.push((role, info.name.clone())))
            .unwrap();
        assert!(seen.iter().any(|(r, _)| *r == DeviceRole::Playback));
        assert!(seen.iter().any(|(r, _)| *r == DeviceRole::Capture));

        let default = context.device_info(None, DeviceRole::Playback).unwrap();
        assert!(default.is_default);
        assert!(!default.native_formats.is_empty());
    }
}
