//! Zeroconf (mDNS) advertisement
//!
//! Advertises the satellite as `_wyoming._tcp.local.` so voice-assistant
//! servers can discover it on the LAN. The instance name defaults to a
//! MAC-derived identifier; the host address defaults to interface
//! detection.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::config::DiscoveryConfig;
use crate::{Error, Result};

/// mDNS service type for Wyoming endpoints
pub const SERVICE_TYPE: &str = "_wyoming._tcp.local.";

/// mDNS advertiser for the satellite
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    registered: Option<String>,
}

impl MdnsAdvertiser {
    /// Create a new advertiser.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the mDNS daemon cannot be created.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Config(format!("failed to create mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            registered: None,
        })
    }

    /// Register the satellite on the LAN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the service cannot be registered.
    pub fn register(&mut self, config: &DiscoveryConfig, port: u16) -> Result<()> {
        let instance_name = match &config.name {
            Some(name) => name.clone(),
            None => default_instance_name(),
        };

        let hostname = hostname::get()
            .map_or_else(|_| "satellite".to_string(), |h| h.to_string_lossy().to_string());

        let mut service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &format!("{hostname}.local."),
            config.host.as_deref().unwrap_or_default(),
            port,
            HashMap::<String, String>::new(),
        )
        .map_err(|e| Error::Config(format!("failed to create service info: {e}")))?;

        if config.host.is_none() {
            // Let the daemon pick routable interface addresses
            service = service.enable_addr_auto();
        }

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| Error::Config(format!("failed to register mDNS service: {e}")))?;
        self.registered = Some(fullname);

        tracing::info!(
            service_type = SERVICE_TYPE,
            instance = %instance_name,
            port,
            "zeroconf discovery enabled"
        );
        Ok(())
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Some(name) = self.registered.take() {
            let _ = self.daemon.unregister(&name);
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

/// Default zeroconf instance name: the primary interface MAC as bare hex
fn default_instance_name() -> String {
    match mac_address::get_mac_address() {
        Ok(Some(mac)) => mac
            .bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>(),
        _ => {
            tracing::warn!("could not read MAC address, using hostname for discovery");
            hostname::get()
                .map_or_else(|_| "satellite".to_string(), |h| h.to_string_lossy().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_format() {
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.contains("._tcp."));
        assert!(SERVICE_TYPE.ends_with(".local."));
    }

    #[test]
    fn default_name_is_nonempty_hex_or_hostname() {
        let name = default_instance_name();
        assert!(!name.is_empty());
    }

    #[test]
    fn advertiser_creation() {
        // mDNS may be unavailable in CI; only assert when it comes up
        if let Ok(advertiser) = MdnsAdvertiser::new() {
            assert!(advertiser.registered.is_none());
        }
    }
}
