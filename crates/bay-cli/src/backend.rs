//! Device discovery and power control backends.

use std::future::Future;

use bay_core::{Device, DeviceError, DeviceId, PowerState};
use bay_kasa::KasaAccount;

/// Discovers bay devices and switches their power.
pub trait DeviceBackend: Send + Sync {
    fn discover(&self) -> impl Future<Output = Result<Vec<Device>, DeviceError>> + Send;

    fn set_power(
        &self,
        device: &DeviceId,
        state: PowerState,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Fabricates `Device 0` .. `Device N-1` and logs power changes.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedBackend {
    count: usize,
}

impl SimulatedBackend {
    pub const fn new(count: usize) -> Self {
        Self { count }
    }
}

impl DeviceBackend for SimulatedBackend {
    async fn discover(&self) -> Result<Vec<Device>, DeviceError> {
        Ok((0..self.count)
            .map(|index| Device::new(format!("sim-{index}"), format!("Device {index}")))
            .collect())
    }

    async fn set_power(&self, device: &DeviceId, state: PowerState) -> Result<(), DeviceError> {
        tracing::info!(%device, %state, "simulated power change");
        Ok(())
    }
}

/// Devices registered to a Kasa cloud account.
#[derive(Debug)]
pub struct KasaBackend {
    account: KasaAccount,
}

impl KasaBackend {
    pub const fn new(account: KasaAccount) -> Self {
        Self { account }
    }
}

impl DeviceBackend for KasaBackend {
    async fn discover(&self) -> Result<Vec<Device>, DeviceError> {
        Ok(self.account.discover().await?)
    }

    async fn set_power(&self, device: &DeviceId, state: PowerState) -> Result<(), DeviceError> {
        Ok(self.account.set_power(device, state).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_backend_names_devices_by_index() {
        let devices = SimulatedBackend::new(3).discover().await.unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Device 0", "Device 1", "Device 2"]);
        assert_eq!(devices[2].id.as_str(), "sim-2");
    }

    #[tokio::test]
    async fn simulated_backend_accepts_power_changes() {
        let backend = SimulatedBackend::new(1);
        assert!(
            backend
                .set_power(&DeviceId::from("sim-0"), PowerState::On)
                .await
                .is_ok()
        );
    }
}
