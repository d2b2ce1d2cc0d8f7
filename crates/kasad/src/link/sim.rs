//! In-memory simulated device fleet.
//!
//! Used by tests and by `kasad daemon --simulate` for dry runs. Every
//! device accepts register reads and writes; devices added as switches
//! also answer `on`/`off`/`state`, and sensors answer a configured
//! reading while their control handle holds the enable command.
//!
//! Faults can be injected per device: unreachable, failing the next N
//! connects, dropping an open link, hanging every call, or hanging only the
//! device operations while connect and probe keep answering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kasa_core::DeviceKey;
use tracing::debug;

use super::{DeviceLink, Discovery, LinkError, LinkFactory};

#[derive(Debug, Clone)]
struct Sensor {
    ctrl_addr: String,
    enable_cmd: String,
    read_addr: String,
    reading: String,
}

#[derive(Debug, Clone)]
struct SimDevice {
    reachable: bool,
    failing_connects: u32,
    link_up: bool,
    hung: bool,
    hung_ops: bool,
    switch: bool,
    power: bool,
    registers: HashMap<String, String>,
    sensors: Vec<Sensor>,
    connect_attempts: u32,
}

impl SimDevice {
    fn new(switch: bool) -> Self {
        Self {
            reachable: true,
            failing_connects: 0,
            link_up: false,
            hung: false,
            hung_ops: false,
            switch,
            power: false,
            registers: HashMap::new(),
            sensors: Vec::new(),
            connect_attempts: 0,
        }
    }

    fn read(&self, addr: &str) -> Option<String> {
        if let Some(sensor) = self.sensors.iter().find(|s| s.read_addr == addr) {
            let enabled = self.registers.get(&sensor.ctrl_addr) == Some(&sensor.enable_cmd);
            return Some(if enabled {
                sensor.reading.clone()
            } else {
                "00".to_string()
            });
        }
        self.registers.get(addr).cloned()
    }
}

/// A shared, clonable set of simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimFleet {
    devices: Arc<Mutex<HashMap<DeviceKey, SimDevice>>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fleet of plain devices.
    pub fn with_devices<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let fleet = Self::new();
        for key in keys {
            fleet.add_device(key);
        }
        fleet
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, SimDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_device<R>(&self, key: &DeviceKey, f: impl FnOnce(&mut SimDevice) -> R) -> Option<R> {
        self.lock().get_mut(key).map(f)
    }

    pub fn add_device(&self, key: &str) {
        self.lock().insert(DeviceKey::new(key), SimDevice::new(false));
    }

    /// Adds a power-switch device, initially off.
    pub fn add_switch(&self, key: &str) {
        self.lock().insert(DeviceKey::new(key), SimDevice::new(true));
    }

    /// Adds a sensor reporting `reading` at `read_addr` while `ctrl_addr`
    /// holds `enable_cmd`.
    pub fn add_sensor(
        &self,
        key: &str,
        ctrl_addr: &str,
        enable_cmd: &str,
        read_addr: &str,
        reading: &str,
    ) {
        let mut device = SimDevice::new(false);
        device.sensors.push(Sensor {
            ctrl_addr: ctrl_addr.to_string(),
            enable_cmd: enable_cmd.to_string(),
            read_addr: read_addr.to_string(),
            reading: reading.to_string(),
        });
        self.lock().insert(DeviceKey::new(key), device);
    }

    pub fn set_reachable(&self, key: &str, reachable: bool) {
        self.with_device(&DeviceKey::new(key), |d| d.reachable = reachable);
    }

    /// Makes the next `count` connect attempts to `key` fail.
    pub fn fail_next_connects(&self, key: &str, count: u32) {
        self.with_device(&DeviceKey::new(key), |d| d.failing_connects = count);
    }

    /// Drops the open link to `key`; probes fail until it reconnects.
    pub fn drop_link(&self, key: &str) {
        self.with_device(&DeviceKey::new(key), |d| d.link_up = false);
    }

    /// Makes every call to `key` hang (or stop hanging).
    pub fn set_hung(&self, key: &str, hung: bool) {
        self.with_device(&DeviceKey::new(key), |d| d.hung = hung);
    }

    /// Makes reads, writes and power calls to `key` hang; connect, probe
    /// and close still answer.
    pub fn set_hung_ops(&self, key: &str, hung: bool) {
        self.with_device(&DeviceKey::new(key), |d| d.hung_ops = hung);
    }

    pub fn set_register(&self, key: &str, addr: &str, value: &str) {
        self.with_device(&DeviceKey::new(key), |d| {
            d.registers.insert(addr.to_string(), value.to_string());
        });
    }

    pub fn register(&self, key: &str, addr: &str) -> Option<String> {
        self.with_device(&DeviceKey::new(key), |d| d.registers.get(addr).cloned())
            .flatten()
    }

    pub fn power(&self, key: &str) -> Option<bool> {
        self.with_device(&DeviceKey::new(key), |d| d.power)
    }

    pub fn connect_attempts(&self, key: &str) -> u32 {
        self.with_device(&DeviceKey::new(key), |d| d.connect_attempts)
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl LinkFactory for SimFleet {
    fn create(&self, key: &DeviceKey) -> Box<dyn DeviceLink> {
        Box::new(SimLink {
            fleet: self.clone(),
            key: key.clone(),
            open: false,
        })
    }
}

#[async_trait]
impl Discovery for SimFleet {
    async fn discover(&self, _window: Duration) -> Result<Vec<DeviceKey>, LinkError> {
        let devices = self.lock();
        let mut keys: Vec<_> = devices
            .iter()
            .filter(|(_, d)| d.reachable)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Link to one simulated device.
pub struct SimLink {
    fleet: SimFleet,
    key: DeviceKey,
    open: bool,
}

impl SimLink {
    async fn stall_if_hung(&self) {
        if self.fleet.with_device(&self.key, |d| d.hung).unwrap_or(false) {
            std::future::pending::<()>().await;
        }
    }

    async fn stall_if_op_hung(&self) {
        if self
            .fleet
            .with_device(&self.key, |d| d.hung || d.hung_ops)
            .unwrap_or(false)
        {
            std::future::pending::<()>().await;
        }
    }

    fn live<R>(&self, f: impl FnOnce(&mut SimDevice) -> Result<R, LinkError>) -> Result<R, LinkError> {
        if !self.open {
            return Err(LinkError::Disconnected(self.key.clone()));
        }
        self.fleet
            .with_device(&self.key, |d| {
                if d.link_up {
                    f(d)
                } else {
                    Err(LinkError::Disconnected(self.key.clone()))
                }
            })
            .unwrap_or_else(|| Err(LinkError::Disconnected(self.key.clone())))
    }

    fn switch<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SimDevice) -> R,
    ) -> Result<R, LinkError> {
        self.live(|d| {
            if d.switch {
                Ok(f(d))
            } else {
                Err(LinkError::Unsupported {
                    device: self.key.clone(),
                    operation,
                })
            }
        })
    }
}

#[async_trait]
impl DeviceLink for SimLink {
    async fn connect(&mut self, key: &DeviceKey) -> Result<(), LinkError> {
        self.stall_if_hung().await;
        let connected = self
            .fleet
            .with_device(key, |d| {
                d.connect_attempts += 1;
                if !d.reachable {
                    return false;
                }
                if d.failing_connects > 0 {
                    d.failing_connects -= 1;
                    return false;
                }
                d.link_up = true;
                true
            })
            .unwrap_or(false);

        debug!(key = %key, connected, "Simulated connect");
        if connected {
            self.key = key.clone();
            self.open = true;
            Ok(())
        } else {
            Err(LinkError::Unreachable(key.clone()))
        }
    }

    async fn probe(&mut self) -> Result<(), LinkError> {
        self.stall_if_hung().await;
        self.live(|_| Ok(()))
    }

    async fn read(&mut self, addr: &str) -> Result<String, LinkError> {
        self.stall_if_op_hung().await;
        self.live(|d| {
            d.read(addr)
                .ok_or_else(|| LinkError::Device(format!("no handle {addr}")))
        })
    }

    async fn write(&mut self, addr: &str, value: &str) -> Result<(), LinkError> {
        self.stall_if_op_hung().await;
        self.live(|d| {
            d.registers.insert(addr.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn set_power(&mut self, on: bool) -> Result<(), LinkError> {
        self.stall_if_op_hung().await;
        self.switch(if on { "on" } else { "off" }, |d| d.power = on)
    }

    async fn power(&mut self) -> Result<bool, LinkError> {
        self.stall_if_op_hung().await;
        self.switch("state", |d| d.power)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.stall_if_hung().await;
        self.open = false;
        self.fleet.with_device(&self.key, |d| d.link_up = false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_read_write() {
        let fleet = SimFleet::with_devices(["AA"]);
        let key = DeviceKey::new("AA");
        let mut link = fleet.create(&key);

        assert!(matches!(link.read("0x25").await, Err(LinkError::Disconnected(_))));

        link.connect(&key).await.unwrap();
        link.write("0x25", "01").await.unwrap();
        assert_eq!(link.read("0x25").await.unwrap(), "01");
        assert_eq!(fleet.register("AA", "0x25").as_deref(), Some("01"));
        assert!(matches!(link.read("0x99").await, Err(LinkError::Device(_))));
    }

    #[tokio::test]
    async fn test_failing_connects_then_success() {
        let fleet = SimFleet::with_devices(["AA"]);
        fleet.fail_next_connects("AA", 2);
        let key = DeviceKey::new("AA");
        let mut link = fleet.create(&key);

        assert!(link.connect(&key).await.is_err());
        assert!(link.connect(&key).await.is_err());
        assert!(link.connect(&key).await.is_ok());
        assert_eq!(fleet.connect_attempts("AA"), 3);
    }

    #[tokio::test]
    async fn test_dropped_link_fails_probe_until_reconnect() {
        let fleet = SimFleet::with_devices(["AA"]);
        let key = DeviceKey::new("AA");
        let mut link = fleet.create(&key);
        link.connect(&key).await.unwrap();
        link.probe().await.unwrap();

        fleet.drop_link("AA");
        assert!(matches!(link.probe().await, Err(LinkError::Disconnected(_))));

        link.connect(&key).await.unwrap();
        link.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_and_sensor_devices() {
        let fleet = SimFleet::new();
        fleet.add_switch("kitchen");
        fleet.add_sensor("tag", "0x24", "01", "0x21", "1f2e");

        let kitchen = DeviceKey::new("kitchen");
        let mut switch = fleet.create(&kitchen);
        switch.connect(&kitchen).await.unwrap();
        switch.set_power(true).await.unwrap();
        assert!(switch.power().await.unwrap());
        assert_eq!(fleet.power("kitchen"), Some(true));

        let tag = DeviceKey::new("tag");
        let mut sensor = fleet.create(&tag);
        sensor.connect(&tag).await.unwrap();
        assert_eq!(sensor.read("0x21").await.unwrap(), "00");
        sensor.write("0x24", "01").await.unwrap();
        assert_eq!(sensor.read("0x21").await.unwrap(), "1f2e");
        assert!(matches!(
            sensor.set_power(true).await,
            Err(LinkError::Unsupported { operation: "on", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_ops_leave_probe_answering() {
        let fleet = SimFleet::with_devices(["AA"]);
        let key = DeviceKey::new("AA");
        let mut link = fleet.create(&key);
        link.connect(&key).await.unwrap();

        fleet.set_hung_ops("AA", true);
        link.probe().await.unwrap();
        let read = tokio::time::timeout(Duration::from_secs(1), link.read("0x25")).await;
        assert!(read.is_err());

        fleet.set_hung_ops("AA", false);
        link.write("0x25", "01").await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_lists_reachable_devices() {
        let fleet = SimFleet::with_devices(["BB", "AA", "CC"]);
        fleet.set_reachable("CC", false);
        let found = fleet.discover(Duration::from_millis(10)).await.unwrap();
        assert_eq!(found, vec![DeviceKey::new("AA"), DeviceKey::new("BB")]);
    }
}
