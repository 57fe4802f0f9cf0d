// Simulated WiFi
// Platform WiFi stack stand-in that raises association events on its own

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::lock;
use crate::transport::{
    AccessPointConfig, DriverFault, IpSettings, LinkInfo, ScanRecord, WifiDriver, WifiEvent,
    WifiEventSender, WifiMode, REASON_ASSOC_LEAVE,
};

/// Reason code reported when the target network is not visible
const REASON_NO_AP_FOUND: u8 = 201;
/// Reason code reported for a rejected passphrase
const REASON_AUTH_FAIL: u8 = 202;
const REASON_BEACON_TIMEOUT: u8 = 200;

const DHCP_LEASE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

struct SimNetwork {
    record: ScanRecord,
    password: String,
}

struct SimWifiState {
    events: Option<WifiEventSender>,
    mode: WifiMode,
    networks: Vec<SimNetwork>,
    target: Option<(String, String)>,
    joined: Option<String>,
    ip: Option<Ipv4Addr>,
    ip_settings: IpSettings,
    auto_respond: bool,
    fail_associations: u32,
    associations: u32,
    access_point: Option<AccessPointConfig>,
    ap_clients: u8,
    sent: Vec<Vec<u8>>,
    fail_sends: bool,
    power_save: bool,
    tx_power: f32,
}

/// WiFi driver backed by a list of simulated networks
pub struct SimWifi {
    shared: Arc<Mutex<SimWifiState>>,
}

/// Test-side control of a [`SimWifi`]
#[derive(Clone)]
pub struct SimWifiHandle {
    shared: Arc<Mutex<SimWifiState>>,
}

impl SimWifi {
    pub fn new() -> (Self, SimWifiHandle) {
        let shared = Arc::new(Mutex::new(SimWifiState {
            events: None,
            mode: WifiMode::Off,
            networks: Vec::new(),
            target: None,
            joined: None,
            ip: None,
            ip_settings: IpSettings::Dhcp,
            auto_respond: true,
            fail_associations: 0,
            associations: 0,
            access_point: None,
            ap_clients: 0,
            sent: Vec::new(),
            fail_sends: false,
            power_save: false,
            tx_power: 20.0,
        }));
        (
            Self {
                shared: shared.clone(),
            },
            SimWifiHandle { shared },
        )
    }
}

impl SimWifiState {
    fn emit(&self, event: WifiEvent) -> bool {
        trace!(?event, "sim wifi event");
        self.events.as_ref().map(|tx| tx.emit(event)).unwrap_or(false)
    }

    fn associate(&mut self) {
        self.associations += 1;
        let Some((ssid, password)) = self.target.clone() else {
            return;
        };
        if self.fail_associations > 0 {
            self.fail_associations -= 1;
            self.emit(WifiEvent::StationDisconnected {
                reason: REASON_NO_AP_FOUND,
            });
            return;
        }

        let reason = match self.networks.iter().find(|n| n.record.ssid == ssid) {
            None => Some(REASON_NO_AP_FOUND),
            Some(network) if network.record.auth_mode != 0 && network.password != password => {
                Some(REASON_AUTH_FAIL)
            }
            Some(_) => None,
        };
        match reason {
            Some(reason) => {
                self.emit(WifiEvent::StationDisconnected { reason });
            }
            None => {
                let ip = match &self.ip_settings {
                    IpSettings::Dhcp => DHCP_LEASE,
                    IpSettings::Static { ip, .. } => *ip,
                };
                self.joined = Some(ssid);
                self.ip = Some(ip);
                self.emit(WifiEvent::StationConnected);
                self.emit(WifiEvent::GotIp(ip));
            }
        }
    }

    fn joined_network(&self) -> Option<&SimNetwork> {
        let ssid = self.joined.as_ref()?;
        self.networks.iter().find(|n| &n.record.ssid == ssid)
    }
}

#[async_trait]
impl WifiDriver for SimWifi {
    fn attach_events(&mut self, events: WifiEventSender) {
        lock(&self.shared).events = Some(events);
    }

    async fn set_mode(&mut self, mode: WifiMode) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        state.mode = mode;
        if mode.has_station() {
            state.emit(WifiEvent::StationStarted);
        }
        Ok(())
    }

    async fn configure_ip(&mut self, ip: &IpSettings) -> Result<(), DriverFault> {
        lock(&self.shared).ip_settings = ip.clone();
        Ok(())
    }

    async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        if !state.mode.has_station() {
            return Err(DriverFault("station interface is off".to_string()));
        }
        state.target = Some((ssid.to_string(), password.to_string()));
        if state.auto_respond {
            state.associate();
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        if state.target.is_none() {
            return Err(DriverFault("no network to rejoin".to_string()));
        }
        if state.auto_respond {
            state.associate();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        state.target = None;
        state.ip = None;
        if state.joined.take().is_some() {
            state.emit(WifiEvent::StationDisconnected {
                reason: REASON_ASSOC_LEAVE,
            });
        }
        Ok(())
    }

    async fn start_ap(&mut self, config: &AccessPointConfig) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        if !state.mode.has_access_point() {
            return Err(DriverFault("access point interface is off".to_string()));
        }
        state.access_point = Some(config.clone());
        state.emit(WifiEvent::ApStarted);
        Ok(())
    }

    async fn stop_ap(&mut self) -> Result<(), DriverFault> {
        let mut state = lock(&self.shared);
        if state.access_point.take().is_some() {
            state.ap_clients = 0;
            state.emit(WifiEvent::ApStopped);
        }
        Ok(())
    }

    async fn scan(&mut self) -> Result<Vec<ScanRecord>, DriverFault> {
        Ok(self.scan_results())
    }

    async fn start_scan(&mut self) -> Result<(), DriverFault> {
        let state = lock(&self.shared);
        if !state.emit(WifiEvent::ScanDone) {
            return Err(DriverFault("event queue unavailable".to_string()));
        }
        Ok(())
    }

    fn scan_results(&mut self) -> Vec<ScanRecord> {
        lock(&self.shared)
            .networks
            .iter()
            .map(|n| n.record.clone())
            .collect()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, DriverFault> {
        let mut state = lock(&self.shared);
        if state.joined.is_none() {
            return Err(DriverFault("not associated".to_string()));
        }
        if state.fail_sends {
            return Err(DriverFault("socket write failed".to_string()));
        }
        state.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn link_info(&self) -> LinkInfo {
        let state = lock(&self.shared);
        let (rssi, channel) = state
            .joined_network()
            .map(|n| (n.record.rssi, n.record.channel))
            .unwrap_or((0, 0));
        LinkInfo {
            ssid: state.joined.clone(),
            rssi,
            channel,
            ip: state.ip,
            mac: "02:00:00:5e:00:01".to_string(),
            ap_clients: state.ap_clients,
        }
    }

    async fn set_power_save(&mut self, enabled: bool) -> Result<(), DriverFault> {
        lock(&self.shared).power_save = enabled;
        Ok(())
    }

    async fn set_tx_power(&mut self, dbm: f32) -> Result<(), DriverFault> {
        lock(&self.shared).tx_power = dbm;
        Ok(())
    }
}

impl SimWifiHandle {
    /// Make a network visible; `auth_mode` 0 is open
    pub fn add_network(&self, ssid: &str, password: &str, rssi: i32, channel: u8, auth_mode: u8) {
        lock(&self.shared).networks.push(SimNetwork {
            record: ScanRecord {
                ssid: ssid.to_string(),
                rssi,
                channel,
                auth_mode,
            },
            password: password.to_string(),
        });
    }

    pub fn remove_network(&self, ssid: &str) {
        lock(&self.shared).networks.retain(|n| n.record.ssid != ssid);
    }

    /// Fail the next `count` association attempts
    pub fn fail_next_associations(&self, count: u32) {
        lock(&self.shared).fail_associations = count;
    }

    /// When disabled, association attempts stay pending until events are emitted by hand
    pub fn set_auto_respond(&self, enabled: bool) {
        lock(&self.shared).auto_respond = enabled;
    }

    pub fn emit(&self, event: WifiEvent) -> bool {
        lock(&self.shared).emit(event)
    }

    /// Drop the association as if the access point vanished
    pub fn drop_link(&self) -> bool {
        let mut state = lock(&self.shared);
        state.joined = None;
        state.ip = None;
        state.emit(WifiEvent::StationDisconnected {
            reason: REASON_BEACON_TIMEOUT,
        })
    }

    pub fn client_joined(&self, mac: &str) -> bool {
        let mut state = lock(&self.shared);
        state.ap_clients = state.ap_clients.saturating_add(1);
        state.emit(WifiEvent::ApClientConnected {
            mac: mac.to_string(),
        })
    }

    pub fn set_send_failure(&self, failing: bool) {
        lock(&self.shared).fail_sends = failing;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).sent.clone()
    }

    pub fn mode(&self) -> WifiMode {
        lock(&self.shared).mode
    }

    pub fn associations(&self) -> u32 {
        lock(&self.shared).associations
    }

    pub fn access_point(&self) -> Option<AccessPointConfig> {
        lock(&self.shared).access_point.clone()
    }

    pub fn power_save(&self) -> bool {
        lock(&self.shared).power_save
    }

    pub fn tx_power(&self) -> f32 {
        lock(&self.shared).tx_power
    }
}
