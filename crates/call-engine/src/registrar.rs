//! Multi-identity SIP registrar client
//!
//! Every device with credentials holds its own registration, refreshed by
//! its own task. The loop is strictly sequential per device, so at most one
//! REGISTER is in flight per identity at any time.
//!
//! Refresh fires at 90% of the granted expiry with a 30 second floor.
//! Failures back off for a fixed minute (with a little jitter so a fleet of
//! devices does not retry in lockstep) and never touch the last granted
//! expiry. Persistent auth failures are logged and retried forever; wrong
//! credentials are an operator problem, not a crash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::sip::{RegisterRequest, SipCredentials, SipStack};

/// Fixed retry delay after a failed REGISTER
const FAILURE_BACKOFF: Duration = Duration::from_secs(60);
/// Floor for the refresh timer
const MIN_REFRESH_SECS: u64 = 30;

/// Registration parameters shared by all devices
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Domain used in From/To (`sip:<ext>@<domain>`)
    pub domain: String,
    /// Registrar host:port REGISTER is sent to
    pub registrar: String,
    /// Address advertised in Contact
    pub external_address: String,
    /// Requested expiry in seconds
    pub expires: u32,
}

/// Observable state of one device's registration
#[derive(Debug, Clone)]
pub struct RegistrationStatus {
    pub extension: String,
    pub device_name: String,
    pub active: bool,
    pub granted_expires: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Refresh schedule: `max(30, floor(0.9 x granted))` seconds.
///
/// ```
/// use std::time::Duration;
/// use voxbridge_call_engine::registrar::refresh_delay;
///
/// // A granted expiry of 600 s refreshes at 540 s
/// assert_eq!(refresh_delay(600), Duration::from_secs(540));
/// // Tiny grants are clamped to the floor
/// assert_eq!(refresh_delay(20), Duration::from_secs(30));
/// ```
pub fn refresh_delay(granted_expires: u32) -> Duration {
    let refresh = (granted_expires as u64 * 9) / 10;
    Duration::from_secs(refresh.max(MIN_REFRESH_SECS))
}

fn backoff_with_jitter() -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    FAILURE_BACKOFF.mul_f64(factor)
}

/// One registration task per registrable device
pub struct MultiRegistrar {
    stack: Arc<dyn SipStack>,
    config: RegistrarConfig,
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    statuses: Arc<DashMap<String, RegistrationStatus>>,
}

impl MultiRegistrar {
    pub fn new(stack: Arc<dyn SipStack>, config: RegistrarConfig) -> Self {
        Self { stack, config, tasks: Mutex::new(HashMap::new()), statuses: Arc::new(DashMap::new()) }
    }

    /// Start (or restart) registrations for the given devices. Devices
    /// without credentials are ignored; devices no longer in the set have
    /// their registration task dropped.
    pub fn start(&self, devices: &[Arc<Device>]) {
        let mut tasks = self.tasks.lock();

        let keep: std::collections::HashSet<&str> =
            devices.iter().filter(|d| d.is_registrable()).map(|d| d.extension.as_str()).collect();
        let stale: Vec<String> =
            tasks.keys().filter(|ext| !keep.contains(ext.as_str())).cloned().collect();
        for extension in stale {
            if let Some(old) = tasks.remove(&extension) {
                debug!(%extension, "dropping registration for removed device");
                old.abort();
            }
            self.statuses.remove(&extension);
        }

        for device in devices {
            if !device.is_registrable() {
                continue;
            }
            if let Some(old) = tasks.remove(&device.extension) {
                old.abort();
            }

            self.statuses.insert(
                device.extension.clone(),
                RegistrationStatus {
                    extension: device.extension.clone(),
                    device_name: device.name.clone(),
                    active: false,
                    granted_expires: 0,
                    last_success: None,
                    consecutive_failures: 0,
                },
            );

            let handle = tokio::spawn(run_registration(
                self.stack.clone(),
                device.clone(),
                self.config.clone(),
                self.statuses.clone(),
            ));
            tasks.insert(device.extension.clone(), handle);
        }
        info!(devices = tasks.len(), "registrar started");
    }

    /// Stop every registration task.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        for (extension, handle) in tasks.drain() {
            debug!(%extension, "stopping registration");
            handle.abort();
        }
        self.statuses.clear();
    }

    pub fn statuses(&self) -> Vec<RegistrationStatus> {
        self.statuses.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.statuses.iter().filter(|entry| entry.value().active).count()
    }
}

impl Drop for MultiRegistrar {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

async fn run_registration(
    stack: Arc<dyn SipStack>,
    device: Arc<Device>,
    config: RegistrarConfig,
    statuses: Arc<DashMap<String, RegistrationStatus>>,
) {
    // is_registrable() checked before spawn
    let credentials = SipCredentials {
        username: device.auth_id.clone().unwrap_or_default(),
        password: device.password.clone().unwrap_or_default(),
    };

    loop {
        let request = RegisterRequest {
            aor: format!("sip:{}@{}", device.extension, config.domain),
            contact: format!("sip:{}@{}", device.extension, config.external_address),
            registrar: config.registrar.clone(),
            expires: config.expires,
            credentials: credentials.clone(),
        };

        match stack.register(request).await {
            Ok(grant) => {
                let delay = refresh_delay(grant.granted_expires);
                if let Some(mut status) = statuses.get_mut(&device.extension) {
                    status.active = true;
                    status.granted_expires = grant.granted_expires;
                    status.last_success = Some(Utc::now());
                    status.consecutive_failures = 0;
                }
                debug!(
                    extension = %device.extension,
                    granted = grant.granted_expires,
                    refresh_in = delay.as_secs(),
                    "registration refreshed"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let failures = if let Some(mut status) = statuses.get_mut(&device.extension) {
                    status.active = false;
                    status.consecutive_failures += 1;
                    status.consecutive_failures
                } else {
                    1
                };
                warn!(
                    extension = %device.extension,
                    failures,
                    "registration failed, retrying in {}s: {}",
                    FAILURE_BACKOFF.as_secs(),
                    e
                );
                tokio::time::sleep(backoff_with_jitter()).await;
            }
        }
    }
}
