//! Cloud backend abstraction.
//!
//! The protocol core consumes a small RPC surface: binding records, PSK
//! storage, data reporting and OTA metadata/downloads. The application
//! supplies the real client; [`MemoryBackend`] covers tests and demos.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::tlv::ValueMap;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no PSK record for {device_id}")]
    PskNotFound { device_id: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("firmware download failed: {0}")]
    Download(String),
}

/// Parameters of a signature-based bind registration.
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub device_id: String,
    pub signature: String,
    pub device_timestamp: u32,
    pub conn_id: String,
}

/// OTA metadata for one device.
#[derive(Debug, Clone)]
pub struct OtaInfo {
    pub target_version: String,
    pub firmware_url: String,
}

/// Backend acknowledgement of a property report.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportAck {
    pub code: i8,
}

/// RPC surface the session and OTA engine call into.
pub trait BackendApi: Send + Sync {
    /// Register a bind record proven by the device signature.
    fn register_binding(&self, request: &BindRequest) -> Result<(), BackendError>;

    /// Remove the bind record for a device.
    fn remove_binding(&self, device_id: &str) -> Result<(), BackendError>;

    /// Persist the PSK negotiated at bind time.
    fn store_psk(&self, device_id: &str, psk: &str) -> Result<(), BackendError>;

    /// Fetch the PSK for a previously bound device.
    fn load_psk(&self, device_id: &str) -> Result<String, BackendError>;

    /// Report device-pushed property values.
    fn report_properties(&self, device_id: &str, values: &ValueMap)
    -> Result<ReportAck, BackendError>;

    /// Report a device event.
    fn report_event(
        &self,
        device_id: &str,
        event_id: &str,
        params: &ValueMap,
    ) -> Result<(), BackendError>;

    /// Publish the output of a completed action.
    fn publish_action_output(
        &self,
        device_id: &str,
        action_id: &str,
        output: &ValueMap,
    ) -> Result<(), BackendError>;

    /// Desired property state, served when the device asks for status.
    fn desired_properties(&self, device_id: &str) -> Result<ValueMap, BackendError>;

    /// OTA target version and firmware location.
    fn ota_info(&self, device_id: &str) -> Result<OtaInfo, BackendError>;

    /// Download the firmware image, reporting progress as
    /// `(received, total)` byte counts.
    fn download_firmware(
        &self,
        url: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<Vec<u8>, BackendError>;

    /// Record the firmware version the device reported after connect.
    fn report_ota_version(&self, device_id: &str, version: &str) -> Result<(), BackendError>;
}

/// In-memory backend for tests and examples.
#[derive(Default)]
pub struct MemoryBackend {
    psk_store: Mutex<HashMap<String, String>>,
    bindings: Mutex<Vec<BindRequest>>,
    desired: Mutex<ValueMap>,
    ota: Mutex<Option<OtaInfo>>,
    firmware: Mutex<Vec<u8>>,
    reported: Mutex<Vec<(String, ValueMap)>>,
    events: Mutex<Vec<(String, String)>>,
    action_outputs: Mutex<Vec<(String, String)>>,
    ota_versions: Mutex<Vec<String>>,
    fail_bindings: Mutex<u32>,
    fail_reports: Mutex<u32>,
    fail_downloads: Mutex<u32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_psk(&self, device_id: &str, psk: &str) {
        self.psk_store
            .lock()
            .unwrap()
            .insert(device_id.to_string(), psk.to_string());
    }

    pub fn set_desired(&self, values: ValueMap) {
        *self.desired.lock().unwrap() = values;
    }

    pub fn set_ota(&self, info: OtaInfo, firmware: Vec<u8>) {
        *self.ota.lock().unwrap() = Some(info);
        *self.firmware.lock().unwrap() = firmware;
    }

    pub fn bindings(&self) -> Vec<BindRequest> {
        self.bindings.lock().unwrap().clone()
    }

    pub fn reported_properties(&self) -> Vec<(String, ValueMap)> {
        self.reported.lock().unwrap().clone()
    }

    pub fn reported_events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn published_actions(&self) -> Vec<(String, String)> {
        self.action_outputs.lock().unwrap().clone()
    }

    pub fn reported_ota_versions(&self) -> Vec<String> {
        self.ota_versions.lock().unwrap().clone()
    }

    /// Fail the next `register_binding` call.
    pub fn fail_next_binding(&self) {
        *self.fail_bindings.lock().unwrap() += 1;
    }

    /// Fail the next `report_properties` call.
    pub fn fail_next_report(&self) {
        *self.fail_reports.lock().unwrap() += 1;
    }

    /// Fail the next `download_firmware` call.
    pub fn fail_next_download(&self) {
        *self.fail_downloads.lock().unwrap() += 1;
    }

    /// Insert a pre-existing bind record.
    pub fn seed_binding(&self, device_id: &str) {
        self.bindings.lock().unwrap().push(BindRequest {
            device_id: device_id.to_string(),
            signature: String::new(),
            device_timestamp: 0,
            conn_id: String::new(),
        });
    }
}

impl BackendApi for MemoryBackend {
    fn register_binding(&self, request: &BindRequest) -> Result<(), BackendError> {
        let mut failures = self.fail_bindings.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BackendError::Request("injected binding failure".into()));
        }
        self.bindings.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn remove_binding(&self, device_id: &str) -> Result<(), BackendError> {
        self.bindings
            .lock()
            .unwrap()
            .retain(|b| b.device_id != device_id);
        Ok(())
    }

    fn store_psk(&self, device_id: &str, psk: &str) -> Result<(), BackendError> {
        self.set_psk(device_id, psk);
        Ok(())
    }

    fn load_psk(&self, device_id: &str) -> Result<String, BackendError> {
        self.psk_store
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BackendError::PskNotFound {
                device_id: device_id.to_string(),
            })
    }

    fn report_properties(
        &self,
        device_id: &str,
        values: &ValueMap,
    ) -> Result<ReportAck, BackendError> {
        let mut failures = self.fail_reports.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BackendError::Request("injected report failure".into()));
        }
        self.reported
            .lock()
            .unwrap()
            .push((device_id.to_string(), values.clone()));
        Ok(ReportAck::default())
    }

    fn report_event(
        &self,
        device_id: &str,
        event_id: &str,
        _params: &ValueMap,
    ) -> Result<(), BackendError> {
        self.events
            .lock()
            .unwrap()
            .push((device_id.to_string(), event_id.to_string()));
        Ok(())
    }

    fn publish_action_output(
        &self,
        device_id: &str,
        action_id: &str,
        _output: &ValueMap,
    ) -> Result<(), BackendError> {
        self.action_outputs
            .lock()
            .unwrap()
            .push((device_id.to_string(), action_id.to_string()));
        Ok(())
    }

    fn desired_properties(&self, _device_id: &str) -> Result<ValueMap, BackendError> {
        Ok(self.desired.lock().unwrap().clone())
    }

    fn ota_info(&self, _device_id: &str) -> Result<OtaInfo, BackendError> {
        self.ota
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Request("no OTA record".into()))
    }

    fn download_firmware(
        &self,
        _url: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<Vec<u8>, BackendError> {
        let mut failures = self.fail_downloads.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BackendError::Download("injected download failure".into()));
        }
        let firmware = self.firmware.lock().unwrap().clone();
        progress(firmware.len() as u64, firmware.len() as u64);
        Ok(firmware)
    }

    fn report_ota_version(&self, _device_id: &str, version: &str) -> Result<(), BackendError> {
        self.ota_versions.lock().unwrap().push(version.to_string());
        Ok(())
    }
}
