//! Observer events for UI decoupling.
//!
//! CLI/app layers subscribe to session and OTA progress without tight
//! coupling to the protocol internals.

use std::fmt;

use crate::error::ErrorCode;

/// Link-level phases of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connected,
    Binding,
    Authenticating,
    Authorized,
    Unbinding,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkPhase::Disconnected => "Disconnected",
            LinkPhase::Connected => "Connected",
            LinkPhase::Binding => "Binding",
            LinkPhase::Authenticating => "Authenticating",
            LinkPhase::Authorized => "Authorized",
            LinkPhase::Unbinding => "Unbinding",
        };
        f.write_str(name)
    }
}

/// Phases of a firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    CheckUpdateInfo,
    Downloading,
    RequestingUpdate,
    SendingData,
    ConfirmingCompletion,
    WaitingReboot,
    Success,
    Failed,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OtaPhase::Idle => "Idle",
            OtaPhase::CheckUpdateInfo => "Check Update Info",
            OtaPhase::Downloading => "Downloading",
            OtaPhase::RequestingUpdate => "Requesting Update",
            OtaPhase::SendingData => "Sending Data",
            OtaPhase::ConfirmingCompletion => "Confirming Completion",
            OtaPhase::WaitingReboot => "Waiting for Reboot",
            OtaPhase::Success => "Success",
            OtaPhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Events emitted by the session and the OTA engine.
#[derive(Debug, Clone)]
pub enum LlsyncEvent {
    /// Link phase changed.
    PhaseChanged { from: LinkPhase, to: LinkPhase },
    /// Session authorized; negotiated parameters attached.
    Authorized {
        version: u8,
        mtu: usize,
        ota_version: Option<String>,
    },
    /// Physical link dropped.
    Disconnected,
    /// OTA phase changed.
    OtaPhaseChanged { from: OtaPhase, to: OtaPhase },
    /// Firmware bytes confirmed received by the device.
    OtaProgress { received: usize, total: usize },
    /// Firmware download progress (from the backend).
    DownloadProgress { received: u64, total: u64 },
    /// A completed message arrived that nothing was waiting for.
    MessageDropped { kind: &'static str },
    /// A coded failure was surfaced to the caller.
    Failure { code: ErrorCode },
}

/// Observer trait for receiving session events.
///
/// Implement this in the UI layer to receive updates.
pub trait LlsyncObserver: Send + Sync {
    fn on_event(&self, event: &LlsyncEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LlsyncObserver for NullObserver {
    fn on_event(&self, _event: &LlsyncEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LlsyncObserver for TracingObserver {
    fn on_event(&self, event: &LlsyncEvent) {
        match event {
            LlsyncEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            LlsyncEvent::Authorized {
                version,
                mtu,
                ota_version,
            } => {
                tracing::info!(version, mtu, ota_version = ?ota_version, "Session authorized");
            }
            LlsyncEvent::Disconnected => {
                tracing::warn!("Device disconnected");
            }
            LlsyncEvent::OtaPhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "OTA phase changed");
            }
            LlsyncEvent::OtaProgress { received, total } => {
                let pct = if *total > 0 { received * 100 / total } else { 0 };
                tracing::debug!(received, total, progress = %format!("{pct}%"), "OTA progress");
            }
            LlsyncEvent::DownloadProgress { received, total } => {
                tracing::debug!(received, total, "Firmware download progress");
            }
            LlsyncEvent::MessageDropped { kind } => {
                tracing::debug!(kind, "Dropped unconsumed message");
            }
            LlsyncEvent::Failure { code } => {
                tracing::error!(code = code.as_str(), "{}", code.message());
            }
        }
    }
}
