//! LLSync-Core: BLE device pairing and data exchange in Rust.
//!
//! This crate implements the LLSync profile for constrained BLE links
//! (MTU down to 20 bytes): binding and challenge/response connection
//! authentication, a schema-driven TLV data model, MTU-aware
//! fragmentation, and a resumable firmware-update transfer.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, fragmentation, notify-frame classification
//! - **Schema/TLV**: Data template and the TLV codec it drives
//! - **Transport**: BLE link abstraction (platform adapter, mock)
//! - **Backend**: Cloud RPC abstraction (bindings, PSKs, OTA metadata)
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Notify pump and the write-then-wait engine
//! - **Pairing/Control**: The authenticated protocol exchanges
//! - **OTA**: Resumable firmware-update engine
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use llsync_core::{
//!     DataTemplate, DeviceIdentity, LlsyncConfig, LlsyncSession, MemoryBackend, MockTransport,
//! };
//!
//! let template = DataTemplate::from_json(
//!     r#"{"properties": [{"id": "power_switch", "define": {"type": "bool"}}]}"#,
//! ).expect("valid template");
//! let identity = DeviceIdentity {
//!     product_id: "PRODUCT1".into(),
//!     device_name: "dev_001".into(),
//!     user_identity: "0102030405060708".into(),
//! };
//!
//! let mut session = LlsyncSession::new(
//!     MockTransport::new(),
//!     MemoryBackend::new(),
//!     template,
//!     identity,
//!     LlsyncConfig::default(),
//! );
//! session.connect().expect("connect");
//! session.authenticate_connection().expect("authenticate");
//! loop {
//!     session.service(Duration::from_millis(100)).expect("serve reports");
//! }
//! ```

pub mod backend;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod events;
pub mod ota;
pub mod pairing;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod tlv;
pub mod transport;

// Re-exports for convenience
pub use backend::{BackendApi, BackendError, BindRequest, MemoryBackend, OtaInfo, ReportAck};
pub use config::LlsyncConfig;
pub use error::{ErrorCode, ProtocolError};
pub use events::{LinkPhase, LlsyncEvent, LlsyncObserver, NullObserver, OtaPhase, TracingObserver};
pub use ota::{FirmwareFile, OtaCancelHandle, OtaError, OtaProgress, OtaReport};
pub use pairing::{BindReply, DeviceInfo};
pub use protocol::{Assembled, EventKind, FragmentError, Reassembler, fragment};
pub use schema::{DataTemplate, FieldSpec, SchemaError, TemplateSection, TlvType};
pub use session::{DeviceIdentity, LlsyncSession, SessionState};
pub use tlv::{ActionOutput, EventPayload, TlvError, TlvValue, ValueMap};
pub use transport::{BleTransport, MockTransport, TransportError, WriteTarget};
