//! `ethertunnel` is a virtual Ethernet overlay: endpoints tunnel Layer-2
//! frames over TCP to a central learning switch.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  Ethernet  ┌────────────────┐   frames    ┌──────────────────┐
//!  │  device  │◀──────────▶│ EndpointWorker │◀═══════════▶│      Switch      │
//!  │ (TAP/mem)│            │ (two loops)    │  over TCP   │ (learning bridge)│
//!  └──────────┘            └────────────────┘             └───┬──────────┬───┘
//!                                                             │          │
//!                                                     ┌───────▼──┐  ┌────▼─────┐
//!                                                     │ MacTable │  │ Registry │
//!                                                     └──────────┘  └──────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`frame`]     : wire framing (`0xFFFF | length | payload`)
//! - [`control`]   : control messages carried inside frames
//! - [`ethernet`]  : Ethernet header parsing and MAC addresses
//! - [`switch`]    : login, MAC learning and forwarding
//! - [`registry`]  : live switch sessions
//! - [`mac_table`] : per-network MAC → session bindings
//! - [`pool`]      : per-network IPv4 lease pool
//! - [`endpoint`]  : endpoint state machine and forwarding loops
//! - [`state`]     : endpoint finite-state-machine types
//! - [`device`]    : virtual device trait and in-memory device
//! - [`tap`]       : Linux TAP device
//! - [`transport`] : TCP connector/listener and frame reader/sender
//! - [`shutdown`]  : cancellation signal
//! - [`config`]    : tunables
//! - [`logging`]   : injected logging handle
//! - [`error`]     : error taxonomy

pub mod config;
pub mod control;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod ethernet;
pub mod frame;
pub mod logging;
pub mod mac_table;
pub mod pool;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod switch;
#[cfg(target_os = "linux")]
pub mod tap;
pub mod transport;

pub use error::Error;
