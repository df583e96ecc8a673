//! Boot supervisor for thinboot images.
//!
//! Runs as PID 1 of every runtime image: brings up devices and the network,
//! synchronizes the clock, starts the display server, then keeps a remote
//! desktop session running while telemetry flows to the central server.

pub mod bringup;
pub mod clock;
pub mod display;
pub mod network;
pub mod power;
pub mod process;
pub mod services;
pub mod session;
pub mod shell;
pub mod supervisor;
pub mod telemetry;

pub use display::{DisplayEvent, DisplayRun, DisplayState, DisplaySupervisor};
pub use process::{CommandRunner, ExitOutcome, Supervised, SupervisedChild, SystemRunner};
pub use session::{BackoffPolicy, ExitClass, SessionAttempt, SessionSupervisor};
pub use supervisor::{BootOutcome, BootPhase, BootSupervisor, DiagnosticReport};
pub use telemetry::{LogBuffer, UplinkLayer};
