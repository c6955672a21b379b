//! Library crate for glidescan: a concurrent recon engine with two scan kinds, a TCP port
//! scan with service fingerprinting and an HTTP path brute-force, behind one session model.
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod progress;
pub mod results;
pub mod server;
pub mod session;
pub mod state;
pub mod targets;
pub mod types;
pub mod wordlist;

pub use config::{EngineConfig, PathScanRequest, PortScanRequest, ScanRequest, WordlistSource};
pub use error::ScanError;
pub use session::{Engine, Session};
