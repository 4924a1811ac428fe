//! Multi-rail reliable transport: fragmentation, credit-based flow control,
//! acknowledgment and retransmission over several interconnect rails.

pub mod checksum;
pub mod config;
pub mod credit;
pub mod device;
pub mod dma;
pub mod error;
pub mod frag;
pub mod message;
pub mod path;
pub mod pool;
pub mod rail;
pub mod seqtrack;
pub mod wire;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use path::{PathEngine, PathStats, ReceivedData};
