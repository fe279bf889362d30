pub mod config;
pub mod history;
pub mod paths;
pub mod peers;

mod error;

pub use config::Config;
pub use error::StoreError;
pub use history::{CallHistory, HistoryRecord};
pub use peers::{PeerRecord, PeersStore};
