//! Pipeline plumbing shared by the producer, the sinks and the controller

pub mod channel;
pub mod state;
pub mod ticker;

pub use channel::{bounded, ChannelReceiver, ChannelSender, ChannelStats, InFlight, Received, Rejected};
pub use state::{ProducerState, RecorderState, StateMachine};
pub use ticker::Ticker;
