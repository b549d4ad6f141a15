// parley-common: wire protocol and shared identifiers for the Parley realtime relay

pub mod protocol;
pub mod types;
