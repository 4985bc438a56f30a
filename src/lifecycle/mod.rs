//! Connection lifecycle: probing, initial load, steady polling and recovery

mod machine;

pub use machine::{
    ConnectionLifecycle, ConnectionState, LifecycleSnapshot, STATUS_CONNECTING,
    STATUS_CONNECTION_FAILED, STATUS_OK, STATUS_WAITING_FOR_CONFIG,
};
