//! Multi-port Modbus-RTU serial gateway.
//!
//! Owns one or more RS-485/serial links, drives Modbus-RTU read requests
//! on behalf of remote JSON clients connected over TCP, and reassembles
//! the raw byte stream coming back from each line into discrete response
//! frames on demand.

pub mod config;
pub mod protocol;
