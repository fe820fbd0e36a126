//! The `transport` module carries MQTT 3.1.1 between clients and the broker.
//!
//! - `packet` and `codec`: control packets and their framing.
//! - `server`: the TCP/TLS listener, the WebSocket listener on port + 1, and
//!   the per-connection task.
//! - `ws`: adapter presenting a WebSocket as a byte stream.

pub mod codec;
pub mod packet;
pub mod server;
pub mod ws;
