//! Meshstream sender and receiver sessions
//!
//! A sender publishes mesh, material and texture blobs and streams quantized
//! vertex frames to every receiver that finished syncing. A receiver mirrors
//! the assets, rebuilds vertex buffers from keyframes and fragments, and blends
//! between frames for rendering.

pub mod demo;
pub mod logging;
pub mod receiver;
pub mod sender;

pub use demo::{Cloth, DemoSource};
pub use logging::{init_logging, LogLevel};
pub use receiver::{Receiver, ReceiverConfig, ReceiverEvent};
pub use sender::{MeshSource, Sender, SenderConfig, SenderStats};
