pub mod artnet;
pub mod bridge;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatch;
pub mod pixel;
pub mod receiver;
pub mod router;
