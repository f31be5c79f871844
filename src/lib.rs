pub mod balancer;
pub mod bridge;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod haproxy;
pub mod master;
pub mod net;
pub mod pool;
pub mod shutdown;
pub mod stats;
pub mod worker;
