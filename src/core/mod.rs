pub mod breaker;
pub mod bus;
pub mod limiter;
pub mod offload;
