// Core modules implementing the frame model, encoding, requests and error modeling.
pub mod builder;
pub mod codec;
pub mod column;
pub mod dtype;
pub mod error;
pub mod frame;
pub mod request;
pub mod sql;
