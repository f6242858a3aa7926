//! [`Engine`](crate::engine::Engine) implementations

mod docker;
mod mock;

pub use docker::DockerEngine;
pub use mock::{MockContainer, MockEngine, MockImage, MockOp};
