//! Common test utilities and fixtures.

pub mod backends;
pub mod server;

#[allow(unused_imports)]
pub use backends::*;
#[allow(unused_imports)]
pub use server::*;
