pub mod client;
pub mod message;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;
