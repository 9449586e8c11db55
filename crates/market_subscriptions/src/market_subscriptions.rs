mod data_provider;
#[cfg(any(test, feature = "test-support"))]
mod fake_data_provider;
mod registry;
mod subscription_key;

pub use data_provider::*;
#[cfg(any(test, feature = "test-support"))]
pub use fake_data_provider::*;
pub use registry::*;
pub use subscription_key::*;

#[cfg(test)]
#[ctor::ctor]
fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}
