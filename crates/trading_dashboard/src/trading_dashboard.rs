mod dashboard;
mod dashboard_settings;
mod error_handling;
mod layout_persistence;
mod widget_store;

pub use dashboard::*;
pub use dashboard_settings::*;
pub use error_handling::*;
pub use layout_persistence::*;
pub use widget_store::*;

#[cfg(test)]
#[ctor::ctor]
fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}
