pub mod client;
pub mod server;
pub mod setup;

pub use client::run_client;
pub use server::run_server;
pub use setup::{run_setup_wizard, WizardResult};
