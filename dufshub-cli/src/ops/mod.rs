mod output;
mod ports;
mod run;
mod services;
pub mod ui;

pub use output::OutputFormat;
pub use ports::show_ports;
pub use run::{run, RunOptions};
pub use services::{
    add_service, add_service_interactive, edit_service, list_services, remove_service,
    ServiceArgs,
};
