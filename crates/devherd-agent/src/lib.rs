//! Launch, watch and stop local dev servers through a fire-and-forget
//! command gateway, inferring process state from ports, HTTP and logs.

pub mod fleet;
pub mod gateway;
pub mod launcher;
pub mod log_tail;
pub mod manager;
pub mod probe;
pub mod settings;
pub mod terminate;
pub mod watchdog;

pub use devherd_model as model;
