pub mod connection;
pub mod db_activity;
pub mod db_cells;
pub mod db_provisioning;
pub mod db_schema;
pub mod db_services;
pub mod db_timings;

pub use connection::Database;
pub use db_activity::{ActivityMethods, NewActivityEvent};
pub use db_cells::CellMethods;
pub use db_provisioning::ProvisioningStateMethods;
pub use db_schema::initialize_schema;
pub use db_services::CellServiceMethods;
pub use db_timings::{NewTimingEvent, TimingMethods};
