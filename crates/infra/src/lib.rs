//! Infrastructure layer: event store, dispatcher, read models, numbering,
//! outbound collaborators, configuration and the service facade.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod external;
pub mod numbering;
pub mod persistence;
pub mod projections;
pub mod read_model;
pub mod services;
