//! Client directory domain (event-sourced).
//!
//! Clients are the billed counterparties of a tenant's invoices.

pub mod client;

pub use client::{
    Client, ClientCommand, ClientDeactivated, ClientDeleted, ClientDetails, ClientEvent, ClientId,
    ClientReactivated, ClientRegistered, ClientStatus, ClientUpdated, DeactivateClient,
    DeleteClient, ReactivateClient, RegisterClient, UpdateClient, normalize_email,
};
