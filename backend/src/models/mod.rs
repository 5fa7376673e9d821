//! Domain models shared by the services and the record store.

pub mod backup;
pub mod provider;
