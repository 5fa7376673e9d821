//! Business logic services.

pub mod archive;
pub mod backup_service;
pub mod db_client;
pub mod destination;
pub mod destination_factory;
pub mod dump_service;
pub mod dump_writer;
pub mod encryption;
pub mod import_service;
pub mod record_store;
pub mod restore_service;
pub mod scheduler_service;
pub mod sql_record_store;
