//! In-process emulators of the key-management and object-store
//! collaborators, used by tests and the server's "memory" backend.

pub mod kms;
pub mod store;
