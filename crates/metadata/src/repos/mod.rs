//! Repository traits for metadata operations.

pub mod collections;
pub mod contents;
pub mod deals;
pub mod obj_refs;
pub mod objects;
pub mod providers;
pub mod users;

pub use collections::CollectionRepo;
pub use contents::ContentRepo;
pub use deals::DealRepo;
pub use obj_refs::ObjRefRepo;
pub use objects::ObjectRepo;
pub use providers::ProviderRepo;
pub use users::UserRepo;
