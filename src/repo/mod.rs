pub mod user_repo;

pub use user_repo::{Listing, UpdateOutcome, UserRepository};
