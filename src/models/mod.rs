pub mod user;

pub use user::{NewUser, User, user_key};
