pub mod key;
pub mod registry;
