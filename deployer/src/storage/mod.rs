//! Local state directory

pub mod layout;
pub mod settings;
