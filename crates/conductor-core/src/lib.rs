pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod settings;
pub mod stream;
