pub mod cloud;

pub use cloud::CloudAgentBackend;
