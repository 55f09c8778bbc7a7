pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod parallax;
pub mod pointer;
pub mod prompts;
pub mod stage;
pub mod store;
pub mod processing {
    pub mod layout;
}
pub mod tasks {
    pub mod background;
    pub mod emotion;
    pub mod loader;
    pub mod scheduler;
    pub mod viewer;
}

pub use stage_model;
