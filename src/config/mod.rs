mod settings;

pub use settings::HubConfig;
