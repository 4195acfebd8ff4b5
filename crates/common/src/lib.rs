// atelier-common: shared types and wire protocol for the Atelier workspace

pub mod protocol;
pub mod types;
