pub mod find;
pub mod model;
pub mod status;
