pub mod helpers;
pub mod model;
