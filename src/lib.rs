pub mod anchor;
pub mod config;
pub mod detect;
pub mod feedback;
pub mod fit;
pub mod geometry;
pub mod mesh;
pub mod store;
pub mod tape;
pub mod tracking;
