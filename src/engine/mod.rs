pub mod assignment;
pub mod effects;
pub mod features;
pub mod gate;
pub mod lifecycle;
pub mod model;
pub mod pricing;
pub mod ranking;
pub mod registry;
pub mod training;
