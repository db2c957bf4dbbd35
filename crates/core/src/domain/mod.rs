pub mod feedback;
pub mod intent;
pub mod message;
pub mod plan;
pub mod state;
pub mod step;
pub mod tool;
