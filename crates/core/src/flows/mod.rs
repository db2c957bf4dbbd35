pub mod router;
pub mod states;

pub use router::{open_turn, route, Router};
pub use states::{Route, RouteEffect, RouteReason, Stage};
