mod attribute_value;
mod clock;
mod condition;
mod config;
mod engine;
mod error;
mod eval;
mod experiment;
mod feature;
mod feature_value;
mod hash;
mod prerequisite;
mod rule;
mod saved_group;
mod schedule;
mod stale;
mod sticky;
mod store;
mod test_common;
mod util;

pub use attribute_value::*;
pub use clock::*;
pub use condition::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use eval::*;
pub use experiment::*;
pub use feature::*;
pub use feature_value::*;
pub use hash::*;
pub use prerequisite::*;
pub use rule::*;
pub use saved_group::*;
pub use schedule::*;
pub use stale::*;
pub use sticky::*;
pub use store::*;
